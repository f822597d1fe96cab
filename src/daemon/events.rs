use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::{AppNetworkStatus, DeviceNetworkStatus, NetworkInstanceConfig, ReprogramReason};

/// Everything the dispatch loop reacts to. Producers (intake, monitors)
/// only send; the loop is the only consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkInstanceEvent {
    Create(NetworkInstanceConfig),
    Modify {
        old: NetworkInstanceConfig,
        new: NetworkInstanceConfig,
    },
    Delete(Uuid),
    /// Re-derive per-app configuration without a config change
    Reprogram {
        instance: Uuid,
        reason: ReprogramReason,
    },
    UplinkChanged {
        instance: Uuid,
        uplink: String,
    },
    AddressChanged {
        if_name: String,
    },
    DeviceStatus(DeviceNetworkStatus),
    Apps(Vec<AppNetworkStatus>),
}

impl NetworkInstanceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkInstanceEvent::Create(_) => "create",
            NetworkInstanceEvent::Modify { .. } => "modify",
            NetworkInstanceEvent::Delete(_) => "delete",
            NetworkInstanceEvent::Reprogram { .. } => "reprogram",
            NetworkInstanceEvent::UplinkChanged { .. } => "uplink-changed",
            NetworkInstanceEvent::AddressChanged { .. } => "address-changed",
            NetworkInstanceEvent::DeviceStatus(_) => "device-status",
            NetworkInstanceEvent::Apps(_) => "apps",
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<NetworkInstanceEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<NetworkInstanceEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
