use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// One application network interface attached to a network instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInterface {
    pub network: Uuid,
    pub mac: String,
    #[serde(default)]
    pub vif_name: String,
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
}

/// Application identity and cloud-init material served by the metadata
/// server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppNetworkStatus {
    pub uuid: Uuid,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    /// base64-encoded cloud-init payload
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<AppInterface>,
}

impl AppNetworkStatus {
    pub fn has_ip(&self, ip: Ipv4Addr) -> bool {
        self.interfaces.iter().any(|i| i.ip == Some(ip))
    }
}

/// An app interface as seen from the network instance it is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppAttachment {
    pub app: Uuid,
    pub network: Uuid,
    pub vif_name: String,
    pub mac: String,
    pub ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReprogramReason {
    /// The network instance moved its traffic to another uplink
    UplinkChanged { old: String, new: String },
    /// Operator or controller asked for a refresh
    Requested,
}

impl fmt::Display for ReprogramReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReprogramReason::UplinkChanged { old, new } => {
                write!(f, "uplink changed from '{}' to '{}'", old, new)
            }
            ReprogramReason::Requested => f.write_str("requested"),
        }
    }
}
