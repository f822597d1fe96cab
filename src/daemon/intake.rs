//! Declarative configuration intake.
//!
//! The intake file carries the full desired state. Each revision is diffed
//! against the previous one into events: deletes first so released subnets
//! and bridge numbers can be reused, then modifies, then creates.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use uuid::Uuid;

use super::events::NetworkInstanceEvent;
use crate::instance::sanity;
use crate::network::error::NetworkResult;
use crate::types::{
    AppNetworkStatus, DeviceNetworkStatus, NetworkInstanceConfig, NetworkInstanceStatus,
    ReprogramReason,
};
use crate::uplink::UplinkSelector;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntakeFile {
    #[serde(default)]
    pub device: DeviceNetworkStatus,
    #[serde(default)]
    pub network_instances: Vec<NetworkInstanceConfig>,
    #[serde(default)]
    pub apps: Vec<AppNetworkStatus>,
    /// Instance UUID -> uplink interface to use instead of the resolved one
    #[serde(default)]
    pub uplink_overrides: BTreeMap<Uuid, String>,
    /// Instance UUID -> counter; raising it re-derives the ACLs of the
    /// instance's apps
    #[serde(default)]
    pub reprogram_requests: BTreeMap<Uuid, u32>,
}

impl IntakeFile {
    pub fn load(path: &Path) -> NetworkResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Loads `path`, treating a missing file as an empty configuration.
    pub fn load_or_default(path: &Path) -> NetworkResult<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Config {} not found, starting empty", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Events that move the agent from `previous` to `next`.
pub fn diff(previous: &IntakeFile, next: &IntakeFile) -> Vec<NetworkInstanceEvent> {
    let mut events = Vec::new();

    if previous.device != next.device {
        events.push(NetworkInstanceEvent::DeviceStatus(next.device.clone()));
    }

    let old: HashMap<Uuid, &NetworkInstanceConfig> = previous
        .network_instances
        .iter()
        .map(|c| (c.uuid, c))
        .collect();
    let new: HashMap<Uuid, &NetworkInstanceConfig> = next
        .network_instances
        .iter()
        .map(|c| (c.uuid, c))
        .collect();

    for config in &previous.network_instances {
        if !new.contains_key(&config.uuid) {
            events.push(NetworkInstanceEvent::Delete(config.uuid));
        }
    }
    for config in &next.network_instances {
        if let Some(prior) = old.get(&config.uuid) {
            if *prior != config {
                events.push(NetworkInstanceEvent::Modify {
                    old: (*prior).clone(),
                    new: config.clone(),
                });
            }
        }
    }
    for config in &next.network_instances {
        if !old.contains_key(&config.uuid) {
            events.push(NetworkInstanceEvent::Create(config.clone()));
        }
    }

    if previous.apps != next.apps || events.iter().any(|e| matches!(e, NetworkInstanceEvent::Create(_))) {
        events.push(NetworkInstanceEvent::Apps(next.apps.clone()));
    }

    for (instance, uplink) in &next.uplink_overrides {
        if previous.uplink_overrides.get(instance) != Some(uplink) {
            events.push(NetworkInstanceEvent::UplinkChanged {
                instance: *instance,
                uplink: uplink.clone(),
            });
        }
    }

    for (instance, counter) in &next.reprogram_requests {
        let raised = previous
            .reprogram_requests
            .get(instance)
            .map_or(true, |prior| counter > prior);
        if raised {
            events.push(NetworkInstanceEvent::Reprogram {
                instance: *instance,
                reason: ReprogramReason::Requested,
            });
        }
    }
    events
}

/// Offline validation: runs the create-time sanity checks of every
/// instance in file order against the file's device status. Instances that
/// fail are not counted when checking later ones for overlap.
pub fn check(
    file: &IntakeFile,
    selector: &UplinkSelector,
) -> Vec<(NetworkInstanceConfig, NetworkResult<()>)> {
    let mut accepted: Vec<NetworkInstanceStatus> = Vec::new();
    let mut results = Vec::new();
    for config in &file.network_instances {
        let mut status = NetworkInstanceStatus::new(config.clone());
        status.current_uplink_intf = selector
            .first_uplink(&file.device, &config.logical_label)
            .unwrap_or_default();
        let result = sanity::sanity_check(&status, accepted.iter(), &file.device);
        if result.is_ok() {
            accepted.push(status);
        }
        results.push((config.clone(), result));
    }
    results
}
