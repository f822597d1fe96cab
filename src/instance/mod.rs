//! Network instance lifecycle.
//!
//! The manager owns every `NetworkInstanceStatus` and is driven from a
//! single dispatch loop, so no status is ever mutated concurrently. Every
//! kernel, process and tunnel side effect goes through a collaborator
//! trait.

pub mod manager;
pub mod sanity;
pub mod store;
#[cfg(test)]
pub mod testing;

use std::sync::Arc;
use uuid::Uuid;

use crate::apps::AppNetworks;
use crate::network::{AclProgrammer, BridgeOps, NatOps, VpnDriver};
use crate::services::ServiceBinder;
use crate::types::NetworkInstanceType;

pub use manager::NetworkInstanceManager;
pub use store::StatusStore;

/// What a background monitor watches for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTarget {
    pub instance: Uuid,
    pub kind: NetworkInstanceType,
    pub logical_label: String,
    pub bridge_name: String,
    pub current_uplink: String,
}

/// Starts and stops the per-instance watcher. Watchers report back through
/// the dispatch loop and never touch instance state themselves.
pub trait InstanceMonitor: Send + Sync {
    /// Replaces any watcher already running for the instance.
    fn start(&self, target: MonitorTarget);
    fn stop(&self, instance: Uuid);
}

pub struct Collaborators {
    pub bridges: Arc<dyn BridgeOps>,
    pub nat: Arc<dyn NatOps>,
    pub acl: Arc<dyn AclProgrammer>,
    pub vpn: Arc<dyn VpnDriver>,
    pub services: Arc<ServiceBinder>,
    pub apps: Arc<dyn AppNetworks>,
    pub monitor: Arc<dyn InstanceMonitor>,
}
