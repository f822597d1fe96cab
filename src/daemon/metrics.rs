use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::{NetworkInstanceMetrics, NetworkInstanceStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

pub struct MetricsCollector {
    sys_class_net: PathBuf,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_root("/sys/class/net")
    }

    pub fn with_root(sys_class_net: impl Into<PathBuf>) -> Self {
        Self {
            sys_class_net: sys_class_net.into(),
        }
    }

    fn read_counter(dir: &Path, name: &str) -> u64 {
        fs::read_to_string(dir.join(name))
            .ok()
            .and_then(|content| content.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }

    /// Reads `statistics/*` of an interface; a missing interface reads as
    /// all zeroes.
    pub fn interface_counters(&self, if_name: &str) -> InterfaceCounters {
        let stats = self.sys_class_net.join(if_name).join("statistics");
        InterfaceCounters {
            rx_bytes: Self::read_counter(&stats, "rx_bytes"),
            tx_bytes: Self::read_counter(&stats, "tx_bytes"),
            rx_packets: Self::read_counter(&stats, "rx_packets"),
            tx_packets: Self::read_counter(&stats, "tx_packets"),
        }
    }

    pub fn collect(&self, status: &NetworkInstanceStatus) -> NetworkInstanceMetrics {
        let counters = if status.bridge_name.is_empty() {
            InterfaceCounters::default()
        } else {
            self.interface_counters(&status.bridge_name)
        };
        // the gateway entry is not a lease
        let assigned_addresses = status
            .ip_assignments
            .keys()
            .filter(|mac| **mac != status.bridge_mac)
            .count();

        NetworkInstanceMetrics {
            uuid: status.uuid(),
            display_name: status.config.display_name.clone(),
            kind: status.kind(),
            bridge_name: status.bridge_name.clone(),
            activated: status.activated,
            assigned_addresses,
            rx_bytes: counters.rx_bytes,
            tx_bytes: counters.tx_bytes,
            rx_packets: counters.rx_packets,
            tx_packets: counters.tx_packets,
            collected_at: Utc::now(),
        }
    }
}
