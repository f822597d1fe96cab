use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// State of one physical or management port, as reported by the device
/// network manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPortStatus {
    pub if_name: String,
    #[serde(default)]
    pub logical_label: String,
    #[serde(default)]
    pub is_mgmt: bool,
    /// Management port without usage cost
    #[serde(default)]
    pub free: bool,
    #[serde(default)]
    pub addrs: Vec<IpAddr>,
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default)]
    pub ntp_servers: Vec<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNetworkStatus {
    #[serde(default)]
    pub ports: Vec<NetworkPortStatus>,
}

/// Shared, read-mostly snapshot of the device ports.
pub type DeviceStatusHandle = Arc<RwLock<DeviceNetworkStatus>>;

impl DeviceNetworkStatus {
    pub fn lookup_port(&self, if_name: &str) -> Option<&NetworkPortStatus> {
        self.ports.iter().find(|p| p.if_name == if_name)
    }

    pub fn port_exists(&self, if_name: &str) -> bool {
        self.lookup_port(if_name).is_some()
    }

    /// Maps a logical label to its interface name. A label that matches no
    /// port is returned unchanged so that plain interface names resolve to
    /// themselves.
    pub fn logical_label_to_if_name(&self, label: &str) -> String {
        self.ports
            .iter()
            .find(|p| p.logical_label == label)
            .map(|p| p.if_name.clone())
            .unwrap_or_else(|| label.to_string())
    }

    pub fn mgmt_ports(&self, free_only: bool) -> Vec<String> {
        self.ports
            .iter()
            .filter(|p| p.is_mgmt && (!free_only || p.free))
            .map(|p| p.if_name.clone())
            .collect()
    }

    /// DNS servers of one port, or of every management port when `if_name`
    /// is empty.
    pub fn dns_servers(&self, if_name: &str) -> Vec<IpAddr> {
        self.collect_servers(if_name, |p| &p.dns_servers)
    }

    pub fn ntp_servers(&self, if_name: &str) -> Vec<IpAddr> {
        self.collect_servers(if_name, |p| &p.ntp_servers)
    }

    fn collect_servers<F>(&self, if_name: &str, field: F) -> Vec<IpAddr>
    where
        F: Fn(&NetworkPortStatus) -> &Vec<IpAddr>,
    {
        let mut servers: Vec<IpAddr> = Vec::new();
        for port in &self.ports {
            let selected = if if_name.is_empty() {
                port.is_mgmt
            } else {
                port.if_name == if_name
            };
            if !selected {
                continue;
            }
            for server in field(port) {
                if !servers.contains(server) {
                    servers.push(*server);
                }
            }
        }
        servers
    }

    /// First IPv4 address on the port that is not link-local.
    pub fn local_addr_no_link_local(&self, if_name: &str) -> Option<Ipv4Addr> {
        self.lookup_port(if_name)?.addrs.iter().find_map(|addr| match addr {
            IpAddr::V4(v4) if !v4.is_link_local() => Some(*v4),
            _ => None,
        })
    }
}
