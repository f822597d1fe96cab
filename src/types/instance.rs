use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

use crate::network::bridge::BRIDGE_PREFIX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkInstanceType {
    /// Private bridge, NAT to an uplink, local DHCP/DNS
    Local,
    /// Layer-2 bridge onto an uplink, addressing managed externally
    Switch,
    /// Private bridge tunnelled over a VPN
    Cloud,
}

impl NetworkInstanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkInstanceType::Local => "local",
            NetworkInstanceType::Switch => "switch",
            NetworkInstanceType::Cloud => "cloud",
        }
    }
}

impl fmt::Display for NetworkInstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    #[default]
    None,
    Ipv4,
    Ipv6,
    CryptoIpv4,
    CryptoIpv6,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    #[serde(default)]
    pub start: Option<Ipv4Addr>,
    #[serde(default)]
    pub end: Option<Ipv4Addr>,
}

impl fmt::Display for DhcpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |ip: Option<Ipv4Addr>| ip.map(|ip| ip.to_string()).unwrap_or_default();
        write!(f, "{}-{}", show(self.start), show(self.end))
    }
}

/// Tunnel parameters handed to the VPN collaborator as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VpnConfig {
    /// IPsec client towards a cloud provider VPC gateway
    CloudIpsec {
        region: String,
        gateway: IpAddr,
        pre_shared_key: String,
        remote_subnet: Ipv4Network,
    },
    /// IPsec client towards an on-premises gateway
    OnPremIpsec {
        gateway: IpAddr,
        pre_shared_key: String,
        remote_subnet: Ipv4Network,
    },
    /// IPsec responder accepting remote clients
    OnPremIpsecServer {
        pre_shared_key: String,
        #[serde(default)]
        client_subnet: Option<Ipv4Network>,
    },
}

/// State returned by the VPN collaborator on create and passed back on
/// every later call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnStatus {
    pub tunnel_name: String,
    pub uplink: String,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInstanceConfig {
    pub uuid: Uuid,
    #[serde(default)]
    pub display_name: String,
    #[serde(rename = "type")]
    pub kind: NetworkInstanceType,
    #[serde(default)]
    pub ip_type: AddressType,
    #[serde(default)]
    pub logical_label: String,
    #[serde(default)]
    pub subnet: Option<Ipv4Network>,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dhcp_range: DhcpRange,
    #[serde(default)]
    pub activate: bool,
    #[serde(default)]
    pub vpn: Option<VpnConfig>,
}

impl NetworkInstanceConfig {
    /// Name used in log lines: display name when set, UUID otherwise.
    pub fn name(&self) -> String {
        if self.display_name.is_empty() {
            self.uuid.to_string()
        } else {
            self.display_name.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeInProgress {
    #[default]
    None,
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInstanceStatus {
    #[serde(flatten)]
    pub config: NetworkInstanceConfig,

    /// 0 while no bridge number is held
    pub bridge_num: u32,
    pub bridge_name: String,
    pub bridge_mac: String,
    pub bridge_ifindex: u32,
    pub bridge_ip: Option<Ipv4Addr>,

    pub if_name_list: Vec<String>,
    pub current_uplink_intf: String,
    pub prev_uplink_intf: String,
    pub prog_uplink_intf: String,
    pub need_intf_update: bool,

    /// Set once every create step has succeeded
    #[serde(default)]
    pub created: bool,
    pub activated: bool,
    pub change_in_progress: ChangeInProgress,

    /// MAC -> leased address; the bridge MAC holds the gateway
    pub ip_assignments: BTreeMap<String, Ipv4Addr>,

    pub vpn_status: Option<VpnStatus>,

    pub error: Option<String>,
    pub error_time: Option<DateTime<Utc>>,
}

impl NetworkInstanceStatus {
    pub fn new(config: NetworkInstanceConfig) -> Self {
        Self {
            config,
            bridge_num: 0,
            bridge_name: String::new(),
            bridge_mac: String::new(),
            bridge_ifindex: 0,
            bridge_ip: None,
            if_name_list: Vec::new(),
            current_uplink_intf: String::new(),
            prev_uplink_intf: String::new(),
            prog_uplink_intf: String::new(),
            need_intf_update: false,
            created: false,
            activated: false,
            change_in_progress: ChangeInProgress::None,
            ip_assignments: BTreeMap::new(),
            vpn_status: None,
            error: None,
            error_time: None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.config.uuid
    }

    pub fn kind(&self) -> NetworkInstanceType {
        self.config.kind
    }

    pub fn set_error(&mut self, err: impl fmt::Display) {
        self.error = Some(err.to_string());
        self.error_time = Some(Utc::now());
    }

    pub fn clear_error(&mut self) {
        self.error = None;
        self.error_time = None;
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_ip_assigned(&self, ip: Ipv4Addr) -> bool {
        self.ip_assignments.values().any(|assigned| *assigned == ip)
    }

    /// True when the bridge was created by this agent rather than looked up.
    pub fn owns_bridge(&self) -> bool {
        self.bridge_name.starts_with(BRIDGE_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInstanceMetrics {
    pub uuid: Uuid,
    pub display_name: String,
    #[serde(rename = "type")]
    pub kind: NetworkInstanceType,
    pub bridge_name: String,
    pub activated: bool,
    pub assigned_addresses: usize,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub collected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "uuid": "6f1c3a53-0e65-4a3b-9a43-9c2f7f3f1d10",
            "display_name": "lan0",
            "type": "local",
            "ip_type": "ipv4",
            "logical_label": "uplink",
            "subnet": "10.1.0.0/24",
            "gateway": "10.1.0.1",
            "dhcp_range": {"start": "10.1.0.2", "end": "10.1.0.100"},
            "activate": true
        }"#;
        let config: NetworkInstanceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind, NetworkInstanceType::Local);
        assert_eq!(config.ip_type, AddressType::Ipv4);
        assert_eq!(config.dhcp_range.to_string(), "10.1.0.2-10.1.0.100");
        assert!(config.vpn.is_none());
    }

    #[test]
    fn test_vpn_config_tagged() {
        let json = r#"{"kind": "on_prem_ipsec", "gateway": "192.0.2.1",
            "pre_shared_key": "s3cret", "remote_subnet": "172.16.0.0/16"}"#;
        let vpn: VpnConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(vpn, VpnConfig::OnPremIpsec { .. }));
    }

    #[test]
    fn test_status_error_tracking() {
        let config: NetworkInstanceConfig = serde_json::from_str(
            r#"{"uuid": "6f1c3a53-0e65-4a3b-9a43-9c2f7f3f1d10", "type": "switch"}"#,
        )
        .unwrap();
        let mut status = NetworkInstanceStatus::new(config);
        assert!(!status.has_error());
        status.set_error("Port eth9 not found");
        assert_eq!(status.error.as_deref(), Some("Port eth9 not found"));
        assert!(status.error_time.is_some());
        status.clear_error();
        assert!(!status.has_error());
    }

    #[test]
    fn test_owns_bridge() {
        let config: NetworkInstanceConfig = serde_json::from_str(
            r#"{"uuid": "6f1c3a53-0e65-4a3b-9a43-9c2f7f3f1d10", "type": "switch"}"#,
        )
        .unwrap();
        let mut status = NetworkInstanceStatus::new(config);
        status.bridge_name = "eth0".to_string();
        assert!(!status.owns_bridge());
        status.bridge_name = "bn3".to_string();
        assert!(status.owns_bridge());
    }
}
