use crate::network::error::{NetworkError, NetworkResult};
use crate::network::pbr::{self, PolicyRouter, RoutingRule};
use crate::utils::command::CommandExecutor;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Link-local address guests use to reach the metadata service.
pub const METADATA_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

/// Host rules installed on behalf of a network instance. Each rule can be
/// added and removed on its own, and removing an absent rule succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NatRule {
    /// Source NAT of the subnet out of the uplink
    Masquerade { subnet: Ipv4Network, uplink: String },
    /// Bridge routing table seeded from the uplink's routes
    PbrRoutes {
        bridge: String,
        subnet: Ipv4Network,
        uplink: String,
        table: u32,
    },
    /// `ip rule` entry
    Routing(RoutingRule),
    /// Redirect of the metadata address to the bridge IP
    MetadataDnat {
        bridge: String,
        bridge_ip: Ipv4Addr,
        port: u16,
    },
}

impl NatRule {
    pub fn describe(&self) -> String {
        match self {
            NatRule::Masquerade { subnet, uplink } => {
                format!("masquerade {} via {}", pbr::subnet_string(*subnet), uplink)
            }
            NatRule::PbrRoutes { bridge, uplink, table, .. } => {
                format!("routes of {} in table {} for {}", uplink, table, bridge)
            }
            NatRule::Routing(rule) => format!("ip rule priority {}", rule.priority),
            NatRule::MetadataDnat { bridge, bridge_ip, port } => {
                format!("metadata DNAT on {} to {}:{}", bridge, bridge_ip, port)
            }
        }
    }
}

#[async_trait]
pub trait NatOps: Send + Sync {
    async fn add_rule(&self, rule: &NatRule) -> NetworkResult<()>;
    async fn remove_rule(&self, rule: &NatRule) -> NetworkResult<()>;
}

pub fn masquerade_args(subnet: Ipv4Network, uplink: &str) -> Vec<String> {
    vec![
        "-t".into(),
        "nat".into(),
        "POSTROUTING".into(),
        "-o".into(),
        uplink.to_string(),
        "-s".into(),
        pbr::subnet_string(subnet),
        "-j".into(),
        "MASQUERADE".into(),
    ]
}

pub fn metadata_dnat_args(bridge: &str, bridge_ip: Ipv4Addr, port: u16) -> Vec<String> {
    vec![
        "-t".into(),
        "nat".into(),
        "PREROUTING".into(),
        "-i".into(),
        bridge.to_string(),
        "-p".into(),
        "tcp".into(),
        "-d".into(),
        format!("{}/32", METADATA_IP),
        "--dport".into(),
        "80".into(),
        "-j".into(),
        "DNAT".into(),
        "--to-destination".into(),
        format!("{}:{}", bridge_ip, port),
    ]
}

/// iptables + iproute2 implementation of `NatOps`.
///
/// Rules are individually removable, so iptables is used rather than a
/// single nftables table owned by the agent.
pub struct Firewall;

impl Firewall {
    pub fn new() -> Self {
        Self
    }

    /// `spec` is `-t <table> <chain> <match...>`; the operation flag is
    /// spliced in front of the chain.
    async fn iptables(op: &str, spec: &[String]) -> NetworkResult<bool> {
        let mut args: Vec<&str> = Vec::with_capacity(spec.len() + 1);
        args.extend(spec[..2].iter().map(String::as_str));
        args.push(op);
        args.extend(spec[2..].iter().map(String::as_str));
        let result = CommandExecutor::execute("iptables", &args).await?;
        if op == "-C" {
            return Ok(result.success);
        }
        if !result.success {
            return Err(NetworkError::Command {
                cmd: CommandExecutor::render("iptables", &args),
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(true)
    }

    async fn ensure_iptables(op: &str, spec: &[String]) -> NetworkResult<()> {
        if !Self::iptables("-C", spec).await? {
            Self::iptables(op, spec).await?;
        }
        Ok(())
    }

    async fn remove_iptables(spec: &[String]) -> NetworkResult<()> {
        if Self::iptables("-C", spec).await? {
            Self::iptables("-D", spec).await?;
        }
        Ok(())
    }
}

impl Default for Firewall {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NatOps for Firewall {
    async fn add_rule(&self, rule: &NatRule) -> NetworkResult<()> {
        tracing::debug!("Adding {}", rule.describe());
        match rule {
            NatRule::Masquerade { subnet, uplink } => {
                Self::ensure_iptables("-A", &masquerade_args(*subnet, uplink)).await
            }
            NatRule::PbrRoutes {
                bridge,
                subnet,
                uplink,
                table,
            } => PolicyRouter::add_routes(bridge, *subnet, uplink, *table).await,
            NatRule::Routing(rule) => PolicyRouter::add_rule(rule).await,
            NatRule::MetadataDnat {
                bridge,
                bridge_ip,
                port,
            } => Self::ensure_iptables("-I", &metadata_dnat_args(bridge, *bridge_ip, *port)).await,
        }
    }

    async fn remove_rule(&self, rule: &NatRule) -> NetworkResult<()> {
        tracing::debug!("Removing {}", rule.describe());
        match rule {
            NatRule::Masquerade { subnet, uplink } => {
                Self::remove_iptables(&masquerade_args(*subnet, uplink)).await
            }
            NatRule::PbrRoutes { table, .. } => PolicyRouter::flush_routes(*table).await,
            NatRule::Routing(rule) => PolicyRouter::del_rule(rule).await,
            NatRule::MetadataDnat {
                bridge,
                bridge_ip,
                port,
            } => Self::remove_iptables(&metadata_dnat_args(bridge, *bridge_ip, *port)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masquerade_args() {
        let args = masquerade_args("10.1.0.0/24".parse().unwrap(), "eth0");
        assert_eq!(
            args.join(" "),
            "-t nat POSTROUTING -o eth0 -s 10.1.0.0/24 -j MASQUERADE"
        );
    }

    #[test]
    fn test_metadata_dnat_args() {
        let args = metadata_dnat_args("bn1", "10.1.0.1".parse().unwrap(), 80);
        assert_eq!(
            args.join(" "),
            "-t nat PREROUTING -i bn1 -p tcp -d 169.254.169.254/32 --dport 80 -j DNAT --to-destination 10.1.0.1:80"
        );
    }

    #[test]
    fn test_describe() {
        let rule = NatRule::Masquerade {
            subnet: "10.1.0.0/24".parse().unwrap(),
            uplink: "eth0".into(),
        };
        assert_eq!(rule.describe(), "masquerade 10.1.0.0/24 via eth0");
    }
}
