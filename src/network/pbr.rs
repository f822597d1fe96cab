//! Policy-based routing for NAT'ed network instances.
//!
//! Each bridge gets its own routing table (`PBR_TABLE_BASE + bridge ifindex`)
//! holding a copy of the chosen uplink's routes, and `ip rule` entries that
//! steer traffic sourced from the instance subnet into that table.

use crate::network::error::{NetworkError, NetworkResult};
use crate::utils::command::CommandExecutor;
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

pub const PBR_TABLE_BASE: u32 = 500;

/// Bridge-local traffic to the gateway stays in the main table.
pub const PBR_NAT_OUT_GATEWAY_PRIO: u32 = 9999;
/// Subnet egress goes through the bridge table.
pub const PBR_NAT_OUT_PRIO: u32 = 10000;
/// Return traffic to the subnet uses the main table.
pub const PBR_NAT_IN_PRIO: u32 = 11000;

pub fn table_for_bridge(bridge_ifindex: u32) -> u32 {
    PBR_TABLE_BASE + bridge_ifindex
}

/// One `ip rule` selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingRule {
    pub from: Option<String>,
    pub to: Option<String>,
    pub table: String,
    pub priority: u32,
}

impl RoutingRule {
    fn args(&self, op: &str) -> Vec<String> {
        let mut args = vec!["rule".to_string(), op.to_string()];
        if let Some(from) = &self.from {
            args.push("from".into());
            args.push(from.clone());
        }
        if let Some(to) = &self.to {
            args.push("to".into());
            args.push(to.clone());
        }
        args.push("lookup".into());
        args.push(self.table.clone());
        args.push("priority".into());
        args.push(self.priority.to_string());
        args
    }
}

pub fn gateway_source_rule(gateway: Ipv4Addr, subnet: Ipv4Network) -> RoutingRule {
    RoutingRule {
        from: Some(format!("{}/32", gateway)),
        to: Some(subnet_string(subnet)),
        table: "main".into(),
        priority: PBR_NAT_OUT_GATEWAY_PRIO,
    }
}

pub fn source_rule(subnet: Ipv4Network, table: u32) -> RoutingRule {
    RoutingRule {
        from: Some(subnet_string(subnet)),
        to: None,
        table: table.to_string(),
        priority: PBR_NAT_OUT_PRIO,
    }
}

pub fn inward_source_rule(subnet: Ipv4Network) -> RoutingRule {
    RoutingRule {
        from: None,
        to: Some(subnet_string(subnet)),
        table: "main".into(),
        priority: PBR_NAT_IN_PRIO,
    }
}

/// Network address form, `10.1.0.0/24`.
pub fn subnet_string(subnet: Ipv4Network) -> String {
    format!("{}/{}", subnet.network(), subnet.prefix())
}

/// Turns `ip route show table main dev <uplink>` output into
/// `ip route replace` argument lists targeting `table`.
pub fn routes_for_table(show_output: &str, uplink: &str, table: u32) -> Vec<Vec<String>> {
    show_output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut args = vec!["route".to_string(), "replace".to_string()];
            let mut tokens = line.split_whitespace().peekable();
            while let Some(token) = tokens.next() {
                // table and dev are set explicitly below
                if token == "table" || token == "dev" {
                    tokens.next();
                    continue;
                }
                // kernel-managed flags are not accepted on input
                if token == "linkdown" || token == "dead" || token == "offload" {
                    continue;
                }
                args.push(token.to_string());
            }
            args.push("dev".into());
            args.push(uplink.to_string());
            args.push("table".into());
            args.push(table.to_string());
            args
        })
        .collect()
}

pub struct PolicyRouter;

impl PolicyRouter {
    /// Populate the bridge table with the bridge subnet and the uplink routes.
    pub async fn add_routes(
        bridge: &str,
        subnet: Ipv4Network,
        uplink: &str,
        table: u32,
    ) -> NetworkResult<()> {
        let table_str = table.to_string();
        let subnet_str = subnet_string(subnet);
        CommandExecutor::execute_checked(
            "ip",
            &["route", "replace", &subnet_str, "dev", bridge, "table", &table_str],
        )
        .await?;

        let shown =
            CommandExecutor::execute_checked("ip", &["route", "show", "table", "main", "dev", uplink])
                .await?;
        for args in routes_for_table(&shown.stdout, uplink, table) {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            if let Err(e) = CommandExecutor::execute_checked("ip", &args).await {
                tracing::warn!("Failed to copy route into table {} (non-fatal): {}", table, e);
            }
        }
        tracing::debug!("PBR table {} populated from {} for {}", table, uplink, bridge);
        Ok(())
    }

    pub async fn flush_routes(table: u32) -> NetworkResult<()> {
        let table_str = table.to_string();
        CommandExecutor::execute_checked("ip", &["route", "flush", "table", &table_str]).await?;
        Ok(())
    }

    /// Adds a rule, replacing an identical one left behind earlier.
    pub async fn add_rule(rule: &RoutingRule) -> NetworkResult<()> {
        Self::del_rule(rule).await?;
        let args = rule.args("add");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        CommandExecutor::execute_checked("ip", &args).await?;
        Ok(())
    }

    /// Removes a rule; a rule that is already gone is not an error.
    pub async fn del_rule(rule: &RoutingRule) -> NetworkResult<()> {
        let args = rule.args("del");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match CommandExecutor::execute_checked("ip", &args).await {
            Ok(_) => Ok(()),
            Err(NetworkError::Command { stderr, .. })
                if stderr.contains("No such file or directory") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet() -> Ipv4Network {
        "10.1.0.0/24".parse().unwrap()
    }

    #[test]
    fn test_rule_args() {
        let rule = gateway_source_rule("10.1.0.1".parse().unwrap(), subnet());
        assert_eq!(
            rule.args("add").join(" "),
            "rule add from 10.1.0.1/32 to 10.1.0.0/24 lookup main priority 9999"
        );
        assert_eq!(
            source_rule(subnet(), table_for_bridge(7)).args("del").join(" "),
            "rule del from 10.1.0.0/24 lookup 507 priority 10000"
        );
        assert_eq!(
            inward_source_rule(subnet()).args("add").join(" "),
            "rule add to 10.1.0.0/24 lookup main priority 11000"
        );
    }

    #[test]
    fn test_subnet_string_uses_network_address() {
        let net: Ipv4Network = "10.1.0.9/24".parse().unwrap();
        assert_eq!(subnet_string(net), "10.1.0.0/24");
    }

    #[test]
    fn test_routes_for_table() {
        let output = "default via 192.168.1.1 proto dhcp src 192.168.1.10 metric 100 \n\
                      192.168.1.0/24 proto kernel scope link src 192.168.1.10 linkdown\n\n";
        let routes = routes_for_table(output, "eth0", 505);
        assert_eq!(routes.len(), 2);
        assert_eq!(
            routes[0].join(" "),
            "route replace default via 192.168.1.1 proto dhcp src 192.168.1.10 metric 100 dev eth0 table 505"
        );
        assert_eq!(
            routes[1].join(" "),
            "route replace 192.168.1.0/24 proto kernel scope link src 192.168.1.10 dev eth0 table 505"
        );
    }
}
