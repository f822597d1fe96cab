// Validation run before a network instance touches the kernel.

use ipnetwork::Ipv4Network;

use crate::network::error::{NetworkError, NetworkResult};
use crate::types::{
    AddressType, DeviceNetworkStatus, NetworkInstanceConfig, NetworkInstanceStatus,
    NetworkInstanceType,
};
use crate::uplink::is_shared_port_label;

/// The configured label must name a known port unless it is one of the
/// shared management labels.
pub fn check_physical_port(
    config: &NetworkInstanceConfig,
    device: &DeviceNetworkStatus,
) -> NetworkResult<()> {
    let label = config.logical_label.as_str();
    if label.is_empty() || is_shared_port_label(label) {
        return Ok(());
    }
    let if_name = device.logical_label_to_if_name(label);
    if !device.port_exists(&if_name) {
        return Err(NetworkError::Validation(format!("Port {} not found", label)));
    }
    Ok(())
}

pub fn check_type_supported(kind: NetworkInstanceType) -> NetworkResult<()> {
    match kind {
        NetworkInstanceType::Local | NetworkInstanceType::Switch | NetworkInstanceType::Cloud => {
            Ok(())
        }
    }
}

/// Passes when no uplink is chosen yet, or the chosen uplink is a shared
/// label, or the interface is known to the device.
pub fn check_port_available(
    status: &NetworkInstanceStatus,
    device: &DeviceNetworkStatus,
) -> NetworkResult<()> {
    let uplink = status.current_uplink_intf.as_str();
    if uplink.is_empty() || is_shared_port_label(uplink) {
        return Ok(());
    }
    if !device.port_exists(uplink) {
        return Err(NetworkError::Validation(format!(
            "Uplink port {} of network instance {} is not available",
            uplink,
            status.config.name()
        )));
    }
    Ok(())
}

pub fn check_vpn_config(config: &NetworkInstanceConfig) -> NetworkResult<()> {
    if config.kind == NetworkInstanceType::Cloud && config.vpn.is_none() {
        return Err(NetworkError::Validation(format!(
            "VPN configuration missing for cloud network instance {}",
            config.name()
        )));
    }
    Ok(())
}

/// True when either subnet contains the other's network address.
pub fn subnets_overlap(a: Ipv4Network, b: Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

pub fn check_subnet<'a>(
    status: &NetworkInstanceStatus,
    others: impl IntoIterator<Item = &'a NetworkInstanceStatus>,
) -> NetworkResult<()> {
    let config = &status.config;
    let subnet = config.subnet.ok_or_else(|| {
        NetworkError::Validation(format!("Subnet not set for network instance {}", config.name()))
    })?;

    for other in others {
        if other.uuid() == config.uuid {
            continue;
        }
        let Some(other_subnet) = other.config.subnet else {
            continue;
        };
        if subnets_overlap(subnet, other_subnet) {
            return Err(NetworkError::Validation(format!(
                "Subnet {} of network instance {} overlaps with subnet {} of network instance {}",
                subnet,
                config.name(),
                other_subnet,
                other.config.name()
            )));
        }
    }

    if config.gateway.is_none() {
        return Err(NetworkError::Validation(format!(
            "Gateway not set for network instance {}",
            config.name()
        )));
    }

    let range = config.dhcp_range;
    let (Some(start), Some(end)) = (range.start, range.end) else {
        return Err(NetworkError::Validation(format!(
            "DHCP range {} of network instance {} must have both a start and an end",
            range,
            config.name()
        )));
    };
    if !subnet.contains(start) || !subnet.contains(end) {
        return Err(NetworkError::Validation(format!(
            "DHCP range {} is outside subnet {} of network instance {}",
            range,
            subnet,
            config.name()
        )));
    }
    Ok(())
}

/// Full pre-create validation; the first failing rule is returned.
pub fn sanity_check<'a>(
    status: &NetworkInstanceStatus,
    others: impl IntoIterator<Item = &'a NetworkInstanceStatus>,
    device: &DeviceNetworkStatus,
) -> NetworkResult<()> {
    check_physical_port(&status.config, device)?;
    check_type_supported(status.kind())?;
    check_port_available(status, device)?;
    check_vpn_config(&status.config)?;

    if status.kind() == NetworkInstanceType::Switch {
        return Ok(());
    }

    match status.config.ip_type {
        AddressType::None => Ok(()),
        AddressType::Ipv6 | AddressType::CryptoIpv6 => Err(NetworkError::Validation(format!(
            "IPv6 addressing is not supported for network instance {}",
            status.config.name()
        ))),
        AddressType::Ipv4 | AddressType::CryptoIpv4 => check_subnet(status, others),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::device::NetworkPortStatus;
    use serde_json::json;
    use uuid::Uuid;

    fn device() -> DeviceNetworkStatus {
        DeviceNetworkStatus {
            ports: vec![NetworkPortStatus {
                if_name: "eth0".into(),
                logical_label: "ethernet0".into(),
                is_mgmt: true,
                free: true,
                ..Default::default()
            }],
        }
    }

    fn alone() -> Vec<&'static NetworkInstanceStatus> {
        Vec::new()
    }

    fn local(subnet: &str, range: (&str, &str)) -> NetworkInstanceStatus {
        let net: Ipv4Network = subnet.parse().unwrap();
        let config: NetworkInstanceConfig = serde_json::from_value(json!({
            "uuid": Uuid::new_v4(),
            "type": "local",
            "ip_type": "ipv4",
            "logical_label": "uplink",
            "subnet": subnet,
            "gateway": std::net::Ipv4Addr::from(u32::from(net.network()) + 1).to_string(),
            "dhcp_range": {"start": range.0, "end": range.1},
        }))
        .unwrap();
        NetworkInstanceStatus::new(config)
    }

    #[test]
    fn test_disjoint_subnets_pass() {
        let a = local("10.1.0.0/24", ("10.1.0.2", "10.1.0.100"));
        let b = local("10.2.0.0/24", ("10.2.0.2", "10.2.0.100"));
        assert!(sanity_check(&a, [&b], &device()).is_ok());
    }

    #[test]
    fn test_overlap_rejected_in_both_directions() {
        let wide = local("10.0.0.0/8", ("10.0.0.2", "10.0.0.100"));
        let narrow = local("10.1.0.0/24", ("10.1.0.2", "10.1.0.100"));

        let err = sanity_check(&narrow, [&wide], &device()).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("overlaps"));

        let err = sanity_check(&wide, [&narrow], &device()).unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_dhcp_range_must_fit_subnet() {
        let status = local("10.1.0.0/24", ("10.1.0.2", "10.1.1.10"));
        let err = sanity_check(&status, alone(), &device()).unwrap_err();
        assert!(err.to_string().contains("outside subnet"));
    }

    #[test]
    fn test_dhcp_range_needs_both_ends() {
        let mut status = local("10.1.0.0/24", ("10.1.0.2", "10.1.0.100"));
        status.config.dhcp_range.end = None;
        let err = sanity_check(&status, alone(), &device()).unwrap_err();
        assert!(err.to_string().contains("both a start and an end"));
    }

    #[test]
    fn test_missing_port_label() {
        let mut status = local("10.1.0.0/24", ("10.1.0.2", "10.1.0.100"));
        status.config.logical_label = "ethernet9".into();
        let err = sanity_check(&status, alone(), &device()).unwrap_err();
        assert_eq!(err.to_string(), "validation error: Port ethernet9 not found");
    }

    #[test]
    fn test_known_label_and_uplink_pass() {
        let mut status = local("10.1.0.0/24", ("10.1.0.2", "10.1.0.100"));
        status.config.logical_label = "ethernet0".into();
        status.current_uplink_intf = "eth0".into();
        assert!(sanity_check(&status, alone(), &device()).is_ok());

        status.current_uplink_intf = "eth7".into();
        assert!(sanity_check(&status, alone(), &device()).is_err());
    }

    #[test]
    fn test_ipv6_rejected() {
        let mut status = local("10.1.0.0/24", ("10.1.0.2", "10.1.0.100"));
        status.config.ip_type = AddressType::Ipv6;
        let err = sanity_check(&status, alone(), &device()).unwrap_err();
        assert!(err.to_string().contains("IPv6"));
    }

    #[test]
    fn test_cloud_needs_vpn_config() {
        let mut status = local("10.1.0.0/24", ("10.1.0.2", "10.1.0.100"));
        status.config.kind = NetworkInstanceType::Cloud;
        let err = sanity_check(&status, alone(), &device()).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("VPN configuration missing"));

        status.config.vpn = Some(crate::types::VpnConfig::OnPremIpsec {
            gateway: "192.0.2.1".parse().unwrap(),
            pre_shared_key: "k".into(),
            remote_subnet: "172.16.0.0/16".parse().unwrap(),
        });
        assert!(sanity_check(&status, alone(), &device()).is_ok());
    }

    #[test]
    fn test_switch_without_uplink_passes() {
        let config: NetworkInstanceConfig = serde_json::from_value(json!({
            "uuid": Uuid::new_v4(),
            "type": "switch",
        }))
        .unwrap();
        let status = NetworkInstanceStatus::new(config);
        assert!(sanity_check(&status, alone(), &DeviceNetworkStatus::default()).is_ok());
    }
}
