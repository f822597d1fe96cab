//! Per-instance IPv4 lease table.
//!
//! Leases are handed out from the instance DHCP range. The starting guess is
//! the range start offset by the number of leases already recorded, minus
//! one when a gateway is configured because the gateway sits in the table
//! under the bridge MAC. From there the range is scanned once, wrapping back
//! to the start, for an address nobody holds.

use std::net::Ipv4Addr;

use crate::network::error::{NetworkError, NetworkResult};
use crate::types::{NetworkInstanceStatus, NetworkInstanceType};

/// Returns the address leased to `mac`, allocating one if needed.
///
/// `Ok(None)` means the instance has no DHCP range and its addressing is
/// managed elsewhere (Switch instances).
pub fn lookup_or_allocate(
    status: &mut NetworkInstanceStatus,
    mac: &str,
) -> NetworkResult<Option<Ipv4Addr>> {
    if let Some(ip) = status.ip_assignments.get(mac) {
        return Ok(Some(*ip));
    }

    let range = status.config.dhcp_range;
    let start = match range.start {
        Some(start) => start,
        None if status.kind() == NetworkInstanceType::Switch => return Ok(None),
        None => {
            return Err(NetworkError::Validation(format!(
                "network instance {} has no DHCP range start",
                status.config.name()
            )))
        }
    };
    let start_u32 = u32::from(start);
    let end_u32 = match range.end {
        Some(end) => u32::from(end),
        None => return Err(no_free_address(status)),
    };
    if end_u32 < start_u32 {
        return Err(no_free_address(status));
    }

    let candidate = start_u32.saturating_add(starting_offset(status));
    let candidate = if candidate > end_u32 { start_u32 } else { candidate };

    let scan = (candidate..=end_u32).chain(start_u32..candidate);
    for raw in scan {
        let ip = Ipv4Addr::from(raw);
        if status.is_ip_assigned(ip) {
            continue;
        }
        status.ip_assignments.insert(mac.to_string(), ip);
        return Ok(Some(ip));
    }

    Err(no_free_address(status))
}

/// Drops the lease held by `mac`.
pub fn release(status: &mut NetworkInstanceStatus, mac: &str) -> NetworkResult<()> {
    match status.ip_assignments.remove(mac) {
        Some(_) => Ok(()),
        None => Err(NetworkError::NotFound(format!(
            "no IP assignment for {} in network instance {}",
            mac,
            status.config.name()
        ))),
    }
}

/// Lease count adjusted for the gateway slot.
fn starting_offset(status: &NetworkInstanceStatus) -> u32 {
    let allocated = status.ip_assignments.len() as u32;
    if status.config.gateway.is_some() {
        allocated.saturating_sub(1)
    } else {
        allocated
    }
}

fn no_free_address(status: &NetworkInstanceStatus) -> NetworkError {
    NetworkError::NoFreeAddress {
        instance: status.config.name(),
        range: status.config.dhcp_range.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AddressType, DhcpRange, NetworkInstanceConfig};
    use uuid::Uuid;

    const BRIDGE_MAC: &str = "00:16:3e:06:00:01";

    fn local_status(start: &str, end: &str) -> NetworkInstanceStatus {
        let config = NetworkInstanceConfig {
            uuid: Uuid::new_v4(),
            display_name: "lan0".into(),
            kind: NetworkInstanceType::Local,
            ip_type: AddressType::Ipv4,
            logical_label: "uplink".into(),
            subnet: Some("10.1.0.0/24".parse().unwrap()),
            gateway: Some("10.1.0.1".parse().unwrap()),
            dhcp_range: DhcpRange {
                start: Some(start.parse().unwrap()),
                end: Some(end.parse().unwrap()),
            },
            activate: false,
            vpn: None,
        };
        let mut status = NetworkInstanceStatus::new(config);
        status
            .ip_assignments
            .insert(BRIDGE_MAC.into(), "10.1.0.1".parse().unwrap());
        status
    }

    fn ip(s: &str) -> Option<Ipv4Addr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn allocates_sequentially_from_range_start() {
        let mut status = local_status("10.1.0.2", "10.1.0.100");
        assert_eq!(lookup_or_allocate(&mut status, "aa:bb:cc:dd:ee:01").unwrap(), ip("10.1.0.2"));
        assert_eq!(lookup_or_allocate(&mut status, "aa:bb:cc:dd:ee:02").unwrap(), ip("10.1.0.3"));
    }

    #[test]
    fn lookup_is_idempotent() {
        let mut status = local_status("10.1.0.2", "10.1.0.100");
        let first = lookup_or_allocate(&mut status, "aa:bb:cc:dd:ee:01").unwrap();
        let count = status.ip_assignments.len();
        let second = lookup_or_allocate(&mut status, "aa:bb:cc:dd:ee:01").unwrap();
        assert_eq!(first, second);
        assert_eq!(status.ip_assignments.len(), count);
    }

    #[test]
    fn rescans_from_current_count_after_release() {
        let mut status = local_status("10.1.0.2", "10.1.0.100");
        lookup_or_allocate(&mut status, "aa:bb:cc:dd:ee:01").unwrap();
        lookup_or_allocate(&mut status, "aa:bb:cc:dd:ee:02").unwrap();
        release(&mut status, "aa:bb:cc:dd:ee:01").unwrap();

        // gateway + one lease: offset 1 lands on .3, which is taken
        let third = lookup_or_allocate(&mut status, "aa:bb:cc:dd:ee:03").unwrap();
        assert_eq!(third, ip("10.1.0.4"));
    }

    #[test]
    fn gateway_slot_adjusts_starting_guess() {
        let mut with_gateway = local_status("10.1.0.10", "10.1.0.20");
        assert_eq!(starting_offset(&with_gateway), 0);
        assert_eq!(
            lookup_or_allocate(&mut with_gateway, "aa:bb:cc:dd:ee:01").unwrap(),
            ip("10.1.0.10")
        );

        let mut no_gateway = local_status("10.1.0.10", "10.1.0.20");
        no_gateway.config.gateway = None;
        no_gateway.ip_assignments.clear();
        no_gateway
            .ip_assignments
            .insert("aa:bb:cc:dd:ee:09".into(), "10.1.0.15".parse().unwrap());
        assert_eq!(starting_offset(&no_gateway), 1);
        assert_eq!(
            lookup_or_allocate(&mut no_gateway, "aa:bb:cc:dd:ee:01").unwrap(),
            ip("10.1.0.11")
        );
    }

    #[test]
    fn never_leaves_range_and_exhausts() {
        let mut status = local_status("10.1.0.2", "10.1.0.4");
        let mut seen = Vec::new();
        for n in 0..3 {
            let mac = format!("aa:bb:cc:dd:ee:{:02x}", n);
            let got = lookup_or_allocate(&mut status, &mac).unwrap().unwrap();
            assert!(got >= "10.1.0.2".parse::<Ipv4Addr>().unwrap());
            assert!(got <= "10.1.0.4".parse::<Ipv4Addr>().unwrap());
            assert!(!seen.contains(&got));
            seen.push(got);
        }
        let err = lookup_or_allocate(&mut status, "aa:bb:cc:dd:ee:ff").unwrap_err();
        assert!(matches!(err, NetworkError::NoFreeAddress { .. }));
    }

    #[test]
    fn wraps_to_range_start_for_free_slot() {
        let mut status = local_status("10.1.0.2", "10.1.0.4");
        for n in 0..3 {
            lookup_or_allocate(&mut status, &format!("aa:bb:cc:dd:ee:{:02x}", n)).unwrap();
        }
        release(&mut status, "aa:bb:cc:dd:ee:00").unwrap();
        // offset 2 points at .4 which is held; the scan wraps to .2
        let got = lookup_or_allocate(&mut status, "aa:bb:cc:dd:ee:10").unwrap();
        assert_eq!(got, ip("10.1.0.2"));
    }

    #[test]
    fn switch_without_range_returns_none() {
        let mut status = local_status("10.1.0.2", "10.1.0.4");
        status.config.kind = NetworkInstanceType::Switch;
        status.config.dhcp_range = DhcpRange::default();
        assert_eq!(lookup_or_allocate(&mut status, "aa:bb:cc:dd:ee:01").unwrap(), None);
        assert_eq!(status.ip_assignments.len(), 1);
    }

    #[test]
    fn release_unknown_mac_is_not_found() {
        let mut status = local_status("10.1.0.2", "10.1.0.4");
        let before = status.ip_assignments.clone();
        let err = release(&mut status, "aa:bb:cc:dd:ee:77").unwrap_err();
        assert!(matches!(err, NetworkError::NotFound(_)));
        assert_eq!(status.ip_assignments, before);
    }
}
