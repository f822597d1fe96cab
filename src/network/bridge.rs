// Bridge management module
// Creates, looks up and deletes the layer-2 bridges backing network instances.

use crate::network::error::{NetworkError, NetworkResult};
use crate::network::netlink::NetlinkHandle;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Every bridge created by the agent is named `bn<N>`.
pub const BRIDGE_PREFIX: &str = "bn";

/// Locally administered prefix of bridge MACs; the last two octets carry N.
const BRIDGE_MAC_PREFIX: [u8; 4] = [0x00, 0x16, 0x3e, 0x06];

pub fn bridge_name(bridge_num: u32) -> String {
    format!("{}{}", BRIDGE_PREFIX, bridge_num)
}

pub fn bridge_mac(bridge_num: u32) -> [u8; 6] {
    let num = bridge_num as u16;
    let [hi, lo] = num.to_be_bytes();
    [
        BRIDGE_MAC_PREFIX[0],
        BRIDGE_MAC_PREFIX[1],
        BRIDGE_MAC_PREFIX[2],
        BRIDGE_MAC_PREFIX[3],
        hi,
        lo,
    ]
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInfo {
    pub name: String,
    pub mac: String,
    pub ifindex: u32,
}

/// Kernel-side bridge operations used by the state machine.
#[async_trait]
pub trait BridgeOps: Send + Sync {
    /// Create `name` with a MAC derived from `bridge_num`, replacing any
    /// stale link of the same name.
    async fn create_bridge(&self, name: &str, bridge_num: u32) -> NetworkResult<BridgeInfo>;

    /// Find a bridge created by the device network manager for an uplink.
    async fn lookup_existing_bridge(&self, if_name: &str) -> NetworkResult<BridgeInfo>;

    async fn set_bridge_ip(&self, bridge: &str, addr: Ipv4Addr, prefix_len: u8)
        -> NetworkResult<()>;

    async fn attach_member(&self, bridge: &str, member: &str) -> NetworkResult<()>;

    async fn detach_member(&self, member: &str) -> NetworkResult<()>;

    async fn delete_bridge(&self, name: &str) -> NetworkResult<()>;
}

/// Netlink-backed bridge manager.
pub struct BridgeManager {
    nl: Arc<NetlinkHandle>,
    proc_root: PathBuf,
}

impl BridgeManager {
    pub fn new(nl: Arc<NetlinkHandle>) -> Self {
        Self {
            nl,
            proc_root: PathBuf::from("/proc"),
        }
    }

    fn disable_redirects(&self, bridge: &str) {
        let path = self
            .proc_root
            .join("sys/net/ipv4/conf")
            .join(bridge)
            .join("send_redirects");
        if let Err(e) = std::fs::write(&path, "0") {
            tracing::warn!(
                "Failed to disable ICMP redirects on {} (non-fatal): {}",
                bridge,
                e
            );
        }
    }
}

#[async_trait]
impl BridgeOps for BridgeManager {
    async fn create_bridge(&self, name: &str, bridge_num: u32) -> NetworkResult<BridgeInfo> {
        if !name.starts_with(BRIDGE_PREFIX) {
            panic!("refusing to create bridge '{}' outside the {} namespace", name, BRIDGE_PREFIX);
        }

        // Stale bridge from a previous run
        self.nl.delete_link(name).await?;

        let index = self.nl.create_bridge(name).await?;
        let mac = bridge_mac(bridge_num);
        self.nl.set_link_address(index, mac).await?;
        self.nl.set_link_up(index).await?;
        self.disable_redirects(name);

        tracing::info!("Created bridge {} (index {}, mac {})", name, index, format_mac(&mac));
        Ok(BridgeInfo {
            name: name.to_string(),
            mac: format_mac(&mac),
            ifindex: index,
        })
    }

    async fn lookup_existing_bridge(&self, if_name: &str) -> NetworkResult<BridgeInfo> {
        let link = self.nl.get_link(if_name).await?;
        if !link.is_bridge {
            return Err(NetworkError::Validation(format!(
                "uplink {} is not a bridge",
                if_name
            )));
        }
        let mac = link
            .mac
            .map(|m| format_mac(&m))
            .ok_or_else(|| NetworkError::NotFound(format!("MAC address of {}", if_name)))?;
        Ok(BridgeInfo {
            name: link.name,
            mac,
            ifindex: link.index,
        })
    }

    async fn set_bridge_ip(
        &self,
        bridge: &str,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> NetworkResult<()> {
        let index = self.nl.get_link_index(bridge).await?;
        self.nl.add_address(index, addr, prefix_len).await
    }

    async fn attach_member(&self, bridge: &str, member: &str) -> NetworkResult<()> {
        let bridge_index = self.nl.get_link_index(bridge).await?;
        let member_index = self.nl.get_link_index(member).await?;
        self.nl.set_link_up(member_index).await?;
        self.nl.set_link_master(member_index, bridge_index).await
    }

    async fn detach_member(&self, member: &str) -> NetworkResult<()> {
        let member_index = match self.nl.get_link_index(member).await {
            Ok(idx) => idx,
            Err(NetworkError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.nl.set_link_nomaster(member_index).await
    }

    async fn delete_bridge(&self, name: &str) -> NetworkResult<()> {
        self.nl.delete_link(name).await
    }
}

/// Dense, reclaimed numbering of `bn<N>` bridges, N >= 1.
#[derive(Debug, Default)]
pub struct BridgeNumAllocator {
    assigned: BTreeMap<Uuid, u32>,
}

impl BridgeNumAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number held by `instance`, or the lowest free one.
    pub fn allocate(&mut self, instance: Uuid) -> NetworkResult<u32> {
        if let Some(num) = self.assigned.get(&instance) {
            return Ok(*num);
        }
        let in_use: Vec<u32> = self.assigned.values().copied().collect();
        let num = (1..=u16::MAX as u32)
            .find(|n| !in_use.contains(n))
            .ok_or_else(|| NetworkError::Validation("bridge numbers exhausted".to_string()))?;
        self.assigned.insert(instance, num);
        Ok(num)
    }

    pub fn free(&mut self, instance: Uuid) -> Option<u32> {
        self.assigned.remove(&instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_mac_is_deterministic() {
        assert_eq!(format_mac(&bridge_mac(1)), "00:16:3e:06:00:01");
        assert_eq!(format_mac(&bridge_mac(0x1ff)), "00:16:3e:06:01:ff");
        assert_eq!(bridge_name(7), "bn7");
    }

    #[test]
    fn test_allocator_is_dense_and_reclaims() {
        let mut alloc = BridgeNumAllocator::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(alloc.allocate(a).unwrap(), 1);
        assert_eq!(alloc.allocate(b).unwrap(), 2);
        assert_eq!(alloc.allocate(a).unwrap(), 1);

        assert_eq!(alloc.free(a), Some(1));
        assert_eq!(alloc.allocate(c).unwrap(), 1);
        assert_eq!(alloc.allocate(b).unwrap(), 2);
        assert_eq!(alloc.free(a), None);
    }
}
