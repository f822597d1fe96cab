use crate::network::error::{NetworkError, NetworkResult};
use futures::TryStreamExt;
use netlink_packet_route::link::nlas::{Info, InfoKind, Nla as LinkNla};
use std::net::Ipv4Addr;

/// Attributes of a link that the bridge manager cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDetails {
    pub index: u32,
    pub name: String,
    pub mac: Option<[u8; 6]>,
    pub is_bridge: bool,
}

/// Persistent netlink handle wrapping rtnetlink for bridge and link operations.
/// One handle per process, shared by every network instance.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

impl NetlinkHandle {
    /// Create a new netlink handle with a persistent connection
    pub fn new() -> NetworkResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    // ── Link lookup ───────────────────────────────────────────────────

    /// Fetch a link by name. Returns NotFound if the link doesn't exist.
    pub async fn get_link(&self, name: &str) -> NetworkResult<LinkDetails> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        let msg = match links.try_next().await {
            Ok(Some(msg)) => msg,
            Ok(None) => return Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) => {
                // rtnetlink returns an error for "not found" on some kernels
                if e.to_string().contains("No such device") {
                    return Err(NetworkError::NotFound(format!("link {}", name)));
                }
                return Err(NetworkError::Netlink(e));
            }
        };

        let mut details = LinkDetails {
            index: msg.header.index,
            name: name.to_string(),
            mac: None,
            is_bridge: false,
        };
        for nla in &msg.nlas {
            match nla {
                LinkNla::Address(bytes) if bytes.len() == 6 => {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(bytes);
                    details.mac = Some(mac);
                }
                LinkNla::Info(infos) => {
                    details.is_bridge = infos
                        .iter()
                        .any(|info| matches!(info, Info::Kind(InfoKind::Bridge)));
                }
                _ => {}
            }
        }
        Ok(details)
    }

    /// Get a link's ifindex by name
    pub async fn get_link_index(&self, name: &str) -> NetworkResult<u32> {
        Ok(self.get_link(name).await?.index)
    }

    // ── Bridge operations ─────────────────────────────────────────────

    /// Create a bridge interface and return its index. Fails if the name is taken.
    pub async fn create_bridge(&self, name: &str) -> NetworkResult<u32> {
        self.handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
            .map_err(|e| {
                if e.to_string().contains("File exists") {
                    return NetworkError::AlreadyExists(name.to_string());
                }
                NetworkError::Netlink(e)
            })?;

        self.get_link_index(name).await
    }

    pub async fn set_link_address(&self, index: u32, mac: [u8; 6]) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .address(mac.to_vec())
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Add an IPv4 address with prefix to a link
    pub async fn add_address(
        &self,
        link_index: u32,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> NetworkResult<()> {
        let result = self
            .handle
            .address()
            .add(link_index, std::net::IpAddr::V4(addr), prefix_len)
            .execute()
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()), // already assigned
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    /// Set a link UP by index
    pub async fn set_link_up(&self, index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Set a link's master (attach to bridge)
    pub async fn set_link_master(&self, link_index: u32, master_index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(link_index)
            .master(master_index)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Clear a link's master (detach from bridge)
    pub async fn set_link_nomaster(&self, link_index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(link_index)
            .nomaster()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Delete a link by name. Idempotent - returns Ok if link doesn't exist.
    pub async fn delete_link(&self, name: &str) -> NetworkResult<()> {
        let index = match self.get_link_index(name).await {
            Ok(idx) => idx,
            Err(NetworkError::NotFound(_)) => return Ok(()), // already gone
            Err(e) => return Err(e),
        };

        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such device") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }
}
