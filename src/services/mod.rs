// Service binder: per-bridge auxiliary services tied to the bridge IP.
// The DHCP/DNS lease service runs whenever the bridge has an address; the
// metadata server runs for activated Local and Cloud instances.

pub mod dnsmasq;
pub mod metadata;

use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::network::error::NetworkResult;
use crate::network::firewall::{NatOps, NatRule};
pub use dnsmasq::{Dnsmasq, LeaseService, LeaseServiceSpec};
pub use metadata::{MetadataLauncher, MetadataRegistry, ServerKey};

pub struct ServiceBinder {
    leases: Arc<dyn LeaseService>,
    nat: Arc<dyn NatOps>,
    launcher: Arc<dyn MetadataLauncher>,
    registry: MetadataRegistry,
    metadata_port: u16,
}

impl ServiceBinder {
    pub fn new(
        leases: Arc<dyn LeaseService>,
        nat: Arc<dyn NatOps>,
        launcher: Arc<dyn MetadataLauncher>,
        metadata_port: u16,
    ) -> Self {
        Self {
            leases,
            nat,
            launcher,
            registry: MetadataRegistry::new(),
            metadata_port,
        }
    }

    // ── Lease service ─────────────────────────────────────────────────

    pub fn prepare_hosts(&self, bridge: &str, bridge_ip: Option<Ipv4Addr>) -> NetworkResult<()> {
        self.leases.create_hosts_dir(bridge, bridge_ip)
    }

    pub fn remove_hosts(&self, bridge: &str) {
        if let Err(e) = self.leases.remove_hosts_dir(bridge) {
            tracing::warn!("Failed to remove hosts dir of {} (non-fatal): {}", bridge, e);
        }
    }

    pub fn add_host(&self, bridge: &str, mac: &str, ip: Ipv4Addr, hostname: &str) {
        if let Err(e) = self.leases.add_host(bridge, mac, ip, hostname) {
            tracing::warn!("Failed to publish host {} on {} (non-fatal): {}", mac, bridge, e);
        }
    }

    pub fn remove_host(&self, bridge: &str, mac: &str, hostname: &str) {
        if let Err(e) = self.leases.remove_host(bridge, mac, hostname) {
            tracing::warn!("Failed to remove host {} on {} (non-fatal): {}", mac, bridge, e);
        }
    }

    pub async fn start_lease_service(&self, spec: &LeaseServiceSpec) -> NetworkResult<()> {
        self.leases.start(spec).await
    }

    /// Best-effort stop; a service that is not running is fine.
    pub async fn stop_lease_service(&self, bridge: &str) {
        if let Err(e) = self.leases.stop(bridge).await {
            tracing::warn!("Failed to stop lease service on {} (non-fatal): {}", bridge, e);
        }
    }

    // ── Metadata server ───────────────────────────────────────────────

    fn metadata_dnat(&self, bridge: &str, bridge_ip: Ipv4Addr) -> NatRule {
        NatRule::MetadataDnat {
            bridge: bridge.to_string(),
            bridge_ip,
            port: self.metadata_port,
        }
    }

    pub async fn start_metadata_server(&self, bridge: &str, bridge_ip: Ipv4Addr) -> NetworkResult<()> {
        let rule = self.metadata_dnat(bridge, bridge_ip);
        self.nat.add_rule(&rule).await?;

        let key = ServerKey::new(bridge, bridge_ip);
        let (done, shutdown) = oneshot::channel();
        if let Err(e) = self.launcher.launch(&key, shutdown) {
            if let Err(undo) = self.nat.remove_rule(&rule).await {
                tracing::warn!("Failed to remove {} (non-fatal): {}", rule.describe(), undo);
            }
            return Err(e);
        }
        self.registry.register(key, done);
        Ok(())
    }

    pub async fn stop_metadata_server(&self, bridge: &str, bridge_ip: Ipv4Addr) {
        let rule = self.metadata_dnat(bridge, bridge_ip);
        if let Err(e) = self.nat.remove_rule(&rule).await {
            tracing::warn!("Failed to remove {} (non-fatal): {}", rule.describe(), e);
        }
        self.registry.signal_stop(&ServerKey::new(bridge, bridge_ip));
    }

    pub fn metadata_running(&self, bridge: &str, bridge_ip: Ipv4Addr) -> bool {
        self.registry.contains(&ServerKey::new(bridge, bridge_ip))
    }
}
