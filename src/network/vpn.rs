// VPN tunnel collaborator used by Cloud network instances.

use crate::network::error::{NetworkError, NetworkResult};
use crate::types::{VpnConfig, VpnStatus};
use async_trait::async_trait;
use ipnetwork::Ipv4Network;

/// Instance-side parameters a tunnel is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnBinding {
    pub bridge_name: String,
    pub uplink: String,
    pub subnet: Option<Ipv4Network>,
}

#[async_trait]
pub trait VpnDriver: Send + Sync {
    async fn create(&self, binding: &VpnBinding, config: &VpnConfig) -> NetworkResult<VpnStatus>;
    async fn activate(&self, status: &VpnStatus) -> NetworkResult<()>;
    async fn inactivate(&self, status: &VpnStatus) -> NetworkResult<()>;
    async fn destroy(&self, status: &VpnStatus) -> NetworkResult<()>;
}

/// Driver used when no tunnel backend is installed: every Cloud instance
/// fails at create with a recorded error.
pub struct UnconfiguredVpn;

#[async_trait]
impl VpnDriver for UnconfiguredVpn {
    async fn create(&self, binding: &VpnBinding, _config: &VpnConfig) -> NetworkResult<VpnStatus> {
        Err(NetworkError::Vpn(format!(
            "no VPN backend available for {}",
            binding.bridge_name
        )))
    }

    async fn activate(&self, status: &VpnStatus) -> NetworkResult<()> {
        Err(NetworkError::Vpn(format!(
            "no VPN backend available for {}",
            status.tunnel_name
        )))
    }

    async fn inactivate(&self, _status: &VpnStatus) -> NetworkResult<()> {
        Ok(())
    }

    async fn destroy(&self, _status: &VpnStatus) -> NetworkResult<()> {
        Ok(())
    }
}
