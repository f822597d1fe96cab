use thiserror::Error;

/// Error type for network instance operations.
///
/// Validation errors are raised before any kernel state is touched; every
/// other variant describes a failed step against the host.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Configuration rejected by a sanity check
    #[error("validation error: {0}")]
    Validation(String),

    /// Netlink operation failed
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    /// System I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// External command exited unsuccessfully
    #[error("command '{cmd}' failed: {stderr}")]
    Command { cmd: String, stderr: String },

    /// Resource not found (interface, bridge, lease, etc.)
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The DHCP range of an instance has no unassigned address left
    #[error("no free IP addresses in DHCP range {range} for network instance {instance}")]
    NoFreeAddress { instance: String, range: String },

    /// VPN collaborator failure
    #[error("vpn error: {0}")]
    Vpn(String),

    /// ACL collaborator failure
    #[error("acl error: {0}")]
    Acl(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NetworkError {
    pub fn is_validation(&self) -> bool {
        matches!(self, NetworkError::Validation(_))
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
