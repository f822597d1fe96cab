// Kernel networking for network instances: netlink bridges, iptables NAT
// and ACLs, policy routing and conntrack.

pub mod acl;
pub mod bridge;
pub mod conntrack;
pub mod error;
pub mod firewall;
pub mod netlink;
pub mod pbr;
pub mod vpn;

pub use acl::AclProgrammer;
pub use bridge::BridgeOps;
pub use firewall::NatOps;
pub use vpn::VpnDriver;
