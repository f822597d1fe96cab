//! Records shared between the state machine, the service binder and the
//! published status store.

pub mod app;
pub mod device;
pub mod instance;

pub use app::{AppAttachment, AppNetworkStatus, ReprogramReason};
pub use device::{DeviceNetworkStatus, DeviceStatusHandle};
pub use instance::{
    AddressType, ChangeInProgress, DhcpRange, NetworkInstanceConfig, NetworkInstanceMetrics,
    NetworkInstanceStatus, NetworkInstanceType, VpnConfig, VpnStatus,
};
