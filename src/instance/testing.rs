// Recording fakes for the network instance collaborators.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{Collaborators, InstanceMonitor, MonitorTarget, NetworkInstanceManager, StatusStore};
use crate::apps::{AppNetworks, CloudInit};
use crate::network::acl::{AclArgs, AclProgrammer, AclRule};
use crate::network::bridge::{bridge_mac, format_mac, BridgeInfo, BridgeOps};
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::firewall::{NatOps, NatRule};
use crate::network::vpn::{VpnBinding, VpnDriver};
use crate::services::metadata::{MetadataLauncher, ServerKey};
use crate::services::{LeaseService, LeaseServiceSpec, ServiceBinder};
use crate::types::device::NetworkPortStatus;
use crate::types::{
    AppAttachment, AppNetworkStatus, DeviceNetworkStatus, DeviceStatusHandle,
    NetworkInstanceConfig, ReprogramReason, VpnConfig, VpnStatus,
};
use crate::uplink::UplinkSelector;

fn always_present(_if_name: &str) -> Option<u32> {
    Some(1)
}

/// eth0 is the free management port, wwan0 the metered one.
pub fn device() -> DeviceNetworkStatus {
    DeviceNetworkStatus {
        ports: vec![
            NetworkPortStatus {
                if_name: "eth0".into(),
                logical_label: "ethernet0".into(),
                is_mgmt: true,
                free: true,
                addrs: vec!["192.168.1.10".parse().unwrap()],
                dns_servers: vec!["1.1.1.1".parse().unwrap()],
                ntp_servers: vec!["192.168.1.1".parse().unwrap()],
            },
            NetworkPortStatus {
                if_name: "wwan0".into(),
                logical_label: "wwan0".into(),
                is_mgmt: true,
                free: false,
                addrs: vec!["10.64.0.2".parse().unwrap()],
                dns_servers: vec!["9.9.9.9".parse().unwrap()],
                ntp_servers: Vec::new(),
            },
        ],
    }
}

fn host(subnet: &str, n: u32) -> String {
    let net: ipnetwork::Ipv4Network = subnet.parse().unwrap();
    Ipv4Addr::from(u32::from(net.network()) + n).to_string()
}

pub fn local_config(subnet: &str, activate: bool) -> NetworkInstanceConfig {
    serde_json::from_value(json!({
        "uuid": Uuid::new_v4(),
        "display_name": format!("local-{}", subnet),
        "type": "local",
        "ip_type": "ipv4",
        "logical_label": "uplink",
        "subnet": subnet,
        "gateway": host(subnet, 1),
        "dhcp_range": {"start": host(subnet, 2), "end": host(subnet, 100)},
        "activate": activate,
    }))
    .unwrap()
}

pub fn cloud_config(subnet: &str) -> NetworkInstanceConfig {
    let mut config = local_config(subnet, true);
    config.kind = crate::types::NetworkInstanceType::Cloud;
    config.display_name = format!("cloud-{}", subnet);
    config.vpn = Some(VpnConfig::OnPremIpsec {
        gateway: "192.0.2.1".parse().unwrap(),
        pre_shared_key: "s3cret".into(),
        remote_subnet: "172.16.0.0/16".parse().unwrap(),
    });
    config
}

pub fn switch_config(label: &str, activate: bool) -> NetworkInstanceConfig {
    serde_json::from_value(json!({
        "uuid": Uuid::new_v4(),
        "display_name": "switch",
        "type": "switch",
        "logical_label": label,
        "activate": activate,
    }))
    .unwrap()
}

// ── Bridges ───────────────────────────────────────────────────────────

#[derive(Default)]
struct BridgeLog {
    created: Vec<String>,
    deleted: Vec<String>,
    attached: Vec<(String, String)>,
    detached: Vec<String>,
    plain_links: bool,
}

#[derive(Default)]
pub struct FakeBridges {
    log: Mutex<BridgeLog>,
}

impl FakeBridges {
    pub fn created(&self) -> Vec<String> {
        self.log.lock().created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.log.lock().deleted.clone()
    }

    pub fn attached(&self) -> Vec<(String, String)> {
        self.log.lock().attached.clone()
    }

    pub fn detached(&self) -> Vec<String> {
        self.log.lock().detached.clone()
    }

    /// Makes every looked-up uplink a plain (non-bridge) link.
    pub fn set_plain_links(&self, plain: bool) {
        self.log.lock().plain_links = plain;
    }
}

#[async_trait]
impl BridgeOps for FakeBridges {
    async fn create_bridge(&self, name: &str, bridge_num: u32) -> NetworkResult<BridgeInfo> {
        self.log.lock().created.push(name.to_string());
        Ok(BridgeInfo {
            name: name.to_string(),
            mac: format_mac(&bridge_mac(bridge_num)),
            ifindex: 100 + bridge_num,
        })
    }

    async fn lookup_existing_bridge(&self, if_name: &str) -> NetworkResult<BridgeInfo> {
        if self.log.lock().plain_links {
            return Err(NetworkError::Validation(format!("uplink {} is not a bridge", if_name)));
        }
        Ok(BridgeInfo {
            name: if_name.to_string(),
            mac: "02:00:00:00:00:01".into(),
            ifindex: 2,
        })
    }

    async fn set_bridge_ip(&self, _bridge: &str, _addr: Ipv4Addr, _prefix: u8) -> NetworkResult<()> {
        Ok(())
    }

    async fn attach_member(&self, bridge: &str, member: &str) -> NetworkResult<()> {
        self.log
            .lock()
            .attached
            .push((bridge.to_string(), member.to_string()));
        Ok(())
    }

    async fn detach_member(&self, member: &str) -> NetworkResult<()> {
        self.log.lock().detached.push(member.to_string());
        Ok(())
    }

    async fn delete_bridge(&self, name: &str) -> NetworkResult<()> {
        self.log.lock().deleted.push(name.to_string());
        Ok(())
    }
}

// ── NAT ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeNat {
    installed: Mutex<Vec<NatRule>>,
    ops: Mutex<usize>,
}

impl FakeNat {
    pub fn installed(&self) -> Vec<NatRule> {
        self.installed.lock().clone()
    }

    pub fn op_count(&self) -> usize {
        *self.ops.lock()
    }
}

#[async_trait]
impl NatOps for FakeNat {
    async fn add_rule(&self, rule: &NatRule) -> NetworkResult<()> {
        *self.ops.lock() += 1;
        let mut installed = self.installed.lock();
        if !installed.contains(rule) {
            installed.push(rule.clone());
        }
        Ok(())
    }

    async fn remove_rule(&self, rule: &NatRule) -> NetworkResult<()> {
        *self.ops.lock() += 1;
        self.installed.lock().retain(|r| r != rule);
        Ok(())
    }
}

// ── ACL ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeAcl {
    applied: Mutex<Vec<AclArgs>>,
    removed: Mutex<Vec<AclArgs>>,
    reprogrammed: Mutex<Vec<(AclArgs, ReprogramReason)>>,
}

impl FakeAcl {
    pub fn applied(&self) -> Vec<AclArgs> {
        self.applied.lock().clone()
    }

    pub fn removed(&self) -> Vec<AclArgs> {
        self.removed.lock().clone()
    }

    pub fn reprogrammed(&self) -> Vec<(AclArgs, ReprogramReason)> {
        self.reprogrammed.lock().clone()
    }
}

#[async_trait]
impl AclProgrammer for FakeAcl {
    async fn apply_rules(&self, args: &AclArgs) -> NetworkResult<Vec<AclRule>> {
        self.applied.lock().push(args.clone());
        Ok(Vec::new())
    }

    async fn remove_rules(&self, args: &AclArgs) -> NetworkResult<Vec<AclRule>> {
        self.removed.lock().push(args.clone());
        Ok(Vec::new())
    }

    async fn reprogram_app(&self, args: &AclArgs, reason: &ReprogramReason) -> NetworkResult<()> {
        self.reprogrammed
            .lock()
            .push((args.clone(), reason.clone()));
        Ok(())
    }
}

// ── VPN ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeVpn {
    calls: Mutex<Vec<String>>,
    fail_create: Mutex<bool>,
}

impl FakeVpn {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn set_fail_create(&self, fail: bool) {
        *self.fail_create.lock() = fail;
    }
}

#[async_trait]
impl VpnDriver for FakeVpn {
    async fn create(&self, binding: &VpnBinding, _config: &VpnConfig) -> NetworkResult<VpnStatus> {
        if *self.fail_create.lock() {
            return Err(NetworkError::Vpn(format!("no tunnel for {}", binding.bridge_name)));
        }
        self.calls
            .lock()
            .push(format!("create {}", binding.bridge_name));
        Ok(VpnStatus {
            tunnel_name: format!("vti-{}", binding.bridge_name),
            uplink: binding.uplink.clone(),
            active: false,
        })
    }

    async fn activate(&self, status: &VpnStatus) -> NetworkResult<()> {
        self.calls
            .lock()
            .push(format!("activate {}", status.tunnel_name));
        Ok(())
    }

    async fn inactivate(&self, status: &VpnStatus) -> NetworkResult<()> {
        self.calls
            .lock()
            .push(format!("inactivate {}", status.tunnel_name));
        Ok(())
    }

    async fn destroy(&self, status: &VpnStatus) -> NetworkResult<()> {
        self.calls
            .lock()
            .push(format!("destroy {}", status.tunnel_name));
        Ok(())
    }
}

// ── Lease service ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeLeases {
    events: Mutex<Vec<String>>,
    started: Mutex<Vec<LeaseServiceSpec>>,
    hosts: Mutex<BTreeMap<(String, String), Ipv4Addr>>,
}

impl FakeLeases {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn last_started(&self) -> Option<LeaseServiceSpec> {
        self.started.lock().last().cloned()
    }

    pub fn hosts(&self) -> BTreeMap<(String, String), Ipv4Addr> {
        self.hosts.lock().clone()
    }
}

#[async_trait]
impl LeaseService for FakeLeases {
    fn create_hosts_dir(&self, bridge: &str, _bridge_ip: Option<Ipv4Addr>) -> NetworkResult<()> {
        self.events.lock().push(format!("hosts {}", bridge));
        Ok(())
    }

    fn remove_hosts_dir(&self, bridge: &str) -> NetworkResult<()> {
        self.events.lock().push(format!("rmhosts {}", bridge));
        Ok(())
    }

    fn add_host(&self, bridge: &str, mac: &str, ip: Ipv4Addr, _hostname: &str) -> NetworkResult<()> {
        self.hosts
            .lock()
            .insert((bridge.to_string(), mac.to_string()), ip);
        Ok(())
    }

    fn remove_host(&self, bridge: &str, mac: &str, _hostname: &str) -> NetworkResult<()> {
        self.hosts
            .lock()
            .remove(&(bridge.to_string(), mac.to_string()));
        Ok(())
    }

    async fn start(&self, spec: &LeaseServiceSpec) -> NetworkResult<()> {
        self.events
            .lock()
            .push(format!("start {}", spec.bridge_name));
        self.started.lock().push(spec.clone());
        Ok(())
    }

    async fn stop(&self, bridge: &str) -> NetworkResult<()> {
        self.events.lock().push(format!("stop {}", bridge));
        Ok(())
    }
}

// ── Metadata, monitor, apps ───────────────────────────────────────────

#[derive(Default)]
pub struct FakeLauncher {
    launched: Mutex<Vec<ServerKey>>,
}

impl FakeLauncher {
    pub fn launched(&self) -> Vec<ServerKey> {
        self.launched.lock().clone()
    }
}

impl MetadataLauncher for FakeLauncher {
    fn launch(&self, key: &ServerKey, _shutdown: oneshot::Receiver<()>) -> NetworkResult<SocketAddr> {
        self.launched.lock().push(key.clone());
        Ok(SocketAddr::new(key.bridge_ip.into(), 80))
    }
}

#[derive(Default)]
pub struct FakeMonitor {
    started: Mutex<Vec<Uuid>>,
    stopped: Mutex<Vec<Uuid>>,
}

impl FakeMonitor {
    pub fn started(&self) -> Vec<Uuid> {
        self.started.lock().clone()
    }

    pub fn stopped(&self) -> Vec<Uuid> {
        self.stopped.lock().clone()
    }
}

impl InstanceMonitor for FakeMonitor {
    fn start(&self, target: MonitorTarget) {
        self.started.lock().push(target.instance);
    }

    fn stop(&self, instance: Uuid) {
        self.stopped.lock().push(instance);
    }
}

#[derive(Default)]
pub struct FakeApps {
    attachments: Mutex<Vec<AppAttachment>>,
}

impl FakeApps {
    /// Attaches a new app to `network` and returns its UUID.
    pub fn attach(&self, network: Uuid, mac: &str, ip: Option<Ipv4Addr>) -> Uuid {
        let app = Uuid::new_v4();
        let mut attachments = self.attachments.lock();
        let vif_name = format!("nbu{}", attachments.len() + 1);
        attachments.push(AppAttachment {
            app,
            network,
            vif_name,
            mac: mac.to_string(),
            ip,
        });
        app
    }
}

impl AppNetworks for FakeApps {
    fn app_by_ip(&self, _ip: Ipv4Addr) -> Option<AppNetworkStatus> {
        None
    }

    fn cloud_init(&self, app: Uuid) -> Result<CloudInit, String> {
        Err(format!("no cloud-init for {}", app))
    }

    fn attachments(&self, network: Uuid) -> Vec<AppAttachment> {
        self.attachments
            .lock()
            .iter()
            .filter(|a| a.network == network)
            .cloned()
            .collect()
    }
}

// ── Harness ───────────────────────────────────────────────────────────

pub struct Harness {
    pub manager: NetworkInstanceManager,
    pub device: DeviceStatusHandle,
    pub store: StatusStore,
    pub bridges: Arc<FakeBridges>,
    pub nat: Arc<FakeNat>,
    pub acl: Arc<FakeAcl>,
    pub vpn: Arc<FakeVpn>,
    pub leases: Arc<FakeLeases>,
    pub launcher: Arc<FakeLauncher>,
    pub monitor: Arc<FakeMonitor>,
    pub apps: Arc<FakeApps>,
}

impl Harness {
    pub fn new() -> Self {
        let apps = Arc::new(FakeApps::default());
        Self::build(apps.clone(), apps)
    }

    /// Wires `networks` into the manager in place of the recording fake;
    /// `apps` is then left unused.
    pub fn with_app_networks(networks: Arc<dyn AppNetworks>) -> Self {
        Self::build(networks, Arc::new(FakeApps::default()))
    }

    fn build(networks: Arc<dyn AppNetworks>, apps: Arc<FakeApps>) -> Self {
        let device: DeviceStatusHandle = Arc::new(RwLock::new(device()));
        let store = StatusStore::new();
        let bridges = Arc::new(FakeBridges::default());
        let nat = Arc::new(FakeNat::default());
        let acl = Arc::new(FakeAcl::default());
        let vpn = Arc::new(FakeVpn::default());
        let leases = Arc::new(FakeLeases::default());
        let launcher = Arc::new(FakeLauncher::default());
        let monitor = Arc::new(FakeMonitor::default());

        let services = ServiceBinder::new(leases.clone(), nat.clone(), launcher.clone(), 80);
        let ops = Collaborators {
            bridges: bridges.clone(),
            nat: nat.clone(),
            acl: acl.clone(),
            vpn: vpn.clone(),
            services: Arc::new(services),
            apps: networks,
            monitor: monitor.clone(),
        };
        let manager = NetworkInstanceManager::new(
            device.clone(),
            UplinkSelector::with_index_lookup(always_present),
            store.clone(),
            ops,
        );

        Self {
            manager,
            device,
            store,
            bridges,
            nat,
            acl,
            vpn,
            leases,
            launcher,
            monitor,
            apps,
        }
    }
}
