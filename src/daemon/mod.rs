//! The agent process: one dispatch loop owns the instance manager and
//! serializes every request against it. Intake reloads, per-instance
//! monitors and signals feed the loop; nothing else mutates instance state.

pub mod events;
pub mod intake;
pub mod metrics;
pub mod monitor;

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use uuid::Uuid;

use crate::apps::AppRegistry;
use crate::config::AgentConfig;
use crate::instance::{Collaborators, NetworkInstanceManager, StatusStore};
use crate::network::acl::IptablesAcl;
use crate::network::bridge::BridgeManager;
use crate::network::error::NetworkResult;
use crate::network::firewall::{Firewall, NatOps};
use crate::network::netlink::NetlinkHandle;
use crate::network::vpn::UnconfiguredVpn;
use crate::services::metadata::{HttpMetadataLauncher, MetadataContext};
use crate::services::{Dnsmasq, ServiceBinder};
use crate::types::{AppNetworkStatus, DeviceNetworkStatus, DeviceStatusHandle};
use crate::uplink::UplinkSelector;

use events::{EventReceiver, EventSender, NetworkInstanceEvent};
use intake::IntakeFile;
use metrics::MetricsCollector;
use monitor::UplinkMonitor;

pub struct Daemon {
    config: AgentConfig,
    manager: NetworkInstanceManager,
    apps: Arc<AppRegistry>,
    device: DeviceStatusHandle,
    collector: MetricsCollector,
    events: EventSender,
    inbox: EventReceiver,
    intake: IntakeFile,
}

impl Daemon {
    /// Wires the production collaborators. Must run inside the runtime: the
    /// netlink connection is spawned onto it.
    pub async fn build(config: AgentConfig) -> NetworkResult<Self> {
        std::fs::create_dir_all(&config.run_dir)?;

        let device: DeviceStatusHandle = Arc::new(RwLock::new(DeviceNetworkStatus::default()));
        let apps = Arc::new(AppRegistry::new());
        let store = StatusStore::persisted(config.status_dir())?;
        let selector = UplinkSelector::new();
        let (events, inbox) = events::channel();

        let netlink = Arc::new(NetlinkHandle::new()?);
        let nat: Arc<dyn NatOps> = Arc::new(Firewall::new());
        let leases = Arc::new(Dnsmasq::new(&config.dnsmasq_bin, &config.run_dir));
        let launcher = Arc::new(HttpMetadataLauncher::new(
            MetadataContext {
                store: store.clone(),
                device: device.clone(),
                apps: apps.clone(),
            },
            config.metadata_port,
        ));
        let services = Arc::new(ServiceBinder::new(
            leases,
            nat.clone(),
            launcher,
            config.metadata_port,
        ));
        let monitor = Arc::new(UplinkMonitor::new(
            device.clone(),
            selector,
            events.clone(),
            config.monitor_interval,
        ));

        let ops = Collaborators {
            bridges: Arc::new(BridgeManager::new(netlink)),
            nat,
            acl: Arc::new(IptablesAcl::new()),
            vpn: Arc::new(UnconfiguredVpn),
            services,
            apps: apps.clone(),
            monitor,
        };
        let manager = NetworkInstanceManager::new(device.clone(), selector, store, ops);

        Ok(Self::from_parts(config, manager, apps, device, (events, inbox)))
    }

    fn from_parts(
        config: AgentConfig,
        manager: NetworkInstanceManager,
        apps: Arc<AppRegistry>,
        device: DeviceStatusHandle,
        (events, inbox): (EventSender, EventReceiver),
    ) -> Self {
        Self {
            config,
            manager,
            apps,
            device,
            collector: MetricsCollector::new(),
            events,
            inbox,
            intake: IntakeFile::default(),
        }
    }

    /// Runs until SIGINT or SIGTERM, then tears every instance down.
    pub async fn run(mut self) -> NetworkResult<()> {
        tracing::info!(
            "edgenet agent starting (config {}, run dir {})",
            self.config.config_path.display(),
            self.config.run_dir.display()
        );

        let mut hangup = signal(SignalKind::hangup())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut metrics_tick = tokio::time::interval(self.config.metrics_interval);

        self.reload();

        loop {
            tokio::select! {
                Some(event) = self.inbox.recv() => self.handle(event).await,
                _ = metrics_tick.tick() => self.publish_metrics(),
                _ = hangup.recv() => {
                    tracing::info!("SIGHUP received, reloading {}", self.config.config_path.display());
                    self.reload();
                }
                _ = interrupt.recv() => {
                    tracing::info!("SIGINT received, shutting down");
                    break;
                }
                _ = terminate.recv() => {
                    tracing::info!("SIGTERM received, shutting down");
                    break;
                }
            }
        }

        self.manager.delete_all().await;
        tracing::info!("edgenet agent stopped");
        Ok(())
    }

    /// Reads the intake file and queues the events that move the agent to it.
    /// A file that fails to parse leaves the current state untouched.
    fn reload(&mut self) {
        let next = match IntakeFile::load_or_default(&self.config.config_path) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(
                    "Failed to load {}, keeping current configuration: {}",
                    self.config.config_path.display(),
                    e
                );
                return;
            }
        };

        let queued = intake::diff(&self.intake, &next);
        tracing::info!("Configuration loaded, {} change(s) queued", queued.len());
        for event in queued {
            if self.events.send(event).is_err() {
                tracing::error!("Event channel closed during reload");
                return;
            }
        }
        self.intake = next;
    }

    async fn handle(&mut self, event: NetworkInstanceEvent) {
        let kind = event.kind();
        tracing::debug!("Handling {} event", kind);

        let result = match event {
            NetworkInstanceEvent::Create(config) => self.manager.create(config).await,
            NetworkInstanceEvent::Modify { old, new } => {
                tracing::debug!("Network instance {} changed", old.name());
                self.manager.modify(new).await
            }
            NetworkInstanceEvent::Delete(uuid) => {
                self.forget_app_addresses(uuid);
                self.manager.delete(uuid).await;
                Ok(())
            }
            NetworkInstanceEvent::Reprogram { instance, reason } => {
                self.manager.reprogram_instance_apps(instance, reason).await;
                Ok(())
            }
            NetworkInstanceEvent::UplinkChanged { instance, uplink } => {
                self.manager.uplink_changed(instance, uplink).await
            }
            NetworkInstanceEvent::AddressChanged { if_name } => {
                self.manager.address_changed(&if_name).await;
                Ok(())
            }
            NetworkInstanceEvent::DeviceStatus(device) => {
                tracing::info!("Device network status updated ({} port(s))", device.ports.len());
                *self.device.write() = device;
                Ok(())
            }
            NetworkInstanceEvent::Apps(apps) => {
                self.apply_apps(apps);
                Ok(())
            }
        };

        match result {
            Err(e) if e.is_validation() => tracing::warn!("{} event rejected: {}", kind, e),
            Err(e) => tracing::error!("{} event failed: {}", kind, e),
            Ok(()) => {}
        }
    }

    /// Registers the new app set, releasing the leases of apps that went
    /// away and leasing addresses for every attached interface.
    fn apply_apps(&mut self, apps: Vec<AppNetworkStatus>) {
        for app in self.apps.replace_all(apps) {
            let hostname = app.uuid.to_string();
            for iface in &app.interfaces {
                if let Err(e) = self.manager.detach_app_host(iface.network, &iface.mac, &hostname) {
                    tracing::debug!("No lease to release for {} on {}: {}", iface.mac, iface.network, e);
                }
            }
        }

        for app in self.apps.all() {
            let hostname = app.uuid.to_string();
            for iface in &app.interfaces {
                match self.manager.attach_app_host(iface.network, &iface.mac, &hostname) {
                    Ok(ip) => self.apps.set_interface_ip(app.uuid, &iface.mac, ip),
                    Err(e) => tracing::warn!(
                        "Cannot lease an address for app {} interface {}: {}",
                        app.uuid,
                        iface.mac,
                        e
                    ),
                }
            }
        }
    }

    fn forget_app_addresses(&self, network: Uuid) {
        for app in self.apps.all() {
            for iface in app.interfaces.iter().filter(|i| i.network == network) {
                self.apps.set_interface_ip(app.uuid, &iface.mac, None);
            }
        }
    }

    fn publish_metrics(&self) {
        for status in self.manager.statuses() {
            let metrics = self.collector.collect(status);
            self.manager.store().publish_metrics(&metrics);
        }
    }
}
