//! Application network registry: which apps sit on which network instance,
//! and the identity and cloud-init material the metadata server hands out.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use uuid::Uuid;

use crate::types::{AppAttachment, AppNetworkStatus};

/// Cloud-init material for one app.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudInit {
    pub ssh_keys: Vec<String>,
    /// base64-encoded payload
    pub user_data: String,
}

/// Read side of the app-network subsystem.
pub trait AppNetworks: Send + Sync {
    fn app_by_ip(&self, ip: Ipv4Addr) -> Option<AppNetworkStatus>;

    fn cloud_init(&self, app: Uuid) -> Result<CloudInit, String>;

    /// Interfaces of every app attached to `network`.
    fn attachments(&self, network: Uuid) -> Vec<AppAttachment>;
}

#[derive(Default)]
pub struct AppRegistry {
    apps: RwLock<HashMap<Uuid, AppNetworkStatus>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the registered apps, returning the ones that disappeared.
    pub fn replace_all(&self, apps: Vec<AppNetworkStatus>) -> Vec<AppNetworkStatus> {
        let mut incoming: HashMap<Uuid, AppNetworkStatus> =
            apps.into_iter().map(|app| (app.uuid, app)).collect();
        let mut guard = self.apps.write();
        let removed: Vec<AppNetworkStatus> = guard
            .values()
            .filter(|app| !incoming.contains_key(&app.uuid))
            .cloned()
            .collect();
        // keep addresses already leased to interfaces that are still present
        for (uuid, app) in incoming.iter_mut() {
            if let Some(existing) = guard.get(uuid) {
                for iface in app.interfaces.iter_mut() {
                    if iface.ip.is_none() {
                        iface.ip = existing
                            .interfaces
                            .iter()
                            .find(|old| old.mac == iface.mac && old.network == iface.network)
                            .and_then(|old| old.ip);
                    }
                }
            }
        }
        *guard = incoming;
        removed
    }

    pub fn set_interface_ip(&self, app: Uuid, mac: &str, ip: Option<Ipv4Addr>) {
        if let Some(status) = self.apps.write().get_mut(&app) {
            for iface in status.interfaces.iter_mut().filter(|i| i.mac == mac) {
                iface.ip = ip;
            }
        }
    }

    pub fn all(&self) -> Vec<AppNetworkStatus> {
        self.apps.read().values().cloned().collect()
    }
}

impl AppNetworks for AppRegistry {
    fn app_by_ip(&self, ip: Ipv4Addr) -> Option<AppNetworkStatus> {
        self.apps.read().values().find(|app| app.has_ip(ip)).cloned()
    }

    fn cloud_init(&self, app: Uuid) -> Result<CloudInit, String> {
        let apps = self.apps.read();
        let status = apps
            .get(&app)
            .ok_or_else(|| format!("no app network config for {}", app))?;
        Ok(CloudInit {
            ssh_keys: status.ssh_keys.clone(),
            user_data: status.user_data.clone().unwrap_or_default(),
        })
    }

    fn attachments(&self, network: Uuid) -> Vec<AppAttachment> {
        let apps = self.apps.read();
        let mut attached: Vec<AppAttachment> = apps
            .values()
            .flat_map(|app| {
                app.interfaces
                    .iter()
                    .filter(|iface| iface.network == network)
                    .map(|iface| AppAttachment {
                        app: app.uuid,
                        network,
                        vif_name: iface.vif_name.clone(),
                        mac: iface.mac.clone(),
                        ip: iface.ip,
                    })
            })
            .collect();
        attached.sort_by(|a, b| a.mac.cmp(&b.mac));
        attached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::app::AppInterface;

    fn app(network: Uuid, mac: &str, ip: Option<&str>) -> AppNetworkStatus {
        AppNetworkStatus {
            uuid: Uuid::new_v4(),
            display_name: "web".into(),
            ssh_keys: vec!["ssh-ed25519 AAAA test".into()],
            user_data: None,
            interfaces: vec![AppInterface {
                network,
                mac: mac.into(),
                vif_name: "nbu1x1".into(),
                ip: ip.map(|s| s.parse().unwrap()),
            }],
        }
    }

    #[test]
    fn test_lookup_by_ip_and_attachments() {
        let registry = AppRegistry::new();
        let net = Uuid::new_v4();
        let web = app(net, "aa:bb:cc:dd:ee:01", Some("10.1.0.2"));
        let other = app(Uuid::new_v4(), "aa:bb:cc:dd:ee:02", Some("10.2.0.2"));
        registry.replace_all(vec![web.clone(), other]);

        assert_eq!(
            registry.app_by_ip("10.1.0.2".parse().unwrap()).map(|a| a.uuid),
            Some(web.uuid)
        );
        assert!(registry.app_by_ip("10.1.0.9".parse().unwrap()).is_none());

        let attached = registry.attachments(net);
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].app, web.uuid);
    }

    #[test]
    fn test_replace_all_keeps_leased_ip() {
        let registry = AppRegistry::new();
        let net = Uuid::new_v4();
        let mut web = app(net, "aa:bb:cc:dd:ee:01", None);
        registry.replace_all(vec![web.clone()]);
        registry.set_interface_ip(web.uuid, "aa:bb:cc:dd:ee:01", Some("10.1.0.2".parse().unwrap()));

        web.display_name = "web-renamed".into();
        let removed = registry.replace_all(vec![web.clone()]);
        assert!(removed.is_empty());
        assert!(registry.app_by_ip("10.1.0.2".parse().unwrap()).is_some());

        let removed = registry.replace_all(vec![]);
        assert_eq!(removed.len(), 1);
        assert!(registry.cloud_init(web.uuid).is_err());
    }
}
