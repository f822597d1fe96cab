// Per-instance background watcher. Polls the device port snapshot and
// reports uplink and address changes to the dispatch loop.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::events::{EventSender, NetworkInstanceEvent};
use crate::instance::{InstanceMonitor, MonitorTarget};
use crate::types::{DeviceNetworkStatus, DeviceStatusHandle, NetworkInstanceType};
use crate::uplink::UplinkSelector;

/// One observation of the things a watcher compares between polls.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Observation {
    uplink: Option<String>,
    bridge_addr: Option<Ipv4Addr>,
}

fn observe(
    target: &MonitorTarget,
    device: &DeviceNetworkStatus,
    selector: &UplinkSelector,
) -> Observation {
    // Switch instances follow their label through the bridge, not NAT
    let uplink = match target.kind {
        NetworkInstanceType::Switch => None,
        _ if target.logical_label.is_empty() => None,
        _ => Some(
            selector
                .first_uplink(device, &target.logical_label)
                .unwrap_or_default(),
        ),
    };
    Observation {
        uplink,
        bridge_addr: device.local_addr_no_link_local(&target.bridge_name),
    }
}

/// Events implied by moving from `before` to `after`.
fn changes(target: &MonitorTarget, before: &Observation, after: &Observation) -> Vec<NetworkInstanceEvent> {
    let mut events = Vec::new();
    if let Some(uplink) = &after.uplink {
        if before.uplink.as_ref() != Some(uplink) {
            events.push(NetworkInstanceEvent::UplinkChanged {
                instance: target.instance,
                uplink: uplink.clone(),
            });
        }
    }
    if before.bridge_addr != after.bridge_addr {
        events.push(NetworkInstanceEvent::AddressChanged {
            if_name: target.bridge_name.clone(),
        });
    }
    events
}

pub struct UplinkMonitor {
    device: DeviceStatusHandle,
    selector: UplinkSelector,
    events: EventSender,
    interval: Duration,
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl UplinkMonitor {
    pub fn new(
        device: DeviceStatusHandle,
        selector: UplinkSelector,
        events: EventSender,
        interval: Duration,
    ) -> Self {
        Self {
            device,
            selector,
            events,
            interval,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn running(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl InstanceMonitor for UplinkMonitor {
    fn start(&self, target: MonitorTarget) {
        let device = self.device.clone();
        let selector = self.selector;
        let events = self.events.clone();
        let interval = self.interval;
        let instance = target.instance;

        let task = tokio::spawn(async move {
            let mut last = {
                let device = device.read();
                let mut first = observe(&target, &device, &selector);
                // the instance starts out on its current uplink
                if first.uplink.is_some() {
                    first.uplink = Some(target.current_uplink.clone());
                }
                first
            };
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let now = {
                    let device = device.read();
                    observe(&target, &device, &selector)
                };
                for event in changes(&target, &last, &now) {
                    tracing::debug!("Monitor of {} reports {}", target.bridge_name, event.kind());
                    if events.send(event).is_err() {
                        tracing::debug!("Dispatch loop gone, monitor of {} exiting", target.bridge_name);
                        return;
                    }
                }
                last = now;
            }
        });

        if let Some(previous) = self.tasks.lock().insert(instance, task) {
            previous.abort();
        }
        tracing::debug!("Started monitor for network instance {}", instance);
    }

    fn stop(&self, instance: Uuid) {
        if let Some(task) = self.tasks.lock().remove(&instance) {
            task.abort();
            tracing::debug!("Stopped monitor for network instance {}", instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::device::NetworkPortStatus;
    use parking_lot::RwLock;
    use std::sync::Arc;

    fn always_present(_if_name: &str) -> Option<u32> {
        Some(1)
    }

    fn port(if_name: &str, addr: &str) -> NetworkPortStatus {
        NetworkPortStatus {
            if_name: if_name.into(),
            is_mgmt: true,
            addrs: vec![addr.parse().unwrap()],
            ..Default::default()
        }
    }

    fn target(kind: NetworkInstanceType, bridge: &str) -> MonitorTarget {
        MonitorTarget {
            instance: Uuid::new_v4(),
            kind,
            logical_label: "uplink".into(),
            bridge_name: bridge.into(),
            current_uplink: "eth0".into(),
        }
    }

    #[test]
    fn test_uplink_change_detected() {
        let selector = UplinkSelector::with_index_lookup(always_present);
        let target = target(NetworkInstanceType::Local, "bn1");
        let before = observe(
            &target,
            &DeviceNetworkStatus { ports: vec![port("eth0", "192.168.1.10")] },
            &selector,
        );
        let after = observe(
            &target,
            &DeviceNetworkStatus { ports: vec![port("wwan0", "10.64.0.2")] },
            &selector,
        );
        assert_eq!(
            changes(&target, &before, &after),
            vec![NetworkInstanceEvent::UplinkChanged {
                instance: target.instance,
                uplink: "wwan0".into()
            }]
        );
        assert!(changes(&target, &after, &after).is_empty());
    }

    #[test]
    fn test_switch_reports_address_changes_only() {
        let selector = UplinkSelector::with_index_lookup(always_present);
        let target = target(NetworkInstanceType::Switch, "eth0");
        let before = observe(
            &target,
            &DeviceNetworkStatus { ports: vec![port("eth0", "192.168.1.10")] },
            &selector,
        );
        let after = observe(
            &target,
            &DeviceNetworkStatus { ports: vec![port("eth0", "192.168.1.77")] },
            &selector,
        );
        assert_eq!(before.uplink, None);
        assert_eq!(
            changes(&target, &before, &after),
            vec![NetworkInstanceEvent::AddressChanged { if_name: "eth0".into() }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_task_sends_and_stops() {
        let device: DeviceStatusHandle = Arc::new(RwLock::new(DeviceNetworkStatus {
            ports: vec![port("eth0", "192.168.1.10")],
        }));
        let (tx, mut rx) = super::super::events::channel();
        let monitor = UplinkMonitor::new(
            device.clone(),
            UplinkSelector::with_index_lookup(always_present),
            tx,
            Duration::from_secs(10),
        );
        let target = target(NetworkInstanceType::Local, "bn1");
        let instance = target.instance;
        monitor.start(target);
        assert_eq!(monitor.running(), 1);

        device.write().ports = vec![port("wwan0", "10.64.0.2")];
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            NetworkInstanceEvent::UplinkChanged {
                instance,
                uplink: "wwan0".into()
            }
        );

        monitor.stop(instance);
        assert_eq!(monitor.running(), 0);
    }
}
