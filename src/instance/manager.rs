// Network instance state machine: create, modify, activate, inactivate,
// delete and reprogram after an uplink change.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use uuid::Uuid;

use super::{sanity, Collaborators, MonitorTarget, StatusStore};
use crate::ipam;
use crate::network::acl::{AclArgs, AppAclTarget};
use crate::network::bridge::{bridge_name, BridgeNumAllocator};
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::firewall::NatRule;
use crate::network::pbr;
use crate::network::vpn::VpnBinding;
use crate::services::LeaseServiceSpec;
use crate::types::{
    AppAttachment, ChangeInProgress, DeviceStatusHandle, NetworkInstanceConfig,
    NetworkInstanceStatus, NetworkInstanceType, ReprogramReason,
};
use crate::uplink::UplinkSelector;

/// Prefix length used for the bridge address when no subnet is configured.
const DEFAULT_PREFIX_LEN: u8 = 24;

pub struct NetworkInstanceManager {
    instances: BTreeMap<Uuid, NetworkInstanceStatus>,
    bridge_nums: BridgeNumAllocator,
    device: DeviceStatusHandle,
    selector: UplinkSelector,
    store: StatusStore,
    ops: Collaborators,
}

impl NetworkInstanceManager {
    pub fn new(
        device: DeviceStatusHandle,
        selector: UplinkSelector,
        store: StatusStore,
        ops: Collaborators,
    ) -> Self {
        Self {
            instances: BTreeMap::new(),
            bridge_nums: BridgeNumAllocator::new(),
            device,
            selector,
            store,
            ops,
        }
    }

    #[cfg(test)]
    pub fn get(&self, uuid: Uuid) -> Option<&NetworkInstanceStatus> {
        self.instances.get(&uuid)
    }

    pub fn statuses(&self) -> impl Iterator<Item = &NetworkInstanceStatus> {
        self.instances.values()
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    // ── Requests ──────────────────────────────────────────────────────

    pub async fn create(&mut self, config: NetworkInstanceConfig) -> NetworkResult<()> {
        if self.instances.contains_key(&config.uuid) {
            tracing::info!(
                "Network instance {} already exists, applying as modify",
                config.name()
            );
            return self.modify_existing(config).await;
        }
        self.create_new(config).await
    }

    pub async fn modify(&mut self, config: NetworkInstanceConfig) -> NetworkResult<()> {
        if !self.instances.contains_key(&config.uuid) {
            tracing::info!("Network instance {} is unknown, applying as create", config.name());
            return self.create_new(config).await;
        }
        self.modify_existing(config).await
    }

    /// Full teardown. Unknown instances are ignored.
    pub async fn delete(&mut self, uuid: Uuid) {
        let Some(mut status) = self.instances.remove(&uuid) else {
            tracing::warn!("Delete for unknown network instance {}", uuid);
            return;
        };

        tracing::info!("Deleting network instance {}", status.config.name());
        status.change_in_progress = ChangeInProgress::Delete;
        self.store.publish(&status);

        if status.activated {
            self.inactivate(&mut status).await;
        }

        if status.kind() == NetworkInstanceType::Cloud {
            if let Some(vpn) = status.vpn_status.take() {
                if let Err(e) = self.ops.vpn.destroy(&vpn).await {
                    tracing::warn!("Failed to destroy VPN {} (non-fatal): {}", vpn.tunnel_name, e);
                }
            }
        }

        for attachment in self.ops.apps.attachments(uuid) {
            let args = self.app_acl_args(&status, &attachment);
            if let Err(e) = self.ops.acl.remove_rules(&args).await {
                tracing::warn!("Failed to remove ACLs of app {} (non-fatal): {}", attachment.app, e);
            }
        }

        if !status.bridge_name.is_empty() {
            let bridge = status.bridge_name.clone();
            self.ops.services.stop_lease_service(&bridge).await;
            self.ops.services.remove_hosts(&bridge);
            self.ops.monitor.stop(uuid);

            if let Err(e) = self.ops.acl.remove_rules(&self.instance_acl_args(&status)).await {
                tracing::warn!("Failed to remove ACLs on {} (non-fatal): {}", bridge, e);
            }
            if status.owns_bridge() {
                if let Err(e) = self.ops.bridges.delete_bridge(&bridge).await {
                    tracing::warn!("Failed to delete bridge {} (non-fatal): {}", bridge, e);
                }
            }
        }

        if let Some(num) = self.bridge_nums.free(uuid) {
            tracing::debug!("Released bridge number {} of {}", num, status.config.name());
        }
        self.store.unpublish(uuid);
        self.store.unpublish_metrics(uuid);
        tracing::info!("Deleted network instance {}", status.config.name());
    }

    pub async fn delete_all(&mut self) {
        let uuids: Vec<Uuid> = self.instances.keys().copied().collect();
        for uuid in uuids {
            self.delete(uuid).await;
        }
    }

    /// The resolved uplink of an instance changed.
    pub async fn uplink_changed(&mut self, uuid: Uuid, uplink: String) -> NetworkResult<()> {
        let Some(mut status) = self.instances.remove(&uuid) else {
            tracing::debug!("Uplink change for unknown network instance {}", uuid);
            return Ok(());
        };

        if status.current_uplink_intf != uplink {
            tracing::info!(
                "Network instance {} uplink changed from '{}' to '{}'",
                status.config.name(),
                status.current_uplink_intf,
                uplink
            );
            status.prev_uplink_intf = std::mem::replace(&mut status.current_uplink_intf, uplink);
        }
        status.need_intf_update = true;
        self.store.publish(&status);

        let result = self.reprogram(&mut status).await;
        self.finish(status, result, "reprogram")
    }

    /// Re-derives the ACLs of every app attached to an instance.
    pub async fn reprogram_instance_apps(&mut self, uuid: Uuid, reason: ReprogramReason) {
        match self.instances.get(&uuid) {
            Some(status) => self.reprogram_apps(status, &reason).await,
            None => tracing::warn!("Reprogram for unknown network instance {}", uuid),
        }
    }

    /// An address changed on `if_name`; refreshes the bridge IP of every
    /// activated Switch instance using it.
    pub async fn address_changed(&mut self, if_name: &str) {
        let affected: Vec<Uuid> = self
            .instances
            .values()
            .filter(|s| {
                s.kind() == NetworkInstanceType::Switch
                    && s.activated
                    && (s.bridge_name == if_name || s.if_name_list.iter().any(|n| n == if_name))
            })
            .map(|s| s.uuid())
            .collect();

        for uuid in affected {
            let Some(mut status) = self.instances.remove(&uuid) else {
                continue;
            };
            self.refresh_bridge_ip(&mut status).await;
            self.store.publish(&status);
            self.instances.insert(uuid, status);
        }
    }

    pub fn lookup_or_allocate(&mut self, uuid: Uuid, mac: &str) -> NetworkResult<Option<Ipv4Addr>> {
        let status = self
            .instances
            .get_mut(&uuid)
            .ok_or_else(|| NetworkError::NotFound(format!("network instance {}", uuid)))?;
        let before = status.ip_assignments.len();
        let ip = ipam::lookup_or_allocate(status, mac)?;
        if status.ip_assignments.len() != before {
            self.store.publish(status);
        }
        Ok(ip)
    }

    pub fn release(&mut self, uuid: Uuid, mac: &str) -> NetworkResult<()> {
        let status = self
            .instances
            .get_mut(&uuid)
            .ok_or_else(|| NetworkError::NotFound(format!("network instance {}", uuid)))?;
        ipam::release(status, mac)?;
        self.store.publish(status);
        Ok(())
    }

    /// Leases an address for an app interface and publishes it to the
    /// instance's lease service.
    pub fn attach_app_host(
        &mut self,
        uuid: Uuid,
        mac: &str,
        hostname: &str,
    ) -> NetworkResult<Option<Ipv4Addr>> {
        let ip = self.lookup_or_allocate(uuid, mac)?;
        if let (Some(ip), Some(status)) = (ip, self.instances.get(&uuid)) {
            if !status.bridge_name.is_empty() {
                self.ops
                    .services
                    .add_host(&status.bridge_name, mac, ip, hostname);
            }
        }
        Ok(ip)
    }

    /// Drops an app interface lease and its lease service entry.
    pub fn detach_app_host(&mut self, uuid: Uuid, mac: &str, hostname: &str) -> NetworkResult<()> {
        self.release(uuid, mac)?;
        if let Some(status) = self.instances.get(&uuid) {
            if !status.bridge_name.is_empty() {
                self.ops
                    .services
                    .remove_host(&status.bridge_name, mac, hostname);
            }
        }
        Ok(())
    }

    // ── Steps ─────────────────────────────────────────────────────────

    async fn create_new(&mut self, config: NetworkInstanceConfig) -> NetworkResult<()> {
        tracing::info!("Creating network instance {} ({})", config.name(), config.kind);
        let mut status = NetworkInstanceStatus::new(config);
        status.change_in_progress = ChangeInProgress::Create;
        status.current_uplink_intf = self.initial_uplink(&status.config);
        self.store.publish(&status);

        let result = self.do_create(&mut status).await;
        self.finish(status, result, "create")
    }

    async fn modify_existing(&mut self, config: NetworkInstanceConfig) -> NetworkResult<()> {
        let Some(mut status) = self.instances.remove(&config.uuid) else {
            return Ok(());
        };
        tracing::info!("Modifying network instance {}", config.name());
        status.change_in_progress = ChangeInProgress::Modify;
        self.store.publish(&status);

        let result = self.do_modify(&mut status, config).await;
        self.finish(status, result, "modify")
    }

    fn finish(
        &mut self,
        mut status: NetworkInstanceStatus,
        result: NetworkResult<()>,
        step: &str,
    ) -> NetworkResult<()> {
        if let Err(e) = &result {
            tracing::error!("Network instance {} {} failed: {}", status.config.name(), step, e);
            status.set_error(e);
        }
        status.change_in_progress = ChangeInProgress::None;
        self.store.publish(&status);
        self.instances.insert(status.uuid(), status);
        result
    }

    fn initial_uplink(&self, config: &NetworkInstanceConfig) -> String {
        let device = self.device.read();
        self.selector
            .first_uplink(&device, &config.logical_label)
            .unwrap_or_default()
    }

    /// Every step is safe to repeat, so a create that failed part way is
    /// resumed by running it again.
    async fn do_create(&mut self, status: &mut NetworkInstanceStatus) -> NetworkResult<()> {
        {
            let device = self.device.read();
            sanity::sanity_check(status, self.instances.values(), &device)?;
        }

        let num = self.bridge_nums.allocate(status.uuid())?;
        status.bridge_num = num;

        if status.bridge_name.is_empty() {
            let info = if status.kind() == NetworkInstanceType::Switch
                && !status.current_uplink_intf.is_empty()
            {
                self.ops
                    .bridges
                    .lookup_existing_bridge(&status.current_uplink_intf)
                    .await?
            } else {
                self.ops.bridges.create_bridge(&bridge_name(num), num).await?
            };
            status.bridge_name = info.name;
            status.bridge_mac = info.mac;
            status.bridge_ifindex = info.ifindex;
            self.store.publish(status);
        }

        self.set_bridge_ip(status).await?;
        self.ops
            .services
            .prepare_hosts(&status.bridge_name, status.bridge_ip)?;
        self.restart_lease_service(status).await?;
        self.ops.monitor.start(self.monitor_target(status));

        if status.kind() == NetworkInstanceType::Cloud && status.vpn_status.is_none() {
            self.create_vpn(status).await?;
        }
        status.created = true;

        if status.config.activate && !status.activated {
            self.activate(status).await?;
        }
        tracing::info!(
            "Created network instance {} on bridge {}",
            status.config.name(),
            status.bridge_name
        );
        Ok(())
    }

    async fn do_modify(
        &mut self,
        status: &mut NetworkInstanceStatus,
        config: NetworkInstanceConfig,
    ) -> NetworkResult<()> {
        if config.kind != status.kind() {
            return Err(NetworkError::Validation(format!(
                "Changing type of network instance {} from {} to {} is not supported",
                status.config.name(),
                status.kind(),
                config.kind
            )));
        }
        {
            let device = self.device.read();
            sanity::check_physical_port(&config, &device)?;
        }
        if config.logical_label != status.config.logical_label {
            return Err(NetworkError::Validation(format!(
                "Changing port of network instance {} from '{}' to '{}' is not supported",
                status.config.name(),
                status.config.logical_label,
                config.logical_label
            )));
        }

        status.clear_error();

        // an unfinished create is resumed with the new config
        if !status.created {
            status.config = config;
            return self.do_create(status).await;
        }

        status.config.display_name = config.display_name;
        status.config.activate = config.activate;
        if status.config.activate && !status.activated {
            self.activate(status).await?;
        } else if !status.config.activate && status.activated {
            self.inactivate(status).await;
        }
        Ok(())
    }

    async fn set_bridge_ip(&self, status: &mut NetworkInstanceStatus) -> NetworkResult<()> {
        if let Some(gateway) = status.config.gateway {
            let prefix = status
                .config
                .subnet
                .map(|subnet| subnet.prefix())
                .unwrap_or(DEFAULT_PREFIX_LEN);
            self.ops
                .bridges
                .set_bridge_ip(&status.bridge_name, gateway, prefix)
                .await?;
            status.bridge_ip = Some(gateway);
            status
                .ip_assignments
                .insert(status.bridge_mac.clone(), gateway);
            tracing::debug!("Bridge {} has address {}/{}", status.bridge_name, gateway, prefix);
        } else if status.kind() == NetworkInstanceType::Switch {
            self.switch_bridge_ip(status);
        }
        Ok(())
    }

    /// Re-reads the address a Switch bridge got from outside. Returns true
    /// when it changed.
    fn switch_bridge_ip(&self, status: &mut NetworkInstanceStatus) -> bool {
        let ip = self
            .device
            .read()
            .local_addr_no_link_local(&status.bridge_name);
        if ip == status.bridge_ip {
            return false;
        }
        tracing::info!(
            "Bridge {} address changed from {:?} to {:?}",
            status.bridge_name,
            status.bridge_ip,
            ip
        );
        status.bridge_ip = ip;
        true
    }

    async fn refresh_bridge_ip(&self, status: &mut NetworkInstanceStatus) {
        if !self.switch_bridge_ip(status) {
            return;
        }
        if let Err(e) = self
            .ops
            .services
            .prepare_hosts(&status.bridge_name, status.bridge_ip)
        {
            tracing::warn!("Failed to refresh hosts of {} (non-fatal): {}", status.bridge_name, e);
        }
        if let Err(e) = self.restart_lease_service(status).await {
            tracing::error!("Failed to restart lease service on {}: {}", status.bridge_name, e);
            status.set_error(e);
        }
    }

    fn lease_spec(&self, status: &NetworkInstanceStatus) -> Option<LeaseServiceSpec> {
        let bridge_ip = status.bridge_ip?;
        let device = self.device.read();
        let uplink = status.current_uplink_intf.as_str();
        Some(LeaseServiceSpec {
            bridge_name: status.bridge_name.clone(),
            bridge_ip,
            subnet: status.config.subnet,
            gateway: status.config.gateway,
            dhcp_range: status.config.dhcp_range,
            uplink: uplink.to_string(),
            dns_servers: device.dns_servers(uplink),
            ntp_servers: device.ntp_servers(uplink),
        })
    }

    /// Stops the lease service and starts it again when the bridge has an
    /// address.
    async fn restart_lease_service(&self, status: &NetworkInstanceStatus) -> NetworkResult<()> {
        self.ops
            .services
            .stop_lease_service(&status.bridge_name)
            .await;
        match self.lease_spec(status) {
            Some(spec) => self.ops.services.start_lease_service(&spec).await,
            None => Ok(()),
        }
    }

    fn monitor_target(&self, status: &NetworkInstanceStatus) -> MonitorTarget {
        MonitorTarget {
            instance: status.uuid(),
            kind: status.kind(),
            logical_label: status.config.logical_label.clone(),
            bridge_name: status.bridge_name.clone(),
            current_uplink: status.current_uplink_intf.clone(),
        }
    }

    // ── Activation ────────────────────────────────────────────────────

    async fn activate(&self, status: &mut NetworkInstanceStatus) -> NetworkResult<()> {
        tracing::info!("Activating network instance {}", status.config.name());
        let label = match status.kind() {
            NetworkInstanceType::Switch => status.config.logical_label.clone(),
            _ => status.current_uplink_intf.clone(),
        };
        {
            let device = self.device.read();
            sanity::check_port_available(status, &device)?;
            status.if_name_list = self.selector.resolve_label(&device, &label);
        }

        match status.kind() {
            NetworkInstanceType::Switch => self.activate_switch(status).await?,
            NetworkInstanceType::Local => self.activate_local(status).await?,
            NetworkInstanceType::Cloud => self.activate_cloud(status).await?,
        }

        status.prog_uplink_intf = status.current_uplink_intf.clone();
        status.activated = true;

        if let Err(e) = self.ops.acl.apply_rules(&self.instance_acl_args(status)).await {
            tracing::error!(
                "Failed to apply ACLs for network instance {}: {}",
                status.config.name(),
                e
            );
        }
        Ok(())
    }

    async fn activate_switch(&self, status: &mut NetworkInstanceStatus) -> NetworkResult<()> {
        if status.owns_bridge() {
            match status.if_name_list.first() {
                Some(member) => {
                    self.ops
                        .bridges
                        .attach_member(&status.bridge_name, member)
                        .await?
                }
                None => tracing::info!(
                    "Switch network instance {} has no uplink, bridge {} stays isolated",
                    status.config.name(),
                    status.bridge_name
                ),
            }
        }
        self.refresh_bridge_ip(status).await;
        Ok(())
    }

    async fn activate_local(&self, status: &mut NetworkInstanceStatus) -> NetworkResult<()> {
        if status.if_name_list.len() > 1 {
            return Err(NetworkError::Validation(format!(
                "Network instance {} resolves to more than one uplink: {:?}",
                status.config.name(),
                status.if_name_list
            )));
        }
        if let Some(uplink) = status.if_name_list.first() {
            self.add_nat(status, uplink).await?;
        }
        self.start_metadata(status).await
    }

    async fn activate_cloud(&self, status: &mut NetworkInstanceStatus) -> NetworkResult<()> {
        let name = status.config.name();
        let vpn = status.vpn_status.as_mut().ok_or_else(|| {
            NetworkError::Vpn(format!("VPN of network instance {} was never created", name))
        })?;
        self.ops.vpn.activate(vpn).await?;
        vpn.active = true;
        self.start_metadata(status).await
    }

    /// Best-effort reverse of `activate`.
    async fn inactivate(&self, status: &mut NetworkInstanceStatus) {
        tracing::info!("Inactivating network instance {}", status.config.name());
        match status.kind() {
            NetworkInstanceType::Switch => {
                if status.owns_bridge() {
                    if let Some(member) = status.if_name_list.first() {
                        if let Err(e) = self.ops.bridges.detach_member(member).await {
                            tracing::warn!(
                                "Failed to detach {} from {} (non-fatal): {}",
                                member,
                                status.bridge_name,
                                e
                            );
                        }
                    }
                }
            }
            NetworkInstanceType::Local => {
                if !status.prog_uplink_intf.is_empty() {
                    self.remove_nat(status, &status.prog_uplink_intf).await;
                }
                self.stop_metadata(status).await;
            }
            NetworkInstanceType::Cloud => {
                if let Some(vpn) = status.vpn_status.as_mut() {
                    if let Err(e) = self.ops.vpn.inactivate(vpn).await {
                        tracing::warn!(
                            "Failed to inactivate VPN {} (non-fatal): {}",
                            vpn.tunnel_name,
                            e
                        );
                    }
                    vpn.active = false;
                }
                self.stop_metadata(status).await;
            }
        }

        if let Err(e) = self.ops.acl.remove_rules(&self.instance_acl_args(status)).await {
            tracing::warn!("Failed to remove ACLs on {} (non-fatal): {}", status.bridge_name, e);
        }
        status.activated = false;
    }

    // ── NAT and services ──────────────────────────────────────────────

    /// Rules binding the instance subnet to `uplink`, in install order.
    fn nat_rules(&self, status: &NetworkInstanceStatus, uplink: &str) -> Vec<NatRule> {
        let (Some(subnet), Some(bridge_ip)) = (status.config.subnet, status.bridge_ip) else {
            return Vec::new();
        };
        if uplink.is_empty() {
            return Vec::new();
        }
        let table = pbr::table_for_bridge(status.bridge_ifindex);
        vec![
            NatRule::Masquerade {
                subnet,
                uplink: uplink.to_string(),
            },
            NatRule::PbrRoutes {
                bridge: status.bridge_name.clone(),
                subnet,
                uplink: uplink.to_string(),
                table,
            },
            NatRule::Routing(pbr::gateway_source_rule(bridge_ip, subnet)),
            NatRule::Routing(pbr::source_rule(subnet, table)),
            NatRule::Routing(pbr::inward_source_rule(subnet)),
        ]
    }

    async fn add_nat(&self, status: &NetworkInstanceStatus, uplink: &str) -> NetworkResult<()> {
        for rule in self.nat_rules(status, uplink) {
            self.ops.nat.add_rule(&rule).await?;
        }
        tracing::info!("NAT for {} enabled via {}", status.bridge_name, uplink);
        Ok(())
    }

    async fn remove_nat(&self, status: &NetworkInstanceStatus, uplink: &str) {
        for rule in self.nat_rules(status, uplink).iter().rev() {
            if let Err(e) = self.ops.nat.remove_rule(rule).await {
                tracing::warn!("Failed to remove {} (non-fatal): {}", rule.describe(), e);
            }
        }
        tracing::info!("NAT for {} via {} removed", status.bridge_name, uplink);
    }

    async fn start_metadata(&self, status: &NetworkInstanceStatus) -> NetworkResult<()> {
        let Some(ip) = status.bridge_ip else {
            tracing::warn!(
                "Bridge {} has no address, metadata server not started",
                status.bridge_name
            );
            return Ok(());
        };
        if self.ops.services.metadata_running(&status.bridge_name, ip) {
            return Ok(());
        }
        self.ops
            .services
            .start_metadata_server(&status.bridge_name, ip)
            .await
    }

    async fn stop_metadata(&self, status: &NetworkInstanceStatus) {
        if let Some(ip) = status.bridge_ip {
            self.ops
                .services
                .stop_metadata_server(&status.bridge_name, ip)
                .await;
        }
    }

    async fn create_vpn(&self, status: &mut NetworkInstanceStatus) -> NetworkResult<()> {
        let config = status.config.vpn.clone().ok_or_else(|| {
            NetworkError::Validation(format!(
                "VPN configuration missing for cloud network instance {}",
                status.config.name()
            ))
        })?;
        let binding = VpnBinding {
            bridge_name: status.bridge_name.clone(),
            uplink: status.current_uplink_intf.clone(),
            subnet: status.config.subnet,
        };
        let vpn = self.ops.vpn.create(&binding, &config).await?;
        tracing::info!("Created VPN {} for {}", vpn.tunnel_name, status.config.name());
        status.vpn_status = Some(vpn);
        Ok(())
    }

    async fn rebuild_vpn(&self, status: &mut NetworkInstanceStatus) -> NetworkResult<()> {
        if let Some(vpn) = status.vpn_status.take() {
            if vpn.active {
                if let Err(e) = self.ops.vpn.inactivate(&vpn).await {
                    tracing::warn!("Failed to inactivate VPN {} (non-fatal): {}", vpn.tunnel_name, e);
                }
            }
            if let Err(e) = self.ops.vpn.destroy(&vpn).await {
                tracing::warn!("Failed to destroy VPN {} (non-fatal): {}", vpn.tunnel_name, e);
            }
        }
        self.create_vpn(status).await?;
        if status.activated {
            if let Some(vpn) = status.vpn_status.as_mut() {
                self.ops.vpn.activate(vpn).await?;
                vpn.active = true;
            }
        }
        Ok(())
    }

    // ── Reprogram ─────────────────────────────────────────────────────

    async fn reprogram(&self, status: &mut NetworkInstanceStatus) -> NetworkResult<()> {
        if !status.need_intf_update {
            return Ok(());
        }
        if status.prog_uplink_intf == status.current_uplink_intf {
            tracing::debug!(
                "Network instance {} already programmed for '{}'",
                status.config.name(),
                status.prog_uplink_intf
            );
            status.need_intf_update = false;
            return Ok(());
        }
        if status.kind() == NetworkInstanceType::Switch {
            status.need_intf_update = false;
            return Ok(());
        }

        let old = status.prog_uplink_intf.clone();
        let new = status.current_uplink_intf.clone();
        tracing::info!(
            "Reprogramming network instance {} from '{}' to '{}'",
            status.config.name(),
            old,
            new
        );

        if status.activated {
            if let Err(e) = self.ops.acl.remove_rules(&self.instance_acl_args(status)).await {
                tracing::warn!("Failed to remove ACLs on {} (non-fatal): {}", status.bridge_name, e);
            }
        }
        {
            let device = self.device.read();
            status.if_name_list = self.selector.resolve_label(&device, &new);
        }

        // nothing is programmed yet; activation picks up the new uplink
        if status.kind() == NetworkInstanceType::Local && !status.activated {
            tracing::debug!(
                "Network instance {} is not activated, deferring uplink '{}'",
                status.config.name(),
                new
            );
            status.need_intf_update = false;
            return Ok(());
        }

        match status.kind() {
            NetworkInstanceType::Local => {
                if !old.is_empty() {
                    self.remove_nat(status, &old).await;
                }
                if status.if_name_list.len() > 1 {
                    return Err(NetworkError::Validation(format!(
                        "Network instance {} resolves to more than one uplink: {:?}",
                        status.config.name(),
                        status.if_name_list
                    )));
                }
                if let Some(uplink) = status.if_name_list.first() {
                    self.add_nat(status, uplink).await?;
                }
            }
            NetworkInstanceType::Cloud => self.rebuild_vpn(status).await?,
            NetworkInstanceType::Switch => {}
        }

        status.prog_uplink_intf = new.clone();
        if status.activated {
            if let Err(e) = self.ops.acl.apply_rules(&self.instance_acl_args(status)).await {
                tracing::error!("Failed to apply ACLs on {}: {}", status.bridge_name, e);
            }
        }
        self.restart_lease_service(status).await?;
        self.reprogram_apps(status, &ReprogramReason::UplinkChanged { old, new })
            .await;

        status.need_intf_update = false;
        Ok(())
    }

    async fn reprogram_apps(&self, status: &NetworkInstanceStatus, reason: &ReprogramReason) {
        for attachment in self.ops.apps.attachments(status.uuid()) {
            let args = self.app_acl_args(status, &attachment);
            if let Err(e) = self.ops.acl.reprogram_app(&args, reason).await {
                tracing::warn!(
                    "Failed to reprogram app {} on {} (non-fatal): {}",
                    attachment.app,
                    status.bridge_name,
                    e
                );
            }
        }
    }

    // ── ACL arguments ─────────────────────────────────────────────────

    fn instance_acl_args(&self, status: &NetworkInstanceStatus) -> AclArgs {
        AclArgs {
            bridge_name: status.bridge_name.clone(),
            bridge_ip: status.bridge_ip,
            kind: status.kind(),
            uplinks: status.if_name_list.clone(),
            app: None,
        }
    }

    fn app_acl_args(&self, status: &NetworkInstanceStatus, attachment: &AppAttachment) -> AclArgs {
        AclArgs {
            app: Some(AppAclTarget {
                app: attachment.app,
                vif_name: attachment.vif_name.clone(),
                ip: attachment.ip,
            }),
            ..self.instance_acl_args(status)
        }
    }
}
