//! Resolution of uplink labels to kernel interface names.

use crate::types::DeviceNetworkStatus;

/// Any management port.
pub const LABEL_UPLINK: &str = "uplink";
/// Management ports without usage cost.
pub const LABEL_FREE_UPLINK: &str = "freeuplink";

pub fn is_shared_port_label(label: &str) -> bool {
    label == LABEL_UPLINK || label == LABEL_FREE_UPLINK
}

/// Looks up the kernel index of an interface, `None` when it does not exist.
pub type IndexLookup = fn(&str) -> Option<u32>;

fn kernel_index(if_name: &str) -> Option<u32> {
    nix::net::if_::if_nametoindex(if_name).ok()
}

#[derive(Debug, Clone, Copy)]
pub struct UplinkSelector {
    index_of: IndexLookup,
}

impl Default for UplinkSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl UplinkSelector {
    pub fn new() -> Self {
        Self { index_of: kernel_index }
    }

    pub fn with_index_lookup(index_of: IndexLookup) -> Self {
        Self { index_of }
    }

    /// Expands a label into candidate interface names without checking the
    /// kernel.
    pub fn label_to_if_names(&self, dns: &DeviceNetworkStatus, label: &str) -> Vec<String> {
        match label {
            LABEL_UPLINK => dns.mgmt_ports(false),
            LABEL_FREE_UPLINK => dns.mgmt_ports(true),
            "" => Vec::new(),
            other => vec![dns.logical_label_to_if_name(other)],
        }
    }

    /// Expands a label and keeps the interfaces that have a kernel index.
    /// When none do, the unfiltered list is returned so the caller fails on
    /// a concrete interface name.
    pub fn resolve_label(&self, dns: &DeviceNetworkStatus, label: &str) -> Vec<String> {
        let candidates = self.label_to_if_names(dns, label);
        let live: Vec<String> = candidates
            .iter()
            .filter(|name| (self.index_of)(name).is_some())
            .cloned()
            .collect();
        if live.is_empty() {
            if !candidates.is_empty() {
                tracing::debug!(
                    "No interface of label '{}' has a kernel index, using {:?}",
                    label,
                    candidates
                );
            }
            return candidates;
        }
        live
    }

    /// First resolved interface of a label, if any.
    pub fn first_uplink(&self, dns: &DeviceNetworkStatus, label: &str) -> Option<String> {
        self.resolve_label(dns, label).into_iter().next()
    }
}
