//! Published view of network instance status and metrics.
//!
//! The dispatch loop is the only writer. The metadata server reads the last
//! published status from memory. When a directory is configured every
//! status and metrics record is also written there as JSON, which is what
//! the status CLI reads.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::network::error::NetworkResult;
use crate::types::{NetworkInstanceMetrics, NetworkInstanceStatus};

#[derive(Clone, Default)]
pub struct StatusStore {
    statuses: Arc<RwLock<BTreeMap<Uuid, NetworkInstanceStatus>>>,
    persist_dir: Option<PathBuf>,
}

fn status_path(dir: &Path, uuid: Uuid) -> PathBuf {
    dir.join(format!("{}.json", uuid))
}

fn metrics_path(dir: &Path, uuid: Uuid) -> PathBuf {
    dir.join(format!("{}.metrics.json", uuid))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) {
    let result = serde_json::to_vec_pretty(value)
        .map_err(std::io::Error::from)
        .and_then(|bytes| std::fs::write(path, bytes));
    if let Err(e) = result {
        tracing::warn!("Failed to persist {} (non-fatal): {}", path.display(), e);
    }
}

fn remove_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {} (non-fatal): {}", path.display(), e);
        }
    }
}

impl StatusStore {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that also mirrors every record into `dir`.
    pub fn persisted(dir: impl Into<PathBuf>) -> NetworkResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            statuses: Arc::default(),
            persist_dir: Some(dir),
        })
    }

    pub fn publish(&self, status: &NetworkInstanceStatus) {
        self.statuses.write().insert(status.uuid(), status.clone());
        if let Some(dir) = &self.persist_dir {
            write_json(&status_path(dir, status.uuid()), status);
        }
    }

    pub fn unpublish(&self, uuid: Uuid) {
        self.statuses.write().remove(&uuid);
        if let Some(dir) = &self.persist_dir {
            remove_file(&status_path(dir, uuid));
        }
    }

    #[cfg(test)]
    pub fn get(&self, uuid: Uuid) -> Option<NetworkInstanceStatus> {
        self.statuses.read().get(&uuid).cloned()
    }

    #[cfg(test)]
    pub fn all(&self) -> Vec<NetworkInstanceStatus> {
        self.statuses.read().values().cloned().collect()
    }

    /// Instance whose lease table holds `ip`.
    pub fn find_by_app_ip(&self, ip: Ipv4Addr) -> Option<NetworkInstanceStatus> {
        self.statuses
            .read()
            .values()
            .find(|status| {
                status
                    .ip_assignments
                    .iter()
                    .any(|(mac, assigned)| *assigned == ip && *mac != status.bridge_mac)
            })
            .cloned()
    }

    /// Metrics only go to disk; a store without a directory drops them.
    pub fn publish_metrics(&self, metrics: &NetworkInstanceMetrics) {
        if let Some(dir) = &self.persist_dir {
            write_json(&metrics_path(dir, metrics.uuid), metrics);
        }
    }

    pub fn unpublish_metrics(&self, uuid: Uuid) {
        if let Some(dir) = &self.persist_dir {
            remove_file(&metrics_path(dir, uuid));
        }
    }

    /// Reads the status records a running agent mirrored into `dir`.
    pub fn load_persisted(dir: &Path) -> NetworkResult<Vec<NetworkInstanceStatus>> {
        let mut statuses: Vec<NetworkInstanceStatus> =
            read_records(dir, |name| !name.ends_with(".metrics.json"))?;
        statuses.sort_by(|a, b| a.config.name().cmp(&b.config.name()));
        Ok(statuses)
    }

    /// Reads the metrics records mirrored into `dir`, keyed by instance.
    pub fn load_persisted_metrics(
        dir: &Path,
    ) -> NetworkResult<BTreeMap<Uuid, NetworkInstanceMetrics>> {
        let metrics: Vec<NetworkInstanceMetrics> =
            read_records(dir, |name| name.ends_with(".metrics.json"))?;
        Ok(metrics.into_iter().map(|m| (m.uuid, m)).collect())
    }
}

fn read_records<T, F>(dir: &Path, wanted: F) -> NetworkResult<Vec<T>>
where
    T: serde::de::DeserializeOwned,
    F: Fn(&str) -> bool,
{
    let mut records = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if !name.ends_with(".json") || !wanted(&name) {
            continue;
        }
        let bytes = std::fs::read(&path)?;
        records.push(serde_json::from_slice(&bytes)?);
    }
    Ok(records)
}
