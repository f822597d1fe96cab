//! Replies of the metadata service, independent of the HTTP server.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use serde_json::json;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::apps::{AppNetworks, CloudInit};
use crate::instance::store::StatusStore;
use crate::types::{AppNetworkStatus, DeviceStatusHandle};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";
const OCTET_STREAM: &str = "application/octet-stream";
const TEXT_YAML: &str = "text/yaml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataReply {
    pub status: StatusCode,
    pub content_type: Option<&'static str>,
    pub body: Vec<u8>,
}

impl MetadataReply {
    fn empty(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            body: Vec::new(),
        }
    }

    fn text(body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: Some(TEXT_PLAIN),
            body: body.into().into_bytes(),
        }
    }

    fn bytes(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: Some(content_type),
            body,
        }
    }

    fn not_found() -> Self {
        Self::empty(StatusCode::NOT_FOUND)
    }

    fn internal_error() -> Self {
        Self::empty(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for MetadataReply {
    fn into_response(self) -> Response {
        match self.content_type {
            Some(content_type) => {
                (self.status, [(header::CONTENT_TYPE, content_type)], self.body).into_response()
            }
            None => (self.status, self.body).into_response(),
        }
    }
}

/// Splits a request path into (directory, last element), ignoring a
/// trailing slash.
fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    match trimmed.rfind('/') {
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => ("", trimmed),
    }
}

/// Lookups the metadata service needs: published instance status, the
/// device ports and the app registry.
#[derive(Clone)]
pub struct MetadataContext {
    pub store: StatusStore,
    pub device: DeviceStatusHandle,
    pub apps: Arc<dyn AppNetworks>,
}

impl MetadataContext {
    fn app(&self, caller: Ipv4Addr) -> Option<AppNetworkStatus> {
        let app = self.apps.app_by_ip(caller);
        if app.is_none() {
            tracing::error!("No app network status for {}", caller);
        }
        app
    }

    fn cloud_init(&self, app: &AppNetworkStatus) -> Option<CloudInit> {
        match self.apps.cloud_init(app.uuid) {
            Ok(cloud_init) => Some(cloud_init),
            Err(e) => {
                tracing::error!("Cannot get cloud-init for {}: {}", app.uuid, e);
                None
            }
        }
    }

    fn decoded_user_data(&self, app: &AppNetworkStatus) -> Option<Vec<u8>> {
        let cloud_init = self.cloud_init(app)?;
        match base64::engine::general_purpose::STANDARD.decode(cloud_init.user_data.trim()) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::error!("Cannot decode user-data for {}: {}", app.uuid, e);
                None
            }
        }
    }

    /// External address of the uplink the caller's instance uses.
    pub fn external_ip_for_app(&self, caller: Ipv4Addr) -> (Option<Ipv4Addr>, StatusCode) {
        let Some(status) = self.store.find_by_app_ip(caller) else {
            tracing::error!("No network instance status for {}", caller);
            return (None, StatusCode::NOT_FOUND);
        };
        if status.current_uplink_intf.is_empty() {
            tracing::warn!("No current uplink for {}", caller);
            return (None, StatusCode::NO_CONTENT);
        }
        match self
            .device
            .read()
            .local_addr_no_link_local(&status.current_uplink_intf)
        {
            Some(ip) => (Some(ip), StatusCode::OK),
            None => {
                tracing::error!(
                    "No external IP on {} for {}",
                    status.current_uplink_intf,
                    caller
                );
                (None, StatusCode::NO_CONTENT)
            }
        }
    }

    pub fn network_json(&self, remote: SocketAddr, caller: Ipv4Addr) -> MetadataReply {
        let (external, status) = self.external_ip_for_app(caller);
        let hostname = self
            .apps
            .app_by_ip(caller)
            .map(|app| app.uuid.to_string())
            .unwrap_or_default();
        let body = json!({
            "caller-ip": remote.to_string(),
            "external-ipv4": external.map(|ip| ip.to_string()).unwrap_or_default(),
            "hostname": hostname,
        });
        MetadataReply {
            status,
            content_type: Some(APPLICATION_JSON),
            body: body.to_string().into_bytes(),
        }
    }

    pub fn external_ipv4(&self, caller: Ipv4Addr) -> MetadataReply {
        match self.external_ip_for_app(caller) {
            (Some(ip), status) => MetadataReply {
                status,
                content_type: Some(TEXT_PLAIN),
                body: format!("{}\n", ip).into_bytes(),
            },
            (None, status) => MetadataReply::empty(status),
        }
    }

    pub fn hostname(&self, caller: Ipv4Addr) -> MetadataReply {
        match self.app(caller) {
            Some(app) => MetadataReply::text(format!("{}\n", app.uuid)),
            None => MetadataReply::empty(StatusCode::NO_CONTENT),
        }
    }

    /// EC2-style `/<version>/meta-data/...` tree.
    pub fn ec2_metadata(&self, caller: Ipv4Addr, path: &str) -> MetadataReply {
        let (dirname, filename) = split_path(path);
        let Some(app) = self.app(caller) else {
            return MetadataReply::not_found();
        };

        match filename {
            "meta-data" => return MetadataReply::text("instance-id\nhostname\npublic-keys/\n"),
            "hostname" => return MetadataReply::text(format!("{}\n", app.display_name)),
            "instance-id" => return MetadataReply::text(format!("{}\n", app.uuid)),
            "public-keys" => {
                let Some(cloud_init) = self.cloud_init(&app) else {
                    return MetadataReply::internal_error();
                };
                let listing: String = (0..cloud_init.ssh_keys.len())
                    .map(|i| format!("{}=key-{}", i, i))
                    .collect();
                return MetadataReply::text(listing);
            }
            "openssh-key" => {
                let (_, previous) = split_path(dirname);
                if let Ok(index) = previous.parse::<usize>() {
                    let Some(cloud_init) = self.cloud_init(&app) else {
                        return MetadataReply::internal_error();
                    };
                    if let Some(key) = cloud_init.ssh_keys.get(index) {
                        return MetadataReply::text(format!("{}\n", key));
                    }
                }
            }
            _ => {
                if path.contains("/public-keys/") {
                    if let Ok(index) = filename.parse::<usize>() {
                        let Some(cloud_init) = self.cloud_init(&app) else {
                            return MetadataReply::internal_error();
                        };
                        if index < cloud_init.ssh_keys.len() {
                            return MetadataReply::text("openssh-key");
                        }
                    }
                }
            }
        }
        MetadataReply::not_found()
    }

    pub fn user_data(&self, caller: Ipv4Addr) -> MetadataReply {
        let Some(app) = self.app(caller) else {
            return MetadataReply::not_found();
        };
        match self.decoded_user_data(&app) {
            Some(bytes) => MetadataReply::bytes(OCTET_STREAM, bytes),
            None => MetadataReply::internal_error(),
        }
    }

    /// OpenStack config-drive style `/openstack/<version>/<file>` tree.
    pub fn openstack(&self, caller: Ipv4Addr, path: &str) -> MetadataReply {
        let (_, filename) = split_path(path);
        let Some(app) = self.app(caller) else {
            return MetadataReply::not_found();
        };

        match filename {
            "openstack" => MetadataReply::text("latest\n"),
            "meta_data.json" => {
                let Some(cloud_init) = self.cloud_init(&app) else {
                    return MetadataReply::internal_error();
                };
                let keys: Vec<serde_json::Value> = cloud_init
                    .ssh_keys
                    .iter()
                    .enumerate()
                    .map(|(i, key)| {
                        json!({
                            "data": format!("{}\n", key),
                            "type": "ssh",
                            "name": format!("key-{}", i),
                        })
                    })
                    .collect();
                let public_keys: serde_json::Map<String, serde_json::Value> = cloud_init
                    .ssh_keys
                    .iter()
                    .enumerate()
                    .map(|(i, key)| (format!("key-{}", i), json!(format!("{}\n", key))))
                    .collect();
                // an app without keys reports null, not []
                let keys = if keys.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::Value::Array(keys)
                };
                let body = json!({
                    "uuid": app.uuid.to_string(),
                    "hostname": app.display_name,
                    "name": app.display_name,
                    "launch_index": 0,
                    "keys": keys,
                    "public_keys": public_keys,
                });
                MetadataReply::bytes(APPLICATION_JSON, body.to_string().into_bytes())
            }
            "network_data.json" => MetadataReply::bytes(
                APPLICATION_JSON,
                json!({"services": [], "networks": []}).to_string().into_bytes(),
            ),
            "user_data" => match self.decoded_user_data(&app) {
                Some(bytes) => MetadataReply::bytes(TEXT_YAML, bytes),
                None => MetadataReply::internal_error(),
            },
            "vendor_data.json" => MetadataReply::bytes(APPLICATION_JSON, b"{}".to_vec()),
            _ => MetadataReply::not_found(),
        }
    }
}
