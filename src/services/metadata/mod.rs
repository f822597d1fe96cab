//! Per-bridge metadata HTTP service.
//!
//! One listener runs for each (bridge name, bridge IP) pair. The registry
//! maps that pair to the one-shot sender that asks the listener to drain
//! and exit.

pub mod handlers;
pub mod server;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::sync::oneshot;

use crate::network::error::NetworkResult;
pub use handlers::MetadataContext;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerKey {
    pub bridge_name: String,
    pub bridge_ip: Ipv4Addr,
}

impl ServerKey {
    pub fn new(bridge_name: &str, bridge_ip: Ipv4Addr) -> Self {
        Self {
            bridge_name: bridge_name.to_string(),
            bridge_ip,
        }
    }
}

#[derive(Default)]
pub struct MetadataRegistry {
    servers: Mutex<HashMap<ServerKey, oneshot::Sender<()>>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a running server. A second registration for the same key
    /// means two listeners on one address and aborts.
    pub fn register(&self, key: ServerKey, done: oneshot::Sender<()>) {
        let mut servers = self.servers.lock();
        if servers.contains_key(&key) {
            panic!(
                "metadata server for {} on {} registered twice",
                key.bridge_name, key.bridge_ip
            );
        }
        servers.insert(key, done);
    }

    /// Signals the server to shut down without waiting for it. Returns
    /// false when no server was registered for the key.
    pub fn signal_stop(&self, key: &ServerKey) -> bool {
        let done = self.servers.lock().remove(key);
        match done {
            Some(done) => {
                if done.send(()).is_err() {
                    tracing::warn!("Metadata server for {} already exited", key.bridge_name);
                }
                true
            }
            None => {
                tracing::error!(
                    "No metadata server registered for {} on {}",
                    key.bridge_name,
                    key.bridge_ip
                );
                false
            }
        }
    }

    pub fn contains(&self, key: &ServerKey) -> bool {
        self.servers.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }
}

/// Starts a listener for a key; the listener must exit once `shutdown`
/// fires or its sender is dropped.
pub trait MetadataLauncher: Send + Sync {
    fn launch(&self, key: &ServerKey, shutdown: oneshot::Receiver<()>)
        -> NetworkResult<SocketAddr>;
}

/// axum listener bound to the bridge IP.
pub struct HttpMetadataLauncher {
    ctx: MetadataContext,
    port: u16,
}

impl HttpMetadataLauncher {
    pub fn new(ctx: MetadataContext, port: u16) -> Self {
        Self { ctx, port }
    }
}

impl MetadataLauncher for HttpMetadataLauncher {
    fn launch(
        &self,
        key: &ServerKey,
        shutdown: oneshot::Receiver<()>,
    ) -> NetworkResult<SocketAddr> {
        let listener =
            std::net::TcpListener::bind(SocketAddr::new(IpAddr::V4(key.bridge_ip), self.port))?;
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let local = listener.local_addr()?;

        let app = server::router(self.ctx.clone());
        let bridge = key.bridge_name.clone();
        tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown.await;
            })
            .await;
            match result {
                Ok(()) => tracing::info!("Metadata server on {} ({}) stopped", local, bridge),
                Err(e) => tracing::error!("Metadata server on {} ({}) failed: {}", local, bridge, e),
            }
        });

        tracing::info!("Metadata server for {} listening on {}", key.bridge_name, local);
        Ok(local)
    }
}
