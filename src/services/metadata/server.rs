// HTTP front of the metadata service.

use axum::extract::{ConnectInfo, State};
use axum::http::{StatusCode, Uri};
use axum::routing::get;
use axum::Router;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::services::metadata::handlers::{MetadataContext, MetadataReply};

type Ctx = State<Arc<MetadataContext>>;

fn caller_ipv4(remote: &SocketAddr) -> Option<Ipv4Addr> {
    match remote.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

fn unknown_caller() -> MetadataReply {
    MetadataReply {
        status: StatusCode::NOT_FOUND,
        content_type: None,
        body: Vec::new(),
    }
}

pub fn router(ctx: MetadataContext) -> Router {
    Router::new()
        .route("/eve/v1/network.json", get(network_json))
        .route("/eve/v1/external_ipv4", get(external_ipv4))
        .route("/eve/v1/hostname", get(hostname))
        .route("/latest/user-data", get(user_data))
        .route("/2009-04-04/user-data", get(user_data))
        .route("/openstack", get(openstack))
        .fallback(prefixed)
        .with_state(Arc::new(ctx))
}

async fn network_json(
    State(ctx): Ctx,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> MetadataReply {
    match caller_ipv4(&remote) {
        Some(caller) => ctx.network_json(remote, caller),
        None => unknown_caller(),
    }
}

async fn external_ipv4(
    State(ctx): Ctx,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> MetadataReply {
    match caller_ipv4(&remote) {
        Some(caller) => ctx.external_ipv4(caller),
        None => unknown_caller(),
    }
}

async fn hostname(State(ctx): Ctx, ConnectInfo(remote): ConnectInfo<SocketAddr>) -> MetadataReply {
    match caller_ipv4(&remote) {
        Some(caller) => ctx.hostname(caller),
        None => unknown_caller(),
    }
}

async fn user_data(State(ctx): Ctx, ConnectInfo(remote): ConnectInfo<SocketAddr>) -> MetadataReply {
    match caller_ipv4(&remote) {
        Some(caller) => ctx.user_data(caller),
        None => unknown_caller(),
    }
}

async fn openstack(State(ctx): Ctx, ConnectInfo(remote): ConnectInfo<SocketAddr>) -> MetadataReply {
    match caller_ipv4(&remote) {
        Some(caller) => ctx.openstack(caller, "/openstack"),
        None => unknown_caller(),
    }
}

/// Subtrees matched by prefix: EC2 meta-data and OpenStack files.
async fn prefixed(
    State(ctx): Ctx,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    uri: Uri,
) -> MetadataReply {
    let Some(caller) = caller_ipv4(&remote) else {
        return unknown_caller();
    };
    let path = uri.path();
    if path.starts_with("/latest/meta-data") || path.starts_with("/2009-04-04/meta-data") {
        ctx.ec2_metadata(caller, path)
    } else if path.starts_with("/openstack/") {
        ctx.openstack(caller, path)
    } else {
        unknown_caller()
    }
}
