//! Request routing
//!
//! - `GET /health` answers locally.
//! - `/vm/{name}/...` goes to the named machine, with the prefix removed.
//! - Everything else goes to the first machine that offers the service.
//!
//! A `vm=<name>` query parameter overrides either choice and is never
//! forwarded. Socket upgrades on any proxied path are relayed instead of
//! forwarded.

use axum::{
    extract::{FromRequestParts, Path, Request, State, WebSocketUpgrade},
    http::{header, HeaderMap, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use url::form_urlencoded;
use vmgate_discovery::{BackendResolver, ResolvedBackend};

use crate::config::{ProxyConfig, NAMED_PREFIX, ROUTING_QUERY_PARAM};
use crate::error::{GatewayError, UpgradeError};
use crate::forwarder::HttpForwarder;
use crate::relay::serve_socket;

/// Health check path, never proxied
pub const HEALTH_PATH: &str = "/health";

/// Shared, read-only state behind every handler
pub struct Gateway {
    resolver: BackendResolver,
    forwarder: HttpForwarder,
    config: ProxyConfig,
}

impl Gateway {
    pub fn new(resolver: BackendResolver, config: ProxyConfig) -> Self {
        Self {
            resolver,
            forwarder: HttpForwarder::new(config.forward_timeout),
            config,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

/// Build the gateway's route table
pub fn build_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route("/vm/{name}", any(named_root))
        .route("/vm/{name}/", any(named_root))
        .route("/vm/{name}/{*path}", any(named_path))
        .fallback(default_route)
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

async fn health(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": gateway.config.service.name,
    }))
}

async fn named_root(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
    request: Request,
) -> Response {
    respond(dispatch(&gateway, Some(name), "/".to_string(), request).await)
}

// The decoded wildcard is ignored; the backend gets the path as the caller sent it
async fn named_path(
    State(gateway): State<Arc<Gateway>>,
    Path((name, _)): Path<(String, String)>,
    request: Request,
) -> Response {
    let path = strip_named_prefix(request.uri().path()).to_string();
    respond(dispatch(&gateway, Some(name), path, request).await)
}

async fn default_route(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    respond(dispatch(&gateway, None, path, request).await)
}

fn respond(result: Result<Response, GatewayError>) -> Response {
    match result {
        Ok(response) => response,
        Err(e) => {
            warn!("Request failed ({}): {}", e.kind(), e);
            e.into_response()
        }
    }
}

async fn dispatch(
    gateway: &Gateway,
    path_name: Option<String>,
    backend_path: String,
    request: Request,
) -> Result<Response, GatewayError> {
    let (override_name, query) = split_routing_query(request.uri().query());
    let target = override_name.or(path_name);

    // Origin is checked before discovery so rejected callers cost nothing
    let upgrade = is_upgrade_request(request.headers());
    if upgrade {
        let origin = request
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok());
        if !gateway.config.upgrade_policy.permits(origin) {
            return Err(UpgradeError::OriginRejected(origin.unwrap_or_default().to_string()).into());
        }
    }

    let backend = gateway
        .resolver
        .resolve(target.as_deref(), &gateway.config.service.selector)
        .await?;

    let path_and_query = match query {
        Some(q) if !q.is_empty() => format!("{}?{}", backend_path, q),
        _ => backend_path,
    };

    if upgrade {
        return relay(gateway, request, &backend, path_and_query).await;
    }

    let public_base = public_base(
        request.headers(),
        request.uri(),
        &gateway.config.public_host,
        target.as_deref(),
    );
    debug!("Public base for this request: {}", public_base);

    Ok(gateway
        .forwarder
        .forward(request, &backend, &path_and_query, &public_base)
        .await?)
}

async fn relay(
    gateway: &Gateway,
    request: Request,
    backend: &ResolvedBackend,
    path_and_query: String,
) -> Result<Response, GatewayError> {
    let (mut parts, _body) = request.into_parts();
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &())
        .await
        .map_err(|rejection| UpgradeError::Handshake(rejection.body_text()))?;

    let backend_url = format!("ws://{}{}", backend.address, path_and_query);
    let dial_timeout = gateway.config.forward_timeout;

    Ok(ws
        .on_failed_upgrade(|e| warn!("Inbound socket upgrade failed: {}", e))
        .on_upgrade(move |socket| async move {
            serve_socket(socket, backend_url, dial_timeout).await;
        }))
}

/// The raw remainder of `/vm/{name}/...` after the name segment, still
/// percent-encoded. `/` when nothing follows the name.
fn strip_named_prefix(path: &str) -> &str {
    let Some(rest) = path
        .strip_prefix(NAMED_PREFIX)
        .and_then(|p| p.strip_prefix('/'))
    else {
        return "/";
    };

    match rest.find('/') {
        Some(idx) => &rest[idx..],
        None => "/",
    }
}

/// Pull the routing parameter out of a raw query string.
///
/// Returns the decoded machine name (if present and non-empty) and the query
/// with every routing parameter removed. Other parameters keep their original
/// encoding and order.
fn split_routing_query(query: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(query) = query else {
        return (None, None);
    };

    let mut name = None;
    let mut kept = Vec::new();

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        match form_urlencoded::parse(pair.as_bytes()).next() {
            Some((key, value)) if key == ROUTING_QUERY_PARAM => {
                if !value.is_empty() {
                    name = Some(value.into_owned());
                }
            }
            _ => kept.push(pair),
        }
    }

    (name, Some(kept.join("&")))
}

/// Whether the request asks to switch to the WebSocket protocol
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));

    connection_upgrade && upgrade_websocket
}

/// The host that backend URLs are rewritten to, including the named prefix
/// when a machine was picked by name.
fn public_base(headers: &HeaderMap, uri: &Uri, fallback: &str, target: Option<&str>) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_else(|| fallback.to_string());

    match target {
        Some(name) => format!("{}{}/{}", host, NAMED_PREFIX, name),
        None => host,
    }
}
