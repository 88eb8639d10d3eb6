//! Shared fixtures: a mock control-plane, test backends and a running gateway
#![allow(dead_code)]

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
    routing::{any, get},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use vmgate_discovery::{BackendResolver, ControlPlaneClient, ServiceSelector};
use vmgate_proxy::{build_router, Gateway, GatewayServer, ProxyConfig, ServiceProfile};

pub async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// An address with nothing listening on it
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Machine entry in control-plane wire format
pub fn machine(name: &str, status: &str, ip: &str, host_port: u16) -> serde_json::Value {
    json!({
        "vmName": name,
        "status": status,
        "ip": ip,
        "portForwards": [
            { "description": "ssh", "guestPort": "22", "hostPort": "2222" },
            { "description": "cdp", "guestPort": "9223", "hostPort": host_port.to_string() }
        ]
    })
}

pub async fn spawn_control_plane(machines: Vec<serde_json::Value>) -> SocketAddr {
    let listing = json!({ "vms": machines });
    let app = Router::new().route(
        "/v1/vms",
        get(move || {
            let listing = listing.clone();
            async move { Json(listing) }
        }),
    );
    spawn(app).await
}

/// Lifecycle events a test backend reports per socket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    Opened,
    Closed,
}

pub struct Backend {
    pub addr: SocketAddr,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

impl Backend {
    /// Wait for `wanted`, skipping other events
    pub async fn expect(&mut self, wanted: SocketEvent) {
        let wait = async {
            while let Some(event) = self.events.recv().await {
                if event == wanted {
                    return;
                }
            }
            panic!("backend event channel closed before {:?}", wanted);
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {:?}", wanted));
    }
}

struct BackendState {
    identity: String,
    events: mpsc::UnboundedSender<SocketEvent>,
}

/// A DevTools-like backend
///
/// - `/json/version` describes itself with a socket URL built from its Host
/// - `/whoami` answers `"{identity} {query}"`
/// - `/blob` returns its socket URL as an opaque binary body
/// - `/raw/...` answers with the path and query exactly as received
/// - `/submit` answers `201` with `"{method} {body}"` and an `x-backend` header
/// - `/hang` never answers in time
/// - `/devtools/...` is a socket echo; `/devtools/close-me` closes right away
pub async fn spawn_backend(identity: &str) -> Backend {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(BackendState {
        identity: identity.to_string(),
        events: tx,
    });

    let app = Router::new()
        .route("/json/version", get(version))
        .route("/whoami", get(whoami))
        .route("/blob", get(blob))
        .route("/raw/{*rest}", get(raw))
        .route("/submit", any(submit))
        .route(
            "/hang",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "too late"
            }),
        )
        .route("/devtools/{*path}", get(devtools_socket))
        .with_state(state);

    Backend {
        addr: spawn(app).await,
        events: rx,
    }
}

fn host(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("missing-host")
        .to_string()
}

async fn version(headers: HeaderMap) -> Json<serde_json::Value> {
    Json(json!({
        "Browser": "HeadlessChrome/120.0",
        "Protocol-Version": "1.3",
        "webSocketDebuggerUrl": format!("ws://{}/devtools/browser/x", host(&headers)),
    }))
}

async fn whoami(State(state): State<Arc<BackendState>>, uri: Uri) -> String {
    format!("{} {}", state.identity, uri.query().unwrap_or(""))
}

async fn blob(headers: HeaderMap) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        format!("ws://{}/x", host(&headers)).into_bytes(),
    )
}

async fn raw(uri: Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default()
}

async fn submit(method: Method, body: String) -> impl IntoResponse {
    (
        StatusCode::CREATED,
        [("x-backend", "1")],
        format!("{} {}", method, body),
    )
}

async fn devtools_socket(
    State(state): State<Arc<BackendState>>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let close_at_once = uri.path().ends_with("/close-me");
    ws.on_upgrade(move |socket| echo(socket, state, close_at_once))
}

async fn echo(mut socket: WebSocket, state: Arc<BackendState>, close_at_once: bool) {
    let _ = state.events.send(SocketEvent::Opened);

    if close_at_once {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: "done".into(),
            })))
            .await;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(_) | Message::Binary(_) => {
                if socket.send(msg).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    let _ = state.events.send(SocketEvent::Closed);
}

pub fn test_config() -> ProxyConfig {
    ProxyConfig {
        service: ServiceProfile::new("cdp", ServiceSelector::new("cdp").with_internal_port("9223")),
        forward_timeout: Duration::from_secs(1),
        ..ProxyConfig::default()
    }
}

/// Start a gateway in front of the given control-plane
pub async fn spawn_gateway(control_plane: SocketAddr, config: ProxyConfig) -> SocketAddr {
    let client = ControlPlaneClient::new(format!("http://{}", control_plane))
        .with_timeout(Duration::from_secs(2));
    let resolver = BackendResolver::new(Arc::new(client));
    let router = build_router(Arc::new(Gateway::new(resolver, config)));

    let server = GatewayServer::bind("127.0.0.1:0".parse().unwrap(), router)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    tokio::spawn(server.run_until(std::future::pending()));

    addr
}
