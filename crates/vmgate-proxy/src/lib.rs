//! Dual-mode gateway: HTTP forwarding with response rewriting, and WebSocket
//! relaying, both to machines picked through [`vmgate_discovery`].

pub mod config;
pub mod error;
pub mod forwarder;
pub mod relay;
pub mod rewrite;
pub mod router;
pub mod server;

pub use config::{ProxyConfig, ServiceProfile, UpgradePolicy, NAMED_PREFIX, ROUTING_QUERY_PARAM};
pub use error::{GatewayError, ProxyError, RelayFault, UpgradeError};
pub use forwarder::HttpForwarder;
pub use relay::{
    serve_socket, CompletionLatch, Leg, LegEnd, RelaySession, SessionOutcome, Trigger,
    BACKEND_UNAVAILABLE,
};
pub use rewrite::{rewrite, rewrite_all};
pub use router::{build_router, is_upgrade_request, Gateway, HEALTH_PATH};
pub use server::{GatewayServer, ServerError};
