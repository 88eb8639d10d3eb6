//! Listener lifecycle: bind, serve, drain on shutdown

use axum::Router;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// A bound gateway listener ready to serve
pub struct GatewayServer {
    listener: TcpListener,
    router: Router,
    grace: Duration,
}

impl GatewayServer {
    pub async fn bind(addr: SocketAddr, router: Router) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            listener,
            router,
            grace: Duration::from_secs(30),
        })
    }

    /// How long in-flight requests may run after shutdown is requested
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves, then stop accepting and drain.
    ///
    /// Connections still open when the grace period ends are dropped.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            listener,
            router,
            grace,
        } = self;

        info!("Gateway listening on {}", listener.local_addr()?);

        let stop = CancellationToken::new();
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(stop.clone().cancelled_owned())
            .into_future();
        tokio::pin!(serve);

        tokio::select! {
            result = &mut serve => return Ok(result?),
            _ = shutdown => info!("Shutdown requested, draining for up to {:?}", grace),
        }

        stop.cancel();

        match tokio::time::timeout(grace, serve).await {
            Ok(result) => result?,
            Err(_) => warn!("Grace period of {:?} expired with requests in flight", grace),
        }

        info!("Gateway stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = GatewayServer::bind(addr, Router::new()).await.err().unwrap();
        match &err {
            ServerError::BindError { port, .. } => assert_eq!(*port, addr.port()),
            other => panic!("expected BindError, got {:?}", other),
        }
        assert!(err.to_string().contains("lsof -i"));
    }

    #[tokio::test]
    async fn test_run_until_stops_on_signal() {
        let router = Router::new().route("/", get(|| async { "ok" }));
        let server = GatewayServer::bind("127.0.0.1:0".parse().unwrap(), router)
            .await
            .unwrap()
            .with_shutdown_grace(Duration::from_millis(200));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
