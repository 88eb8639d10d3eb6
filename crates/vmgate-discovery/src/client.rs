//! Control-plane client
//!
//! Issues the single read-only listing call the gateway depends on. Every
//! resolution performs a fresh call; nothing is cached between requests.

use crate::{DiscoveryError, MachineListing};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, trace};

/// Path of the machine listing on the control-plane
pub const LISTING_PATH: &str = "/v1/vms";

/// Source of machine listings
///
/// Implemented by [`ControlPlaneClient`] for production and by
/// [`MachineListing`] itself so a fixed listing can stand in for tests.
#[async_trait]
pub trait MachineSource: Send + Sync {
    async fn list_machines(&self) -> Result<MachineListing, DiscoveryError>;
}

#[async_trait]
impl MachineSource for MachineListing {
    async fn list_machines(&self) -> Result<MachineListing, DiscoveryError> {
        Ok(self.clone())
    }
}

/// HTTP client for the control-plane REST API
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    /// Upper bound for one listing call
    timeout: Duration,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    /// Create a client for the control-plane at `base_url` (e.g. `http://127.0.0.1:7000`)
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(5),
            http: reqwest::Client::new(),
        }
    }

    /// Set the per-call timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn listing_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), LISTING_PATH)
    }
}

#[async_trait]
impl MachineSource for ControlPlaneClient {
    async fn list_machines(&self) -> Result<MachineListing, DiscoveryError> {
        let url = self.listing_url();
        debug!("Querying control-plane at {}", url);

        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| DiscoveryError::Unreachable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Unreachable(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DiscoveryError::Unreachable(format!("{}: {}", url, e)))?;

        let listing: MachineListing = serde_json::from_slice(&body)
            .map_err(|e| DiscoveryError::Malformed(e.to_string()))?;

        trace!(
            "Control-plane listed {} machine(s), {} running",
            listing.machines.len(),
            listing.running().count()
        );

        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MachineDescriptor, MachineStatus};

    #[test]
    fn test_client_defaults() {
        let client = ControlPlaneClient::new("http://127.0.0.1:7000");
        assert_eq!(client.timeout, Duration::from_secs(5));
        assert_eq!(client.base_url(), "http://127.0.0.1:7000");
    }

    #[test]
    fn test_listing_url_ignores_trailing_slash() {
        let client = ControlPlaneClient::new("http://control:7000/");
        assert_eq!(client.listing_url(), "http://control:7000/v1/vms");

        let client = ControlPlaneClient::new("http://control:7000");
        assert_eq!(client.listing_url(), "http://control:7000/v1/vms");
    }

    #[tokio::test]
    async fn test_static_listing_is_a_source() {
        let listing = MachineListing::default()
            .with_machine(MachineDescriptor::new("a", MachineStatus::Running));

        let fetched = listing.list_machines().await.unwrap();
        assert_eq!(fetched, listing);
    }
}
