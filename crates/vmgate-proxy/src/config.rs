//! Gateway configuration values
//!
//! Everything here is immutable once the router is built; handlers only ever
//! see it through a shared reference.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use vmgate_discovery::ServiceSelector;

/// Prefix of the named-backend path family: `/vm/{name}/...`
pub const NAMED_PREFIX: &str = "/vm";

/// Query parameter that overrides path-derived machine selection
pub const ROUTING_QUERY_PARAM: &str = "vm";

/// The service this gateway instance fronts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProfile {
    /// Name reported by the health endpoint
    pub name: String,
    pub selector: ServiceSelector,
}

impl ServiceProfile {
    pub fn new(name: impl Into<String>, selector: ServiceSelector) -> Self {
        Self {
            name: name.into(),
            selector,
        }
    }

    /// Chrome DevTools, matched by tag alone
    pub fn devtools() -> Self {
        Self::new("cdp", ServiceSelector::new("cdp"))
    }
}

impl Default for ServiceProfile {
    fn default() -> Self {
        Self::devtools()
    }
}

/// Which browser origins may open relayed sockets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradePolicy {
    /// `None` allows every origin
    allowed_origins: Option<Vec<String>>,
}

impl UpgradePolicy {
    pub fn allow_all() -> Self {
        Self {
            allowed_origins: None,
        }
    }

    pub fn allow_origins<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_origins: Some(
                origins
                    .into_iter()
                    .map(|o| normalize_origin(&o.into()))
                    .collect(),
            ),
        }
    }

    /// Requests without an `Origin` header come from non-browser clients and
    /// are always permitted.
    pub fn permits(&self, origin: Option<&str>) -> bool {
        match (&self.allowed_origins, origin) {
            (None, _) | (Some(_), None) => true,
            (Some(allowed), Some(origin)) => {
                let origin = normalize_origin(origin);
                allowed.iter().any(|a| *a == origin)
            }
        }
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Gateway request-handling configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Host (and port) substituted into rewritten bodies when the inbound
    /// request carries no usable Host
    pub public_host: String,
    pub service: ServiceProfile,
    /// Upper bound for one forwarded HTTP exchange and for dialing a backend socket
    pub forward_timeout: Duration,
    pub upgrade_policy: UpgradePolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            public_host: "localhost:3007".to_string(),
            service: ServiceProfile::default(),
            forward_timeout: Duration::from_secs(10),
            upgrade_policy: UpgradePolicy::allow_all(),
        }
    }
}
