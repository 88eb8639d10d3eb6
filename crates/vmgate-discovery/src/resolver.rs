//! Backend resolution
//!
//! Turns an optional machine name plus a service selector into one concrete
//! backend address. Selection without a name is "first running machine in
//! listing order"; there is no balancing between machines.

use crate::{
    DiscoveryError, MachineDescriptor, MachineListing, MachineSource, PortMapping,
    ServiceSelector,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// How the gateway reaches a resolved machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialMode {
    /// `{backend_host}:{external_port}` through the host-side port forward
    #[default]
    Mapped,
    /// `{machine ip}:{internal_port}` straight onto the machine network
    Direct,
}

impl std::fmt::Display for DialMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialMode::Mapped => write!(f, "mapped"),
            DialMode::Direct => write!(f, "direct"),
        }
    }
}

impl std::str::FromStr for DialMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mapped" | "host" => Ok(DialMode::Mapped),
            "direct" | "internal" => Ok(DialMode::Direct),
            _ => Err(format!("Unknown dial mode: {}", s)),
        }
    }
}

/// Host and port the gateway dials
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddress {
    pub host: String,
    pub port: String,
}

impl BackendAddress {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }
}

impl std::fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outcome of a successful resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBackend {
    pub address: BackendAddress,
    pub machine: MachineDescriptor,
    pub mapping: PortMapping,
}

impl ResolvedBackend {
    /// `ip:internal_port` as seen from inside the machine network
    pub fn internal_authority(&self) -> Option<String> {
        self.machine
            .internal_host()
            .map(|host| format!("{}:{}", host, self.mapping.internal_port))
    }

    /// Every authority a backend may have embedded in its responses
    pub fn known_authorities(&self) -> Vec<String> {
        let mut authorities = vec![self.address.to_string()];
        if let Some(internal) = self.internal_authority() {
            if !authorities.contains(&internal) {
                authorities.push(internal);
            }
        }
        authorities
    }
}

/// Pick the machine and mapping for a request from one listing
///
/// Pure: no I/O, deterministic for a given listing.
pub fn select_backend<'a>(
    listing: &'a MachineListing,
    target_name: Option<&str>,
    selector: &ServiceSelector,
) -> Result<(&'a MachineDescriptor, &'a PortMapping), DiscoveryError> {
    let found = listing
        .running()
        .filter(|machine| target_name.map_or(true, |name| machine.name == name))
        .find_map(|machine| {
            machine
                .find_mapping(selector)
                .map(|mapping| (machine, mapping))
        });

    found.ok_or_else(|| match target_name {
        Some(name) => DiscoveryError::NamedNotFound {
            name: name.to_string(),
            service: selector.to_string(),
        },
        None => DiscoveryError::NoneAvailable {
            service: selector.to_string(),
        },
    })
}

/// Resolves backends against a live [`MachineSource`]
pub struct BackendResolver {
    source: Arc<dyn MachineSource>,
    dial_mode: DialMode,
    /// Host carrying the mapped external ports
    backend_host: String,
}

impl BackendResolver {
    pub fn new(source: Arc<dyn MachineSource>) -> Self {
        Self {
            source,
            dial_mode: DialMode::Mapped,
            backend_host: "127.0.0.1".to_string(),
        }
    }

    pub fn with_dial_mode(mut self, dial_mode: DialMode) -> Self {
        self.dial_mode = dial_mode;
        self
    }

    pub fn with_backend_host(mut self, host: impl Into<String>) -> Self {
        self.backend_host = host.into();
        self
    }

    pub fn dial_mode(&self) -> DialMode {
        self.dial_mode
    }

    /// Fetch a fresh listing and resolve one backend from it
    pub async fn resolve(
        &self,
        target_name: Option<&str>,
        selector: &ServiceSelector,
    ) -> Result<ResolvedBackend, DiscoveryError> {
        let listing = self.source.list_machines().await?;
        let (machine, mapping) = select_backend(&listing, target_name, selector)?;

        let address = match self.dial_mode {
            DialMode::Mapped => BackendAddress::new(&self.backend_host, &mapping.external_port),
            DialMode::Direct => {
                let host = machine.internal_host().ok_or_else(|| {
                    DiscoveryError::Malformed(format!(
                        "machine '{}' has no internal address",
                        machine.name
                    ))
                })?;
                BackendAddress::new(host, &mapping.internal_port)
            }
        };

        info!(
            "Resolved {} to machine '{}' ({} guest:{} -> {})",
            selector, machine.name, self.dial_mode, mapping.internal_port, address
        );
        debug!(
            "Resolution requested name {:?}, {} machine(s) listed",
            target_name,
            listing.machines.len()
        );

        Ok(ResolvedBackend {
            address,
            machine: machine.clone(),
            mapping: mapping.clone(),
        })
    }
}
