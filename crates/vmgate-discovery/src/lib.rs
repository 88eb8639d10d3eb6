//! Machine discovery for the gateway
//!
//! Queries the control-plane for the machines that currently exist and picks
//! the one (and the port mapping on it) that should serve a request.

pub mod client;
pub mod error;
pub mod model;
pub mod resolver;

pub use client::{ControlPlaneClient, MachineSource, LISTING_PATH};
pub use error::DiscoveryError;
pub use model::{MachineDescriptor, MachineListing, MachineStatus, PortMapping, ServiceSelector};
pub use resolver::{select_backend, BackendAddress, BackendResolver, DialMode, ResolvedBackend};
