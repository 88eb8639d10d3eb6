use thiserror::Error;

/// Failures while turning a request into a backend
///
/// None of these are retried; callers surface them as "service unavailable".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("Control-plane unreachable: {0}")]
    Unreachable(String),

    #[error("Malformed machine listing: {0}")]
    Malformed(String),

    #[error("No running machine named '{name}' exposes service '{service}'")]
    NamedNotFound { name: String, service: String },

    #[error("No running machine exposes service '{service}'")]
    NoneAvailable { service: String },
}

impl DiscoveryError {
    /// Stable machine-readable identifier for error bodies and logs
    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryError::Unreachable(_) => "control_plane_unreachable",
            DiscoveryError::Malformed(_) => "control_plane_malformed",
            DiscoveryError::NamedNotFound { .. } => "machine_not_found",
            DiscoveryError::NoneAvailable { .. } => "no_machine_available",
        }
    }
}
