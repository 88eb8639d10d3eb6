//! Machine listing types returned by the control-plane
//!
//! The control-plane answers `GET /v1/vms` with:
//!
//! ```json
//! { "vms": [ { "vmName": "sandbox-1", "status": "RUNNING", "ip": "10.20.1.2/24",
//!              "portForwards": [ { "description": "cdp", "guestPort": "9223", "hostPort": "41000" } ] } ] }
//! ```
//!
//! Ports travel as strings on the wire and are kept that way here.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a machine. Only [`MachineStatus::Running`] is routable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    Running,
    Stopped,
    Paused,
    Creating,
    /// Any status string this build does not know about
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineStatus::Running => write!(f, "RUNNING"),
            MachineStatus::Stopped => write!(f, "STOPPED"),
            MachineStatus::Paused => write!(f, "PAUSED"),
            MachineStatus::Creating => write!(f, "CREATING"),
            MachineStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One exposed service on a machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Service tag, e.g. "cdp"
    #[serde(rename = "description")]
    pub tag: String,
    /// Port the service listens on inside the machine
    #[serde(rename = "guestPort")]
    pub internal_port: String,
    /// Port assigned on the host side, varies per machine
    #[serde(rename = "hostPort")]
    pub external_port: String,
}

impl PortMapping {
    pub fn new(
        tag: impl Into<String>,
        internal_port: impl Into<String>,
        external_port: impl Into<String>,
    ) -> Self {
        Self {
            tag: tag.into(),
            internal_port: internal_port.into(),
            external_port: external_port.into(),
        }
    }
}

/// Which port mapping a request is looking for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSelector {
    pub tag: String,
    /// Expected internal port; `None` accepts any port carrying the tag
    #[serde(default)]
    pub internal_port: Option<String>,
}

impl ServiceSelector {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            internal_port: None,
        }
    }

    pub fn with_internal_port(mut self, port: impl Into<String>) -> Self {
        self.internal_port = Some(port.into());
        self
    }

    pub fn matches(&self, mapping: &PortMapping) -> bool {
        mapping.tag == self.tag
            && self
                .internal_port
                .as_deref()
                .map_or(true, |port| mapping.internal_port == port)
    }
}

impl std::fmt::Display for ServiceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.internal_port {
            Some(port) => write!(f, "{}:{}", self.tag, port),
            None => write!(f, "{}", self.tag),
        }
    }
}

/// A machine as reported by the control-plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDescriptor {
    #[serde(rename = "vmName")]
    pub name: String,
    pub status: MachineStatus,
    /// Internal network address, possibly with a CIDR suffix
    #[serde(rename = "ip", default)]
    pub internal_address: String,
    #[serde(rename = "portForwards", default)]
    pub port_mappings: Vec<PortMapping>,
}

impl MachineDescriptor {
    pub fn new(name: impl Into<String>, status: MachineStatus) -> Self {
        Self {
            name: name.into(),
            status,
            internal_address: String::new(),
            port_mappings: Vec::new(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.internal_address = address.into();
        self
    }

    pub fn with_mapping(mut self, mapping: PortMapping) -> Self {
        self.port_mappings.push(mapping);
        self
    }

    pub fn is_routable(&self) -> bool {
        self.status == MachineStatus::Running
    }

    /// Internal host without any CIDR suffix, `None` if the control-plane sent none
    pub fn internal_host(&self) -> Option<&str> {
        let host = self
            .internal_address
            .split('/')
            .next()
            .unwrap_or_default()
            .trim();
        if host.is_empty() {
            None
        } else {
            Some(host)
        }
    }

    /// First mapping satisfying the selector, in listing order
    pub fn find_mapping(&self, selector: &ServiceSelector) -> Option<&PortMapping> {
        self.port_mappings.iter().find(|m| selector.matches(m))
    }
}

/// Result of one control-plane query. Never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineListing {
    #[serde(rename = "vms", default)]
    pub machines: Vec<MachineDescriptor>,
}

impl MachineListing {
    pub fn new(machines: Vec<MachineDescriptor>) -> Self {
        Self { machines }
    }

    pub fn with_machine(mut self, machine: MachineDescriptor) -> Self {
        self.machines.push(machine);
        self
    }

    pub fn running(&self) -> impl Iterator<Item = &MachineDescriptor> {
        self.machines.iter().filter(|m| m.is_routable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_control_plane_listing() {
        let json = r#"{
            "vms": [
                {
                    "vmName": "sandbox-1",
                    "status": "RUNNING",
                    "ip": "10.20.1.2/24",
                    "portForwards": [
                        {"description": "cdp", "guestPort": "9223", "hostPort": "41000"}
                    ]
                },
                {"vmName": "sandbox-2", "status": "STOPPED"}
            ]
        }"#;

        let listing: MachineListing = serde_json::from_str(json).unwrap();
        assert_eq!(listing.machines.len(), 2);

        let first = &listing.machines[0];
        assert_eq!(first.name, "sandbox-1");
        assert!(first.is_routable());
        assert_eq!(first.internal_host(), Some("10.20.1.2"));
        assert_eq!(
            first.port_mappings[0],
            PortMapping::new("cdp", "9223", "41000")
        );

        let second = &listing.machines[1];
        assert_eq!(second.status, MachineStatus::Stopped);
        assert!(second.port_mappings.is_empty());
        assert_eq!(second.internal_host(), None);
    }

    #[test]
    fn test_unknown_status_is_not_routable() {
        let json = r#"{"vms": [{"vmName": "a", "status": "MIGRATING"}]}"#;
        let listing: MachineListing = serde_json::from_str(json).unwrap();

        assert_eq!(listing.machines[0].status, MachineStatus::Unknown);
        assert_eq!(listing.running().count(), 0);
    }

    #[test]
    fn test_empty_object_decodes_to_empty_listing() {
        let listing: MachineListing = serde_json::from_str("{}").unwrap();
        assert!(listing.machines.is_empty());
    }

    #[test]
    fn test_selector_port_is_optional() {
        let mapping = PortMapping::new("cdp", "9222", "40000");

        assert!(ServiceSelector::new("cdp").matches(&mapping));
        assert!(ServiceSelector::new("cdp")
            .with_internal_port("9222")
            .matches(&mapping));
        assert!(!ServiceSelector::new("cdp")
            .with_internal_port("9223")
            .matches(&mapping));
        assert!(!ServiceSelector::new("vnc").matches(&mapping));
    }

    #[test]
    fn test_first_matching_mapping_wins() {
        let machine = MachineDescriptor::new("a", MachineStatus::Running)
            .with_mapping(PortMapping::new("vnc", "5901", "40001"))
            .with_mapping(PortMapping::new("cdp", "9223", "40002"))
            .with_mapping(PortMapping::new("cdp", "9223", "40003"));

        let found = machine.find_mapping(&ServiceSelector::new("cdp")).unwrap();
        assert_eq!(found.external_port, "40002");
    }

    #[test]
    fn test_status_display_matches_wire_format() {
        assert_eq!(MachineStatus::Running.to_string(), "RUNNING");
        assert_eq!(
            serde_json::to_string(&MachineStatus::Paused).unwrap(),
            "\"PAUSED\""
        );
    }
}
