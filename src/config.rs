//! Gateway settings from flags, environment and an optional YAML file
//!
//! Precedence: command line / environment, then the file, then defaults.
//!
//! ```yaml
//! gateway:
//!   listen: 0.0.0.0:3007
//!   control_plane: http://127.0.0.1:7000
//!   public_host: browsers.example.com
//!   service_tag: cdp
//!   service_port: "9223"
//!   dial_mode: mapped
//!   allowed_origins:
//!     - https://console.example.com
//! ```

use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vmgate_discovery::{DialMode, ServiceSelector};
use vmgate_proxy::{ProxyConfig, ServiceProfile, UpgradePolicy};

const DEFAULT_LISTEN: &str = "0.0.0.0:3007";
const DEFAULT_CONTROL_PLANE: &str = "http://127.0.0.1:7000";
const DEFAULT_PUBLIC_HOST: &str = "localhost:3007";
const DEFAULT_SERVICE: &str = "cdp";
const DEFAULT_BACKEND_HOST: &str = "127.0.0.1";
const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 10;
const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 5;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Flags shared by every command
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// YAML configuration file
    #[arg(long, env = "VMGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on [default: 0.0.0.0:3007]
    #[arg(long, env = "VMGATE_LISTEN")]
    pub listen: Option<String>,

    /// Control-plane base URL [default: http://127.0.0.1:7000]
    #[arg(long, env = "VMGATE_CONTROL_PLANE")]
    pub control_plane: Option<String>,

    /// Host used in rewritten URLs when a request carries none [default: localhost:3007]
    #[arg(long, env = "VMGATE_PUBLIC_HOST")]
    pub public_host: Option<String>,

    /// Service name reported by /health [default: cdp]
    #[arg(long, env = "VMGATE_SERVICE_NAME")]
    pub service_name: Option<String>,

    /// Port-mapping tag to route to [default: cdp]
    #[arg(long, env = "VMGATE_SERVICE_TAG")]
    pub service_tag: Option<String>,

    /// Expected internal port of the mapping (any if unset)
    #[arg(long, env = "VMGATE_SERVICE_PORT")]
    pub service_port: Option<String>,

    /// Host carrying mapped ports [default: 127.0.0.1]
    #[arg(long, env = "VMGATE_BACKEND_HOST")]
    pub backend_host: Option<String>,

    /// How to reach machines: mapped or direct [default: mapped]
    #[arg(long, env = "VMGATE_DIAL_MODE")]
    pub dial_mode: Option<DialMode>,

    /// Timeout for one forwarded HTTP exchange [default: 10]
    #[arg(long, env = "VMGATE_FORWARD_TIMEOUT_SECS")]
    pub forward_timeout_secs: Option<u64>,

    /// Timeout for one control-plane listing [default: 5]
    #[arg(long, env = "VMGATE_DISCOVERY_TIMEOUT_SECS")]
    pub discovery_timeout_secs: Option<u64>,

    /// Drain period on shutdown [default: 30]
    #[arg(long, env = "VMGATE_SHUTDOWN_GRACE_SECS")]
    pub shutdown_grace_secs: Option<u64>,

    /// Origin allowed to open sockets (repeatable; all origins if omitted)
    #[arg(long = "allowed-origin")]
    pub allowed_origins: Vec<String>,

    /// Log level (RUST_LOG takes precedence) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Configuration file format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: FileSettings,
}

/// The `gateway:` section; every key is optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    pub listen: Option<String>,
    pub control_plane: Option<String>,
    pub public_host: Option<String>,
    pub service_name: Option<String>,
    pub service_tag: Option<String>,
    pub service_port: Option<String>,
    pub backend_host: Option<String>,
    pub dial_mode: Option<DialMode>,
    pub forward_timeout_secs: Option<u64>,
    pub discovery_timeout_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
    pub allowed_origins: Option<Vec<String>>,
    pub log_level: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_yaml::from_str(&content).context("Failed to parse YAML config")
    }
}

/// Fully resolved gateway settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: SocketAddr,
    pub control_plane: String,
    pub public_host: String,
    pub service: ServiceProfile,
    pub backend_host: String,
    pub dial_mode: DialMode,
    pub forward_timeout: Duration,
    pub discovery_timeout: Duration,
    pub shutdown_grace: Duration,
    pub upgrade_policy: UpgradePolicy,
    pub log_level: String,
}

impl Settings {
    pub fn resolve(args: &ServeArgs, file: FileSettings) -> Result<Self> {
        let listen = pick(args.listen.clone(), file.listen, DEFAULT_LISTEN);
        let listen: SocketAddr = listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", listen))?;

        let service_tag = pick(args.service_tag.clone(), file.service_tag, DEFAULT_SERVICE);
        let mut selector = ServiceSelector::new(service_tag);
        if let Some(port) = args.service_port.clone().or(file.service_port) {
            selector = selector.with_internal_port(port);
        }
        let service = ServiceProfile::new(
            pick(args.service_name.clone(), file.service_name, DEFAULT_SERVICE),
            selector,
        );

        let allowed_origins = if args.allowed_origins.is_empty() {
            file.allowed_origins
        } else {
            Some(args.allowed_origins.clone())
        };
        let upgrade_policy = match allowed_origins {
            Some(origins) => UpgradePolicy::allow_origins(origins),
            None => UpgradePolicy::allow_all(),
        };

        Ok(Self {
            listen,
            control_plane: pick(args.control_plane.clone(), file.control_plane, DEFAULT_CONTROL_PLANE),
            public_host: pick(args.public_host.clone(), file.public_host, DEFAULT_PUBLIC_HOST),
            service,
            backend_host: pick(args.backend_host.clone(), file.backend_host, DEFAULT_BACKEND_HOST),
            dial_mode: args.dial_mode.or(file.dial_mode).unwrap_or_default(),
            forward_timeout: secs(
                args.forward_timeout_secs.or(file.forward_timeout_secs),
                DEFAULT_FORWARD_TIMEOUT_SECS,
            ),
            discovery_timeout: secs(
                args.discovery_timeout_secs.or(file.discovery_timeout_secs),
                DEFAULT_DISCOVERY_TIMEOUT_SECS,
            ),
            shutdown_grace: secs(
                args.shutdown_grace_secs.or(file.shutdown_grace_secs),
                DEFAULT_SHUTDOWN_GRACE_SECS,
            ),
            upgrade_policy,
            log_level: pick(args.log_level.clone(), file.log_level, DEFAULT_LOG_LEVEL),
        })
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            public_host: self.public_host.clone(),
            service: self.service.clone(),
            forward_timeout: self.forward_timeout,
            upgrade_policy: self.upgrade_policy.clone(),
        }
    }
}

fn pick(flag: Option<String>, file: Option<String>, default: &str) -> String {
    flag.or(file).unwrap_or_else(|| default.to_string())
}

fn secs(value: Option<u64>, default: u64) -> Duration {
    Duration::from_secs(value.unwrap_or(default))
}
