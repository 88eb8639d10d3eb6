//! vmgate - discovery-driven gateway for browser debugging endpoints
//!
//! Looks up running machines on the control-plane for every request and
//! forwards HTTP (rewriting embedded socket URLs) or relays WebSocket traffic
//! to the machine that offers the configured service.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmgate_discovery::{BackendResolver, ControlPlaneClient};
use vmgate_proxy::{build_router, Gateway, GatewayServer};

use config::{ConfigFile, FileSettings, ServeArgs, Settings};

#[derive(Parser, Debug)]
#[command(name = "vmgate")]
#[command(about = "Route HTTP and WebSocket traffic to machines found on the control-plane", long_about = None)]
#[command(version)]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), "\nCommit: ", env!("VMGATE_GIT_HASH"), "\nBuilt: ", env!("VMGATE_BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve_args: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve a backend once and print it, without serving
    Resolve {
        /// Machine name (first running machine if omitted)
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = match &cli.serve_args.config {
        Some(path) => ConfigFile::load(path)?.gateway,
        None => FileSettings::default(),
    };
    let settings = Settings::resolve(&cli.serve_args, file)?;

    init_logging(&settings.log_level)?;

    match cli.command {
        Some(Commands::Resolve { name }) => resolve_once(&settings, name.as_deref()).await,
        None => serve(settings).await,
    }
}

fn build_resolver(settings: &Settings) -> BackendResolver {
    let client = ControlPlaneClient::new(&settings.control_plane)
        .with_timeout(settings.discovery_timeout);

    BackendResolver::new(Arc::new(client))
        .with_dial_mode(settings.dial_mode)
        .with_backend_host(&settings.backend_host)
}

async fn resolve_once(settings: &Settings, name: Option<&str>) -> Result<()> {
    let resolver = build_resolver(settings);
    let backend = resolver
        .resolve(name, &settings.service.selector)
        .await
        .with_context(|| format!("Failed to resolve {}", settings.service.selector))?;

    println!("Machine:  {}", backend.machine.name);
    println!("Status:   {}", backend.machine.status);
    println!(
        "Mapping:  {} guest:{} host:{}",
        backend.mapping.tag, backend.mapping.internal_port, backend.mapping.external_port
    );
    println!("Dial:     {} ({})", backend.address, resolver.dial_mode());

    Ok(())
}

async fn serve(settings: Settings) -> Result<()> {
    info!("Starting vmgate {}", env!("CARGO_PKG_VERSION"));
    info!("  - Control-plane: {}", settings.control_plane);
    info!(
        "  - Service: {} ({}), dial mode {}",
        settings.service.name, settings.service.selector, settings.dial_mode
    );

    let gateway = Gateway::new(build_resolver(&settings), settings.proxy_config());
    let router = build_router(Arc::new(gateway));

    let server = GatewayServer::bind(settings.listen, router)
        .await?
        .with_shutdown_grace(settings.shutdown_grace);

    info!("Press Ctrl+C to stop");
    server
        .run_until(shutdown_signal())
        .await
        .context("Gateway server failed")?;

    info!("vmgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Error listening for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Error installing SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections...");
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
