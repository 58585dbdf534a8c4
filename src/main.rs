//! crab-mitm - Main entry point
//!
//! Runs the proxy engine from command-line flags and an optional JSON
//! settings file until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use crab_mitm::{logging, EngineSettings, ProxyHandle};
use std::path::PathBuf;
use tracing::info;

/// crab-mitm - interactive TLS-intercepting HTTP(S) proxy
#[derive(Parser, Debug)]
#[command(name = "crab-mitm")]
#[command(author = "CrabProxy Contributors")]
#[command(version)]
#[command(about = "Interactive TLS-intercepting HTTP(S) proxy")]
struct Args {
    /// Address of the explicit proxy listener
    #[arg(long, env = "CRAB_LISTEN", default_value = "127.0.0.1:8888")]
    listen: String,

    /// JSON settings file (rules, throttle, allowlist, transparent mode)
    #[arg(long, env = "CRAB_CONFIG")]
    config: Option<PathBuf>,

    /// Root CA certificate (PEM) used to intercept TLS
    #[arg(long, env = "CRAB_CA_CERT", requires = "ca_key")]
    ca_cert: Option<PathBuf>,

    /// Root CA private key (PKCS#8, or PKCS#1 for RSA)
    #[arg(long, env = "CRAB_CA_KEY", requires = "ca_cert")]
    ca_key: Option<PathBuf>,

    /// Relay tunnels without decrypting them
    #[arg(long)]
    no_inspect: bool,

    /// Added latency per request in milliseconds (enables throttling)
    #[arg(long)]
    latency_ms: Option<u64>,

    /// Download cap in bytes per second (enables throttling)
    #[arg(long)]
    downstream_bps: Option<u64>,

    /// Upload cap in bytes per second (enables throttling)
    #[arg(long)]
    upstream_bps: Option<u64>,

    /// Only throttle hosts matching these patterns (repeatable)
    #[arg(long = "throttle-host")]
    throttle_hosts: Vec<String>,

    /// Only accept clients with these IPs (repeatable)
    #[arg(long = "allow-client")]
    allow_clients: Vec<String>,

    /// Also accept redirected traffic on this port
    #[arg(long, env = "CRAB_TRANSPARENT_PORT")]
    transparent_port: Option<u16>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn configure(handle: &ProxyHandle, args: &Args) -> Result<()> {
    if let Some(path) = &args.config {
        let settings = EngineSettings::load(path)?;
        handle
            .apply_settings(&settings)
            .with_context(|| format!("failed to apply settings from {}", path.display()))?;
        info!("Settings loaded from {}", path.display());
    }

    if let (Some(cert), Some(key)) = (&args.ca_cert, &args.ca_key) {
        handle.load_ca(cert, key)?;
    }
    if args.no_inspect {
        handle.set_inspect_enabled(false)?;
    }

    if args.latency_ms.is_some() || args.downstream_bps.is_some() || args.upstream_bps.is_some() {
        handle.set_throttle_enabled(true)?;
        handle.set_throttle_latency_ms(args.latency_ms.unwrap_or(0))?;
        handle.set_throttle_downstream_bps(args.downstream_bps.unwrap_or(0))?;
        handle.set_throttle_upstream_bps(args.upstream_bps.unwrap_or(0))?;
    }
    if !args.throttle_hosts.is_empty() {
        handle.set_throttle_only_selected_hosts(true)?;
        handle.throttle_hosts_clear()?;
        for pattern in &args.throttle_hosts {
            handle.throttle_hosts_add(pattern)?;
        }
    }

    if !args.allow_clients.is_empty() {
        handle.set_client_allowlist_enabled(true)?;
        handle.client_allowlist_clear()?;
        for ip in &args.allow_clients {
            handle.client_allowlist_add_ip(ip)?;
        }
    }

    if let Some(port) = args.transparent_port {
        handle.set_transparent_enabled(true)?;
        handle.set_transparent_port(port)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    info!("Starting crab-mitm v{}", env!("CARGO_PKG_VERSION"));

    let handle = ProxyHandle::new(&args.listen)?;
    configure(&handle, &args)?;

    let snapshot = handle.snapshot();
    if snapshot.ca.is_none() && snapshot.inspect_enabled {
        info!("No CA loaded, TLS tunnels will be relayed without inspection");
    }

    handle.start().await?;
    for addr in handle.local_addrs() {
        info!("Listening on {}", addr);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    handle.destroy().await?;
    Ok(())
}
