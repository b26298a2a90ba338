//! Tandem RPC Server - host bridge with a JSON-RPC control endpoint.
//!
//! Runs a `HostBridge` that clients connect to over TCP, and exposes the host
//! operations (call, fire, broadcast, session management) to other processes
//! as JSON-RPC 2.0 over HTTP.

mod handler;
mod server;

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tandem_core::{BridgeConfig, HostBridge};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tandem-rpc")]
#[command(about = "Tandem host bridge with a JSON-RPC control endpoint")]
struct Args {
    /// Port for the JSON-RPC endpoint (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Port clients connect to (0 = auto-assign)
    #[arg(long, default_value = "0")]
    bridge_port: u16,

    /// Host to bind both listeners to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    debug: bool,

    /// Reap disconnected sessions after this much silence, and close idle connections
    #[arg(long, default_value = "30000")]
    session_timeout_ms: u64,

    /// Default timeout for `call` when the request gives none
    #[arg(long, default_value = "30000")]
    response_timeout_ms: u64,

    /// How often the session reaper runs
    #[arg(long, default_value = "5000")]
    reap_interval_ms: u64,
}

impl Args {
    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig::default()
            .with_session_timeout(Duration::from_millis(self.session_timeout_ms))
            .with_response_timeout(Duration::from_millis(self.response_timeout_ms))
            .with_reap_interval(Duration::from_millis(self.reap_interval_ms))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; stdout is reserved for the port announcements
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("Starting Tandem RPC Server");

    let host = HostBridge::start(args.bridge_config())?;
    host.set_default_event_callback(|session_id, event_name, event_data| {
        info!(session_id = %session_id, event = %event_name, "Event: {}", event_data);
        Ok(())
    });
    let bridge_addr = host.listen((args.host.as_str(), args.bridge_port))?;

    let rpc_addr = server::start_server(host.clone(), &args.host, args.port).await?;

    // Port announcements for the parent process (intentional stdout)
    println!("BRIDGE_PORT={}", bridge_addr.port());
    println!("RPC_PORT={}", rpc_addr.port());

    info!("Bridge on {}, RPC server on {}", bridge_addr, rpc_addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    host.shutdown();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_map_onto_bridge_config() {
        let args = Args::parse_from([
            "tandem-rpc",
            "--session-timeout-ms",
            "1500",
            "--reap-interval-ms",
            "250",
        ]);
        let config = args.bridge_config();

        assert_eq!(config.session_timeout, Duration::from_millis(1500));
        assert_eq!(config.reap_interval, Duration::from_millis(250));
        assert_eq!(config.response_timeout, BridgeConfig::DEFAULT_RESPONSE_TIMEOUT);
        assert!(config.validate().is_ok());
    }
}
