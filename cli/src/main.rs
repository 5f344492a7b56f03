// natprobe — hole-punch readiness probe CLI
//
// Boots a NATed libp2p endpoint, waits for a public non-relayed address,
// announces it to the DHT, then serves until terminated.

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use natprobe_core::discovery::{discover_with_retry, DiscoveryConfig};
use natprobe_core::{announce_and_serve, config, Endpoint, EndpointConfig, RelayPeer, TransportMode};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "natprobe")]
#[command(about = "NAT hole-punch readiness probe", long_about = None)]
#[command(version)]
struct Cli {
    /// Transport to probe hole punching over
    #[arg(long, default_value = "quic", value_parser = parse_transport)]
    transport: TransportMode,

    /// Listen port
    #[arg(long, default_value_t = 22345)]
    port: u16,

    /// Static relay peer id
    #[arg(long, default_value = config::DEFAULT_RELAY_PEER_ID)]
    relay_peer: String,

    /// Static relay address (repeatable)
    #[arg(long = "relay-addr")]
    relay_addrs: Vec<String>,

    /// Maximum seconds to wait for a public address per attempt
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,

    /// Discovery attempts before giving up (timeouts only are retried)
    #[arg(long, default_value_t = 1)]
    attempts: u32,
}

fn parse_transport(s: &str) -> Result<TransportMode, String> {
    s.parse::<TransportMode>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let relay_addrs = if cli.relay_addrs.is_empty() {
        config::DEFAULT_RELAY_ADDRS
            .iter()
            .map(|a| a.to_string())
            .collect()
    } else {
        cli.relay_addrs.clone()
    };
    let relay = RelayPeer::from_strs(&cli.relay_peer, &relay_addrs)
        .context("invalid relay configuration")?;

    let endpoint_config = EndpointConfig {
        listen_port: cli.port,
        static_relays: vec![relay],
        ..EndpointConfig::for_mode(cli.transport).context("invalid endpoint configuration")?
    };

    println!(
        "{} probe starting in {} mode",
        "✓".green(),
        cli.transport.to_string().bright_cyan()
    );

    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(64);
    let endpoint = Endpoint::spawn(endpoint_config, event_tx)
        .await
        .context("failed to start endpoint")?;
    println!("{} endpoint up, peer id {}", "✓".green(), endpoint.peer_id());

    let discovery = DiscoveryConfig {
        timeout: Duration::from_secs(cli.timeout_secs),
        attempts: cli.attempts,
    };
    let discovered = discover_with_retry(&mut event_rx, discovery)
        .await
        .context("no public address discovered")?;
    // Discovery was the only snapshot consumer; close the channel so the
    // endpoint stops queueing address changes for nobody.
    drop(event_rx);

    println!(
        "{} discovered public address {}",
        "✓".green(),
        discovered.to_string().bright_yellow()
    );
    println!("known addresses:");
    for addr in endpoint.known_addresses().await? {
        println!("  {}", addr);
    }

    println!("{} advertising to the DHT and serving...", "✓".green());
    announce_and_serve(&endpoint.routing(), &discovered)
        .await
        .context("announcement failed")?;

    endpoint.shutdown().await?;
    Ok(())
}
