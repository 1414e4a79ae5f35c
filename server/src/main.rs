use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tmi_bridge_server::config::{BridgeConfig, load_credentials};
use tmi_bridge_server::engine::broadcast::BroadcastServer;
use tmi_bridge_server::supervisor::Supervisor;

/// Relay Twitch chat to local TCP clients as line-delimited JSON.
#[derive(Parser, Debug)]
#[command(name = "tmi-bridge", version)]
struct Cli {
    /// The name of the Twitch account to connect with
    #[arg(short = 'n', long = "name")]
    name: String,

    /// Path to a file containing the OAuth token to use for the Twitch account
    #[arg(short = 'o', long = "oauth")]
    oauth: PathBuf,

    /// A channel to join on startup, may be supplied multiple times
    #[arg(short = 'j', long = "join")]
    join: Vec<String>,

    /// Path to the TOML config file
    #[arg(short = 'c', long = "config", default_value = "bridge.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = BridgeConfig::load(&cli.config)?;
    let credentials = load_credentials(&cli.name, &cli.oauth)?;
    let channels = config.initial_channels(&cli.join);

    let server = BroadcastServer::bind(&config.server.listen_address, config.broadcast_settings())
        .await
        .context("cannot start without a listening address")?;

    let cancel = CancellationToken::new();
    let (broadcast, commands) = server.start(cancel.child_token());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, shutting down");
        shutdown.cancel();
    });

    info!(
        account = %credentials.account,
        channels = channels.len(),
        upstream = %config.upstream.address,
        "tmi bridge starting"
    );

    let supervisor = Supervisor::new(
        config.link_settings(),
        credentials,
        channels,
        commands,
        broadcast.events(),
        config.reconnect_backoff(),
    );
    supervisor.run(cancel.clone()).await;

    cancel.cancel();
    broadcast.join().await;
    Ok(())
}
