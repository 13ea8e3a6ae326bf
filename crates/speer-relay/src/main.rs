//! Speer Relay Server
//!
//! Signaling relay and broadcast hub for Speer clients. Sessions and
//! friendships come from a directory file maintained by the account service.

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use speer_relay::auth::StaticDirectory;
use speer_relay::config::{DEFAULT_LISTEN, RelayConfig};
use speer_relay::{router, AppState};

/// Speer Relay - signaling and presence for peer-to-peer sessions
#[derive(Parser)]
#[command(name = "speer-relay")]
#[command(author, version, about)]
struct Args {
    /// Listen address
    #[arg(short, long, env = "SPEER_LISTEN", default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Directory file with sessions and friendships (JSON)
    #[arg(short, long, env = "SPEER_DIRECTORY")]
    directory: PathBuf,

    /// Heartbeat period in seconds
    #[arg(long, default_value = "10", value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_secs: u64,

    /// Lifetime of unfinished group sessions in seconds
    #[arg(long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
    group_ttl_secs: u64,

    /// Origin allowed to make credentialed requests (any origin when unset)
    #[arg(long, env = "SPEER_ALLOWED_ORIGIN")]
    allowed_origin: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let allowed_origin = args
        .allowed_origin
        .as_deref()
        .map(HeaderValue::from_str)
        .transpose()
        .context("invalid allowed origin")?;

    let config = RelayConfig {
        listen: args.listen,
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
        group_ttl: Duration::from_secs(args.group_ttl_secs),
        allowed_origin,
    };

    let directory = Arc::new(
        StaticDirectory::load(&args.directory)
            .await
            .with_context(|| format!("failed to load directory {}", args.directory.display()))?,
    );

    let state = AppState::new(&config, directory.clone(), directory);
    let _maintenance = state.spawn_maintenance(&config);

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    tracing::info!(
        address = %config.listen,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        group_ttl_secs = config.group_ttl.as_secs(),
        "Speer relay started"
    );

    axum::serve(listener, router(state, &config)).await?;

    Ok(())
}
