//! Speer Command-Line Interface
//!
//! A terminal client for direct peer connections. Signals go through a
//! Speer relay; messages and files then travel over a direct TCP channel.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

/// Speer - direct messaging and file transfer between friends
#[derive(Parser)]
#[command(name = "speer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Relay base URL
    #[arg(short, long, env = "SPEER_RELAY", default_value = "ws://127.0.0.1:8080")]
    relay: String,

    /// Session credential issued by the account service
    #[arg(short, long, env = "SPEER_SESSION", hide_env_values = true)]
    session: String,

    /// Address peer listeners bind to
    #[arg(long, default_value = "127.0.0.1")]
    bind_ip: IpAddr,

    /// Address advertised to peers (defaults to the bind address)
    #[arg(long)]
    advertise_ip: Option<IpAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for incoming connections and print what arrives
    Listen {
        /// Where accepted files are written
        #[arg(short, long, default_value = ".")]
        download_dir: PathBuf,
    },

    /// Send a message
    Send {
        /// Recipient identity
        to: String,

        /// Message text
        message: String,
    },

    /// Send a file
    SendFile {
        /// Recipient identity
        to: String,

        /// File to send
        path: PathBuf,
    },

    /// Print friends' login and logout events
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let client = commands::ClientOptions {
        relay: cli.relay.trim_end_matches('/').to_string(),
        session: cli.session,
        bind_ip: cli.bind_ip,
        advertise_ip: cli.advertise_ip,
    };

    match cli.command {
        Commands::Listen { download_dir } => {
            commands::listen(&client, download_dir).await?;
        }
        Commands::Send { to, message } => {
            commands::send_message(&client, &to, &message).await?;
        }
        Commands::SendFile { to, path } => {
            commands::send_file(&client, &to, &path).await?;
        }
        Commands::Watch => {
            commands::watch(&client).await?;
        }
    }

    Ok(())
}
