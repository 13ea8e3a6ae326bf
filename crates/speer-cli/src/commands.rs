//! CLI command implementations.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use speer_core::client::{EventSubscriptions, RelayClient};
use speer_core::connection::{
    CallHandler, CallRequest, Connection, DeliveryMode, FileConfig, FileDelivery, FileHandler,
    FilePayload, FileRequest, MessageHandler, ProgressFn, SendOutcome,
};
use speer_core::negotiator::{ConnectionAcceptor, Negotiator, NegotiatorConfig};
use speer_core::transport::{TcpPeerConfig, TcpPeerFactory};
use speer_core::Identity;

/// Settings shared by every command.
pub struct ClientOptions {
    /// Relay base URL, without trailing slash.
    pub relay: String,
    /// Session credential.
    pub session: String,
    /// Address peer listeners bind to.
    pub bind_ip: IpAddr,
    /// Address advertised to peers.
    pub advertise_ip: Option<IpAddr>,
}

impl ClientOptions {
    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.relay, path)
    }
}

/// Prints what peers send. Accepts files when it has somewhere to put them.
struct Console {
    download_dir: Option<PathBuf>,
}

impl MessageHandler for Console {
    fn on_data(&self, remote: &Identity, data: Value) {
        match data {
            Value::String(text) => println!("[{}] {}", remote, text),
            other => println!("[{}] {}", remote, other),
        }
    }

    fn on_close(&self, remote: &Identity) {
        println!("[{}] left", remote);
    }
}

impl FileHandler for Console {
    fn on_request(&self, remote: &Identity, request: FileRequest) {
        let metadata = request.metadata();
        if self.download_dir.is_none() {
            println!("[{}] declined file {} (no download directory)", remote, metadata.name);
            request.decline();
            return;
        }
        println!(
            "[{}] receiving {} ({} bytes, {})",
            remote, metadata.name, metadata.size, metadata.mime_type
        );
        request.accept(|fraction| {
            eprint!("\r  received {:>3.0}%", fraction * 100.0);
            let _ = std::io::stderr().flush();
        });
    }

    fn on_receive(&self, remote: &Identity, delivery: FileDelivery) {
        let (FileDelivery::File(file), Some(dir)) = (delivery, self.download_dir.clone()) else {
            return;
        };
        let remote = remote.clone();
        tokio::spawn(async move {
            match file.save_to(&dir).await {
                Ok(path) => println!("\n[{}] saved {}", remote, path.display()),
                Err(e) => warn!(error = %e, name = %file.metadata.name, "Failed to save file"),
            }
        });
    }

    fn on_decline(&self, remote: &Identity) {
        println!("[{}] declined the file", remote);
    }

    fn on_close(&self, _remote: &Identity) {}
}

impl CallHandler for Console {
    fn on_request(&self, remote: &Identity, request: CallRequest) {
        println!("[{}] call declined, calls need a media client", remote);
        request.decline();
    }

    fn on_end(&self, _remote: &Identity) {}

    fn on_close(&self, _remote: &Identity) {}
}

struct ConsoleAcceptor {
    console: Arc<Console>,
}

impl ConnectionAcceptor for ConsoleAcceptor {
    fn message_handler(&self, _remote: &Identity) -> Arc<dyn MessageHandler> {
        self.console.clone()
    }

    fn file_handler(&self, _remote: &Identity) -> Arc<dyn FileHandler> {
        self.console.clone()
    }

    fn file_config(&self, _remote: &Identity) -> FileConfig {
        FileConfig {
            mode: DeliveryMode::Accumulate,
            ..FileConfig::default()
        }
    }

    fn call_handler(&self, _remote: &Identity) -> Arc<dyn CallHandler> {
        self.console.clone()
    }

    fn on_connection(&self, connection: Connection) {
        info!(
            peer = %connection.remote().redacted(),
            kind = connection.sub_protocol().as_str(),
            "Peer connected"
        );
    }

    fn on_group_signal(&self, from: Option<&Identity>, _peer_data: Value, data: Value) {
        match from {
            Some(from) => println!("[{}] group invitation {}", from, data),
            None => println!("group ready {}", data),
        }
    }
}

/// Connect to the relay's signal endpoint and start a negotiator on it.
async fn start_negotiator(client: &ClientOptions, console: Arc<Console>) -> Result<Negotiator> {
    let (relay, inbound) = RelayClient::connect(&client.endpoint("signal"), &client.session)
        .await
        .context("Failed to connect to relay")?;

    let factory = TcpPeerFactory::new(TcpPeerConfig {
        bind_ip: client.bind_ip,
        advertise_ip: client.advertise_ip,
        ..TcpPeerConfig::default()
    });
    let negotiator = Negotiator::new(
        Arc::new(factory),
        relay,
        Arc::new(ConsoleAcceptor { console }),
        NegotiatorConfig::default(),
    );
    tokio::spawn(inbound.run(Arc::new(negotiator.clone())));
    Ok(negotiator)
}

/// Wait for incoming connections until Ctrl+C.
pub async fn listen(client: &ClientOptions, download_dir: PathBuf) -> Result<()> {
    if !download_dir.is_dir() {
        bail!("Download directory {} does not exist", download_dir.display());
    }

    let console = Arc::new(Console {
        download_dir: Some(download_dir),
    });
    let _negotiator = start_negotiator(client, console).await?;

    println!("Connected to {}. Press Ctrl+C to stop.", client.relay);
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    Ok(())
}

/// Send one message.
pub async fn send_message(client: &ClientOptions, to: &str, message: &str) -> Result<()> {
    let console = Arc::new(Console { download_dir: None });
    let negotiator = start_negotiator(client, console.clone()).await?;
    let remote = Identity::new(to);

    let connection = negotiator
        .create_connection(&remote, console)
        .await
        .with_context(|| format!("Failed to connect to {}", to))?;
    connection.send(json!(message)).await?;
    connection.close().await;

    println!("Message sent to {}", to);
    Ok(())
}

/// Send one file and report progress.
pub async fn send_file(client: &ClientOptions, to: &str, path: &Path) -> Result<()> {
    let payload = FilePayload::from_path(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let console = Arc::new(Console { download_dir: None });
    let negotiator = start_negotiator(client, console.clone()).await?;
    let remote = Identity::new(to);

    let connection = negotiator
        .create_file_connection(&remote, console, FileConfig::default())
        .await
        .with_context(|| format!("Failed to connect to {}", to))?;

    println!("Sending {} ({} bytes) to {}", payload.name, payload.data.len(), to);
    let progress: ProgressFn = Arc::new(|fraction: f64| {
        eprint!("\r  sent {:>3.0}%", fraction * 100.0);
        let _ = std::io::stderr().flush();
    });
    let outcome = connection.send(payload, Some(progress)).await?;
    connection.close().await;

    match outcome {
        SendOutcome::Delivered => println!("\nFile delivered."),
        SendOutcome::Declined => println!("{} declined the file.", to),
    }
    Ok(())
}

/// Print friends' presence changes until Ctrl+C.
pub async fn watch(client: &ClientOptions) -> Result<()> {
    let (hub, inbound) = RelayClient::connect(&client.endpoint("pusher"), &client.session)
        .await
        .context("Failed to connect to hub")?;
    let events = Arc::new(EventSubscriptions::new(hub));

    events
        .subscribe("login", |data| println!("+ {}", display_identity(&data)))
        .await?;
    events
        .subscribe("logout", |data| println!("- {}", display_identity(&data)))
        .await?;
    tokio::spawn(inbound.run(events));

    println!("Watching friends on {}. Press Ctrl+C to stop.", client.relay);
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn display_identity(data: &Value) -> String {
    data.as_str().map(str::to_string).unwrap_or_else(|| data.to_string())
}
