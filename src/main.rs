//! Mesh node console
//!
//! Runs one node, broadcasts every line typed on stdin and prints every
//! message received.

use clap::Parser;
use peer_mesh::{Address, BroadcastOutcome, Node, NodeConfig, NodeSettings, PeerId};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "mesh-node")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "A symmetric peer-to-peer TCP mesh node", long_about = None)]
struct Cli {
    /// JSON settings file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<Address>,

    /// Peer address to dial (repeatable)
    #[arg(short, long = "peer")]
    peers: Vec<Address>,

    /// Largest frame payload in bytes
    #[arg(long)]
    max_frame_bytes: Option<usize>,

    /// Connection attempts per dial
    #[arg(long)]
    dial_retries: Option<u32>,

    /// Delay between dial attempts in milliseconds
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Pause after a connection failure in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Discard node log output
    #[arg(long)]
    silent: bool,
}

impl Cli {
    fn settings(&self) -> Result<NodeSettings, peer_mesh::MeshError> {
        let mut settings = match &self.config {
            Some(path) => NodeSettings::load(path)?,
            None => NodeSettings::default(),
        };

        if let Some(listen) = &self.listen {
            settings.listen = listen.clone();
        }
        if !self.peers.is_empty() {
            settings.peers = self.peers.clone();
        }
        if let Some(v) = self.max_frame_bytes {
            settings.max_frame_bytes = v;
        }
        if let Some(v) = self.dial_retries {
            settings.dial_retries = v;
        }
        if let Some(v) = self.retry_delay_ms {
            settings.retry_delay_ms = v;
        }
        if let Some(v) = self.poll_interval_ms {
            settings.poll_interval_ms = v;
        }
        settings.silent |= self.silent;

        Ok(settings)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let (listen, peers, config) = cli.settings()?.into_parts()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(listen, peers, config))
        .map_err(|e| -> Box<dyn std::error::Error> { e })
}

async fn run(
    listen: Address,
    peers: Vec<Address>,
    config: NodeConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    println!("🌐 Starting mesh node on {}...", listen);
    let node = Arc::new(Node::new(listen, peers, config)?);

    {
        let printer = Arc::downgrade(&node);
        node.on_message(move |msg| {
            println!("Received from {}: {}", msg.peer_id, msg.text());
            if let Some(node) = printer.upgrade() {
                show_servers(&node);
            }
        });
    }

    node.start().await;

    println!("Type a line to broadcast it, '@<peer id> text' to send to one peer,");
    println!("'peers' to list dialed peers, 'q' to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let text = line.trim();

        if text.eq_ignore_ascii_case("q") {
            break;
        }
        if text == "peers" {
            show_servers(&node);
            continue;
        }
        if let Err(e) = handle_line(&node, text).await {
            eprintln!("⚠️  {}", e);
        }
    }

    println!("📴 Shutting down node...");
    node.stop().await;
    Ok(())
}

async fn handle_line(node: &Node, text: &str) -> Result<(), peer_mesh::MeshError> {
    if let Some(rest) = text.strip_prefix('@') {
        let (id, message) = rest.split_once(' ').unwrap_or((rest, ""));
        let id: PeerId = id.parse()?;
        let outcome = node.send_text_to(id, message).await?;
        log::debug!("Unicast to {}: {:?}", id, outcome);
        return Ok(());
    }

    match node.broadcast_text(text).await? {
        BroadcastOutcome::Delivered(report) if report.failed > 0 => {
            eprintln!(
                "⚠️  Broadcast reached {} peers, {} failed",
                report.sent, report.failed
            );
        }
        _ => {}
    }
    Ok(())
}

fn show_servers(node: &Node) {
    for (id, address) in node.peers() {
        println!("ID: {} URL: {}", id, address);
    }
}
