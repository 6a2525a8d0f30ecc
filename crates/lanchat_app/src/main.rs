//! LanChat: Serverless chat for everyone on the same network.
//!
//! Usage:
//!   lanchat                          # Run with ~/.lanchat/config.json
//!   lanchat --config path.json       # Run with a custom config
//!   lanchat --name desk-7 --port 0   # Override name, listen on any port

mod commands;
mod config;
mod logging;

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use lanchat_net::chat::{
    register_chat_types, ChatMessage, DiscoveryRequest, DiscoveryResponse, SystemMessage,
};
use lanchat_net::{
    LanNode, NetworkError, NodeEvent, NodeIdentity, Peer, PeerKey, ReceivedObject,
};

use crate::commands::{Command, HELP};
use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "lanchat", about = "Serverless LAN chat")]
struct Cli {
    /// Path to config file (default: ~/.lanchat/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Display name shown to other peers
    #[arg(short, long)]
    name: Option<String>,

    /// TCP port to accept sessions on (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Disable multicast discovery
    #[arg(long)]
    no_discovery: bool,

    /// Do not connect to discovered peers automatically
    #[arg(long)]
    no_auto_connect: bool,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(name) = &self.name {
            config.display_name = name.clone();
        }
        if let Some(port) = self.port {
            config.network.listen_addr.set_port(port);
        }
        if self.no_discovery {
            config.network.discovery_enabled = false;
        }
        if self.no_auto_connect {
            config.auto_connect = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    AppConfig::ensure_dirs()?;
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::config_path()?,
    };
    let mut config = AppConfig::load_from_path(&config_path)?;
    cli.apply(&mut config);

    let _log_guard = logging::init_logging(&AppConfig::logs_dir()?, &config.log_filter)?;

    let identity_path = AppConfig::identity_path()?;
    let mut identity = NodeIdentity::open_or_create(&identity_path, &config.display_name)
        .context("Failed to load node identity")?;
    if identity.name != config.display_name {
        identity.name = config.display_name.clone();
        identity
            .save(&identity_path)
            .context("Failed to save renamed identity")?;
    }

    run(identity, config).await
}

async fn run(identity: NodeIdentity, config: AppConfig) -> Result<()> {
    let mut node = LanNode::new(identity, config.network.clone());
    node.configure_router(register_chat_types);
    let mut events = node.subscribe();

    node.start().await.context("Failed to start node")?;
    let local = node
        .local_addr()
        .context("Node started without a listener")?;
    println!(
        "LanChat as '{}' ({}) on {local}. Type /help for commands.",
        node.identity().name,
        node.node_id()
    );

    let mut chat = ChatState::new(config.auto_connect);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match Command::parse(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => {
                        if let Err(e) = run_command(&node, command).await {
                            println!("! {e:#}");
                        }
                    }
                    Err(e) => println!("! {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {e}");
                    break;
                }
            },
            Some(event) = events.recv() => chat.handle_event(&node, event).await,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(e) = node
        .send_object(&SystemMessage::new(format!("{} left", node.identity().name)), None)
        .await
    {
        warn!("Failed to announce departure: {e}");
    }
    node.stop().await;
    info!("LanChat exited");
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Every peer the user can address by number: discovered peers plus any
/// connected peer that was never discovered, ordered by key.
fn roster(node: &LanNode) -> Vec<(Peer, bool)> {
    let connected: Vec<Peer> = node.connected_peers();
    let connected_keys: HashSet<PeerKey> = connected.iter().map(Peer::key).collect();

    let mut roster: Vec<(Peer, bool)> = node
        .peers()
        .into_iter()
        .map(|p| {
            let live = connected_keys.contains(&p.key());
            (p, live)
        })
        .collect();
    let listed: HashSet<PeerKey> = roster.iter().map(|(p, _)| p.key()).collect();
    roster.extend(
        connected
            .into_iter()
            .filter(|p| !listed.contains(&p.key()))
            .map(|p| (p, true)),
    );
    roster.sort_by(|(a, _), (b, _)| a.key().as_str().cmp(b.key().as_str()));
    roster
}

fn pick(node: &LanNode, index: usize) -> Result<Peer> {
    roster(node)
        .into_iter()
        .nth(index - 1)
        .map(|(peer, _)| peer)
        .with_context(|| format!("no peer #{index}, see /peers"))
}

async fn run_command(node: &LanNode, command: Command) -> Result<()> {
    match command {
        Command::Peers => {
            let roster = roster(node);
            if roster.is_empty() {
                println!("No peers yet. Try /discover.");
            }
            for (i, (peer, live)) in roster.iter().enumerate() {
                let mark = if *live { "*" } else { " " };
                println!("{mark}{:>3}. {peer}", i + 1);
            }
        }
        Command::Connect(index) => {
            let peer = node.connect(&pick(node, index)?).await?;
            println!("Connected to {peer}");
        }
        Command::Disconnect(index) => {
            let peer = pick(node, index)?;
            match node.disconnect(&peer) {
                Ok(()) => println!("Disconnected from {peer}"),
                Err(NetworkError::PeerNotFound(_)) => println!("Not connected to {peer}"),
                Err(e) => return Err(e.into()),
            }
        }
        Command::Discover => node.discover().await?,
        Command::Who => {
            let request = DiscoveryRequest {
                node_id: node.node_id().clone(),
                name: node.identity().name.clone(),
            };
            let sent = node.send_object(&request, None).await?;
            println!("Asked {sent} peer(s) to identify themselves");
        }
        Command::Msg { index, text } => {
            let peer = pick(node, index)?;
            node.send_object(&ChatMessage::new(node.identity(), text), Some(&peer))
                .await?;
        }
        Command::Raw(text) => {
            let sent = node.send_text(&text, None).await?;
            println!("Sent to {sent} peer(s)");
        }
        Command::Say(text) => {
            let sent = node
                .send_object(&ChatMessage::new(node.identity(), text), None)
                .await?;
            if sent == 0 {
                println!("(nobody is connected)");
            }
        }
        Command::Help => println!("{HELP}"),
        // Quit is handled by the input loop.
        Command::Nothing | Command::Quit => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

struct ChatState {
    auto_connect: bool,
    /// Peers announced at least once, so repeat announcements stay quiet.
    known: HashSet<PeerKey>,
    /// Peers whose first announcement we let pass to give them the chance to
    /// dial us first.
    deferred: HashSet<PeerKey>,
}

impl ChatState {
    fn new(auto_connect: bool) -> Self {
        Self {
            auto_connect,
            known: HashSet::new(),
            deferred: HashSet::new(),
        }
    }

    async fn handle_event(&mut self, node: &LanNode, event: NodeEvent) {
        match event {
            NodeEvent::PeerDiscovered(peer) => {
                if self.known.insert(peer.key()) {
                    println!("+ discovered {peer}");
                }
                if self.auto_connect {
                    self.maybe_connect(node, &peer).await;
                }
            }
            NodeEvent::PeerLost(peer) => {
                self.known.remove(&peer.key());
                self.deferred.remove(&peer.key());
                println!("- lost {peer}");
            }
            NodeEvent::PeerConnected(peer) => println!("* connected to {peer}"),
            NodeEvent::PeerDisconnected { peer, reason } => {
                println!("* disconnected from {peer} ({reason})")
            }
            NodeEvent::TextReceived { peer, text } => println!("[{} (raw)] {text}", peer.name),
            NodeEvent::ObjectReceived(obj) => handle_object(node, obj).await,
            NodeEvent::Log(_) => {}
        }
    }

    /// Only the side with the smaller node id dials on first sight; the other
    /// waits one announcement before dialing itself.
    async fn maybe_connect(&mut self, node: &LanNode, peer: &Peer) {
        let key = peer.key();
        if node.connected_peers().iter().any(|p| p.key() == key) {
            self.deferred.remove(&key);
            return;
        }
        if node.node_id().as_str() > peer.node_id.as_str() && self.deferred.insert(key.clone()) {
            return;
        }
        self.deferred.remove(&key);
        if let Err(e) = node.connect(peer).await {
            warn!("Auto-connect to {peer} failed: {e}");
        }
    }
}

async fn handle_object(node: &LanNode, obj: ReceivedObject) {
    let Some(resolved) = &obj.resolved else {
        println!("[{} sent {}] {}", obj.peer.name, obj.type_name, obj.data);
        return;
    };

    if let Some(msg) = resolved.downcast_ref::<ChatMessage>() {
        println!(
            "{} [{}] {}",
            msg.sent_at.with_timezone(&chrono::Local).format("%H:%M"),
            msg.sender_name,
            msg.content
        );
    } else if let Some(msg) = resolved.downcast_ref::<SystemMessage>() {
        println!("* {}", msg.content);
    } else if let Some(request) = resolved.downcast_ref::<DiscoveryRequest>() {
        let response = DiscoveryResponse {
            node_id: node.node_id().clone(),
            name: node.identity().name.clone(),
            tcp_port: node.local_addr().map(|a| a.port()).unwrap_or_default(),
        };
        if let Err(e) = node.send_object(&response, Some(&obj.peer)).await {
            warn!("Failed to answer {} ({}): {e}", request.name, request.node_id);
        }
    } else if let Some(response) = resolved.downcast_ref::<DiscoveryResponse>() {
        println!(
            "= {} ({}) at {}:{}",
            response.name, response.node_id, obj.peer.address, response.tcp_port
        );
    }
}
