//! LAN peer discovery via UDP multicast.
//!
//! The [`DiscoveryService`] joins a multicast group and runs three loops:
//!
//! - **receive**: answers `DISCOVER` with a unicast `HERE`, and upserts the
//!   sender of every `HERE` into the [`PeerRegistry`];
//! - **announce**: a short burst of `HERE` datagrams on start-up, then one
//!   every announce interval;
//! - **aging**: sweeps the registry and reports peers unseen for too long.
//!
//! Datagrams are pipe-delimited UTF-8: `DISCOVER|<nodeId>` and
//! `HERE|<nodeId>|<name>|<tcpPort>`.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::events::{EventBus, LogLevel, NodeEvent};
use crate::identity::{NodeId, NodeIdentity};
use crate::peer::{Peer, PeerRegistry};

/// Largest datagram we expect; anything longer is truncated and then fails
/// to parse.
const MAX_DATAGRAM: usize = 2048;

/// A parsed discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMessage {
    /// Request for every listener to answer with `HERE`.
    Discover { node_id: NodeId },
    /// Announcement of a node and the TCP port it accepts sessions on.
    Here {
        node_id: NodeId,
        name: String,
        tcp_port: u16,
    },
}

impl DiscoveryMessage {
    /// Parse a datagram. Returns `None` for anything malformed.
    ///
    /// A `HERE` name may itself contain `|`; the node id is the first field
    /// and the port the last.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(datagram).ok()?.trim_end_matches(['\r', '\n']);

        if let Some(rest) = text.strip_prefix("DISCOVER|") {
            if rest.is_empty() || rest.contains('|') {
                return None;
            }
            return Some(Self::Discover {
                node_id: NodeId::from_string(rest),
            });
        }

        let rest = text.strip_prefix("HERE|")?;
        let (node_id, rest) = rest.split_once('|')?;
        let (name, port) = rest.rsplit_once('|')?;
        if node_id.is_empty() {
            return None;
        }
        let tcp_port: u16 = port.parse().ok()?;
        if tcp_port == 0 {
            return None;
        }
        Some(Self::Here {
            node_id: NodeId::from_string(node_id),
            name: name.to_string(),
            tcp_port,
        })
    }

    /// The node id carried by either message.
    pub fn node_id(&self) -> &NodeId {
        match self {
            Self::Discover { node_id } | Self::Here { node_id, .. } => node_id,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for DiscoveryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discover { node_id } => write!(f, "DISCOVER|{node_id}"),
            Self::Here {
                node_id,
                name,
                tcp_port,
            } => write!(f, "HERE|{node_id}|{name}|{tcp_port}"),
        }
    }
}

/// Settings the discovery loops need.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub announce_interval: Duration,
    pub announce_burst: u32,
    pub burst_interval: Duration,
    pub sweep_interval: Duration,
    pub peer_timeout: Duration,
}

impl DiscoveryConfig {
    pub fn from_network(config: &NetworkConfig) -> Self {
        Self {
            group: config.multicast_group,
            port: config.discovery_port,
            announce_interval: config.announce_interval,
            announce_burst: config.announce_burst,
            burst_interval: config.burst_interval,
            sweep_interval: config.sweep_interval,
            peer_timeout: config.peer_timeout,
        }
    }

    fn group_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

/// Bind the discovery socket with address reuse, so several nodes on one
/// host can share the port, and join the multicast group.
///
/// Failing to join the group is logged, not fatal: unicast `DISCOVER`/`HERE`
/// still work on hosts without a multicast route.
fn bind_multicast(config: &DiscoveryConfig) -> Result<UdpSocket, NetworkError> {
    let bind_err = |e: std::io::Error| NetworkError::Discovery(format!("Bind failed: {e}"));

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
    socket.bind(&bind_addr.into()).map_err(bind_err)?;

    if let Err(e) = socket.join_multicast_v4(&config.group, &Ipv4Addr::UNSPECIFIED) {
        warn!("Could not join multicast group {}: {e}", config.group);
    }
    if let Err(e) = socket.set_multicast_loop_v4(true) {
        debug!("Could not enable multicast loopback: {e}");
    }

    UdpSocket::from_std(socket.into()).map_err(bind_err)
}

/// Handle to the running discovery loops.
pub struct DiscoveryService {
    socket: Arc<UdpSocket>,
    config: DiscoveryConfig,
    node_id: NodeId,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryService {
    /// Bind the discovery socket and spawn the receive, announce and aging
    /// loops. `tcp_port` is the port announced in `HERE` messages.
    pub async fn start(
        config: DiscoveryConfig,
        identity: &NodeIdentity,
        tcp_port: u16,
        registry: PeerRegistry,
        events: EventBus,
    ) -> Result<Self, NetworkError> {
        let socket = Arc::new(bind_multicast(&config)?);
        info!(
            "Discovery service listening on 0.0.0.0:{} (group {})",
            config.port, config.group
        );

        let here = DiscoveryMessage::Here {
            node_id: identity.node_id.clone(),
            name: identity.name.clone(),
            tcp_port,
        }
        .to_bytes();

        let (shutdown_tx, _) = broadcast::channel(1);
        let tasks = vec![
            tokio::spawn(receive_loop(
                Arc::clone(&socket),
                identity.node_id.clone(),
                here.clone(),
                registry.clone(),
                events.clone(),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(announce_loop(
                Arc::clone(&socket),
                config.clone(),
                here,
                events.clone(),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(aging_loop(
                config.clone(),
                registry,
                events,
                shutdown_tx.subscribe(),
            )),
        ];

        Ok(Self {
            socket,
            config,
            node_id: identity.node_id.clone(),
            shutdown_tx,
            tasks,
        })
    }

    /// Multicast a `DISCOVER` request; listeners answer with unicast `HERE`.
    pub async fn discover(&self) -> Result<(), NetworkError> {
        let request = DiscoveryMessage::Discover {
            node_id: self.node_id.clone(),
        };
        self.socket
            .send_to(&request.to_bytes(), self.config.group_addr())
            .await
            .map_err(|e| NetworkError::Discovery(format!("DISCOVER send failed: {e}")))?;
        debug!("Sent DISCOVER to {}", self.config.group_addr());
        Ok(())
    }

    /// The local address of the discovery socket.
    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.socket.local_addr()?)
    }

    /// Stop all loops, wait for them, and leave the multicast group.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Discovery task ended abnormally: {e}");
            }
        }
        if let Err(e) = self
            .socket
            .leave_multicast_v4(self.config.group, Ipv4Addr::UNSPECIFIED)
        {
            debug!("Leaving multicast group {}: {e}", self.config.group);
        }
        info!("Discovery service stopped");
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    our_id: NodeId,
    here: Vec<u8>,
    registry: PeerRegistry,
    events: EventBus,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        handle_datagram(&socket, &buf[..len], src, &our_id, &here, &registry, &events).await;
                    }
                    Err(e) => {
                        // ICMP port-unreachable from an earlier unicast reply
                        // surfaces here on some platforms; keep listening.
                        events.log(LogLevel::Debug, format!("Discovery recv error: {e}"));
                    }
                }
            }
            _ = shutdown.recv() => {
                debug!("Discovery receive loop shutting down");
                break;
            }
        }
    }
}

async fn handle_datagram(
    socket: &UdpSocket,
    datagram: &[u8],
    src: SocketAddr,
    our_id: &NodeId,
    here: &[u8],
    registry: &PeerRegistry,
    events: &EventBus,
) {
    let Some(message) = DiscoveryMessage::parse(datagram) else {
        trace!("Ignoring malformed discovery datagram from {src}");
        return;
    };
    if message.node_id() == our_id {
        return;
    }

    match message {
        DiscoveryMessage::Discover { node_id } => {
            debug!("DISCOVER from {node_id} at {src}, replying");
            if let Err(e) = socket.send_to(here, src).await {
                events.log(
                    LogLevel::Warning,
                    format!("HERE reply to {src} failed: {e}"),
                );
            }
        }
        DiscoveryMessage::Here {
            node_id,
            name,
            tcp_port,
        } => {
            let peer = Peer::new(node_id, name, src.ip(), tcp_port);
            trace!("HERE from {peer}");
            registry.upsert(peer.clone());
            events.emit(NodeEvent::PeerDiscovered(peer));
        }
    }
}

async fn announce_loop(
    socket: Arc<UdpSocket>,
    config: DiscoveryConfig,
    here: Vec<u8>,
    events: EventBus,
    mut shutdown: broadcast::Receiver<()>,
) {
    let target = config.group_addr();
    let mut sent: u32 = 0;
    loop {
        match socket.send_to(&here, target).await {
            Ok(_) => trace!("Announcement sent to {target}"),
            Err(e) => events.log(LogLevel::Debug, format!("Announcement to {target} failed: {e}")),
        }
        sent = sent.saturating_add(1);

        let delay = if sent < config.announce_burst {
            config.burst_interval
        } else {
            config.announce_interval
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => {
                debug!("Discovery announcer shutting down");
                break;
            }
        }
    }
}

async fn aging_loop(
    config: DiscoveryConfig,
    registry: PeerRegistry,
    events: EventBus,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for peer in registry.sweep(config.peer_timeout, Utc::now()) {
                    info!("Peer {peer} lost (unseen for {:?})", config.peer_timeout);
                    events.emit(NodeEvent::PeerLost(peer));
                }
            }
            _ = shutdown.recv() => {
                debug!("Discovery aging loop shutting down");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
