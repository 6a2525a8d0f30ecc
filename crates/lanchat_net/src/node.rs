//! LanNode: Top-level coordinator for the networking layer.
//!
//! [`LanNode`] is the primary public API for lanchat_net. It manages:
//! - TCP listener (accept incoming sessions, hello exchange)
//! - Outbound sessions (connect to discovered or known peers)
//! - LAN discovery (multicast announce, request/response, peer aging)
//! - Send pipeline (text and typed objects, to one peer or all)
//! - Receive pipeline (decode frames, resolve object types, publish events)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::config::NetworkConfig;
use crate::connection::{
    self, Connection, ConnectionManager, Origin, Registration, TransportEvent,
};
use crate::discovery::{DiscoveryConfig, DiscoveryService};
use crate::error::NetworkError;
use crate::events::{EventBus, LogLevel, NodeEvent, ReceivedObject};
use crate::frame::{Frame, FrameKind};
use crate::identity::{NodeId, NodeIdentity};
use crate::message::{Envelope, Hello, Message};
use crate::peer::{Peer, PeerKey, PeerRegistry};
use crate::router::{Resolution, TypeRouter};

/// Lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Everything that only exists while the node is running.
struct Session {
    local_addr: SocketAddr,
    hello: Hello,
    connections: ConnectionManager,
    /// One in-flight dial per peer key; later callers wait for its result.
    dials: Mutex<HashMap<PeerKey, Arc<tokio::sync::Mutex<()>>>>,
    discovery: Option<DiscoveryService>,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
    pipeline_task: JoinHandle<()>,
}

/// A chat network node.
///
/// Create one per application instance. Call [`start()`](LanNode::start) to
/// begin accepting sessions and discovering peers, and
/// [`subscribe()`](LanNode::subscribe) to receive [`NodeEvent`]s.
pub struct LanNode {
    /// Our identity on the network.
    identity: NodeIdentity,
    /// Network configuration.
    config: NetworkConfig,
    /// Registry of discovered peers.
    peers: PeerRegistry,
    /// Decoders for incoming typed objects.
    router: Arc<RwLock<TypeRouter>>,
    /// Subscribers to node events.
    events: EventBus,
    state: NodeState,
    session: Option<Session>,
}

impl LanNode {
    /// Create a new node with the given identity and config.
    pub fn new(identity: NodeIdentity, config: NetworkConfig) -> Self {
        Self {
            identity,
            config,
            peers: PeerRegistry::new(),
            router: Arc::new(RwLock::new(TypeRouter::new())),
            events: EventBus::new(),
            state: NodeState::Stopped,
            session: None,
        }
    }

    /// Create a node with default config.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(NodeIdentity::generate(name), NetworkConfig::default())
    }

    /// Return the node's id.
    pub fn node_id(&self) -> &NodeId {
        &self.identity.node_id
    }

    /// Return the node's full identity.
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Return the node's configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Whether the node is currently running.
    pub fn is_running(&self) -> bool {
        self.state == NodeState::Running
    }

    /// The address the TCP listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.as_ref().map(|s| s.local_addr)
    }

    /// Open a subscription to this node's events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Register a type so received objects tagged with its name are decoded.
    pub fn register_type<T: Message>(&self) {
        self.router.write().register::<T>();
    }

    /// Edit the type registry directly, e.g. to install a group of types.
    pub fn configure_router(&self, configure: impl FnOnce(&mut TypeRouter)) {
        configure(&mut self.router.write());
    }

    /// Snapshot of all discovered peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.snapshot()
    }

    /// Peers with a live session, in no particular order.
    pub fn connected_peers(&self) -> Vec<Peer> {
        self.session
            .as_ref()
            .map(|s| s.connections.all().iter().map(|c| c.peer().clone()).collect())
            .unwrap_or_default()
    }

    /// Start the node. Binds the listener and starts discovery.
    ///
    /// Calling `start` on a running node is a no-op.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.session.is_some() {
            return Ok(());
        }
        self.state = NodeState::Starting;

        let listener = match TcpListener::bind(self.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state = NodeState::Stopped;
                return Err(NetworkError::Io(e));
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.state = NodeState::Stopped;
                return Err(NetworkError::Io(e));
            }
        };
        info!("Listening for sessions on {local_addr}");

        let hello = Hello {
            node_id: self.identity.node_id.clone(),
            name: self.identity.name.clone(),
            tcp_port: local_addr.port(),
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let connections = ConnectionManager::new(
            self.identity.node_id.clone(),
            transport_tx,
            self.config.max_frame_len,
        );

        let accept_task = tokio::spawn(accept_loop(
            listener,
            connections.clone(),
            hello.clone(),
            self.config.clone(),
            self.events.clone(),
            shutdown_tx.subscribe(),
        ));

        let pipeline_task = tokio::spawn(receive_pipeline(
            transport_rx,
            Arc::clone(&self.router),
            self.events.clone(),
        ));

        let discovery = if self.config.discovery_enabled {
            match DiscoveryService::start(
                DiscoveryConfig::from_network(&self.config),
                &self.identity,
                local_addr.port(),
                self.peers.clone(),
                self.events.clone(),
            )
            .await
            {
                Ok(service) => Some(service),
                Err(e) => {
                    self.events
                        .log(LogLevel::Warning, format!("Discovery start failed (non-fatal): {e}"));
                    None
                }
            }
        } else {
            None
        };

        self.session = Some(Session {
            local_addr,
            hello,
            connections,
            dials: Mutex::new(HashMap::new()),
            discovery,
            shutdown_tx,
            accept_task,
            pipeline_task,
        });
        self.state = NodeState::Running;
        info!(
            "LanNode '{}' started (node_id: {})",
            self.identity.name, self.identity.node_id
        );
        Ok(())
    }

    /// Stop the node. Closes every socket and waits for all background
    /// tasks to finish. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            self.state = NodeState::Stopped;
            return;
        };
        self.state = NodeState::Stopping;

        let Session {
            connections,
            discovery,
            shutdown_tx,
            accept_task,
            pipeline_task,
            ..
        } = session;

        let _ = shutdown_tx.send(());
        if let Err(e) = accept_task.await {
            warn!("Accept loop ended abnormally: {e}");
        }
        if let Some(discovery) = discovery {
            discovery.stop().await;
        }
        connections.close_all().await;

        // The pipeline exits once every sender of the transport channel is
        // gone, after delivering the final disconnect events.
        drop(connections);
        if let Err(e) = pipeline_task.await {
            warn!("Receive pipeline ended abnormally: {e}");
        }

        self.peers.clear();
        self.state = NodeState::Stopped;
        info!("LanNode '{}' stopped", self.identity.name);
    }

    /// Open a session to `peer`, or return the one that already exists.
    ///
    /// Returns the peer as identified by its hello (its node id and name).
    pub async fn connect(&self, peer: &Peer) -> Result<Peer, NetworkError> {
        let conn = self.connection_for(peer).await?;
        Ok(conn.peer().clone())
    }

    /// Close the session to `peer`. Fails with `PeerNotFound` when there is
    /// no session to close.
    pub fn disconnect(&self, peer: &Peer) -> Result<(), NetworkError> {
        let session = self.session()?;
        let key = peer.key();
        match session.connections.unregister(&key) {
            Some(_) => Ok(()),
            None => Err(NetworkError::PeerNotFound(key.to_string())),
        }
    }

    /// Multicast a `DISCOVER` request so peers answer right away instead of
    /// at their next announcement.
    pub async fn discover(&self) -> Result<(), NetworkError> {
        let session = self.session()?;
        match &session.discovery {
            Some(discovery) => discovery.discover().await,
            None => Err(NetworkError::Discovery("discovery is not running".to_string())),
        }
    }

    /// Send raw text to `peer`, or to every connected peer when `None`.
    ///
    /// Returns the number of peers the text was delivered to.
    pub async fn send_text(&self, text: &str, peer: Option<&Peer>) -> Result<usize, NetworkError> {
        self.send_frame(Frame::new(FrameKind::Text, text.as_bytes()), peer)
            .await
    }

    /// Send a typed object to `peer`, or to every connected peer when `None`.
    pub async fn send_object<T: Message>(
        &self,
        value: &T,
        peer: Option<&Peer>,
    ) -> Result<usize, NetworkError> {
        self.send_envelope(&Envelope::wrap(value)?, peer).await
    }

    /// Send a pre-built envelope, for payloads without a Rust type.
    pub async fn send_envelope(
        &self,
        envelope: &Envelope,
        peer: Option<&Peer>,
    ) -> Result<usize, NetworkError> {
        self.send_frame(envelope.to_frame()?, peer).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn session(&self) -> Result<&Session, NetworkError> {
        match (&self.session, self.state) {
            (Some(session), NodeState::Running) => Ok(session),
            _ => Err(NetworkError::NotRunning),
        }
    }

    async fn send_frame(&self, frame: Frame, peer: Option<&Peer>) -> Result<usize, NetworkError> {
        let session = self.session()?;
        let Some(peer) = peer else {
            return Ok(broadcast(&session.connections, &self.events, &frame).await);
        };

        let conn = self.connection_for(peer).await?;
        let err = match conn.send(&frame).await {
            Ok(()) => return Ok(1),
            Err(e) => e,
        };
        if conn.is_retired() {
            // Lost a duplicate-session race mid-send; the winner carries it.
            debug!("Session {} to {peer} was replaced, resending", conn.id());
            let conn = self.connection_for(peer).await?;
            return match conn.send(&frame).await {
                Ok(()) => Ok(1),
                Err(e) => Err(discard_on_fatal(&session.connections, &conn, e)),
            };
        }
        Err(discard_on_fatal(&session.connections, &conn, err))
    }

    /// The live session for `peer`, dialing it if there is none. Concurrent
    /// callers for the same peer share a single dial.
    async fn connection_for(&self, peer: &Peer) -> Result<Arc<Connection>, NetworkError> {
        let session = self.session()?;
        let key = peer.key();
        if let Some(conn) = live_connection(&session.connections, &key) {
            return Ok(conn);
        }
        if peer.node_id == self.identity.node_id {
            return Err(NetworkError::Transport("refusing to connect to self".to_string()));
        }

        let gate = Arc::clone(session.dials.lock().entry(key.clone()).or_default());
        let result = {
            let _dialing = gate.lock().await;
            match live_connection(&session.connections, &key) {
                Some(conn) => Ok(conn),
                None => self.dial(session, peer).await,
            }
        };

        let mut dials = session.dials.lock();
        // Ours plus the map's: nobody else is waiting on this gate.
        if Arc::strong_count(&gate) == 2 {
            dials.remove(&key);
        }
        result
    }

    async fn dial(&self, session: &Session, peer: &Peer) -> Result<Arc<Connection>, NetworkError> {
        let (stream, theirs) = connection::dial(
            peer.socket_addr(),
            &session.hello,
            self.config.max_frame_len,
            self.config.connect_timeout,
        )
        .await?;

        let mut connected = peer.clone();
        connected.node_id = theirs.node_id;
        connected.name = theirs.name;
        Ok(register_session(
            &session.connections,
            &self.events,
            connected,
            stream,
            Origin::Outbound,
        ))
    }
}

fn live_connection(connections: &ConnectionManager, key: &PeerKey) -> Option<Arc<Connection>> {
    connections.get(key).filter(|conn| !conn.is_closed())
}

fn discard_on_fatal(
    connections: &ConnectionManager,
    conn: &Connection,
    err: NetworkError,
) -> NetworkError {
    if err.is_fatal_to_connection() {
        connections.discard(conn);
    }
    err
}

/// Send `frame` to every live connection concurrently. A failing peer is
/// logged and unregistered; it never affects delivery to the others.
async fn broadcast(connections: &ConnectionManager, events: &EventBus, frame: &Frame) -> usize {
    let targets = connections.all();
    let results =
        futures::future::join_all(targets.iter().map(|conn| async move { conn.send(frame).await }))
            .await;

    let mut sent = 0;
    for (conn, result) in targets.iter().zip(results) {
        let (conn, result) = match result {
            // Replaced while sending; the new session carries the frame.
            Err(_) if conn.is_retired() => match connections.get(&conn.peer().key()) {
                Some(current) => {
                    let result = current.send(frame).await;
                    (current, result)
                }
                None => continue,
            },
            other => (Arc::clone(conn), other),
        };
        match result {
            Ok(()) => sent += 1,
            Err(e) => {
                events.log(
                    LogLevel::Warning,
                    format!("Broadcast send to {} failed: {e}", conn.peer()),
                );
                connections.discard(&conn);
            }
        }
    }
    sent
}

fn register_session(
    connections: &ConnectionManager,
    events: &EventBus,
    peer: Peer,
    stream: tokio::net::TcpStream,
    origin: Origin,
) -> Arc<Connection> {
    match connections.register(peer, stream, origin) {
        Registration::Registered(conn) => {
            events.emit(NodeEvent::PeerConnected(conn.peer().clone()));
            conn
        }
        // The peer was already connected; only the socket changed.
        Registration::Replaced(conn) | Registration::Duplicate(conn) => conn,
    }
}

/// Accept loop. Runs the hello exchange for each inbound socket in its own
/// task and registers the resulting session.
async fn accept_loop(
    listener: TcpListener,
    connections: ConnectionManager,
    hello: Hello,
    config: NetworkConfig,
    events: EventBus,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!("Inbound connection from {remote}");
                    let connections = connections.clone();
                    let events = events.clone();
                    let hello = hello.clone();
                    let max_frame_len = config.max_frame_len;
                    let timeout = config.connect_timeout;
                    handshakes.spawn(async move {
                        match connection::accept(stream, remote, &hello, max_frame_len, timeout).await {
                            Ok((stream, peer)) => {
                                register_session(&connections, &events, peer, stream, Origin::Inbound);
                            }
                            Err(e) => events.log(
                                LogLevel::Warning,
                                format!("Rejected inbound session from {remote}: {e}"),
                            ),
                        }
                    });
                }
                Err(e) => {
                    events.log(LogLevel::Error, format!("TCP accept failed: {e}"));
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
            _ = shutdown.recv() => {
                debug!("Accept loop shutting down");
                break;
            }
        }
    }
    handshakes.shutdown().await;
}

/// Receive pipeline. Turns transport events into node events.
async fn receive_pipeline(
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    router: Arc<RwLock<TypeRouter>>,
    events: EventBus,
) {
    while let Some(event) = transport_rx.recv().await {
        match event {
            TransportEvent::Frame { peer, frame } => dispatch_frame(&router, &events, peer, frame),
            TransportEvent::Closed { peer, reason } => {
                info!("Session with {peer} closed: {reason}");
                events.emit(NodeEvent::PeerDisconnected { peer, reason });
            }
        }
    }
    debug!("Receive pipeline finished");
}

fn dispatch_frame(router: &RwLock<TypeRouter>, events: &EventBus, peer: Peer, frame: Frame) {
    match frame.kind {
        FrameKind::Text => {
            let text = match String::from_utf8(frame.payload) {
                Ok(text) => text,
                Err(e) => {
                    events.log(
                        LogLevel::Warning,
                        format!("Invalid UTF-8 in text from {peer}, decoding lossily"),
                    );
                    String::from_utf8_lossy(e.as_bytes()).into_owned()
                }
            };
            events.emit(NodeEvent::TextReceived { peer, text });
        }
        FrameKind::Object => {
            let envelope = match Envelope::from_bytes(&frame.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    events.log(
                        LogLevel::Warning,
                        format!("Undecodable envelope from {peer}: {e}"),
                    );
                    return;
                }
            };
            if envelope.type_name == Hello::TYPE_NAME {
                trace!("Ignoring repeated hello from {peer}");
                return;
            }

            let resolution = router.read().resolve(&envelope);
            let resolved = match resolution {
                Resolution::Resolved(obj) => Some(obj),
                Resolution::Unknown => {
                    debug!("No type registered for '{}' from {peer}", envelope.type_name);
                    None
                }
                Resolution::Malformed(e) => {
                    events.log(
                        LogLevel::Warning,
                        format!(
                            "Object '{}' from {peer} does not match its type: {e}",
                            envelope.type_name
                        ),
                    );
                    None
                }
            };

            events.emit(NodeEvent::ObjectReceived(ReceivedObject {
                peer,
                type_name: envelope.type_name,
                data: envelope.data,
                resolved,
            }));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatMessage;

    fn loopback_node(name: &str) -> LanNode {
        LanNode::new(NodeIdentity::generate(name), NetworkConfig::loopback())
    }

    #[test]
    fn test_node_creation() {
        let node = LanNode::with_defaults("test-node");
        assert!(!node.is_running());
        assert_eq!(node.state(), NodeState::Stopped);
        assert_eq!(node.identity().name, "test-node");
        assert!(node.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_node_start_stop() {
        let mut node = loopback_node("lifecycle-node");

        node.start().await.unwrap();
        assert!(node.is_running());
        assert_ne!(node.local_addr().unwrap().port(), 0);
        assert!(node.peers().is_empty());

        node.stop().await;
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(node.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_node_double_start_and_stop() {
        let mut node = loopback_node("double-node");

        node.start().await.unwrap();
        let addr = node.local_addr();
        node.start().await.unwrap();
        assert_eq!(node.local_addr(), addr);

        node.stop().await;
        node.stop().await;
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_stop_on_never_started_node() {
        let mut node = loopback_node("never-started");
        node.stop().await;
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_send_when_not_running() {
        let node = loopback_node("stopped-node");
        match node.send_text("hi", None).await {
            Err(NetworkError::NotRunning) => {}
            other => panic!("Expected NotRunning, got {other:?}"),
        }
        assert!(matches!(node.discover().await, Err(NetworkError::NotRunning)));
    }

    #[tokio::test]
    async fn test_broadcast_with_no_connections() {
        let mut node = loopback_node("lonely-node");
        node.start().await.unwrap();
        assert_eq!(node.send_text("anyone?", None).await.unwrap(), 0);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_discover_without_discovery() {
        let mut node = loopback_node("no-discovery");
        node.start().await.unwrap();
        assert!(matches!(node.discover().await, Err(NetworkError::Discovery(_))));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_connect_to_self_refused() {
        let mut node = loopback_node("narcissus");
        node.start().await.unwrap();
        let me = Peer::new(
            node.node_id().clone(),
            "narcissus",
            "127.0.0.1".parse().unwrap(),
            node.local_addr().unwrap().port(),
        );
        assert!(node.connect(&me).await.is_err());
        node.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unreachable_peer_fails() {
        let mut node = loopback_node("sender");
        node.start().await.unwrap();

        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let ghost = Peer::new(NodeId::generate(), "ghost", "127.0.0.1".parse().unwrap(), port);

        assert!(node.send_text("hello?", Some(&ghost)).await.is_err());
        node.stop().await;
    }

    async fn wait_for_event<T>(
        rx: &mut mpsc::UnboundedReceiver<NodeEvent>,
        mut pick: impl FnMut(NodeEvent) -> Option<T>,
    ) -> T {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(found) = pick(rx.recv().await.expect("event bus closed")) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_broadcast_drops_peer_whose_send_fails() {
        let mut hub = loopback_node("hub");
        hub.start().await.unwrap();
        let mut hub_events = hub.subscribe();
        let mut alive = loopback_node("alive");
        alive.start().await.unwrap();
        let mut alive_events = alive.subscribe();

        let alive_peer = Peer::new(
            alive.node_id().clone(),
            "alive",
            "127.0.0.1".parse().unwrap(),
            alive.local_addr().unwrap().port(),
        );
        hub.connect(&alive_peer).await.unwrap();

        // A peer that completes the hello and then goes quiet.
        let mut quiet = tokio::net::TcpStream::connect(hub.local_addr().unwrap())
            .await
            .unwrap();
        let quiet_hello = Hello {
            node_id: NodeId::generate(),
            name: "quiet".into(),
            tcp_port: 6000,
        };
        connection::exchange_hello(
            &mut quiet,
            &quiet_hello,
            hub.config().max_frame_len,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        let quiet_peer = wait_for_event(&mut hub_events, |e| match e {
            NodeEvent::PeerConnected(peer) if peer.name == "quiet" => Some(peer),
            _ => None,
        })
        .await;
        let quiet_key = quiet_peer.key();

        // Still registered, but every write to it now fails.
        let session = hub.session.as_ref().unwrap();
        session
            .connections
            .get(&quiet_key)
            .unwrap()
            .shutdown_write()
            .await;

        assert_eq!(hub.send_text("to everyone", None).await.unwrap(), 1);

        let text = wait_for_event(&mut alive_events, |e| match e {
            NodeEvent::TextReceived { text, .. } => Some(text),
            _ => None,
        })
        .await;
        assert_eq!(text, "to everyone");

        let logged = wait_for_event(&mut hub_events, |e| match e {
            NodeEvent::Log(record) if record.message.contains("Broadcast send") => Some(record),
            _ => None,
        })
        .await;
        assert_eq!(logged.level, LogLevel::Warning);
        assert!(!hub.connected_peers().iter().any(|p| p.key() == quiet_key));
        assert_eq!(hub.connected_peers().len(), 1);

        drop(quiet);
        hub.stop().await;
        alive.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_peer_not_found() {
        let mut node = loopback_node("idle");
        node.start().await.unwrap();
        let stranger = Peer::new(
            NodeId::generate(),
            "stranger",
            "127.0.0.1".parse().unwrap(),
            6001,
        );
        assert!(matches!(
            node.disconnect(&stranger),
            Err(NetworkError::PeerNotFound(key)) if key == "127.0.0.1-6001"
        ));
        node.stop().await;
    }

    #[test]
    fn test_dispatch_text_frame() {
        let router = RwLock::new(TypeRouter::new());
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let peer = Peer::new(NodeId::generate(), "p", "10.0.0.2".parse().unwrap(), 4000);

        dispatch_frame(&router, &events, peer, Frame::new(FrameKind::Text, "hey"));
        match rx.try_recv().unwrap() {
            NodeEvent::TextReceived { text, .. } => assert_eq!(text, "hey"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_dispatch_unknown_object_still_emits() {
        let router = RwLock::new(TypeRouter::new());
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let peer = Peer::new(NodeId::generate(), "p", "10.0.0.2".parse().unwrap(), 4000);
        let env = Envelope::new("mystery.type", serde_json::json!({"x": 1}));

        dispatch_frame(&router, &events, peer, env.to_frame().unwrap());
        match rx.try_recv().unwrap() {
            NodeEvent::ObjectReceived(obj) => {
                assert_eq!(obj.type_name, "mystery.type");
                assert_eq!(obj.data["x"], 1);
                assert!(obj.resolved.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_dispatch_malformed_object_logs_and_emits() {
        let mut router = TypeRouter::new();
        router.register::<ChatMessage>();
        let router = RwLock::new(router);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let peer = Peer::new(NodeId::generate(), "p", "10.0.0.2".parse().unwrap(), 4000);
        let env = Envelope::new(ChatMessage::TYPE_NAME, serde_json::json!("wrong shape"));

        dispatch_frame(&router, &events, peer, env.to_frame().unwrap());
        assert!(matches!(rx.try_recv().unwrap(), NodeEvent::Log(_)));
        match rx.try_recv().unwrap() {
            NodeEvent::ObjectReceived(obj) => {
                assert_eq!(obj.type_name, ChatMessage::TYPE_NAME);
                assert!(obj.resolved.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_dispatch_hello_is_swallowed() {
        let router = RwLock::new(TypeRouter::new());
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let peer = Peer::new(NodeId::generate(), "p", "10.0.0.2".parse().unwrap(), 4000);
        let hello = Hello {
            node_id: NodeId::generate(),
            name: "p".into(),
            tcp_port: 4000,
        };

        dispatch_frame(&router, &events, peer, Envelope::wrap(&hello).unwrap().to_frame().unwrap());
        assert!(rx.try_recv().is_err());
    }
}
