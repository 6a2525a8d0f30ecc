//! Connection manager: One framed TCP session per peer key.
//!
//! Each registered [`Connection`] owns the write half of its socket behind an
//! async lock, so concurrent senders never interleave partial frames. The read
//! half is moved into a dedicated read loop, the only reader of that socket,
//! which forwards frames as [`TransportEvent`]s and unregisters the
//! connection when the stream ends or fails.
//!
//! When two sessions exist for one key (both ends dialed at once, or a peer
//! dialed again), both ends keep the same one: the session dialed by the
//! smaller node id, or the newest one when the same node dialed both. The
//! other session is retired: it takes no new sends but keeps reading, so
//! frames already written to it are still delivered. The end that dialed a
//! retired session shuts down its write half once pending writes finish; the
//! other end closes when it reads that EOF.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::frame::{Frame, FrameKind, read_frame, write_frame};
use crate::identity::NodeId;
use crate::message::{Envelope, Hello};
use crate::peer::{Peer, PeerKey};

/// How long `close_all` waits for read loops before aborting them.
const READ_LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on how long a retired session keeps reading.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// An incoming event from a connection's read loop.
#[derive(Debug)]
pub enum TransportEvent {
    /// A frame arrived from a peer.
    Frame { peer: Peer, frame: Frame },
    /// The connection ended and has been unregistered.
    Closed { peer: Peer, reason: String },
}

/// Which end opened a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// We dialed the peer.
    Outbound,
    /// The peer dialed us.
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Open,
    /// Superseded by another session; finishing reads, no new writes.
    Draining,
    Closed,
}

/// An established TCP session with exactly one peer.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    peer: Peer,
    origin: Origin,
    /// Node id of the end that dialed this session.
    dialer: NodeId,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    state: watch::Sender<LinkState>,
    retired: AtomicBool,
}

impl Connection {
    /// Unique id of this session; a reconnect gets a new one.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The peer on the other end.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Whether the connection no longer accepts sends.
    pub fn is_closed(&self) -> bool {
        *self.state.borrow() != LinkState::Open
    }

    /// Whether another session for the same peer replaced this one.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Write one frame. Holds the write lock for the whole frame.
    ///
    /// A write blocked on a peer that stopped reading is abandoned as soon as
    /// the connection is closed.
    pub async fn send(&self, frame: &Frame) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Transport(format!(
                "connection to {} is closed",
                self.peer.key()
            )));
        }
        let mut state = self.state.subscribe();
        let write = async {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, frame).await
        };
        let closed = async {
            let _ = state.wait_for(|s| *s == LinkState::Closed).await;
        };
        tokio::select! {
            biased;
            result = write => result,
            _ = closed => Err(NetworkError::Transport(format!(
                "connection to {} closed during send",
                self.peer.key()
            ))),
        }
    }

    /// Send UTF-8 text as a `Text` frame.
    pub async fn send_text(&self, text: &str) -> Result<(), NetworkError> {
        self.send(&Frame::new(FrameKind::Text, text.as_bytes())).await
    }

    /// Send an envelope as an `Object` frame.
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), NetworkError> {
        self.send(&envelope.to_frame()?).await
    }

    /// Stop the read loop and abandon pending writes. The socket is closed
    /// once the read loop exits.
    pub fn close(&self) {
        self.state.send_replace(LinkState::Closed);
    }

    /// Mark the session as superseded. The dialing end shuts down its write
    /// half once pending writes finish; either end force-closes the session
    /// if the peer has not finished within [`DRAIN_TIMEOUT`].
    fn retire(self: &Arc<Self>) {
        self.retired.store(true, Ordering::Release);
        let draining = self.state.send_if_modified(|state| {
            if *state == LinkState::Open {
                *state = LinkState::Draining;
                true
            } else {
                false
            }
        });
        if !draining {
            return;
        }

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            if conn.origin == Origin::Outbound {
                let _ = conn.writer.lock().await.shutdown().await;
            }
            let mut state = conn.state.subscribe();
            let closed = async {
                let _ = state.wait_for(|s| *s == LinkState::Closed).await;
            };
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, closed).await.is_ok();
            if !drained {
                debug!("Connection {} to {} did not drain in time", conn.id, conn.peer);
                conn.close();
            }
        });
    }

    /// Whether `self` should replace `existing` as the session for its key.
    fn supersedes(&self, existing: &Connection) -> bool {
        // Equal dialers: the same node dialed again and gave up on the
        // earlier session.
        self.dialer <= existing.dialer
    }

    #[cfg(test)]
    pub(crate) async fn shutdown_write(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

/// Result of [`ConnectionManager::register`].
#[derive(Debug)]
pub enum Registration {
    /// The connection was added and its read loop started.
    Registered(Arc<Connection>),
    /// The connection took over the key from an existing session, which was
    /// retired.
    Replaced(Arc<Connection>),
    /// An existing session for the key is kept; the new socket was retired
    /// and the existing connection is returned.
    Duplicate(Arc<Connection>),
}

impl Registration {
    pub fn connection(&self) -> &Arc<Connection> {
        match self {
            Self::Registered(conn) | Self::Replaced(conn) | Self::Duplicate(conn) => conn,
        }
    }

    /// Whether the registered socket became the live session for its key.
    pub fn is_new(&self) -> bool {
        !matches!(self, Self::Duplicate(_))
    }
}

struct Inner {
    local_id: NodeId,
    connections: Mutex<HashMap<PeerKey, Arc<Connection>>>,
    /// Retired sessions still draining, by connection id.
    retiring: Mutex<HashMap<u64, Arc<Connection>>>,
    read_loops: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<TransportEvent>,
    max_frame_len: usize,
}

/// Registry of live connections, at most one per [`PeerKey`].
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager for the node `local_id` whose read loops report into
    /// `events`.
    pub fn new(
        local_id: NodeId,
        events: mpsc::UnboundedSender<TransportEvent>,
        max_frame_len: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local_id,
                connections: Mutex::new(HashMap::new()),
                retiring: Mutex::new(HashMap::new()),
                read_loops: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                events,
                max_frame_len,
            }),
        }
    }

    /// Register a session for `peer`, resolving a clash with an existing
    /// session for the same key.
    ///
    /// Must be called from within a Tokio runtime; the read loop is spawned
    /// before this returns.
    pub fn register(&self, peer: Peer, stream: TcpStream, origin: Origin) -> Registration {
        let key = peer.key();
        let dialer = match origin {
            Origin::Outbound => self.inner.local_id.clone(),
            Origin::Inbound => peer.node_id.clone(),
        };
        let (reader, writer) = stream.into_split();
        let (state_tx, state_rx) = watch::channel(LinkState::Open);
        let conn = Arc::new(Connection {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            peer,
            origin,
            dialer,
            writer: tokio::sync::Mutex::new(writer),
            state: state_tx,
            retired: AtomicBool::new(false),
        });

        let registration = {
            let mut connections = self.inner.connections.lock();
            // A closed entry is one whose read loop has not removed it yet.
            match connections.get(&key).filter(|c| !c.is_closed()).cloned() {
                None => {
                    connections.insert(key.clone(), Arc::clone(&conn));
                    Registration::Registered(Arc::clone(&conn))
                }
                Some(old) if conn.supersedes(&old) => {
                    connections.insert(key.clone(), Arc::clone(&conn));
                    old.retire();
                    debug!("Connection {} replaces {} for {key}", conn.id, old.id);
                    self.inner.retiring.lock().insert(old.id, old);
                    Registration::Replaced(Arc::clone(&conn))
                }
                Some(existing) => {
                    conn.retire();
                    debug!("Duplicate session for {key}, keeping connection {}", existing.id);
                    self.inner.retiring.lock().insert(conn.id, Arc::clone(&conn));
                    Registration::Duplicate(existing)
                }
            }
        };

        if registration.is_new() {
            info!("Registered connection {} to {}", conn.id, conn.peer);
        }
        let handle = tokio::spawn(read_loop(self.clone(), conn, reader, state_rx));

        let mut read_loops = self.inner.read_loops.lock();
        read_loops.retain(|h| !h.is_finished());
        read_loops.push(handle);

        registration
    }

    /// Remove and close the connection for `key`.
    pub fn unregister(&self, key: &PeerKey) -> Option<Arc<Connection>> {
        let conn = self.inner.connections.lock().remove(key)?;
        conn.close();
        debug!("Unregistered connection {} to {key}", conn.id);
        Some(conn)
    }

    /// Close `conn`, removing it from the registry if it is still the live
    /// session for its key. Returns whether it was removed.
    pub fn discard(&self, conn: &Connection) -> bool {
        let removed = self.remove_if_current(&conn.peer.key(), conn.id);
        conn.close();
        removed
    }

    /// Get the live connection for `key`.
    pub fn get(&self, key: &PeerKey) -> Option<Arc<Connection>> {
        self.inner.connections.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &PeerKey) -> bool {
        self.inner.connections.lock().contains_key(key)
    }

    /// Snapshot of every live connection.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.inner.connections.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.lock().is_empty()
    }

    /// Close every connection, draining or not, and wait for all read loops
    /// to finish.
    pub async fn close_all(&self) {
        let mut closing: Vec<Arc<Connection>> = self
            .inner
            .connections
            .lock()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        closing.extend(self.inner.retiring.lock().drain().map(|(_, conn)| conn));
        for conn in &closing {
            conn.close();
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.read_loops.lock());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(READ_LOOP_JOIN_TIMEOUT, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("Read loops did not finish in {READ_LOOP_JOIN_TIMEOUT:?}, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }

    /// Remove `key` only if it still maps to connection `id`.
    fn remove_if_current(&self, key: &PeerKey, id: u64) -> bool {
        let mut connections = self.inner.connections.lock();
        if connections.get(key).is_some_and(|c| c.id == id) {
            connections.remove(key);
            true
        } else {
            false
        }
    }
}

async fn read_loop(
    manager: ConnectionManager,
    conn: Arc<Connection>,
    mut reader: OwnedReadHalf,
    mut state: watch::Receiver<LinkState>,
) {
    let peer = conn.peer.clone();
    let max_frame_len = manager.inner.max_frame_len;

    // Only a close interrupts a read; dropping `read_frame` midway would
    // lose the frame boundary.
    let reason = loop {
        let closed = async {
            let _ = state.wait_for(|s| *s == LinkState::Closed).await;
        };
        tokio::select! {
            result = read_frame(&mut reader, max_frame_len) => match result {
                Ok(Some(frame)) => {
                    let event = TransportEvent::Frame { peer: peer.clone(), frame };
                    if manager.inner.events.send(event).is_err() {
                        break "node shutting down".to_string();
                    }
                }
                Ok(None) => break "closed by peer".to_string(),
                Err(e) => break e.to_string(),
            },
            _ = closed => break "closed locally".to_string(),
        }
    };

    let draining = *state.borrow() == LinkState::Draining;
    if draining {
        // The peer finished; let a send that started before retirement finish.
        if let Ok(mut writer) = tokio::time::timeout(DRAIN_TIMEOUT, conn.writer.lock()).await {
            let _ = writer.shutdown().await;
        }
    }
    conn.close();
    manager.remove_if_current(&peer.key(), conn.id);
    manager.inner.retiring.lock().remove(&conn.id);
    let _ = conn.writer.lock().await.shutdown().await;
    drop(reader);

    debug!("Connection {} to {} ended: {reason}", conn.id, peer);
    // A retired session's peer is still reachable through its replacement.
    if conn.is_retired() {
        return;
    }
    let _ = manager
        .inner
        .events
        .send(TransportEvent::Closed { peer, reason });
}

// ---------------------------------------------------------------------------
// Session establishment
// ---------------------------------------------------------------------------

/// Exchange hello frames on a fresh stream: write ours, then read theirs.
pub async fn exchange_hello(
    stream: &mut TcpStream,
    ours: &Hello,
    max_frame_len: usize,
    timeout: Duration,
) -> Result<Hello, NetworkError> {
    tokio::time::timeout(timeout, exchange_hello_inner(stream, ours, max_frame_len))
        .await
        .map_err(|_| NetworkError::Timeout(timeout))?
}

async fn exchange_hello_inner(
    stream: &mut TcpStream,
    ours: &Hello,
    max_frame_len: usize,
) -> Result<Hello, NetworkError> {
    write_frame(stream, &Envelope::wrap(ours)?.to_frame()?).await?;

    let frame = read_frame(stream, max_frame_len)
        .await?
        .ok_or_else(|| NetworkError::Handshake("closed before hello".to_string()))?;
    if frame.kind != FrameKind::Object {
        return Err(NetworkError::Handshake(format!(
            "expected object frame, got {:?}",
            frame.kind
        )));
    }

    let envelope = Envelope::from_bytes(&frame.payload)
        .map_err(|e| NetworkError::Handshake(format!("bad envelope: {e}")))?;
    match envelope.unwrap_as::<Hello>() {
        Some(Ok(hello)) => Ok(hello),
        Some(Err(e)) => Err(NetworkError::Handshake(format!("bad hello: {e}"))),
        None => Err(NetworkError::Handshake(format!(
            "expected hello, got {}",
            envelope.type_name
        ))),
    }
}

/// Open a session to `addr` and run the hello exchange.
pub async fn dial(
    addr: SocketAddr,
    ours: &Hello,
    max_frame_len: usize,
    timeout: Duration,
) -> Result<(TcpStream, Hello), NetworkError> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| NetworkError::Timeout(timeout))?
        .map_err(|e| NetworkError::Transport(format!("Connect to {addr} failed: {e}")))?;
    stream.set_nodelay(true)?;

    let theirs = exchange_hello(&mut stream, ours, max_frame_len, timeout).await?;
    Ok((stream, theirs))
}

/// Run the hello exchange on an accepted stream and derive the remote peer.
///
/// The peer is keyed by the remote IP and the TCP port it announced, matching
/// the key discovery would give it.
pub async fn accept(
    mut stream: TcpStream,
    remote: SocketAddr,
    ours: &Hello,
    max_frame_len: usize,
    timeout: Duration,
) -> Result<(TcpStream, Peer), NetworkError> {
    stream.set_nodelay(true)?;
    let theirs = exchange_hello(&mut stream, ours, max_frame_len, timeout).await?;
    let peer = Peer::new(theirs.node_id, theirs.name, remote.ip(), theirs.tcp_port);
    Ok((stream, peer))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
