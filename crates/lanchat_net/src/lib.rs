//! LanChat Network: Peer discovery and messaging on a local network.
//!
//! This crate provides the networking core for LanChat, letting instances on
//! the same LAN find each other without configuration and exchange text and
//! typed objects over direct TCP sessions.
//!
//! # Architecture
//!
//! - **Discovery**: UDP multicast announcements (`HERE`) and requests
//!   (`DISCOVER`), with stale peers aged out of the registry.
//! - **Transport**: one TCP session per peer, opened with a hello exchange
//!   and carrying length-prefixed frames.
//! - **Protocol**: text frames, and object frames holding a tagged JSON
//!   envelope.
//! - **Routing**: a type registry that decodes envelopes by tag.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use lanchat_net::{LanNode, NetworkConfig, NodeEvent};
//! use lanchat_net::identity::NodeIdentity;
//!
//! # async fn example() {
//! let identity = NodeIdentity::generate("my-node");
//! let mut node = LanNode::new(identity, NetworkConfig::default());
//! let mut events = node.subscribe();
//!
//! node.start().await.unwrap();
//! while let Some(event) = events.recv().await {
//!     if let NodeEvent::TextReceived { peer, text } = event {
//!         println!("{}: {text}", peer.name);
//!     }
//! }
//! node.stop().await;
//! # }
//! ```

pub mod chat;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod frame;
pub mod identity;
pub mod message;
pub mod node;
pub mod peer;
pub mod router;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NetworkConfig;
pub use error::NetworkError;
pub use events::{EventBus, LogLevel, LogRecord, NodeEvent, ReceivedObject};
pub use frame::{Frame, FrameKind};
pub use identity::{NodeId, NodeIdentity};
pub use message::{Envelope, Message};
pub use node::{LanNode, NodeState};
pub use peer::{Peer, PeerKey, PeerRegistry};
pub use router::{Resolution, ResolvedObject, TypeRouter};
