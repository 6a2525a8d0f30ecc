//! Network configuration for a chat node.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default multicast group for discovery datagrams.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 8, 8, 8);

/// Default UDP port for discovery datagrams.
pub const DEFAULT_DISCOVERY_PORT: u16 = 45555;

/// Default TCP port for framed peer sessions.
pub const DEFAULT_TCP_PORT: u16 = 4000;

/// Default upper bound on a frame payload (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Configuration for the networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on for incoming TCP sessions. Port 0 picks a free
    /// port; the bound port is what gets announced.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Whether LAN discovery (UDP multicast) is enabled.
    pub discovery_enabled: bool,

    /// Multicast group joined by the discovery socket.
    pub multicast_group: Ipv4Addr,

    /// UDP port used for discovery datagrams.
    pub discovery_port: u16,

    /// Interval between periodic `HERE` announcements.
    #[serde(with = "duration_ms_serde")]
    pub announce_interval: Duration,

    /// Number of rapid announcements sent right after start.
    pub announce_burst: u32,

    /// Spacing between the rapid start-up announcements.
    #[serde(with = "duration_ms_serde")]
    pub burst_interval: Duration,

    /// How often the peer registry is swept for stale entries.
    #[serde(with = "duration_ms_serde")]
    pub sweep_interval: Duration,

    /// A peer unseen for longer than this is evicted.
    #[serde(with = "duration_ms_serde")]
    pub peer_timeout: Duration,

    /// Largest frame payload accepted from a peer.
    pub max_frame_len: usize,

    /// Timeout for establishing a session (TCP connect plus hello exchange).
    #[serde(with = "duration_ms_serde")]
    pub connect_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_TCP_PORT)),
            discovery_enabled: true,
            multicast_group: DEFAULT_MULTICAST_GROUP,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            announce_interval: Duration::from_secs(10),
            announce_burst: 3,
            burst_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(30),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl NetworkConfig {
    /// A config for loopback use: ephemeral TCP port, discovery off.
    pub fn loopback() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            discovery_enabled: false,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
