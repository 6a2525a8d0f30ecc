//! Node identity: Unique node identification and persistence.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// An opaque, unique identifier for a node. Generated once per node
/// lifetime and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a new random node ID (UUID v4, simple form).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Create a NodeId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who this node is on the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique node identifier.
    pub node_id: NodeId,
    /// Display name shown to other peers.
    pub name: String,
}

impl NodeIdentity {
    /// Create a new identity with a fresh NodeId.
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            node_id: NodeId::generate(),
            name: name.into(),
        }
    }

    /// Write the identity as JSON, creating missing parent directories.
    pub fn save(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Read a saved identity. `Ok(None)` when nothing has been saved yet.
    pub fn load(path: &Path) -> Result<Option<Self>, NetworkError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The identity stored at `path`, or a fresh one called `name` that is
    /// written there. An unreadable file is replaced, so the node id only
    /// survives restarts while the file stays intact.
    pub fn open_or_create(path: &Path, name: impl Into<String>) -> Result<Self, NetworkError> {
        match Self::load(path) {
            Ok(Some(identity)) => return Ok(identity),
            Ok(None) => {}
            Err(e) => tracing::warn!(path = %path.display(), "Replacing unusable identity file: {e}"),
        }
        let identity = Self::generate(name);
        identity.save(path)?;
        Ok(identity)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
