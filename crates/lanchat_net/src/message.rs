//! Typed-object envelopes carried inside `Object` frames.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::frame::{Frame, FrameKind};
use crate::identity::NodeId;

/// A value that can be sent as a typed object.
///
/// `TYPE_NAME` is the stable tag written into the envelope; receivers look
/// it up in their [`TypeRouter`](crate::router::TypeRouter) to pick a decoder.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

/// Wire wrapper for typed objects: `{"type": "<tag>", "data": <value>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Stable type tag used for dispatch.
    #[serde(rename = "type")]
    pub type_name: String,
    /// The payload, interpreted according to `type_name`.
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(type_name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            type_name: type_name.into(),
            data,
        }
    }

    /// Wrap a typed message.
    pub fn wrap<T: Message>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(T::TYPE_NAME, serde_json::to_value(value)?))
    }

    /// Decode the payload as `T` if the tag matches.
    pub fn unwrap_as<T: Message>(&self) -> Option<Result<T, serde_json::Error>> {
        (self.type_name == T::TYPE_NAME).then(|| serde_json::from_value(self.data.clone()))
    }

    /// Serialize into an `Object` frame.
    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        Ok(Frame::new(FrameKind::Object, serde_json::to_vec(self)?))
    }

    /// Parse an `Object` frame payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// First frame each side sends on a fresh TCP session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub node_id: NodeId,
    pub name: String,
    /// The TCP port the sender accepts sessions on.
    pub tcp_port: u16,
}

impl Message for Hello {
    const TYPE_NAME: &'static str = "lanchat.hello";
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        at: u64,
    }

    impl Message for Ping {
        const TYPE_NAME: &'static str = "test.ping";
    }

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope::wrap(&Ping { at: 7 }).unwrap();
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json, serde_json::json!({"type": "test.ping", "data": {"at": 7}}));
    }

    #[test]
    fn test_unwrap_as_matching_and_mismatching_tag() {
        let env = Envelope::wrap(&Ping { at: 42 }).unwrap();
        assert_eq!(env.unwrap_as::<Ping>().unwrap().unwrap(), Ping { at: 42 });
        assert!(env.unwrap_as::<Hello>().is_none());
    }

    #[test]
    fn test_to_frame_is_object_kind() {
        let env = Envelope::new("x", serde_json::json!(null));
        let frame = env.to_frame().unwrap();
        assert_eq!(frame.kind, FrameKind::Object);
        assert_eq!(Envelope::from_bytes(&frame.payload).unwrap(), env);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(Envelope::from_bytes(b"not json").is_err());
        assert!(Envelope::from_bytes(br#"{"data": 1}"#).is_err());
    }
}
