//! Type router: Maps envelope type tags to decoders.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::message::{Envelope, Message};

type DecodeResult = Result<Arc<dyn Any + Send + Sync>, serde_json::Error>;
type Decoder = Arc<dyn Fn(serde_json::Value) -> DecodeResult + Send + Sync>;

/// A payload decoded into its registered concrete type.
#[derive(Clone)]
pub struct ResolvedObject {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl ResolvedObject {
    /// The tag the value was registered under.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrow the value as `T`, if that is what it is.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn is<T: Message>(&self) -> bool {
        self.value.is::<T>()
    }
}

impl fmt::Debug for ResolvedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedObject")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Outcome of resolving an envelope.
#[derive(Debug)]
pub enum Resolution {
    /// The tag is registered and the data decoded.
    Resolved(ResolvedObject),
    /// No decoder is registered for the tag.
    Unknown,
    /// The tag is registered but the data did not fit its shape.
    Malformed(serde_json::Error),
}

/// Dispatch table from stable type tags to decode functions.
#[derive(Clone, Default)]
pub struct TypeRouter {
    decoders: HashMap<&'static str, Decoder>,
}

impl TypeRouter {
    /// Create a router with no types registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its `TYPE_NAME`. Re-registering replaces the decoder.
    pub fn register<T: Message>(&mut self) {
        debug!("Registering object type: {}", T::TYPE_NAME);
        let decoder: Decoder = Arc::new(decode_as::<T>);
        self.decoders.insert(T::TYPE_NAME, decoder);
    }

    /// Check if a decoder is registered for a tag.
    pub fn has_type(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    /// Return the number of registered types.
    pub fn type_count(&self) -> usize {
        self.decoders.len()
    }

    /// Decode an envelope's data into its registered type.
    pub fn resolve(&self, envelope: &Envelope) -> Resolution {
        let Some((&type_name, decoder)) = self.decoders.get_key_value(envelope.type_name.as_str())
        else {
            return Resolution::Unknown;
        };
        match decoder(envelope.data.clone()) {
            Ok(value) => Resolution::Resolved(ResolvedObject { type_name, value }),
            Err(e) => Resolution::Malformed(e),
        }
    }
}

fn decode_as<T: Message>(data: serde_json::Value) -> DecodeResult {
    let value: T = serde_json::from_value(data)?;
    Ok(Arc::new(value))
}

impl fmt::Debug for TypeRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&&str> = self.decoders.keys().collect();
        names.sort();
        f.debug_struct("TypeRouter").field("types", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
