//! Payload codecs and typed method descriptors.
//!
//! Bodies are JSON. Fixed-slot methods name concrete serde types in their
//! [`Method`]/[`StreamMethod`] descriptor so both sides agree at compile time;
//! [`Any`] is the schema-less escape hatch for genuinely open-ended payloads.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::RpcError;

/// Schema-less payload for methods without a fixed shape.
pub type Any = serde_json::Value;

/// Encode a payload for the wire.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, RpcError> {
    serde_json::to_vec(value).map_err(|e| RpcError::Codec(format!("encode: {e}")))
}

/// Decode a payload from the wire.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RpcError> {
    serde_json::from_slice(bytes).map_err(|e| RpcError::Codec(format!("decode: {e}")))
}

/// Request/response method descriptor.
pub struct Method<Req, Resp> {
    name: &'static str,
    id: u32,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Method<Req, Resp> {
    /// Describe a method living at slot `id`.
    pub const fn new(name: &'static str, id: u32) -> Self {
        Self {
            name,
            id,
            _marker: PhantomData,
        }
    }

    /// Human-readable method name.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Numeric method slot.
    pub const fn id(&self) -> u32 {
        self.id
    }
}

impl<Req, Resp> Clone for Method<Req, Resp> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Req, Resp> Copy for Method<Req, Resp> {}

impl<Req, Resp> fmt::Debug for Method<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Method({} @ {:#06x})", self.name, self.id)
    }
}

/// Server-push stream descriptor.
pub struct StreamMethod<Req, Ev> {
    name: &'static str,
    id: u32,
    _marker: PhantomData<fn(Req) -> Ev>,
}

impl<Req, Ev> StreamMethod<Req, Ev> {
    /// Describe a stream living at slot `id`.
    pub const fn new(name: &'static str, id: u32) -> Self {
        Self {
            name,
            id,
            _marker: PhantomData,
        }
    }

    /// Human-readable method name.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Numeric method slot.
    pub const fn id(&self) -> u32 {
        self.id
    }
}

impl<Req, Ev> Clone for StreamMethod<Req, Ev> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Req, Ev> Copy for StreamMethod<Req, Ev> {}

impl<Req, Ev> fmt::Debug for StreamMethod<Req, Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamMethod({} @ {:#06x})", self.name, self.id)
    }
}
