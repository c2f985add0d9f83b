//! Fixed RPC method slots shared by host and worklet.
//!
//! Each service owns a block of 256 ids starting at `n << 8`, leaving room
//! for sub-methods. New services claim the next unused block.

use crate::rpc::{Method, StreamMethod};
use crate::services::crash::CrashReport;
use crate::services::network::NetworkStatus;

/// Network/NAT status snapshots.
pub const NETWORK_STATUS: StreamMethod<(), NetworkStatus> =
    StreamMethod::new("network.status", 1 << 8);

/// Canonical public key of the backend.
pub const IDENTITY: Method<(), String> = Method::new("identity.query", 2 << 8);

/// Start the inspector; returns its hex key.
pub const INSPECTOR_ENABLE: Method<(), String> = Method::new("inspector.enable", 3 << 8);

/// Stop the inspector.
pub const INSPECTOR_DISABLE: Method<(), ()> = Method::new("inspector.disable", 4 << 8);

/// Current inspector key, `None` when disabled.
pub const INSPECTOR_KEY: Method<(), Option<String>> = Method::new("inspector.key", 5 << 8);

/// Worklet crash reports.
pub const CRASH_RELAY: StreamMethod<(), CrashReport> = StreamMethod::new("crash.relay", 6 << 8);

/// Call shape of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Request/response.
    Request,
    /// Server push.
    Stream,
}

/// Table entry describing one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInfo {
    /// Method name.
    pub name: &'static str,
    /// Slot id.
    pub id: u32,
    /// Call shape.
    pub shape: Shape,
}

const fn request<Req, Resp>(m: Method<Req, Resp>) -> MethodInfo {
    MethodInfo {
        name: m.name(),
        id: m.id(),
        shape: Shape::Request,
    }
}

const fn stream<Req, Ev>(m: StreamMethod<Req, Ev>) -> MethodInfo {
    MethodInfo {
        name: m.name(),
        id: m.id(),
        shape: Shape::Stream,
    }
}

/// Every fixed slot.
pub const TABLE: [MethodInfo; 6] = [
    stream(NETWORK_STATUS),
    request(IDENTITY),
    request(INSPECTOR_ENABLE),
    request(INSPECTOR_DISABLE),
    request(INSPECTOR_KEY),
    stream(CRASH_RELAY),
];
