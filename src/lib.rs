//! Keet worklet - bootstrap and RPC bridge between the host process and its
//! backend worklet.
//!
//! # Architecture
//!
//! ```text
//! host process                              worklet process
//! ┌──────────────────────┐   stdio bytes   ┌───────────────────────────┐
//! │ WorkletClient        │                 │ services (network,        │
//! │   └─ Rpc ◄──────────►│◄───────────────►│   identity, inspector,    │
//! │ Supervisor / Worklet │                 │   crash relay)            │
//! └──────────────────────┘                 │   └─ WorkletContext       │
//!                                          │        └─ Backend         │
//!                                          └───────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`transport`] - Raw byte endpoints (in-memory pair or child stdio)
//! - [`rpc`] - Framing, codecs, and the request/stream multiplexer
//! - [`methods`] - Fixed method slots shared by both sides
//! - [`services`] - Worklet-side handlers
//! - [`host`] - Client facade, child process, supervisor
//! - [`config`] - Configuration loading/saving

pub mod backend;
pub mod config;
pub mod context;
pub mod env;
pub mod events;
pub mod host;
pub mod id_encoding;
pub mod methods;
pub mod rpc;
pub mod services;
pub mod startup;
pub mod transport;
pub mod worklet;

// Re-export commonly used types
pub use backend::{Backend, LocalBackend, ReadinessTimeout, Swarm};
pub use config::Config;
pub use context::WorkletContext;
pub use host::{Supervisor, Worklet, WorkletClient};
pub use rpc::{Rpc, RpcError, StreamSink, Subscription};
pub use startup::StartupArgs;
pub use transport::Endpoint;
