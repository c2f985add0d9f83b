//! Diagnostic services served by the worklet.
//!
//! [`register`] binds every fixed slot in [`crate::methods`] to its handler.
//! Each handler gets the [`WorkletContext`] explicitly.

pub mod crash;
pub(crate) mod identity;
pub mod inspector;
pub mod network;

use std::sync::Arc;

use crate::context::WorkletContext;
use crate::methods;
use crate::rpc::Rpc;

/// Register all diagnostic services on `rpc`.
pub fn register(rpc: &Rpc, ctx: &Arc<WorkletContext>) {
    let c = Arc::clone(ctx);
    rpc.register_stream(methods::NETWORK_STATUS, move |(), sink| {
        network::stream_status(Arc::clone(&c), sink)
    });

    let c = Arc::clone(ctx);
    rpc.register_request(methods::IDENTITY, move |()| identity::query(Arc::clone(&c)));

    let c = Arc::clone(ctx);
    rpc.register_request(methods::INSPECTOR_ENABLE, move |()| {
        let key = c.inspector().enable();
        async move { anyhow::Ok(key) }
    });

    let c = Arc::clone(ctx);
    rpc.register_request(methods::INSPECTOR_DISABLE, move |()| {
        c.inspector().disable();
        async { anyhow::Ok(()) }
    });

    let c = Arc::clone(ctx);
    rpc.register_request(methods::INSPECTOR_KEY, move |()| {
        let key = c.inspector().key();
        async move { anyhow::Ok(key) }
    });

    let c = Arc::clone(ctx);
    rpc.register_stream(methods::CRASH_RELAY, move |(), sink| crash::relay(Arc::clone(&c), sink));

    log::info!("[Worklet] Registered {} services", methods::TABLE.len());
}
