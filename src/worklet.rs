//! Worklet process entry point.
//!
//! The worklet talks to its host over stdin/stdout. It owns one backend, one
//! RPC multiplexer, and the diagnostic services, and it exits when the host
//! closes the transport.

use std::sync::Arc;

use anyhow::Result;

use crate::backend::{Backend, LocalBackend};
use crate::config::Config;
use crate::context::WorkletContext;
use crate::rpc::Rpc;
use crate::services::{self, crash};
use crate::startup::StartupArgs;
use crate::transport::Endpoint;

/// Bind a multiplexer to `endpoint` and register every service on it.
pub fn serve(endpoint: Endpoint, ctx: &Arc<WorkletContext>) -> Rpc {
    let rpc = Rpc::new(endpoint);
    services::register(&rpc, ctx);
    rpc
}

/// Context for a worklet started with `args`.
pub fn build_context(args: &StartupArgs, config: &Config, events: Arc<crash::ProcessEvents>) -> Arc<WorkletContext> {
    let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(
        &args.storage_path,
        config.backend_options(args),
    ));
    Arc::new(
        WorkletContext::new(backend)
            .with_process_events(events)
            .with_readiness_timeout(config.readiness_timeout()),
    )
}

/// Run the worklet on this process's stdio until the host disconnects.
pub async fn run(args: StartupArgs, config: &Config) -> Result<()> {
    let events = Arc::new(crash::ProcessEvents::new());
    crash::install_panic_hook(Arc::clone(&events));

    let ctx = build_context(&args, config, Arc::clone(&events));
    let (endpoint, io) = Endpoint::from_io(tokio::io::stdin(), tokio::io::stdout());
    let rpc = serve(endpoint, &ctx);

    log::info!(
        "[Worklet] Started (storage: {}, mode: {}, experimental: {})",
        args.storage_path.display(),
        args.mode,
        args.is_experimental()
    );

    // Open eagerly; handlers still await the same barrier.
    let backend = Arc::clone(ctx.backend());
    crash::spawn_reported(events, "backend.ready", async move { backend.ready().await });

    rpc.closed().await;
    io.abort();
    log::info!("[Worklet] Host closed the transport, exiting");
    Ok(())
}
