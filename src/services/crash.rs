//! Crash relay: forwards worklet failures to the host.
//!
//! Two process-wide hooks feed [`ProcessEvents`]:
//! - `uncaught_exception`: the installed panic hook, for any panic.
//! - `unhandled_rejection`: [`spawn_reported`], for background tasks that
//!   return `Err` with nobody awaiting them.
//!
//! A crash-relay subscription attaches one listener to each hook for its
//! lifetime and writes every report to the stream.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::context::WorkletContext;
use crate::events::Emitter;
use crate::rpc::{panic_message, StreamSink};

/// One relayed failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    /// Failure message.
    pub message: String,
    /// Stringified stack or error chain.
    pub stack: String,
}

impl CrashReport {
    /// Report for an error returned by a background task.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            stack: format!("{err:?}"),
        }
    }
}

/// Process-wide failure hooks.
#[derive(Debug)]
pub struct ProcessEvents {
    /// Panics anywhere in the process.
    pub uncaught_exception: Emitter<CrashReport>,
    /// Background tasks that failed unobserved.
    pub unhandled_rejection: Emitter<CrashReport>,
}

impl Default for ProcessEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessEvents {
    /// Hooks with no listeners.
    pub fn new() -> Self {
        Self {
            uncaught_exception: Emitter::new("uncaughtException"),
            unhandled_rejection: Emitter::new("unhandledRejection"),
        }
    }

    /// Listeners across both hooks.
    pub fn listener_count(&self) -> usize {
        self.uncaught_exception.listener_count() + self.unhandled_rejection.listener_count()
    }
}

/// Chain a panic hook that raises `uncaught_exception` on `events`.
///
/// Logging is left to the previous hook, which still runs afterwards.
pub fn install_panic_hook(events: Arc<ProcessEvents>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let message = panic_message(panic_info.payload());
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let backtrace = std::backtrace::Backtrace::capture();

        let report = CrashReport {
            stack: format!("{message}\n    at {location}\n{backtrace}"),
            message,
        };
        events.uncaught_exception.emit(&report);

        previous(panic_info);
    }));
}

/// Spawn a background task whose failure is relayed instead of lost.
pub fn spawn_reported<F>(events: Arc<ProcessEvents>, name: &'static str, task: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = task.await {
            log::error!("[Worklet] Task {name} failed: {e:#}");
            events
                .unhandled_rejection
                .emit(&CrashReport::from_error(&e.context(format!("task {name}"))));
        }
    })
}

fn forward_to(sink: StreamSink<CrashReport>) -> impl Fn(&CrashReport) + Send + Sync + 'static {
    move |report: &CrashReport| {
        // Runs inside a global hook: never propagate.
        if !sink.write(report) {
            log::debug!("[Crash] Dropped report on closed stream {}", sink.id());
        }
    }
}

/// Serve one crash-relay subscription.
pub(crate) async fn relay(ctx: Arc<WorkletContext>, sink: StreamSink<CrashReport>) -> Result<()> {
    if sink.is_destroying() {
        return Ok(());
    }

    let events = Arc::clone(ctx.process_events());
    let uncaught = events.uncaught_exception.on(forward_to(sink.clone()));
    let rejected = events.unhandled_rejection.on(forward_to(sink.clone()));
    log::debug!("[Crash] Relay attached on stream {}", sink.id());

    sink.on_close(move || {
        events.uncaught_exception.off(uncaught);
        events.unhandled_rejection.off(rejected);
        log::debug!("[Crash] Relay detached");
    });
    Ok(())
}
