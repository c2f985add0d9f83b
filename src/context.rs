//! Per-worklet state handed to every registered handler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::backend::{Backend, ReadinessTimeout};
use crate::services::crash::ProcessEvents;
use crate::services::inspector::Inspector;

/// Default bound on the backend readiness await.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a service handler may touch.
///
/// Handlers receive an `Arc<WorkletContext>` instead of reaching for globals,
/// so several independent worklets can live in one process (tests do this).
pub struct WorkletContext {
    backend: Arc<dyn Backend>,
    inspector: Inspector,
    process_events: Arc<ProcessEvents>,
    readiness_timeout: Duration,
}

impl std::fmt::Debug for WorkletContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkletContext")
            .field("opened", &self.backend.is_opened())
            .field("experimental", &self.backend.is_experimental())
            .field("inspector", &self.inspector)
            .field("readiness_timeout", &self.readiness_timeout)
            .finish_non_exhaustive()
    }
}

impl WorkletContext {
    /// Context over `backend` with fresh inspector and process-event state.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            inspector: Inspector::new(),
            process_events: Arc::new(ProcessEvents::new()),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
        }
    }

    /// Use a shared process-event hub (the one the panic hook feeds).
    #[must_use]
    pub fn with_process_events(mut self, events: Arc<ProcessEvents>) -> Self {
        self.process_events = events;
        self
    }

    /// Bound the readiness await.
    #[must_use]
    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    /// Backend handle.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Inspector state for this worklet.
    pub fn inspector(&self) -> &Inspector {
        &self.inspector
    }

    /// Process-wide crash hooks.
    pub fn process_events(&self) -> &Arc<ProcessEvents> {
        &self.process_events
    }

    /// Configured readiness bound.
    pub fn readiness_timeout(&self) -> Duration {
        self.readiness_timeout
    }

    /// Wait for the backend to open.
    ///
    /// A synchronous check once opened; otherwise awaits the backend's
    /// one-time barrier, failing with [`ReadinessTimeout`] past the bound.
    pub async fn ensure_ready(&self) -> Result<()> {
        if self.backend.is_opened() {
            return Ok(());
        }

        log::debug!("[Worklet] Waiting for backend readiness");
        match tokio::time::timeout(self.readiness_timeout, self.backend.ready()).await {
            Ok(result) => result,
            Err(_elapsed) => {
                log::warn!(
                    "[Worklet] Backend not ready after {:?}",
                    self.readiness_timeout
                );
                Err(ReadinessTimeout {
                    waited: self.readiness_timeout,
                }
                .into())
            }
        }
    }
}
