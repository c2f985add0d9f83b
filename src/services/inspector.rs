//! Remote debugging inspector control.
//!
//! At most one inspector session per worklet. `enable` is idempotent and
//! returns the live session's key; `disable` tears it down and is a no-op
//! when nothing is running.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use data_encoding::HEXLOWER;

use crate::rpc::lock;

/// Key length in bytes before hex encoding.
const KEY_LEN: usize = 32;

struct Session {
    key: String,
    started: Instant,
}

/// Inspector state for one worklet.
pub struct Inspector {
    session: Mutex<Option<Session>>,
    sessions_started: AtomicUsize,
}

impl Default for Inspector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Inspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inspector")
            .field("enabled", &self.is_enabled())
            .field("sessions_started", &self.sessions_started())
            .finish()
    }
}

impl Inspector {
    /// Disabled inspector.
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
            sessions_started: AtomicUsize::new(0),
        }
    }

    /// Start a session if none is running; return the session key.
    pub fn enable(&self) -> String {
        let mut session = lock(&self.session);
        if let Some(existing) = session.as_ref() {
            return existing.key.clone();
        }

        let bytes: [u8; KEY_LEN] = rand::random();
        let key = HEXLOWER.encode(&bytes);
        *session = Some(Session {
            key: key.clone(),
            started: Instant::now(),
        });
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        log::info!("[Inspector] Enabled");
        key
    }

    /// Stop the running session. Returns false if none was running.
    pub fn disable(&self) -> bool {
        match lock(&self.session).take() {
            Some(session) => {
                log::info!(
                    "[Inspector] Disabled after {:?}",
                    session.started.elapsed()
                );
                true
            }
            None => false,
        }
    }

    /// Key of the running session.
    pub fn key(&self) -> Option<String> {
        lock(&self.session).as_ref().map(|s| s.key.clone())
    }

    /// Whether a session is running.
    pub fn is_enabled(&self) -> bool {
        lock(&self.session).is_some()
    }

    /// Sessions created over this inspector's lifetime.
    pub fn sessions_started(&self) -> usize {
        self.sessions_started.load(Ordering::Relaxed)
    }
}
