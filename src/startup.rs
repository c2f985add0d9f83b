//! Worklet startup arguments.
//!
//! The host passes `[storage_path, mode]` positionally. `mode ==
//! "experimental"` turns on the backend's experimental flag; anything else,
//! including the host's default `"keet"`, leaves it off.

use std::path::PathBuf;

use anyhow::{bail, Result};

/// Mode that enables the experimental backend.
pub const EXPERIMENTAL_MODE: &str = "experimental";

/// Mode the host passes by default.
pub const DEFAULT_MODE: &str = "keet";

/// Arguments a worklet is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupArgs {
    /// Backend storage directory, without any `file://` prefix.
    pub storage_path: PathBuf,
    /// Mode string.
    pub mode: String,
}

impl StartupArgs {
    /// Build from a storage location (path or `file://` URL) and mode.
    pub fn new(storage: &str, mode: impl Into<String>) -> Self {
        Self {
            storage_path: normalize_storage_path(storage),
            mode: mode.into(),
        }
    }

    /// Parse positional arguments. The mode defaults to [`DEFAULT_MODE`].
    pub fn from_argv<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut argv = argv.into_iter();
        let Some(storage) = argv.next() else {
            bail!("Missing storage path argument");
        };
        let mode = argv
            .next()
            .map_or_else(|| DEFAULT_MODE.to_string(), |m| m.as_ref().to_string());
        Ok(Self::new(storage.as_ref(), mode))
    }

    /// Positional form passed to the worklet process.
    pub fn to_argv(&self) -> Vec<String> {
        vec![
            self.storage_path.to_string_lossy().into_owned(),
            self.mode.clone(),
        ]
    }

    /// Whether the backend runs experimental.
    pub fn is_experimental(&self) -> bool {
        self.mode == EXPERIMENTAL_MODE
    }
}

/// Strip a `file://` scheme from a storage location.
pub fn normalize_storage_path(storage: &str) -> PathBuf {
    PathBuf::from(storage.strip_prefix("file://").unwrap_or(storage))
}
