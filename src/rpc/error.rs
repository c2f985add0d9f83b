//! RPC error types.

use std::fmt;

/// Error raised by a remote handler, relayed verbatim.
///
/// `message` and `stack` are produced on the side that ran the handler and are
/// never regenerated locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Error message.
    pub message: String,
    /// Stringified error chain as rendered by the remote side.
    pub stack: String,
}

impl RemoteError {
    /// Build a relayable error from a handler failure.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            stack: format!("{err:?}"),
        }
    }

    /// Build a relayable error from a caught handler panic.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        Self::message(format!("Handler panicked: {}", panic_message(payload)))
    }

    /// Build a relayable error from a plain message.
    pub fn message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            stack: message.clone(),
            message,
        }
    }
}

/// Text of a panic payload (`panic!` with a literal or a formatted message).
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string())
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Errors surfaced to callers of [`super::Rpc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The transport is torn down or the peer process is gone.
    TransportClosed,
    /// The remote handler failed.
    RemoteHandler(RemoteError),
    /// The caller-imposed deadline elapsed before a response arrived.
    Timeout,
    /// A payload did not match the method's codec.
    Codec(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportClosed => write!(f, "Transport closed"),
            Self::RemoteHandler(err) => write!(f, "Remote handler error: {}", err.message),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Codec(msg) => write!(f, "Codec error: {msg}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        Self::RemoteHandler(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_from_anyhow_keeps_chain_in_stack() {
        let err = std::fs::read("/definitely/not/here")
            .context("loading identity")
            .unwrap_err();
        let remote = RemoteError::from_anyhow(&err);
        assert_eq!(remote.message, "loading identity");
        assert!(remote.stack.contains("loading identity"));
        assert!(remote.stack.len() > remote.message.len());
    }

    #[test]
    fn test_from_panic_keeps_payload_text() {
        let literal = std::panic::catch_unwind(|| panic!("index corrupted")).unwrap_err();
        assert_eq!(
            RemoteError::from_panic(&*literal).message,
            "Handler panicked: index corrupted"
        );

        let room = 7;
        let formatted = std::panic::catch_unwind(|| panic!("room {room} missing")).unwrap_err();
        assert_eq!(
            RemoteError::from_panic(&*formatted).message,
            "Handler panicked: room 7 missing"
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(RpcError::TransportClosed.to_string(), "Transport closed");
        let remote = RpcError::from(RemoteError::message("boom"));
        assert_eq!(remote.to_string(), "Remote handler error: boom");
    }
}
