//! Error types for relay, capture and replay sessions.
//!
//! All errors implement the `std::error::Error` trait and carry structured context
//! for logging. The taxonomy separates errors that end a session from errors that
//! the caller may retry.
//!
//! ## Error Categories
//!
//! - **Container Errors**: bad header magic, unsupported version, truncated or corrupt frames
//! - **Negotiation Errors**: resource pack size mismatches, unknown references, out-of-order chunks
//! - **Protocol Errors**: login-sequence invariant violations and undecodable messages
//! - **Connection Errors**: peer disconnects, closed connections, timeouts, socket failures
//!
//! ## Fatal vs Retryable
//!
//! ```rust
//! use relaytap::RelayError;
//!
//! let error = RelayError::UnsupportedVersion { expected: 3, found: 99 };
//! assert!(error.is_fatal());
//! assert!(!error.is_retryable());
//! ```
//!
//! `RelayError` is `Clone` so a single failure can be reported to every task waiting
//! on a connection's spawn signal. I/O sources are shared behind an `Arc` for this.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Main error type for relay operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RelayError {
    #[error("Malformed capture container: {details}")]
    MalformedContainer { details: String },

    #[error("Unsupported capture version: expected {expected}, found {found}")]
    UnsupportedVersion { expected: i32, found: i32 },

    #[error("Truncated frame at offset {offset}: {details}")]
    TruncatedFrame { offset: u64, details: String },

    #[error("Corrupt frame at offset {offset}: {details}")]
    CorruptFrame { offset: u64, details: String },

    #[error("Resource pack {uuid} size mismatch: declared {declared} bytes, received {received}")]
    SizeMismatch { uuid: String, declared: u64, received: u64 },

    #[error("Resource pack stack references unknown pack {uuid}")]
    UnknownPackReference { uuid: String },

    #[error("Resource pack {uuid} chunk out of order: expected {expected}, got {got}")]
    UnexpectedChunk { uuid: String, expected: u32, got: u32 },

    #[error("Resource pack {uuid} not found in cache")]
    PackNotFound { uuid: String },

    #[error("Protocol invariant violated: {details}")]
    ProtocolInvariantViolation { details: String },

    #[error("Failed to decode {context}: {details}")]
    Decode { context: String, details: String },

    #[error("Disconnected by peer: {message}")]
    Disconnected { message: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Failed to connect to {address}: {reason}")]
    Connection {
        address: String,
        reason: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    #[error("Capture file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("I/O error during {context}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Configuration error: {reason}")]
    Config { reason: String },
}

impl RelayError {
    /// Returns whether this error ends the session it occurred in.
    ///
    /// Structural errors are never retried; the session logs them once and terminates.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::MalformedContainer { .. }
                | RelayError::UnsupportedVersion { .. }
                | RelayError::TruncatedFrame { .. }
                | RelayError::CorruptFrame { .. }
                | RelayError::SizeMismatch { .. }
                | RelayError::UnknownPackReference { .. }
                | RelayError::UnexpectedChunk { .. }
                | RelayError::PackNotFound { .. }
                | RelayError::ProtocolInvariantViolation { .. }
        )
    }

    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Connection { .. } => true,
            RelayError::Timeout { .. } => true,
            RelayError::Io { .. } => true,
            RelayError::MalformedContainer { .. }
            | RelayError::UnsupportedVersion { .. }
            | RelayError::TruncatedFrame { .. }
            | RelayError::CorruptFrame { .. }
            | RelayError::SizeMismatch { .. }
            | RelayError::UnknownPackReference { .. }
            | RelayError::UnexpectedChunk { .. }
            | RelayError::PackNotFound { .. }
            | RelayError::ProtocolInvariantViolation { .. }
            | RelayError::Decode { .. }
            | RelayError::Disconnected { .. }
            | RelayError::ConnectionClosed
            | RelayError::File { .. }
            | RelayError::Config { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            RelayError::MalformedContainer { .. } | RelayError::UnsupportedVersion { .. } => vec![
                "Check the file is a capture written by this tool",
                "Re-record the session with the current version",
            ],
            RelayError::TruncatedFrame { .. } | RelayError::CorruptFrame { .. } => vec![
                "The capture tail is damaged; frames before it are still usable",
                "Check the disk did not fill up while recording",
            ],
            RelayError::SizeMismatch { .. }
            | RelayError::UnknownPackReference { .. }
            | RelayError::UnexpectedChunk { .. }
            | RelayError::PackNotFound { .. } => vec![
                "Clear the on-disk pack cache and reconnect",
                "Verify the server advertises consistent pack metadata",
            ],
            RelayError::ProtocolInvariantViolation { .. } | RelayError::Decode { .. } => vec![
                "Verify client, relay and server speak the same protocol version",
                "Capture the session again and inspect the login sequence",
            ],
            RelayError::Disconnected { .. } | RelayError::ConnectionClosed => {
                vec!["Reconnect to start a new session"]
            }
            RelayError::Timeout { .. } => vec![
                "Increase spawn_timeout_secs in the configuration",
                "Check the upstream server is responding",
            ],
            RelayError::Connection { .. } => vec![
                "Check the server address and port",
                "Verify the server is reachable from this machine",
            ],
            RelayError::File { .. } | RelayError::Io { .. } => vec![
                "Check file exists and is readable",
                "Check file permissions and free disk space",
            ],
            RelayError::Config { .. } => vec!["Fix the reported configuration field"],
        }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        RelayError::File { path, source: Arc::new(source) }
    }

    /// Helper constructor for I/O errors with an operation context.
    pub fn io_error(context: impl Into<String>, source: std::io::Error) -> Self {
        RelayError::Io { context: context.into(), source: Arc::new(source) }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(address: impl Into<String>, source: std::io::Error) -> Self {
        RelayError::Connection {
            address: address.into(),
            reason: source.to_string(),
            source: Some(Arc::new(source)),
        }
    }

    /// Helper constructor for login-sequence invariant violations.
    pub fn invariant(details: impl Into<String>) -> Self {
        RelayError::ProtocolInvariantViolation { details: details.into() }
    }

    /// Helper constructor for message decoding errors.
    pub fn decode(context: impl Into<String>, details: impl Into<String>) -> Self {
        RelayError::Decode { context: context.into(), details: details.into() }
    }

    /// Helper constructor for container header errors.
    pub fn malformed(details: impl Into<String>) -> Self {
        RelayError::MalformedContainer { details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        RelayError::Config { reason: reason.into() }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io { context: "I/O operation".to_string(), source: Arc::new(err) }
    }
}
