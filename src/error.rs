//! Error types for the migration engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{StreamId, Token, TokenGroup};

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the migration engine.
///
/// Errors are `Clone` because a single terminal error is both recorded against
/// the aborted group and delivered to the orchestrator's pending acknowledgement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Operation invoked in the wrong lifecycle state.
    #[error("not ready: {0}")]
    NotReady(String),

    /// A stream already exists for the given key.
    #[error("stream already exists: {0}")]
    Duplicate(StreamId),

    /// The source node cannot serve the requested tokens.
    #[error("source node {node} not ready for token {token}")]
    SourceNotReady { node: u64, token: Token },

    /// The source node could not be reached.
    #[error("source node {node} unreachable: {reason}")]
    SourceUnreachable { node: u64, reason: String },

    /// Stale target version or unknown stream.
    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    /// No progress within the configured window.
    #[error("operation timed out")]
    Timeout,

    /// Migration was aborted.
    #[error("migration aborted: {0}")]
    Aborted(String),

    /// Caller supplied an argument that does not apply.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Retries for a token are exhausted and its group was torn down.
    #[error("retries exhausted for token {token} in group {group}")]
    RetriesExhausted { group: TokenGroup, token: Token },

    /// Object store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Wire (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Coarse classification used on the wire and for labeled counters.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotReady(_) => ErrorKind::NotReady,
            Error::Duplicate(_) => ErrorKind::Duplicate,
            Error::SourceNotReady { .. } => ErrorKind::SourceNotReady,
            Error::SourceUnreachable { .. } => ErrorKind::SourceUnreachable,
            Error::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Error::Timeout => ErrorKind::Timeout,
            Error::Aborted(_) | Error::RetriesExhausted { .. } => ErrorKind::Aborted,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Storage(_) | Error::Serialization(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether a token failing with this error may be retried against another source.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SourceNotReady
                | ErrorKind::SourceUnreachable
                | ErrorKind::Timeout
                | ErrorKind::VersionMismatch
                | ErrorKind::NotReady
        )
    }
}

/// Wire-level error classification carried in negative acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotReady,
    Duplicate,
    SourceNotReady,
    SourceUnreachable,
    VersionMismatch,
    Timeout,
    Aborted,
    InvalidArgument,
    Internal,
}

impl ErrorKind {
    /// Stable label for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotReady => "not_ready",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::SourceNotReady => "source_not_ready",
            ErrorKind::SourceUnreachable => "source_unreachable",
            ErrorKind::VersionMismatch => "version_mismatch",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Aborted => "aborted",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Internal => "internal",
        }
    }

    /// Rebuild an error for a token that a remote source refused.
    pub fn into_token_error(self, node: u64, token: Token) -> Error {
        match self {
            ErrorKind::SourceUnreachable => Error::SourceUnreachable {
                node,
                reason: "remote reported unreachable".to_string(),
            },
            ErrorKind::Timeout => Error::Timeout,
            ErrorKind::VersionMismatch => Error::VersionMismatch {
                expected: 0,
                actual: 0,
            },
            _ => Error::SourceNotReady { node, token },
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
