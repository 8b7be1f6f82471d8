//! Centralized error types for chainmail.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the chainmail library.
///
/// Public entry points (`AccountPool::load`, `ProxyChainBuilder::build`,
/// `SessionExecutor::run`) never return these: they log and convert to a
/// `bool`/`Option`. The enum is used internally and by the lower-level
/// capability traits.
#[derive(Error, Debug)]
pub enum ChainmailError {
    /// The account is missing fields required for the requested operation.
    #[error("Account '{account}' is incomplete: missing {missing}")]
    ConfigurationIncomplete { account: String, missing: String },

    /// Chain build, connect, or authentication failure.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The session token fired before or during the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// A single mailbox/queue item failed; the session continues.
    #[error("Item {index} failed: {reason}")]
    Item { index: usize, reason: String },

    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The message store rejected an operation.
    #[error("Message store error: {0}")]
    Store(String),

    /// The durable account store could not be read or written.
    #[error("Account store error for '{path}': {reason}")]
    AccountStore { path: PathBuf, reason: String },

    /// The protocol client reported an error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A message could not be parsed.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Anything else, including caught panics.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Convenience alias for `Result<T, ChainmailError>`.
pub type Result<T> = std::result::Result<T, ChainmailError>;

/// Coarse classification of a failure, reported in a session outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    ConfigurationIncomplete,
    Transport,
    PerItem,
    Unexpected,
}

impl ChainmailError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Map this error onto the session failure taxonomy.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ConfigurationIncomplete { .. } => FailureKind::ConfigurationIncomplete,
            Self::Transport(_) | Self::Protocol(_) => FailureKind::Transport,
            Self::Item { .. } | Self::InvalidMessage(_) => FailureKind::PerItem,
            Self::Cancelled
            | Self::Io { .. }
            | Self::Store(_)
            | Self::AccountStore { .. }
            | Self::Unexpected(_) => FailureKind::Unexpected,
        }
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare; prefer `ChainmailError::io`).
impl From<std::io::Error> for ChainmailError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let incomplete = ChainmailError::ConfigurationIncomplete {
            account: "a".into(),
            missing: "imap host".into(),
        };
        assert_eq!(incomplete.kind(), FailureKind::ConfigurationIncomplete);
        assert_eq!(
            ChainmailError::Transport("refused".into()).kind(),
            FailureKind::Transport
        );
        assert_eq!(
            ChainmailError::Item {
                index: 3,
                reason: "fetch".into()
            }
            .kind(),
            FailureKind::PerItem
        );
    }

    #[test]
    fn test_display_includes_path() {
        let err = ChainmailError::io(
            "/tmp/queue/1.eml",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/queue/1.eml"));
    }
}
