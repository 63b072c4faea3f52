//! # Error Handling
//!
//! A single [`Error`] enum covers every failure mode in the crate. Using one
//! enum keeps executor signatures simple and lets safe dispatch decide the
//! fate of a failure by variant rather than by type.
//!
//! ## Error Classes
//!
//! Failures fall into three classes with very different consequences:
//!
//! | Class | Variants | Consequence |
//! |----------|----------|------------------|
//! | Recoverable | everything except `Protocol` | converted to an error `Response`, worker continues |
//! | Protocol | `Protocol` | fatal to the observing party (coordinator or worker terminates) |
//! | Commit | surfaced from `Database::commit_task` | staged changes discarded, logged |
//!
//! The protocol class exists because a malformed frame sequence signals a bug
//! in the counterpart process, not a user error. Safe dispatch must never
//! swallow it; see [`crate::executors::dispatch_command_safe`].

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in grimdb operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Recoverable Errors (converted to error Responses by safe dispatch)
    // =========================================================================

    /// The request string failed to parse.
    ///
    /// Covers both syntax errors (unterminated string, missing semicolon) and
    /// semantic ones (unknown command word, bad index type name).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A command referenced a dataset id that is not in the snapshot.
    #[error("unknown dataset '{0}'")]
    UnknownDataset(String),

    /// A command referenced an iterator id that is not in the snapshot.
    #[error("unknown iterator '{0}'")]
    UnknownIterator(String),

    /// `config set` named a key outside the registry.
    ///
    /// The message is part of the wire contract: clients match on it.
    #[error("Invalid key name specified")]
    InvalidConfigKey,

    /// `config set` supplied a value outside the key's allowed range.
    ///
    /// The message is part of the wire contract: clients match on it.
    #[error("Value specified is out of range")]
    ConfigValueOutOfRange,

    /// The coordinator refused a dataset or iterator lock.
    ///
    /// Another active task holds at least one of the requested names. The
    /// client may retry once that task commits.
    #[error("lock denied: {0} is locked by another task")]
    LockDenied(String),

    /// An I/O failure during indexing, iterator reads, or name allocation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk iterator metadata failed to decode.
    #[error("corrupted iterator metadata: {0}")]
    CorruptedMeta(String),

    /// The service has shut down and can take no more requests.
    #[error("service is shut down")]
    Shutdown,

    // =========================================================================
    // Fatal Errors (terminate the observing party)
    // =========================================================================

    /// Frame-level protocol violation: a non-empty frame where an empty
    /// separator was expected, a truncated message, or a malformed action
    /// code. Signals a bug in the counterpart, never a user error.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether this error belongs to the fatal protocol class.
    ///
    /// Safe dispatch re-raises these instead of converting them to an error
    /// `Response`.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages appear on the wire inside error Responses, so their
    /// exact text matters.
    #[test]
    fn test_error_display() {
        let err = Error::BadRequest("expected ';'".to_string());
        assert_eq!(err.to_string(), "bad request: expected ';'");

        let err = Error::UnknownDataset("set_123".to_string());
        assert_eq!(err.to_string(), "unknown dataset 'set_123'");

        let err = Error::ConfigValueOutOfRange;
        assert_eq!(err.to_string(), "Value specified is out of range");

        let err = Error::InvalidConfigKey;
        assert_eq!(err.to_string(), "Invalid key name specified");
    }

    #[test]
    fn test_protocol_class() {
        assert!(Error::Protocol("non-empty separator".to_string()).is_protocol());
        assert!(!Error::BadRequest("x".to_string()).is_protocol());
        assert!(!Error::LockDenied("set_1".to_string()).is_protocol());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("gone"));
    }
}
