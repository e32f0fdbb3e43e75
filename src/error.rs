//! Error types for srccache.
//!
//! Uses thiserror for derive macros. The taxonomy follows the propagation
//! policy of the locking core: stale, corrupt, and foreign-machine lock
//! conditions are resolved internally by [`crate::lock::UpdateLock`] and never
//! reach callers; only genuine contention timeouts, ownership violations, and
//! unrecoverable I/O failures propagate upward.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for srccache operations.
#[derive(Error, Debug)]
pub enum SrcCacheError {
    /// The lock could not be acquired within the allotted time because a live
    /// peer holds it, or the in-process serialization guard stayed busy.
    #[error(
        "timed out after {waited_ms} ms acquiring '{kind}' lock for remote '{locator}'; \
         the current holder was not disturbed"
    )]
    Timeout {
        locator: String,
        kind: String,
        waited_ms: u128,
    },

    /// Attempted to release a lock owned by a different process identity.
    ///
    /// This indicates a coordination bug (e.g., a double-unlock race) and is
    /// reported loudly rather than silently ignored.
    #[error(
        "refusing to release '{kind}' lock for remote '{locator}': \
         owned by pid {owner_pid} on machine_id '{owner_machine_id}', not this process"
    )]
    NotOwned {
        locator: String,
        kind: String,
        owner_pid: u32,
        owner_machine_id: String,
    },

    /// A lock file read during release had unparsable content.
    ///
    /// During acquisition corrupt locks are reclaimed internally; seeing one
    /// while we believe we hold the lock means another actor rewrote it.
    #[error("corrupt lock file '{path}': {reason}")]
    CorruptLock { path: PathBuf, reason: String },

    /// Remote configuration entry was rejected.
    #[error("invalid remote configuration: {0}")]
    Config(String),

    /// The source-control backend failed to initialize or fetch a remote.
    #[error("backend operation failed for remote '{locator}': {reason}")]
    Backend { locator: String, reason: String },

    /// Unrecoverable filesystem failure creating or removing a lock file.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SrcCacheError {
    /// Wrap an I/O error with a human-readable context string.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SrcCacheError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Result type alias for srccache operations.
pub type Result<T> = std::result::Result<T, SrcCacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_error_names_remote_and_kind() {
        let err = SrcCacheError::Timeout {
            locator: "file://repo1.git".to_string(),
            kind: "update".to_string(),
            waited_ms: 5000,
        };
        let msg = err.to_string();
        assert!(msg.contains("file://repo1.git"));
        assert!(msg.contains("update"));
        assert!(msg.contains("5000 ms"));
    }

    #[test]
    fn not_owned_error_names_recorded_owner() {
        let err = SrcCacheError::NotOwned {
            locator: "file://repo1.git".to_string(),
            kind: "update".to_string(),
            owner_pid: 4321,
            owner_machine_id: "abcdef0123456789".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("4321"));
        assert!(msg.contains("abcdef0123456789"));
        assert!(msg.contains("not this process"));
    }

    #[test]
    fn io_helper_preserves_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = SrcCacheError::io("creating lock file", inner);
        assert!(err.to_string().contains("creating lock file"));
        assert!(err.to_string().contains("denied"));
    }
}
