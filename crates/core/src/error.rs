//! Error types for the Ontos core
//!
//! This module defines the unified error type returned by all Ontos APIs.
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! ## Error Categories
//!
//! - **Conflict**: a live lock blocks the operation (`LockConflict`)
//! - **State**: a branch state transition not in the transition table
//!   (`InvalidTransition`)
//! - **Not Found**: entity doesn't exist (`NotFound`)
//! - **Transient**: DocStore/Bus timeout or transient I/O; retryable
//!   (`TransientIo`, `Timeout`)
//! - **Integrity**: audit hash mismatch; surfaced, never auto-remediated
//!   (`Integrity`)
//! - **Validation**: invalid input or malformed resolution envelope
//!   (`InvalidInput`, `InvalidResolution`)
//! - **Config**: rejected at startup (`Config`)
//! - **Internal**: unexpected internal state (`Internal`)
//!
//! Sync paths (lock acquire, merge) return these to callers without retry.
//! Async paths (dispatcher, sweepers) retry retryable errors with backoff
//! and escalate the rest via audit records.

use crate::types::LockId;
use std::io;
use thiserror::Error;

/// Result type alias for Ontos operations
pub type OntosResult<T> = std::result::Result<T, OntosError>;

/// Unified error type for all Ontos operations
#[derive(Debug, Error)]
pub enum OntosError {
    /// A live lock conflicts with the requested acquisition.
    ///
    /// Carries the id of the conflicting lock so callers can report or
    /// wait on it. Never retried by the core.
    #[error("lock conflict on branch '{branch}': conflicts with lock {conflicting}")]
    LockConflict {
        /// Branch the acquisition targeted
        branch: String,
        /// Id of the existing lock that blocked it
        conflicting: LockId,
    },

    /// A branch state transition that is not in the transition table.
    ///
    /// The call fails without side effects.
    #[error("invalid state transition on branch '{branch}': {from} -> {to}")]
    InvalidTransition {
        /// Branch the transition targeted
        branch: String,
        /// State the branch was in
        from: String,
        /// State that was requested
        to: String,
    },

    /// Entity not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind (lock, branch, commit, document, ...)
        kind: String,
        /// Identifier that missed
        id: String,
    },

    /// Insert hit an existing document with the same id
    #[error("document already exists in '{collection}': {id}")]
    AlreadyExists {
        /// Collection the insert targeted
        collection: String,
        /// Conflicting document id
        id: String,
    },

    /// Transient I/O failure from the DocStore or bus; retryable
    #[error("transient I/O error: {message}")]
    TransientIo {
        /// What failed
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An external call exceeded its deadline; treated as a failure and
    /// follows retry rules
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        /// Operation that timed out (docstore write, bus publish, ...)
        operation: String,
        /// Deadline that elapsed
        after_ms: u64,
    },

    /// Audit integrity verification failed
    #[error("integrity violation: {message} ({} corrupted)", ids.len())]
    Integrity {
        /// Description of the violation
        message: String,
        /// Ids of the offending records
        ids: Vec<String>,
    },

    /// A manual merge resolution envelope is malformed
    #[error("invalid resolution: {message}")]
    InvalidResolution {
        /// What is wrong with the envelope
        message: String,
    },

    /// Configuration rejected at startup
    #[error("configuration error: {message}")]
    Config {
        /// What is wrong with the configuration
        message: String,
    },

    /// Invalid input parameters; fix the input, don't retry
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the problem
        message: String,
    },

    /// Serialization or deserialization failure
    #[error("serialization error: {message}")]
    Serialization {
        /// What went wrong
        message: String,
    },

    /// Unexpected internal error; indicates a bug
    #[error("internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl OntosError {
    /// Create a LockConflict error
    pub fn lock_conflict(branch: impl Into<String>, conflicting: LockId) -> Self {
        OntosError::LockConflict {
            branch: branch.into(),
            conflicting,
        }
    }

    /// Create an InvalidTransition error
    pub fn invalid_transition(
        branch: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        OntosError::InvalidTransition {
            branch: branch.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a NotFound error
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        OntosError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create an AlreadyExists error
    pub fn already_exists(collection: impl Into<String>, id: impl Into<String>) -> Self {
        OntosError::AlreadyExists {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Create a TransientIo error
    pub fn transient(message: impl Into<String>) -> Self {
        OntosError::TransientIo {
            message: message.into(),
            source: None,
        }
    }

    /// Create a TransientIo error with an underlying source
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        OntosError::TransientIo {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a Timeout error
    pub fn timeout(operation: impl Into<String>, after_ms: u64) -> Self {
        OntosError::Timeout {
            operation: operation.into(),
            after_ms,
        }
    }

    /// Create an Integrity error
    pub fn integrity(message: impl Into<String>, ids: Vec<String>) -> Self {
        OntosError::Integrity {
            message: message.into(),
            ids,
        }
    }

    /// Create an InvalidResolution error
    pub fn invalid_resolution(message: impl Into<String>) -> Self {
        OntosError::InvalidResolution {
            message: message.into(),
        }
    }

    /// Create a Config error
    pub fn config(message: impl Into<String>) -> Self {
        OntosError::Config {
            message: message.into(),
        }
    }

    /// Create an InvalidInput error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        OntosError::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        OntosError::Serialization {
            message: message.into(),
        }
    }

    /// Create an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        OntosError::Internal {
            message: message.into(),
        }
    }

    /// Check if this is a lock conflict
    ///
    /// Lock conflicts are surfaced to callers and never retried by the
    /// core; the caller decides whether to wait or abandon.
    pub fn is_conflict(&self) -> bool {
        matches!(self, OntosError::LockConflict { .. })
    }

    /// Check if this error is retryable
    ///
    /// Retryable errors may succeed on retry with backoff:
    /// - `TransientIo`: DocStore/Bus hiccup
    /// - `Timeout`: deadline exceeded
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OntosError::TransientIo { .. } | OntosError::Timeout { .. }
        )
    }

    /// Check if this is a "not found" error
    ///
    /// Not-found is non-fatal on lock release (idempotent) and surfaced
    /// on get.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OntosError::NotFound { .. })
    }

    /// Check if this is a validation error (bad input, don't retry)
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            OntosError::InvalidInput { .. }
                | OntosError::InvalidResolution { .. }
                | OntosError::InvalidTransition { .. }
        )
    }

    /// Check if this is a serious/unrecoverable error
    ///
    /// Serious errors indicate corruption or bugs and should be logged and
    /// investigated, never silently swallowed.
    pub fn is_serious(&self) -> bool {
        matches!(
            self,
            OntosError::Integrity { .. } | OntosError::Internal { .. }
        )
    }
}

impl From<io::Error> for OntosError {
    fn from(e: io::Error) -> Self {
        OntosError::TransientIo {
            message: format!("IO error: {}", e),
            source: Some(Box::new(e)),
        }
    }
}

impl From<serde_json::Error> for OntosError {
    fn from(e: serde_json::Error) -> Self {
        OntosError::Serialization {
            message: format!("JSON error: {}", e),
        }
    }
}

impl From<toml::de::Error> for OntosError {
    fn from(e: toml::de::Error) -> Self {
        OntosError::Config {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_conflict_display_and_class() {
        let id = LockId::new();
        let e = OntosError::lock_conflict("feature-x", id);
        let msg = e.to_string();

        assert!(msg.contains("lock conflict"));
        assert!(msg.contains("feature-x"));
        assert!(e.is_conflict());
        assert!(!e.is_retryable());
        assert!(!e.is_serious());
    }

    #[test]
    fn test_invalid_transition_display() {
        let e = OntosError::invalid_transition("main", "ARCHIVED", "ACTIVE");
        let msg = e.to_string();

        assert!(msg.contains("invalid state transition"));
        assert!(msg.contains("ARCHIVED"));
        assert!(msg.contains("ACTIVE"));
        assert!(e.is_validation());
    }

    #[test]
    fn test_not_found() {
        let e = OntosError::not_found("lock", "abc-123");
        assert!(e.is_not_found());
        assert!(e.to_string().contains("lock not found"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(OntosError::transient("connection reset").is_retryable());
        assert!(OntosError::timeout("bus publish", 10_000).is_retryable());

        assert!(!OntosError::invalid_input("empty branch name").is_retryable());
        assert!(!OntosError::internal("bug").is_retryable());
        assert!(!OntosError::lock_conflict("b", LockId::new()).is_retryable());
    }

    #[test]
    fn test_serious_classification() {
        let e = OntosError::integrity("hash mismatch", vec!["e1".into(), "e2".into()]);
        assert!(e.is_serious());
        assert!(e.to_string().contains("2 corrupted"));

        assert!(OntosError::internal("unexpected state").is_serious());
        assert!(!OntosError::transient("blip").is_serious());
    }

    #[test]
    fn test_invalid_resolution() {
        let e = OntosError::invalid_resolution("missing decisions");
        assert!(e.is_validation());
        assert!(e.to_string().contains("invalid resolution"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "socket timeout");
        let e: OntosError = io_err.into();
        assert!(e.is_retryable());
        assert!(e.to_string().contains("IO error"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let bad: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let e: OntosError = bad.unwrap_err().into();
        assert!(matches!(e, OntosError::Serialization { .. }));
    }

    #[test]
    fn test_timeout_display() {
        let e = OntosError::timeout("docstore write", 30_000);
        let msg = e.to_string();
        assert!(msg.contains("docstore write"));
        assert!(msg.contains("30000"));
    }
}
