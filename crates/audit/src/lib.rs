//! Audit store with integrity chain
//!
//! Durable, append-only record of actions affecting schemas, locks,
//! branches, and security posture:
//! - Per-event SHA-256 hashes over a canonical subset, plus per-batch
//!   hashes in an integrity log
//! - Action-specific retention with archival (soft delete) and a
//!   retention log
//! - Filtered, paginated queries and aggregate statistics
//! - Tamper detection over tracked policy files, forwarded to a SIEM
//!   collector when one is configured

#![warn(missing_docs)]
#![warn(clippy::all)]

mod event;
mod retention;
mod store;
mod tamper;

pub use event::{AuditError, AuditEvent, AuditTarget};
pub use retention::RetentionPolicy;
pub use store::{
    AuditFilter, AuditPage, AuditRecord, AuditStatistics, AuditStore, IntegrityReport,
    AUDIT_EVENTS, AUDIT_INTEGRITY, AUDIT_RETENTION_LOG,
};
pub use tamper::{
    PolicyIntegrityChecker, PolicySnapshot, TamperSeverity, TamperingEvent, TamperingKind,
    POLICY_SNAPSHOTS,
};
