//! Core types for the Ontos metadata service
//!
//! This crate defines the pieces shared by every subsystem:
//! - Unified error model (`OntosError` / `OntosResult`)
//! - Opaque identifiers and common records (`LockId`, `EventId`, `Actor`, ...)
//! - Canonical JSON encoding and SHA-256 hashing (one encoding pass for
//!   idempotency keys, audit hashes, and policy snapshots)
//! - Configuration with fail-fast validation
//! - External interface traits (`DocStore`, `MessageBus`, `SiemSink`)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod canon;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use canon::{canonical_json, hash_value, sha256_hex};
pub use config::{AuditConfig, EngineConfig, LockConfig, MergeSettings, OntosConfig, OutboxConfig};
pub use error::{OntosError, OntosResult};
pub use traits::{DocStore, MessageBus, SiemSink, TxnOps};
pub use types::{now_utc, Actor, AuditId, CommitId, Document, EventId, LockId};
