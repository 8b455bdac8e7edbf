//! # Ontos
//!
//! Concurrency, integrity, and event-delivery core for an ontology
//! metadata service: a Git-style metadata store that versions schemas
//! across named branches, arbitrates concurrent writes with lease-based
//! locks, produces tamper-evident audit records, and delivers change
//! events with at-least-once semantics plus idempotent deduplication.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ontos::{
//!     Actor, BackgroundTasks, MemoryDocStore, MergeStrategy, OntologyService, OntosConfig,
//! };
//!
//! # struct NoopBus;
//! # impl ontos::MessageBus for NoopBus {
//! #     fn publish(&self, _: &str, _: &[u8], _: &[(&str, &str)], _: std::time::Duration)
//! #         -> ontos::OntosResult<()> { Ok(()) }
//! # }
//! fn main() -> ontos::OntosResult<()> {
//!     let store = Arc::new(MemoryDocStore::new());
//!     let bus = Arc::new(NoopBus);
//!     let service = Arc::new(OntologyService::new(
//!         store,
//!         bus,
//!         None,
//!         OntosConfig::default(),
//!     )?);
//!     let tasks = BackgroundTasks::start(&service);
//!
//!     let alice = Actor::user("u-1", "alice");
//!     service.commit_schema(
//!         "main",
//!         serde_json::json!({"object_types": {}}),
//!         &alice,
//!         "initial schema",
//!         None,
//!     )?;
//!     service.create_branch("feature", "main", &alice)?;
//!     service.merge_branches("feature", "main", MergeStrategy::Auto, &alice, false)?;
//!
//!     tasks.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Subsystems
//!
//! | Subsystem | Entry points |
//! |-----------|--------------|
//! | **Branch Lock Manager** | [`LockManager`], [`AcquireRequest`], [`LockSweeper`] |
//! | **Merge Engine** | [`MergeEngine`], [`MergeConfig`], [`ManualResolution`] |
//! | **Outbox + Dispatcher** | [`Outbox`], [`EventSpec`], [`Dispatcher`] |
//! | **Audit Store** | [`AuditStore`], [`AuditEvent`], [`PolicyIntegrityChecker`] |
//! | **Engine** | [`OntologyService`], [`BackgroundTasks`] |
//!
//! External collaborators are behind traits: [`DocStore`] (with
//! [`MemoryDocStore`] as the in-process implementation), [`MessageBus`],
//! and the optional [`SiemSink`].

pub use ontos_core::{
    canonical_json, hash_value, now_utc, sha256_hex, Actor, AuditConfig, AuditId, CommitId,
    DocStore, Document, EngineConfig, EventId, LockConfig, LockId, MergeSettings, MessageBus,
    OntosConfig, OntosError, OntosResult, OutboxConfig, SiemSink, TxnOps,
};

pub use ontos_store::MemoryDocStore;

pub use ontos_locks::{
    is_valid_transition, AcquireRequest, BranchState, BranchStateInfo, HeartbeatHealth, Lock,
    LockHealth, LockKind, LockManager, LockScope, LockSweeper, ReleaseReason, StateTransition,
};

pub use ontos_merge::{
    diff_trees, is_safe_cardinality_widening, is_safe_primitive_widening, Change, ChangeMap,
    Conflict, ConflictAnalysis, ConflictType, ManualResolution, MergeConfig, MergeEngine,
    MergeResult, MergeStatistics, MergeStatus, MergeStrategy, ResolutionChoice,
    ResolutionDecision, Severity,
};

pub use ontos_outbox::{
    backoff_delay_ms, bus_subject, cloud_event, idempotency_key, Dispatcher, DispatcherHandle,
    EventSpec, Outbox, OutboxRecord, OutboxStatistics, OutboxStatus, IDEMPOTENCY_HEADER,
};

pub use ontos_audit::{
    AuditEvent, AuditFilter, AuditPage, AuditRecord, AuditStatistics, AuditStore, AuditTarget,
    IntegrityReport, PolicyIntegrityChecker, PolicySnapshot, RetentionPolicy, TamperSeverity,
    TamperingEvent, TamperingKind,
};

pub use ontos_engine::{is_protected_branch, BackgroundTasks, OntologyService};
