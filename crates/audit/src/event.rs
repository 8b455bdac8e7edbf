//! Audit event model
//!
//! An `AuditEvent` describes one action: who did what to which target,
//! whether it succeeded, and the request/correlation context it happened
//! in. Events are immutable once stored; the store only ever flips their
//! `archived` flag.

use chrono::{DateTime, Utc};
use ontos_core::{now_utc, Actor, AuditId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an audit event acted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTarget {
    /// Target kind (branch, lock, object_type, policy, ...)
    pub kind: String,
    /// Target identifier
    pub id: String,
    /// Human-readable name, if distinct from the id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Branch context, when the target lives on a branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl AuditTarget {
    /// Target with just a kind and id
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        AuditTarget {
            kind: kind.into(),
            id: id.into(),
            name: None,
            branch: None,
        }
    }

    /// Attach a branch context
    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Attach a display name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The `kind:id` form used in the integrity hash
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

/// Error context attached to failed events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditError {
    /// Stable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

/// One audited action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event id
    pub id: AuditId,
    /// When the action happened (UTC)
    pub time: DateTime<Utc>,
    /// Action name, dotted (e.g. `lock.released`, `schema.create`)
    pub action: String,
    /// Who performed it
    pub actor: Actor,
    /// What it acted on
    pub target: AuditTarget,
    /// Whether the action succeeded
    pub success: bool,
    /// Error context for failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AuditError>,
    /// How long the action took
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Originating request id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Correlation id shared across a request chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Id of the event that caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Structured before/after changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Value>,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Classification tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Compliance annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance: Option<Value>,
}

impl AuditEvent {
    /// A successful event with the minimum required context.
    pub fn new(action: impl Into<String>, actor: Actor, target: AuditTarget) -> Self {
        AuditEvent {
            id: AuditId::new(),
            time: now_utc(),
            action: action.into(),
            actor,
            target,
            success: true,
            error: None,
            duration_ms: None,
            request_id: None,
            correlation_id: None,
            causation_id: None,
            changes: None,
            metadata: None,
            tags: Vec::new(),
            compliance: None,
        }
    }

    /// Mark the event failed with an error code and message
    pub fn failed(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(AuditError {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    /// Attach free-form metadata
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attach structured changes
    pub fn with_changes(mut self, changes: Value) -> Self {
        self.changes = Some(changes);
        self
    }

    /// Attach a correlation id
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach a request id
    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach a duration
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Override the timestamp (used by tests and backfills)
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }
}
