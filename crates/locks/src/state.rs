//! Branch lifecycle states and the transition table
//!
//! Every observable state change goes through [`is_valid_transition`] and
//! is journaled as a [`StateTransition`]. Transitions not in the table are
//! invalid and fail without side effects.

use chrono::{DateTime, Utc};
use ontos_core::now_utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchState {
    /// Normal editing
    Active,
    /// Schema freeze while a branch-wide indexing lock is held
    LockedForWrite,
    /// Indexing complete, awaiting merge
    Ready,
    /// A merge is in progress
    Merging,
    /// Unrecoverable failure; all locks are released on entry
    Error,
    /// Terminal
    Archived,
}

impl BranchState {
    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchState::Active => "ACTIVE",
            BranchState::LockedForWrite => "LOCKED_FOR_WRITE",
            BranchState::Ready => "READY",
            BranchState::Merging => "MERGING",
            BranchState::Error => "ERROR",
            BranchState::Archived => "ARCHIVED",
        }
    }

    /// True when schema writes are allowed in this state
    pub fn allows_writes(&self) -> bool {
        matches!(self, BranchState::Active | BranchState::Ready)
    }

    /// True when no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, BranchState::Archived)
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The static transition table.
///
/// ```text
/// ACTIVE ──────────▶ LOCKED_FOR_WRITE | MERGING
/// LOCKED_FOR_WRITE ─▶ READY
/// READY ───────────▶ ACTIVE
/// MERGING ─────────▶ ACTIVE
/// ERROR ───────────▶ ACTIVE          (admin reset)
/// any ─────────────▶ ERROR | ARCHIVED
/// ARCHIVED ────────▶ (terminal)
/// ```
pub fn is_valid_transition(from: BranchState, to: BranchState) -> bool {
    use BranchState::*;
    match (from, to) {
        (Archived, _) => false,
        (_, Archived) => true,
        (Error, Error) => false,
        (_, Error) => true,
        (Active, LockedForWrite) | (Active, Merging) => true,
        (LockedForWrite, Ready) => true,
        (Ready, Active) => true,
        (Merging, Active) => true,
        (Error, Active) => true,
        _ => false,
    }
}

/// Current state of a branch plus the context of its last change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchStateInfo {
    /// Branch name
    pub branch: String,
    /// Current state
    pub current_state: BranchState,
    /// State before the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<BranchState>,
    /// When the last transition happened
    pub state_changed_at: DateTime<Utc>,
    /// Who triggered the last transition
    pub state_changed_by: String,
    /// Why
    pub state_change_reason: String,
    /// When indexing last started on this branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexing_started_at: Option<DateTime<Utc>>,
    /// When indexing last completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexing_completed_at: Option<DateTime<Utc>>,
    /// Service that ran the indexing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexing_service: Option<String>,
}

impl BranchStateInfo {
    /// Fresh `ACTIVE` state for a branch with no history.
    pub fn initial(branch: impl Into<String>) -> Self {
        BranchStateInfo {
            branch: branch.into(),
            current_state: BranchState::Active,
            previous_state: None,
            state_changed_at: now_utc(),
            state_changed_by: "system".to_string(),
            state_change_reason: "Initial state".to_string(),
            indexing_started_at: None,
            indexing_completed_at: None,
            indexing_service: None,
        }
    }

    /// Apply a validated transition in place.
    pub(crate) fn apply_transition(
        &mut self,
        to: BranchState,
        changed_by: &str,
        reason: &str,
    ) -> StateTransition {
        let from = self.current_state;
        self.previous_state = Some(from);
        self.current_state = to;
        self.state_changed_at = now_utc();
        self.state_changed_by = changed_by.to_string();
        self.state_change_reason = reason.to_string();

        StateTransition {
            branch: self.branch.clone(),
            from_state: from,
            to_state: to,
            transitioned_by: changed_by.to_string(),
            reason: reason.to_string(),
            occurred_at: self.state_changed_at,
        }
    }
}

/// One journaled state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Branch that transitioned
    pub branch: String,
    /// State before
    pub from_state: BranchState,
    /// State after
    pub to_state: BranchState,
    /// Who triggered it
    pub transitioned_by: String,
    /// Why
    pub reason: String,
    /// When
    pub occurred_at: DateTime<Utc>,
}
