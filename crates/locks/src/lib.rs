//! Branch lock manager
//!
//! Serializes writes to branches and resources with lease-based locking:
//! - Branch state machine with a static transition table, journaled
//! - Leases with TTL and optional heartbeats, fine-grained scopes
//!   (branch / resource-type / resource)
//! - Background sweepers that reconcile crashed holders
//!
//! All mutating schema operations acquire a compatible lock first; the
//! conflict matrix lives in [`Lock::conflicts_with`].

#![warn(missing_docs)]
#![warn(clippy::all)]

mod lock;
mod manager;
mod state;
mod sweeper;

pub use lock::{
    AcquireRequest, HeartbeatHealth, Lock, LockHealth, LockKind, LockScope, ReleaseReason,
};
pub use manager::{LockManager, BRANCH_STATE, BRANCH_STATE_JOURNAL, LOCKS};
pub use state::{is_valid_transition, BranchState, BranchStateInfo, StateTransition};
pub use sweeper::LockSweeper;
