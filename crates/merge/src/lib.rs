//! Three-way merge engine for schema trees
//!
//! Computes a deterministic merged schema from two versions and their
//! lowest common ancestor:
//! - Recursive structural diff (mappings by key, sequences by id or index)
//! - Conflict classification by severity with auto-resolution policies
//!   (safe type/cardinality widening, more-complete preference)
//! - Circular-dependency detection over `ref`-typed properties
//! - Manual resolution envelopes for what policy can't decide
//!
//! The engine is stateless and pure: identical inputs and configuration
//! produce byte-identical merged trees and the same conflict set in the
//! same order. Callers persist the result.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod conflict;
mod diff;
mod engine;
mod graph;
mod path;
mod resolve;

pub use conflict::{
    is_safe_cardinality_widening, is_safe_primitive_widening, widen_type_name, Conflict,
    ConflictType, Severity,
};
pub use diff::{diff_trees, Change, ChangeMap};
pub use engine::{
    ConflictAnalysis, MergeConfig, MergeEngine, MergeResult, MergeStatistics, MergeStatus,
    MergeStrategy,
};
pub use resolve::{ManualResolution, ResolutionChoice, ResolutionDecision};
