//! Conflict resolution: policy-driven and manual
//!
//! Auto-resolution handles what policy allows (safe widenings, preferring
//! the more complete addition, custom resolvers). Everything else waits
//! for a manual resolution envelope.

use crate::conflict::{widen_cardinality, widen_type_name, Conflict, ConflictType};
use crate::engine::MergeConfig;
use crate::path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A registered custom resolver: mutates the merged tree and returns a
/// description of what it did, or None to decline.
pub type Resolver = Box<dyn Fn(&Conflict, &mut Value) -> Option<String> + Send + Sync>;

/// Attempt to auto-resolve one conflict into `merged`.
///
/// Returns a description of the applied resolution, or None when no
/// built-in or custom action applies.
pub(crate) fn auto_resolve(
    conflict: &Conflict,
    merged: &mut Value,
    config: &MergeConfig,
    resolvers: &BTreeMap<ConflictType, Resolver>,
) -> Option<String> {
    if let Some(resolver) = resolvers.get(&conflict.conflict_type) {
        if let Some(description) = resolver(conflict, merged) {
            return Some(description);
        }
    }

    match conflict.conflict_type {
        ConflictType::ModifyModify | ConflictType::TypeChange => {
            resolve_type_widening(conflict, merged, config)
        }
        ConflictType::Cardinality => resolve_cardinality(conflict, merged, config),
        ConflictType::AddAdd => resolve_add_add(conflict, merged, config),
        _ => None,
    }
}

fn resolve_type_widening(
    conflict: &Conflict,
    merged: &mut Value,
    config: &MergeConfig,
) -> Option<String> {
    if !config.enable_type_widening {
        return None;
    }
    let source = conflict.source_value.as_ref()?.as_str()?;
    let target = conflict.target_value.as_ref()?.as_str()?;
    let wider = widen_type_name(source, target)?;

    path::set(
        merged,
        &conflict.path,
        Value::String(wider.to_string()),
        &config.id_fields,
    )
    .then(|| format!("widened type to '{}'", wider))
}

fn resolve_cardinality(
    conflict: &Conflict,
    merged: &mut Value,
    config: &MergeConfig,
) -> Option<String> {
    if !config.enable_cardinality_relaxation {
        return None;
    }
    let source = conflict.source_value.as_ref()?.as_str()?;
    let target = conflict.target_value.as_ref()?.as_str()?;
    let wider = widen_cardinality(source, target)?;

    path::set(
        merged,
        &conflict.path,
        Value::String(wider.to_string()),
        &config.id_fields,
    )
    .then(|| format!("relaxed cardinality to '{}'", wider))
}

fn resolve_add_add(conflict: &Conflict, merged: &mut Value, config: &MergeConfig) -> Option<String> {
    let source = conflict.source_value.as_ref()?;
    let target = conflict.target_value.as_ref()?;

    let (winner, side) = if is_more_complete(source, target) {
        (source.clone(), "source")
    } else {
        (target.clone(), "target")
    };

    path::set(merged, &conflict.path, winner, &config.id_fields)
        .then(|| format!("kept the more complete {} addition", side))
}

/// Completeness order for add/add preference: more fields, longer
/// sequence, longer string. Ties go to the target side.
fn is_more_complete(source: &Value, target: &Value) -> bool {
    match (source, target) {
        (Value::Object(a), Value::Object(b)) => a.len() > b.len(),
        (Value::Array(a), Value::Array(b)) => a.len() > b.len(),
        (Value::String(a), Value::String(b)) => a.len() > b.len(),
        _ => false,
    }
}

/// Which side of a conflict a manual decision takes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "choice", rename_all = "lowercase")]
pub enum ResolutionChoice {
    /// Take the source branch's value
    Source,
    /// Take the target branch's value
    Target,
    /// Use an explicitly supplied value
    Custom {
        /// The value to write at the conflict path
        value: Value,
    },
}

/// One decision within a manual resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionDecision {
    /// Conflict path being decided
    pub path: String,
    /// The decision
    #[serde(flatten)]
    pub choice: ResolutionChoice,
}

/// A manual resolution envelope for a conflicted merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualResolution {
    /// Caller-supplied resolution id
    pub resolution_id: String,
    /// When the decisions were made
    pub timestamp: DateTime<Utc>,
    /// One decision per conflicted path
    pub decisions: Vec<ResolutionDecision>,
}

impl ManualResolution {
    /// Structural validation: non-empty id, at least one decision, no
    /// duplicate paths. Returns a description of the first problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.resolution_id.trim().is_empty() {
            return Err("resolution_id must not be empty".to_string());
        }
        if self.decisions.is_empty() {
            return Err("decisions must not be empty".to_string());
        }
        let mut seen = std::collections::BTreeSet::new();
        for decision in &self.decisions {
            if !seen.insert(decision.path.as_str()) {
                return Err(format!("duplicate decision for path '{}'", decision.path));
            }
        }
        Ok(())
    }
}
