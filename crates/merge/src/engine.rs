//! The merge engine: strategies, classification, and outcome assembly

use crate::conflict::{
    widen_cardinality, widen_type_name, Conflict, ConflictType, Severity, SEMANTIC_FIELDS,
};
use crate::diff::{diff_trees, Change, ChangeMap};
use crate::graph;
use crate::path::{self, PathSegment};
use crate::resolve::{self, ManualResolution, ResolutionChoice, Resolver};
use ontos_core::{MergeSettings, OntosError, OntosResult};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::debug;

/// How a merge combines the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeStrategy {
    /// Standard three-way merge
    Merge,
    /// Three-way merge, squashed into one commit downstream
    Squash,
    /// Three-way merge, replayed onto the target downstream
    Rebase,
    /// Take the other side verbatim when one side is unchanged
    FastForward,
    /// Take the source side
    Ours,
    /// Take the target side
    Theirs,
    /// Require explicit decisions for every conflict
    Manual,
    /// Three-way merge with auto-resolution (default)
    Auto,
}

impl MergeStrategy {
    /// Parse a strategy name; unknown values default to `Auto`.
    pub fn parse(s: &str) -> MergeStrategy {
        match s.to_ascii_lowercase().as_str() {
            "merge" => MergeStrategy::Merge,
            "squash" => MergeStrategy::Squash,
            "rebase" => MergeStrategy::Rebase,
            "fast_forward" | "ff" => MergeStrategy::FastForward,
            "ours" => MergeStrategy::Ours,
            "theirs" => MergeStrategy::Theirs,
            "manual" => MergeStrategy::Manual,
            _ => MergeStrategy::Auto,
        }
    }

    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Merge => "MERGE",
            MergeStrategy::Squash => "SQUASH",
            MergeStrategy::Rebase => "REBASE",
            MergeStrategy::FastForward => "FAST_FORWARD",
            MergeStrategy::Ours => "OURS",
            MergeStrategy::Theirs => "THEIRS",
            MergeStrategy::Manual => "MANUAL",
            MergeStrategy::Auto => "AUTO",
        }
    }
}

/// Outcome classification of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    /// Merged cleanly; no unresolved conflicts
    Success,
    /// Merged with unresolved (non-blocking) conflicts remaining
    Partial,
    /// A blocking conflict prevents the merge
    Blocked,
    /// The merge could not produce a tree (strict mode, bad input)
    Failed,
    /// One side was unchanged; the other side is the result
    FastForward,
    /// Dry run completed; nothing was persisted
    DryRunSuccess,
}

impl MergeStatus {
    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStatus::Success => "success",
            MergeStatus::Partial => "partial",
            MergeStatus::Blocked => "blocked",
            MergeStatus::Failed => "failed",
            MergeStatus::FastForward => "fast_forward",
            MergeStatus::DryRunSuccess => "dry_run_success",
        }
    }
}

/// Merge engine configuration (the typed form of `MergeSettings`).
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Default strategy
    pub strategy: MergeStrategy,
    /// Max severity that policy may auto-resolve
    pub auto_resolve_threshold: Severity,
    /// Fail on any conflict
    pub strict_mode: bool,
    /// Diff sequences by id field when every element carries one
    pub merge_arrays_by_id: bool,
    /// Id fields tried in order for by-id diffing
    pub id_fields: Vec<String>,
    /// Fields excluded from diffing
    pub ignore_fields: BTreeSet<String>,
    /// Prefix marking system fields, also excluded
    pub system_field_prefix: String,
    /// Allow safe primitive widening
    pub enable_type_widening: bool,
    /// Allow safe cardinality widening
    pub enable_cardinality_relaxation: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            strategy: MergeStrategy::Auto,
            auto_resolve_threshold: Severity::Warn,
            strict_mode: false,
            merge_arrays_by_id: true,
            id_fields: vec!["@id".to_string(), "name".to_string(), "id".to_string()],
            ignore_fields: ["@timestamp", "@version"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            system_field_prefix: "@".to_string(),
            enable_type_widening: true,
            enable_cardinality_relaxation: true,
        }
    }
}

impl MergeConfig {
    /// No auto-resolution; any conflict fails the merge.
    pub fn strict() -> Self {
        MergeConfig {
            strategy: MergeStrategy::Manual,
            auto_resolve_threshold: Severity::Info,
            strict_mode: true,
            ..MergeConfig::default()
        }
    }

    /// Maximize auto-resolution.
    pub fn lenient() -> Self {
        MergeConfig {
            strategy: MergeStrategy::Auto,
            auto_resolve_threshold: Severity::Error,
            ..MergeConfig::default()
        }
    }

    /// Build from the primitive configuration surface.
    pub fn from_settings(settings: &MergeSettings) -> Self {
        MergeConfig {
            auto_resolve_threshold: Severity::parse(&settings.auto_resolve_threshold)
                .unwrap_or(Severity::Warn),
            strict_mode: settings.strict_mode,
            id_fields: settings.id_fields.clone(),
            ignore_fields: settings.ignore_fields.clone(),
            enable_type_widening: settings.enable_type_widening,
            enable_cardinality_relaxation: settings.enable_type_widening,
            ..MergeConfig::default()
        }
    }

    /// True when a mapping key is excluded from diffing.
    pub fn is_ignored_field(&self, key: &str) -> bool {
        self.ignore_fields.contains(key)
            || (!self.system_field_prefix.is_empty() && key.starts_with(&self.system_field_prefix))
    }
}

/// Merge statistics.
#[derive(Debug, Clone, Default)]
pub struct MergeStatistics {
    /// Paths changed on the source side
    pub source_changes: usize,
    /// Paths changed on the target side
    pub target_changes: usize,
    /// Conflicts detected (resolved or not)
    pub total_conflicts: usize,
    /// Conflicts resolved by policy
    pub auto_resolved: usize,
    /// Conflicts needing manual attention
    pub manual_required: usize,
    /// Detected conflict counts by type
    pub by_type: BTreeMap<String, usize>,
    /// Detected conflict counts by severity
    pub by_severity: BTreeMap<String, usize>,
    /// Whether the merge fast-forwarded
    pub fast_forward: bool,
}

/// Result of a merge. The engine never persists; callers commit `merged`.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// Outcome classification
    pub status: MergeStatus,
    /// The merged tree (None when blocked or failed)
    pub merged: Option<Value>,
    /// Unresolved conflicts, ordered by path
    pub conflicts: Vec<Conflict>,
    /// Post-merge validation warnings
    pub warnings: Vec<String>,
    /// Conflicts resolved by policy
    pub auto_resolved_count: usize,
    /// Strategy that produced this result
    pub strategy: MergeStrategy,
    /// Counters
    pub statistics: MergeStatistics,
    /// Wall time spent merging
    pub duration_ms: u64,
}

/// Summary returned by conflict analysis.
#[derive(Debug, Clone)]
pub struct ConflictAnalysis {
    /// Number of conflicts detected
    pub total_conflicts: usize,
    /// Counts per conflict type
    pub by_type: BTreeMap<String, usize>,
    /// Highest severity present
    pub max_severity: Option<Severity>,
    /// How many are auto-resolvable under the current threshold
    pub auto_resolvable: usize,
}

type Validator = Box<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

/// Stateless three-way merge engine.
///
/// For identical inputs and configuration the engine produces
/// byte-identical merged trees and the same conflict set in the same
/// order; merge commits are content-addressed downstream.
pub struct MergeEngine {
    config: MergeConfig,
    resolvers: BTreeMap<ConflictType, Resolver>,
    validators: Vec<Validator>,
}

impl MergeEngine {
    /// Engine with the given configuration.
    pub fn new(config: MergeConfig) -> Self {
        MergeEngine {
            config,
            resolvers: BTreeMap::new(),
            validators: Vec::new(),
        }
    }

    /// The configuration in effect.
    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Register a custom resolver for one conflict type.
    pub fn register_resolver(
        &mut self,
        conflict_type: ConflictType,
        resolver: impl Fn(&Conflict, &mut Value) -> Option<String> + Send + Sync + 'static,
    ) {
        self.resolvers.insert(conflict_type, Box::new(resolver));
    }

    /// Register a post-merge validator; returned strings become warnings.
    pub fn register_validator(
        &mut self,
        validator: impl Fn(&Value) -> Vec<String> + Send + Sync + 'static,
    ) {
        self.validators.push(Box::new(validator));
    }

    /// Diff two trees with this engine's configuration.
    pub fn diff(&self, old: &Value, new: &Value) -> ChangeMap {
        diff_trees(old, new, &self.config)
    }

    /// Merge with the configured default strategy.
    pub fn merge(&self, base: &Value, source: &Value, target: &Value) -> MergeResult {
        self.merge_with_strategy(base, source, target, self.config.strategy)
    }

    /// Merge with an explicit strategy.
    pub fn merge_with_strategy(
        &self,
        base: &Value,
        source: &Value,
        target: &Value,
        strategy: MergeStrategy,
    ) -> MergeResult {
        let started = Instant::now();

        // Fast-forward: one side unchanged means the other side is the
        // answer, conflict detection skipped entirely.
        if base == source {
            return self.fast_forward_result(target.clone(), started);
        }
        if base == target {
            return self.fast_forward_result(source.clone(), started);
        }

        let source_changes = diff_trees(base, source, &self.config);
        let target_changes = diff_trees(base, target, &self.config);
        let conflicts =
            self.classify_conflicts(base, source, target, &source_changes, &target_changes);

        let mut statistics = MergeStatistics {
            source_changes: source_changes.len(),
            target_changes: target_changes.len(),
            total_conflicts: conflicts.len(),
            ..Default::default()
        };
        for conflict in &conflicts {
            *statistics
                .by_type
                .entry(conflict.conflict_type.as_str().to_string())
                .or_default() += 1;
            *statistics
                .by_severity
                .entry(conflict.severity.as_str().to_string())
                .or_default() += 1;
        }

        match strategy {
            MergeStrategy::Ours => {
                return self.one_sided_result(source.clone(), strategy, statistics, started);
            }
            MergeStrategy::Theirs => {
                return self.one_sided_result(target.clone(), strategy, statistics, started);
            }
            _ => {}
        }

        if self.config.strict_mode && !conflicts.is_empty() {
            statistics.manual_required = conflicts.len();
            return MergeResult {
                status: MergeStatus::Failed,
                merged: None,
                conflicts,
                warnings: vec!["strict mode: conflicts present".to_string()],
                auto_resolved_count: 0,
                strategy,
                statistics,
                duration_ms: started.elapsed().as_millis() as u64,
            };
        }

        if strategy == MergeStrategy::Manual {
            statistics.manual_required = conflicts.len();
            let status = if conflicts.iter().any(|c| c.severity == Severity::Block) {
                MergeStatus::Blocked
            } else {
                MergeStatus::Partial
            };
            return MergeResult {
                status,
                merged: None,
                conflicts,
                warnings: Vec::new(),
                auto_resolved_count: 0,
                strategy,
                statistics,
                duration_ms: started.elapsed().as_millis() as u64,
            };
        }

        // Full three-way: base plus both change sets, conflicts resolved
        // by policy where allowed.
        let (merged, mut unresolved, auto_resolved) = self.build_merged(
            base,
            &source_changes,
            &target_changes,
            conflicts,
            None,
        );

        statistics.auto_resolved = auto_resolved;
        let warnings = self.finalize(&merged, &mut unresolved, &mut statistics);

        unresolved.sort_by(|a, b| a.path.cmp(&b.path).then(a.id.cmp(&b.id)));
        statistics.manual_required = unresolved.len();

        let status = if unresolved.iter().any(|c| c.severity == Severity::Block) {
            MergeStatus::Blocked
        } else if unresolved.is_empty() {
            MergeStatus::Success
        } else {
            MergeStatus::Partial
        };

        debug!(
            status = status.as_str(),
            conflicts = unresolved.len(),
            auto_resolved,
            "merge computed"
        );
        MergeResult {
            merged: (status != MergeStatus::Blocked).then_some(merged),
            status,
            conflicts: unresolved,
            warnings,
            auto_resolved_count: auto_resolved,
            strategy,
            statistics,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Analyze conflicts between two versions of a tree without merging.
    pub fn analyze_conflicts(
        &self,
        base: &Value,
        source: &Value,
        target: &Value,
    ) -> ConflictAnalysis {
        if base == source || base == target {
            return ConflictAnalysis {
                total_conflicts: 0,
                by_type: BTreeMap::new(),
                max_severity: None,
                auto_resolvable: 0,
            };
        }

        let source_changes = diff_trees(base, source, &self.config);
        let target_changes = diff_trees(base, target, &self.config);
        let conflicts =
            self.classify_conflicts(base, source, target, &source_changes, &target_changes);

        let mut by_type = BTreeMap::new();
        for conflict in &conflicts {
            *by_type
                .entry(conflict.conflict_type.as_str().to_string())
                .or_default() += 1;
        }
        ConflictAnalysis {
            total_conflicts: conflicts.len(),
            by_type,
            max_severity: conflicts.iter().map(|c| c.severity).max(),
            auto_resolvable: conflicts.iter().filter(|c| c.auto_resolvable).count(),
        }
    }

    /// Merge with explicit decisions for conflicted paths.
    ///
    /// Fails with `InvalidResolution` when the envelope is malformed or
    /// names a path that is not in conflict.
    pub fn apply_manual_resolution(
        &self,
        base: &Value,
        source: &Value,
        target: &Value,
        resolution: &ManualResolution,
    ) -> OntosResult<MergeResult> {
        resolution
            .validate()
            .map_err(OntosError::invalid_resolution)?;

        let started = Instant::now();
        if base == source {
            return Ok(self.fast_forward_result(target.clone(), started));
        }
        if base == target {
            return Ok(self.fast_forward_result(source.clone(), started));
        }

        let source_changes = diff_trees(base, source, &self.config);
        let target_changes = diff_trees(base, target, &self.config);
        let conflicts =
            self.classify_conflicts(base, source, target, &source_changes, &target_changes);

        let conflict_paths: BTreeSet<&str> =
            conflicts.iter().map(|c| c.path.as_str()).collect();
        for decision in &resolution.decisions {
            if !conflict_paths.contains(decision.path.as_str()) {
                return Err(OntosError::invalid_resolution(format!(
                    "decision path '{}' is not in conflict",
                    decision.path
                )));
            }
        }

        let decisions: BTreeMap<&str, &ResolutionChoice> = resolution
            .decisions
            .iter()
            .map(|d| (d.path.as_str(), &d.choice))
            .collect();

        let mut statistics = MergeStatistics {
            source_changes: source_changes.len(),
            target_changes: target_changes.len(),
            total_conflicts: conflicts.len(),
            ..Default::default()
        };

        let (merged, mut unresolved, auto_resolved) = self.build_merged(
            base,
            &source_changes,
            &target_changes,
            conflicts,
            Some(&decisions),
        );
        statistics.auto_resolved = auto_resolved;

        let warnings = self.finalize(&merged, &mut unresolved, &mut statistics);
        unresolved.sort_by(|a, b| a.path.cmp(&b.path).then(a.id.cmp(&b.id)));
        statistics.manual_required = unresolved.len();

        let status = if unresolved.iter().any(|c| c.severity == Severity::Block) {
            MergeStatus::Blocked
        } else if unresolved.is_empty() {
            MergeStatus::Success
        } else {
            MergeStatus::Partial
        };

        Ok(MergeResult {
            merged: (status != MergeStatus::Blocked).then_some(merged),
            status,
            conflicts: unresolved,
            warnings,
            auto_resolved_count: auto_resolved,
            strategy: MergeStrategy::Manual,
            statistics,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn fast_forward_result(&self, merged: Value, started: Instant) -> MergeResult {
        MergeResult {
            status: MergeStatus::FastForward,
            merged: Some(merged),
            conflicts: Vec::new(),
            warnings: Vec::new(),
            auto_resolved_count: 0,
            strategy: MergeStrategy::FastForward,
            statistics: MergeStatistics {
                fast_forward: true,
                ..Default::default()
            },
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn one_sided_result(
        &self,
        merged: Value,
        strategy: MergeStrategy,
        mut statistics: MergeStatistics,
        started: Instant,
    ) -> MergeResult {
        // Taking one side wholesale resolves every detected conflict
        statistics.auto_resolved = statistics.total_conflicts;
        MergeResult {
            status: MergeStatus::Success,
            merged: Some(merged),
            conflicts: Vec::new(),
            warnings: Vec::new(),
            auto_resolved_count: statistics.auto_resolved,
            strategy,
            statistics,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Assemble the merged tree: apply non-conflicting changes from both
    /// sides, then settle conflicts via decisions and policy. Returns
    /// `(merged, unresolved, auto_resolved_count)`.
    fn build_merged(
        &self,
        base: &Value,
        source_changes: &ChangeMap,
        target_changes: &ChangeMap,
        conflicts: Vec<Conflict>,
        decisions: Option<&BTreeMap<&str, &ResolutionChoice>>,
    ) -> (Value, Vec<Conflict>, usize) {
        let conflict_paths: BTreeSet<&str> =
            conflicts.iter().map(|c| c.path.as_str()).collect();

        let mut merged = base.clone();
        let mut auto_resolved = 0usize;

        for (changed_path, change) in target_changes {
            if !conflict_paths.contains(changed_path.as_str()) {
                if self.apply_change(&mut merged, changed_path, change) {
                    auto_resolved += 1;
                }
            }
        }
        for (changed_path, change) in source_changes {
            if !conflict_paths.contains(changed_path.as_str())
                && !target_changes.contains_key(changed_path)
            {
                if self.apply_change(&mut merged, changed_path, change) {
                    auto_resolved += 1;
                }
            }
        }

        let mut unresolved = Vec::new();
        for conflict in conflicts {
            if let Some(decisions) = decisions {
                if let Some(choice) = decisions.get(conflict.path.as_str()) {
                    self.apply_decision(&mut merged, &conflict, choice, source_changes, target_changes);
                    auto_resolved += 1;
                    continue;
                }
            }

            if conflict.auto_resolvable {
                if let Some(description) =
                    resolve::auto_resolve(&conflict, &mut merged, &self.config, &self.resolvers)
                {
                    debug!(path = %conflict.path, resolution = %description, "conflict auto-resolved");
                    auto_resolved += 1;
                    continue;
                }
            }

            // Unresolved paths keep the target side so the partial tree
            // stays usable for review
            if let Some(change) = target_changes.get(&conflict.path) {
                self.apply_change(&mut merged, &conflict.path, change);
            }
            unresolved.push(conflict);
        }

        (merged, unresolved, auto_resolved)
    }

    /// Apply one change to the merged tree. Returns true when the change
    /// was a one-sided safe widening (counted as an auto-resolution).
    fn apply_change(&self, merged: &mut Value, changed_path: &str, change: &Change) -> bool {
        match change {
            Change::Delete { .. } => {
                path::remove(merged, changed_path, &self.config.id_fields);
                false
            }
            _ => {
                let Some(new_value) = change.new_value() else {
                    return false;
                };
                path::set(
                    merged,
                    changed_path,
                    new_value.clone(),
                    &self.config.id_fields,
                );
                self.is_one_sided_widening(changed_path, change)
            }
        }
    }

    fn is_one_sided_widening(&self, changed_path: &str, change: &Change) -> bool {
        let Change::Modify { old, new } = change else {
            return false;
        };
        let (Some(old), Some(new)) = (old.as_str(), new.as_str()) else {
            return false;
        };
        match last_key(changed_path) {
            Some("type") => {
                self.config.enable_type_widening
                    && crate::conflict::is_safe_primitive_widening(old, new)
            }
            Some("cardinality") => {
                self.config.enable_cardinality_relaxation
                    && crate::conflict::is_safe_cardinality_widening(old, new)
            }
            _ => false,
        }
    }

    fn apply_decision(
        &self,
        merged: &mut Value,
        conflict: &Conflict,
        choice: &ResolutionChoice,
        source_changes: &ChangeMap,
        target_changes: &ChangeMap,
    ) {
        let changes = match choice {
            ResolutionChoice::Source => source_changes,
            ResolutionChoice::Target => target_changes,
            ResolutionChoice::Custom { value } => {
                path::set(merged, &conflict.path, value.clone(), &self.config.id_fields);
                return;
            }
        };
        match changes.get(&conflict.path) {
            Some(change) => {
                self.apply_change(merged, &conflict.path, change);
            }
            // The chosen side didn't change this path: restore base
            None => match &conflict.base_value {
                Some(base_value) => {
                    path::set(
                        merged,
                        &conflict.path,
                        base_value.clone(),
                        &self.config.id_fields,
                    );
                }
                None => {
                    path::remove(merged, &conflict.path, &self.config.id_fields);
                }
            },
        }
    }

    /// Post-merge checks: circular dependencies, name collisions, and
    /// registered validators. Blocking findings land in `unresolved`.
    fn finalize(
        &self,
        merged: &Value,
        unresolved: &mut Vec<Conflict>,
        statistics: &mut MergeStatistics,
    ) -> Vec<String> {
        if let Some(cycle) = graph::find_cycle(&graph::extract_dependencies(merged)) {
            let conflict = Conflict::new(
                ConflictType::CircularDependency,
                Severity::Block,
                "",
                None,
                None,
                None,
                format!("reference cycle: {}", cycle.join(" -> ")),
            );
            *statistics
                .by_type
                .entry(conflict.conflict_type.as_str().to_string())
                .or_default() += 1;
            *statistics
                .by_severity
                .entry(conflict.severity.as_str().to_string())
                .or_default() += 1;
            statistics.total_conflicts += 1;
            unresolved.push(conflict);
        }

        for conflict in name_collisions(merged) {
            *statistics
                .by_type
                .entry(conflict.conflict_type.as_str().to_string())
                .or_default() += 1;
            *statistics
                .by_severity
                .entry(conflict.severity.as_str().to_string())
                .or_default() += 1;
            statistics.total_conflicts += 1;
            unresolved.push(conflict);
        }

        let mut warnings = Vec::new();
        for validator in &self.validators {
            warnings.extend(validator(merged));
        }
        warnings
    }

    /// Classify the paths changed on both sides.
    fn classify_conflicts(
        &self,
        base: &Value,
        source: &Value,
        target: &Value,
        source_changes: &ChangeMap,
        target_changes: &ChangeMap,
    ) -> Vec<Conflict> {
        let mut conflicts = Vec::new();

        for (changed_path, source_change) in source_changes {
            let Some(target_change) = target_changes.get(changed_path) else {
                continue;
            };
            if source_change == target_change {
                continue;
            }
            if let Some(conflict) =
                self.classify_pair(changed_path, base, source, target, source_change, target_change)
            {
                conflicts.push(conflict);
            }
        }

        // Subtree deletion on one side with nested edits on the other is a
        // delete/modify conflict even though the paths differ
        for (deleted, nested) in [
            (source_changes, target_changes),
            (target_changes, source_changes),
        ] {
            for (changed_path, change) in deleted {
                if !matches!(change, Change::Delete { .. }) {
                    continue;
                }
                if nested.contains_key(changed_path) {
                    continue;
                }
                let child_prefix = format!("{}.", changed_path);
                let selector_prefix = format!("{}[", changed_path);
                let has_nested_edit = nested
                    .keys()
                    .any(|p| p.starts_with(&child_prefix) || p.starts_with(&selector_prefix));
                if has_nested_edit {
                    let mut conflict = Conflict::new(
                        ConflictType::DeleteModify,
                        Severity::Error,
                        changed_path,
                        path::get(base, changed_path, &self.config.id_fields).cloned(),
                        path::get(source, changed_path, &self.config.id_fields).cloned(),
                        path::get(target, changed_path, &self.config.id_fields).cloned(),
                        format!(
                            "subtree at {} deleted on one side and edited on the other",
                            changed_path
                        ),
                    );
                    conflict.auto_resolvable =
                        Severity::Error <= self.config.auto_resolve_threshold;
                    conflicts.push(conflict);
                }
            }
        }

        conflicts.sort_by(|a, b| a.path.cmp(&b.path).then(a.id.cmp(&b.id)));
        conflicts.dedup_by(|a, b| a.id == b.id);
        conflicts
    }

    fn classify_pair(
        &self,
        changed_path: &str,
        base: &Value,
        source: &Value,
        target: &Value,
        source_change: &Change,
        target_change: &Change,
    ) -> Option<Conflict> {
        let base_value = path::get(base, changed_path, &self.config.id_fields).cloned();
        let source_value = path::get(source, changed_path, &self.config.id_fields).cloned();
        let target_value = path::get(target, changed_path, &self.config.id_fields).cloned();

        let (conflict_type, severity, suggestion) = match (source_change, target_change) {
            (Change::Delete { .. }, _) | (_, Change::Delete { .. }) => (
                ConflictType::DeleteModify,
                Severity::Error,
                None,
            ),
            (Change::Add { value: sv }, Change::Add { value: tv }) => {
                let suggestion = if add_add_comparable(sv, tv) {
                    Some("keep the more complete addition".to_string())
                } else {
                    None
                };
                (ConflictType::AddAdd, Severity::Warn, suggestion)
            }
            (source_change, target_change) => {
                self.classify_modify_pair(changed_path, source_change, target_change)?
            }
        };

        let auto_resolvable = severity <= self.config.auto_resolve_threshold;
        let mut conflict = Conflict::new(
            conflict_type,
            severity,
            changed_path,
            base_value,
            source_value,
            target_value,
            format!("{} conflict at {}", conflict_type, changed_path),
        );
        conflict.auto_resolvable = auto_resolvable;
        if let Some(suggestion) = suggestion {
            conflict = conflict.with_suggestion(suggestion);
        }
        Some(conflict)
    }

    /// Classify a modify/modify (or type-change) pair. Returns None when
    /// the divergence turns out not to be a conflict.
    #[allow(clippy::type_complexity)]
    fn classify_modify_pair(
        &self,
        changed_path: &str,
        source_change: &Change,
        target_change: &Change,
    ) -> Option<(ConflictType, Severity, Option<String>)> {
        let source_new = source_change.new_value()?;
        let target_new = target_change.new_value()?;
        if source_new == target_new {
            return None;
        }

        if path_has_key(changed_path, "operations") {
            return Some((
                ConflictType::InterfaceMismatch,
                Severity::Error,
                Some("align parameter and return types".to_string()),
            ));
        }

        let last = last_key(changed_path);

        if last == Some("cardinality") {
            if let (Some(s), Some(t)) = (source_new.as_str(), target_new.as_str()) {
                return Some(match widen_cardinality(s, t) {
                    Some(wider) if self.config.enable_cardinality_relaxation => (
                        ConflictType::Cardinality,
                        Severity::Info,
                        Some(format!("widen to {}", wider)),
                    ),
                    _ => (ConflictType::Cardinality, Severity::Error, None),
                });
            }
        }

        if last == Some("type") {
            if let (Some(s), Some(t)) = (source_new.as_str(), target_new.as_str()) {
                return Some(match widen_type_name(s, t) {
                    Some(wider) if self.config.enable_type_widening => (
                        ConflictType::ModifyModify,
                        Severity::Warn,
                        Some(format!("widen to {}", wider)),
                    ),
                    _ => (ConflictType::TypeChange, Severity::Error, None),
                });
            }
        }

        if path_has_key(changed_path, "constraints") {
            return Some((ConflictType::ConstraintConflict, Severity::Warn, None));
        }

        if matches!(source_change, Change::TypeChange { .. })
            || matches!(target_change, Change::TypeChange { .. })
        {
            return Some((ConflictType::TypeChange, Severity::Error, None));
        }

        if last.is_some_and(|key| SEMANTIC_FIELDS.contains(&key)) {
            return Some((ConflictType::ModifyModify, Severity::Error, None));
        }

        Some((ConflictType::ModifyModify, Severity::Warn, None))
    }
}

fn add_add_comparable(source: &Value, target: &Value) -> bool {
    source.is_object() && target.is_object()
        || source.is_array() && target.is_array()
        || source.is_string() && target.is_string()
}

/// Last mapping key of a path, ignoring trailing sequence selectors.
fn last_key(changed_path: &str) -> Option<&str> {
    changed_path.rsplit('.').find_map(|part| {
        let key = match part.find('[') {
            Some(0) => return None,
            Some(i) => &part[..i],
            None => part,
        };
        (!key.is_empty()).then_some(key)
    })
}

fn path_has_key(changed_path: &str, key: &str) -> bool {
    path::parse(changed_path)
        .map(|segments| {
            segments
                .iter()
                .any(|s| matches!(s, PathSegment::Key(k) if k == key))
        })
        .unwrap_or(false)
}

/// Distinct entities of the same kind sharing a `name` collide.
fn name_collisions(merged: &Value) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    let Some(kinds) = merged.as_object() else {
        return conflicts;
    };

    for (kind, entities) in kinds {
        let Some(entities) = entities.as_object() else {
            continue;
        };
        let mut by_name: BTreeMap<&str, Vec<&String>> = BTreeMap::new();
        for (entity_key, body) in entities {
            if let Some(name) = body.get("name").and_then(Value::as_str) {
                by_name.entry(name).or_default().push(entity_key);
            }
        }
        for (name, keys) in by_name {
            if keys.len() > 1 {
                let ids: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
                conflicts.push(Conflict::new(
                    ConflictType::NameCollision,
                    Severity::Error,
                    kind.clone(),
                    None,
                    None,
                    None,
                    format!("entities {} share the name '{}'", ids.join(", "), name),
                ));
            }
        }
    }
    conflicts
}


#[cfg(test)]
mod determinism_props {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn arb_leaf() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i32>().prop_map(serde_json::Value::from),
            "[a-z]{0,8}".prop_map(serde_json::Value::from),
        ]
    }

    // Mapping-shaped trees: the schema shape the engine is built for
    fn arb_tree() -> impl Strategy<Value = serde_json::Value> {
        arb_leaf().prop_recursive(3, 24, 4, |inner| {
            proptest::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                .prop_map(|m| json!(m))
        })
    }

    proptest! {
        #[test]
        fn merge_of_x_with_x_returns_x(base in arb_tree(), x in arb_tree()) {
            let result = MergeEngine::new(MergeConfig::default()).merge(&base, &x, &x);
            prop_assert_eq!(result.merged, Some(x));
        }

        #[test]
        fn merge_is_deterministic(base in arb_tree(), source in arb_tree(), target in arb_tree()) {
            let engine = MergeEngine::new(MergeConfig::default());
            let first = engine.merge(&base, &source, &target);
            let second = engine.merge(&base, &source, &target);
            prop_assert_eq!(first.merged, second.merged);
            prop_assert_eq!(first.status, second.status);
            let first_ids: Vec<String> = first.conflicts.iter().map(|c| c.id.clone()).collect();
            let second_ids: Vec<String> = second.conflicts.iter().map(|c| c.id.clone()).collect();
            prop_assert_eq!(first_ids, second_ids);
        }

        #[test]
        fn fast_forward_laws(base in arb_tree(), x in arb_tree()) {
            let engine = MergeEngine::new(MergeConfig::default());
            let forward = engine.merge(&base, &base, &x);
            prop_assert_eq!(forward.merged, Some(x.clone()));
            let backward = engine.merge(&base, &x, &base);
            prop_assert_eq!(backward.merged, Some(x));
        }
    }
}
