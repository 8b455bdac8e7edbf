//! Merge engine end-to-end: widening, blocking cycles, fast-forward laws,
//! and the branch-level merge flow.

mod common;

use common::service;
use ontos::{
    Actor, BranchState, ConflictType, MergeStatus, MergeStrategy, Severity,
};
use ontos::DocStore;
use serde_json::json;

fn alice() -> Actor {
    Actor::user("u-1", "alice")
}

/// Seed main, fork a feature branch, and commit diverged trees.
fn seed_branches(
    service: &ontos::OntologyService<ontos::MemoryDocStore>,
    base: serde_json::Value,
    feature_tree: serde_json::Value,
    main_tree: serde_json::Value,
) {
    service
        .commit_schema("main", base, &alice(), "base schema", None)
        .unwrap();
    service.create_branch("feature", "main", &alice()).unwrap();
    service
        .commit_schema("feature", feature_tree, &alice(), "feature change", None)
        .unwrap();
    service
        .commit_schema("main", main_tree, &alice(), "main change", None)
        .unwrap();
}

#[test]
fn auto_resolved_type_widening() {
    let (_, _, service) = service();

    let base = json!({"object_types": {"Person": {
        "name": "Person",
        "properties": {"label": {"type": "string"}},
        "description": "v1"
    }}});
    // Feature widens the property type
    let feature = json!({"object_types": {"Person": {
        "name": "Person",
        "properties": {"label": {"type": "text"}},
        "description": "v1"
    }}});
    // Main keeps string but edits an unrelated field
    let main = json!({"object_types": {"Person": {
        "name": "Person",
        "properties": {"label": {"type": "string"}},
        "description": "v2"
    }}});
    seed_branches(&service, base, feature, main);

    let result = service
        .merge_branches("feature", "main", MergeStrategy::Auto, &alice(), false)
        .unwrap();

    assert_eq!(result.status, MergeStatus::Success);
    assert!(result.conflicts.is_empty());
    assert_eq!(result.auto_resolved_count, 1);

    let merged = result.merged.unwrap();
    assert_eq!(
        merged["object_types"]["Person"]["properties"]["label"]["type"],
        "text"
    );
    // The merge landed on main and the branch is back to ACTIVE
    assert_eq!(
        service.branch_state("main").current_state,
        BranchState::Active
    );
}

#[test]
fn circular_dependency_blocks_the_merge() {
    let (_, _, service) = service();

    let base = json!({"object_types": {
        "Person": {"name": "Person", "properties": {}},
        "Organization": {"name": "Organization", "properties": {}}
    }});
    let feature = json!({"object_types": {
        "Person": {"name": "Person", "properties": {
            "org": {"type": "ref", "target": "Organization"}
        }},
        "Organization": {"name": "Organization", "properties": {}}
    }});
    let main = json!({"object_types": {
        "Person": {"name": "Person", "properties": {}},
        "Organization": {"name": "Organization", "properties": {
            "owner": {"type": "ref", "target": "Person"}
        }}
    }});
    seed_branches(&service, base, feature, main);

    let head_before = service.store().head("main").unwrap();
    let result = service
        .merge_branches("feature", "main", MergeStrategy::Auto, &alice(), false)
        .unwrap();

    assert_eq!(result.status, MergeStatus::Blocked);
    let blocker = result
        .conflicts
        .iter()
        .find(|c| c.conflict_type == ConflictType::CircularDependency)
        .expect("circular dependency conflict");
    assert_eq!(blocker.severity, Severity::Block);
    assert_eq!(blocker.path, "");

    // Nothing was committed; the branch recovered to ACTIVE
    assert_eq!(service.store().head("main").unwrap(), head_before);
    assert_eq!(
        service.branch_state("main").current_state,
        BranchState::Active
    );
}

#[test]
fn fast_forward_when_target_unchanged() {
    let (_, _, service) = service();

    service
        .commit_schema("main", json!({"v": 1}), &alice(), "base", None)
        .unwrap();
    service.create_branch("feature", "main", &alice()).unwrap();
    service
        .commit_schema("feature", json!({"v": 2}), &alice(), "ahead", None)
        .unwrap();

    let result = service
        .merge_branches("feature", "main", MergeStrategy::Auto, &alice(), false)
        .unwrap();
    assert_eq!(result.status, MergeStatus::FastForward);
    assert_eq!(result.merged, Some(json!({"v": 2})));

    // Main's head now carries the feature tree
    let head = service.store().head("main").unwrap().unwrap();
    assert_eq!(service.store().tree_at(head).unwrap(), json!({"v": 2}));
}

#[test]
fn merge_of_identical_branches_returns_base_unchanged() {
    let (_, _, service) = service();

    service
        .commit_schema("main", json!({"v": 1}), &alice(), "base", None)
        .unwrap();
    service.create_branch("feature", "main", &alice()).unwrap();

    let result = service
        .merge_branches("feature", "main", MergeStrategy::Auto, &alice(), false)
        .unwrap();
    assert_eq!(result.status, MergeStatus::FastForward);
    assert_eq!(result.merged, Some(json!({"v": 1})));
    assert!(result.conflicts.is_empty());
}

#[test]
fn dry_run_never_commits() {
    let (_, _, service) = service();

    service
        .commit_schema("main", json!({"v": 1}), &alice(), "base", None)
        .unwrap();
    service.create_branch("feature", "main", &alice()).unwrap();
    service
        .commit_schema("feature", json!({"v": 2}), &alice(), "change", None)
        .unwrap();

    let head_before = service.store().head("main").unwrap();
    let result = service
        .merge_branches("feature", "main", MergeStrategy::Auto, &alice(), true)
        .unwrap();

    assert_eq!(result.status, MergeStatus::DryRunSuccess);
    assert_eq!(service.store().head("main").unwrap(), head_before);
    assert_eq!(
        service.branch_state("main").current_state,
        BranchState::Active
    );
}

#[test]
fn conflict_analysis_between_branches() {
    let (_, _, service) = service();

    let base = json!({"object_types": {"P": {"name": "P", "properties": {"x": {"type": "string"}}}}});
    let feature = json!({"object_types": {"P": {"name": "P", "properties": {"x": {"type": "int"}}}}});
    let main = json!({"object_types": {"P": {"name": "P", "properties": {"x": {"type": "text"}}}}});
    seed_branches(&service, base, feature, main);

    let analysis = service.analyze_conflicts("feature", "main").unwrap();
    assert_eq!(analysis.total_conflicts, 1);
    assert_eq!(analysis.max_severity, Some(Severity::Error));
    assert_eq!(analysis.by_type["type_change"], 1);
}

#[test]
fn merge_is_deterministic_across_runs() {
    let build = || {
        let (_, _, service) = service();
        let base = json!({"object_types": {"P": {"name": "P", "properties": {
            "x": {"type": "string"}, "y": {"type": "int"}
        }}}});
        let feature = json!({"object_types": {"P": {"name": "P", "properties": {
            "x": {"type": "text"}, "y": {"type": "int"}
        }}}});
        let main = json!({"object_types": {"P": {"name": "P", "properties": {
            "x": {"type": "string"}, "y": {"type": "long"}
        }}}});
        seed_branches(&service, base, feature, main);
        service
            .merge_branches("feature", "main", MergeStrategy::Auto, &alice(), true)
            .unwrap()
    };

    let first = build();
    let second = build();
    assert_eq!(
        first.merged.map(|v| ontos::canonical_json(&v)),
        second.merged.map(|v| ontos::canonical_json(&v)),
    );
}

#[test]
fn protected_branches_refuse_unforced_deletion() {
    let (_, _, service) = service();

    let err = service
        .delete_branch("main", &alice(), false)
        .unwrap_err();
    assert!(err.to_string().contains("protected"));

    service.create_branch("scratch", "main", &alice()).unwrap();
    assert!(service.delete_branch("scratch", &alice(), false).unwrap());
}

#[test]
fn branch_with_live_locks_cannot_be_deleted() {
    let (_, _, service) = service();
    service.create_branch("feature", "main", &alice()).unwrap();
    service
        .locks()
        .acquire_lock(ontos::AcquireRequest::new(
            "feature",
            ontos::LockKind::Manual,
            ontos::LockScope::Branch,
            "admin",
        ))
        .unwrap();

    let err = service
        .delete_branch("feature", &alice(), false)
        .unwrap_err();
    assert!(err.to_string().contains("active locks"));
}

#[test]
fn merge_audited_with_outcome() {
    let (_, _, service) = service();
    service
        .commit_schema("main", json!({"v": 1}), &alice(), "base", None)
        .unwrap();
    service.create_branch("feature", "main", &alice()).unwrap();
    service
        .commit_schema("feature", json!({"v": 2}), &alice(), "ahead", None)
        .unwrap();
    service
        .merge_branches("feature", "main", MergeStrategy::Auto, &alice(), false)
        .unwrap();

    let page = service
        .audit()
        .query(&ontos::AuditFilter {
            actions: vec!["branch.merge".to_string()],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.total_count, 1);
    let metadata = page.events[0].event.metadata.as_ref().unwrap();
    assert_eq!(metadata["source"], "feature");
    assert_eq!(metadata["status"], "fast_forward");
}
