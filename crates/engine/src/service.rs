//! The ontology service: branch operations over the assembled subsystems

use chrono::Utc;
use ontos_audit::{AuditEvent, AuditStore, AuditTarget, PolicyIntegrityChecker};
use ontos_core::{
    Actor, CommitId, DocStore, MessageBus, OntosConfig, OntosError, OntosResult, SiemSink,
};
use ontos_locks::{BranchState, BranchStateInfo, LockManager};
use ontos_merge::{MergeConfig, MergeEngine, MergeResult, MergeStatus, MergeStrategy};
use ontos_outbox::{Dispatcher, EventSpec, Outbox};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Branches that may not be deleted without an explicit force by an
/// authorized actor: `main`, `production`, and `system*`.
pub fn is_protected_branch(name: &str) -> bool {
    name == "main" || name == "production" || name.starts_with("system")
}

/// The assembled core: lock manager, merge engine, outbox, audit store,
/// and the branch operations that compose them.
pub struct OntologyService<S: DocStore + 'static> {
    store: Arc<S>,
    locks: Arc<LockManager<S>>,
    merge: MergeEngine,
    outbox: Arc<Outbox<S>>,
    audit: Arc<AuditStore<S>>,
    policy_checker: Arc<PolicyIntegrityChecker<S>>,
    bus: Arc<dyn MessageBus>,
    config: OntosConfig,
}

impl<S: DocStore + 'static> OntologyService<S> {
    /// Construct the service: validate configuration, build every
    /// component, and rebuild the lock manager's cache from the store.
    pub fn new(
        store: Arc<S>,
        bus: Arc<dyn MessageBus>,
        siem: Option<Arc<dyn SiemSink>>,
        config: OntosConfig,
    ) -> OntosResult<Self> {
        config.validate()?;

        let audit = Arc::new(AuditStore::new(store.clone(), config.audit.clone()));
        let locks = Arc::new(LockManager::new(
            store.clone(),
            audit.clone(),
            config.lock.clone(),
        ));
        locks.load_from_store()?;

        let merge = MergeEngine::new(MergeConfig::from_settings(&config.merge));
        let outbox = Arc::new(Outbox::new(store.clone(), config.outbox.clone()));
        let policy_checker = Arc::new(PolicyIntegrityChecker::new(
            store.clone(),
            audit.clone(),
            siem,
            config.audit.siem_timeout(),
        ));

        info!("ontology service assembled");
        Ok(OntologyService {
            store,
            locks,
            merge,
            outbox,
            audit,
            policy_checker,
            bus,
            config,
        })
    }

    /// The underlying DocStore.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The lock manager.
    pub fn locks(&self) -> &Arc<LockManager<S>> {
        &self.locks
    }

    /// The merge engine.
    pub fn merge_engine(&self) -> &MergeEngine {
        &self.merge
    }

    /// The outbox.
    pub fn outbox(&self) -> &Arc<Outbox<S>> {
        &self.outbox
    }

    /// The audit store.
    pub fn audit(&self) -> &Arc<AuditStore<S>> {
        &self.audit
    }

    /// The policy tamper checker.
    pub fn policy_checker(&self) -> &Arc<PolicyIntegrityChecker<S>> {
        &self.policy_checker
    }

    /// The configuration in effect.
    pub fn config(&self) -> &OntosConfig {
        &self.config
    }

    /// Build the dispatcher for this service's outbox and bus.
    pub fn dispatcher(&self) -> Arc<Dispatcher<S>> {
        Arc::new(Dispatcher::new(
            self.outbox.clone(),
            self.bus.clone(),
            self.audit.clone(),
        ))
    }

    /// Current state of a branch.
    pub fn branch_state(&self, branch: &str) -> BranchStateInfo {
        self.locks.get_branch_state(branch)
    }

    /// Create a branch from a parent and announce it.
    pub fn create_branch(&self, name: &str, parent: &str, actor: &Actor) -> OntosResult<()> {
        self.store.create_branch(name, parent)?;

        self.audit_quietly(
            AuditEvent::new(
                "branch.create",
                actor.clone(),
                AuditTarget::new("branch", name).on_branch(name),
            )
            .with_metadata(json!({"parent": parent})),
        );
        self.publish_quietly(
            EventSpec::new("com.oms.branch.created", json!({"branch": name, "parent": parent}))
                .subject(format!("branch/{}", name)),
        );
        Ok(())
    }

    /// Delete a branch.
    ///
    /// Protected branches require `force` from an authorized actor, and a
    /// branch with live locks cannot be deleted at all.
    pub fn delete_branch(&self, name: &str, actor: &Actor, force: bool) -> OntosResult<bool> {
        if is_protected_branch(name) && !force {
            return Err(OntosError::invalid_input(format!(
                "branch '{}' is protected; deletion requires force",
                name
            )));
        }
        let live = self.locks.list_active_locks(Some(name));
        if !live.is_empty() {
            return Err(OntosError::invalid_input(format!(
                "branch '{}' has {} active locks",
                name,
                live.len()
            )));
        }

        let deleted = self.store.delete_branch(name)?;
        if deleted {
            self.audit_quietly(
                AuditEvent::new(
                    "branch.delete",
                    actor.clone(),
                    AuditTarget::new("branch", name).on_branch(name),
                )
                .with_metadata(json!({"forced": force})),
            );
            self.publish_quietly(
                EventSpec::new("com.oms.branch.deleted", json!({"branch": name}))
                    .subject(format!("branch/{}", name)),
            );
        }
        Ok(deleted)
    }

    /// Commit a schema tree to a branch: the write path.
    ///
    /// The write permission check consults branch state and live locks;
    /// the outbox row is written in the same transaction as the schema
    /// bookkeeping so delivery matches the commit outcome.
    pub fn commit_schema(
        &self,
        branch: &str,
        tree: Value,
        actor: &Actor,
        message: &str,
        resource_type: Option<&str>,
    ) -> OntosResult<CommitId> {
        let (allowed, reason) = self
            .locks
            .check_write_permission(branch, "schema.commit", resource_type);
        if !allowed {
            return Err(OntosError::invalid_input(reason));
        }

        let commit = self
            .store
            .commit_tree(branch, tree, &actor.name, message)?;

        self.publish_quietly(
            EventSpec::new(
                "com.oms.schema.updated",
                json!({"branch": branch, "commit": commit.to_string(), "message": message}),
            )
            .subject(format!("branch/{}", branch)),
        );
        self.audit_quietly(
            AuditEvent::new(
                "schema.update",
                actor.clone(),
                AuditTarget::new("commit", commit.to_string()).on_branch(branch),
            )
            .with_metadata(json!({"message": message})),
        );
        Ok(commit)
    }

    /// Merge `source` into `target`.
    ///
    /// The target branch passes through `MERGING` for the duration; on a
    /// clean merge the merged tree is committed to the target, the change
    /// event is staged in the outbox, and the branch returns to `ACTIVE`.
    /// A dry run computes the same result but never commits.
    pub fn merge_branches(
        &self,
        source: &str,
        target: &str,
        strategy: MergeStrategy,
        actor: &Actor,
        dry_run: bool,
    ) -> OntosResult<MergeResult> {
        let started = Utc::now();
        let (allowed, reason) = self
            .locks
            .check_write_permission(target, "branch.merge", None);
        if !allowed {
            return Err(OntosError::invalid_input(reason));
        }

        // READY resolves back to ACTIVE before a merge may start
        if self.locks.get_branch_state(target).current_state == BranchState::Ready {
            self.locks.set_branch_state(
                target,
                BranchState::Active,
                &actor.name,
                "Preparing merge",
            )?;
        }
        self.locks.set_branch_state(
            target,
            BranchState::Merging,
            &actor.name,
            &format!("Merging '{}' into '{}'", source, target),
        )?;

        let merge_outcome = self.run_merge(source, target, strategy, actor, dry_run);

        match &merge_outcome {
            Ok(result)
                if matches!(
                    result.status,
                    MergeStatus::Success
                        | MergeStatus::FastForward
                        | MergeStatus::DryRunSuccess
                        | MergeStatus::Partial
                        | MergeStatus::Blocked
                ) =>
            {
                // The branch is intact whether or not the merge landed
                self.locks.set_branch_state(
                    target,
                    BranchState::Active,
                    &actor.name,
                    "Merge finished",
                )?;
            }
            _ => {
                // Unrecoverable failure: force ERROR, which also releases
                // every lock on the branch
                if let Err(e) = self.locks.set_branch_state(
                    target,
                    BranchState::Error,
                    &actor.name,
                    "Merge failed",
                ) {
                    error!(branch = target, error = %e, "failed to mark branch errored");
                }
            }
        }

        let result = merge_outcome?;
        let duration_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
        self.audit_quietly(
            AuditEvent::new(
                "branch.merge",
                actor.clone(),
                AuditTarget::new("branch", target).on_branch(target),
            )
            .with_metadata(json!({
                "source": source,
                "strategy": result.strategy.as_str(),
                "status": result.status.as_str(),
                "conflicts": result.conflicts.len(),
                "auto_resolved": result.auto_resolved_count,
                "dry_run": dry_run,
            }))
            .with_duration_ms(duration_ms),
        );
        Ok(result)
    }

    fn run_merge(
        &self,
        source: &str,
        target: &str,
        strategy: MergeStrategy,
        actor: &Actor,
        dry_run: bool,
    ) -> OntosResult<MergeResult> {
        let source_head = self.head_or_err(source)?;
        let target_head = self.head_or_err(target)?;

        let base_tree = match self
            .store
            .lowest_common_ancestor(source_head, target_head)?
        {
            Some(ancestor) => self.store.tree_at(ancestor)?,
            None => json!({}),
        };
        let source_tree = self.store.tree_at(source_head)?;
        let target_tree = self.store.tree_at(target_head)?;

        let mut result =
            self.merge
                .merge_with_strategy(&base_tree, &source_tree, &target_tree, strategy);

        if dry_run {
            if matches!(
                result.status,
                MergeStatus::Success | MergeStatus::FastForward
            ) {
                result.status = MergeStatus::DryRunSuccess;
            }
            return Ok(result);
        }

        if matches!(
            result.status,
            MergeStatus::Success | MergeStatus::FastForward
        ) {
            let merged_tree = result
                .merged
                .clone()
                .ok_or_else(|| OntosError::internal("successful merge without a tree"))?;
            let commit = self.store.commit_tree(
                target,
                merged_tree,
                &actor.name,
                &format!("Merge '{}' into '{}'", source, target),
            )?;

            self.publish_quietly(
                EventSpec::new(
                    "com.oms.branch.merged",
                    json!({
                        "source": source,
                        "target": target,
                        "merge_commit": commit.to_string(),
                        "strategy": result.strategy.as_str(),
                    }),
                )
                .subject(format!("branch/{}", target)),
            );
            info!(source, target, commit = %commit, "branches merged");
        } else {
            warn!(
                source,
                target,
                status = result.status.as_str(),
                conflicts = result.conflicts.len(),
                "merge did not land"
            );
        }
        Ok(result)
    }

    /// Analyze conflicts between two branches without merging.
    pub fn analyze_conflicts(
        &self,
        source: &str,
        target: &str,
    ) -> OntosResult<ontos_merge::ConflictAnalysis> {
        let source_head = self.head_or_err(source)?;
        let target_head = self.head_or_err(target)?;
        let base_tree = match self
            .store
            .lowest_common_ancestor(source_head, target_head)?
        {
            Some(ancestor) => self.store.tree_at(ancestor)?,
            None => json!({}),
        };
        let source_tree = self.store.tree_at(source_head)?;
        let target_tree = self.store.tree_at(target_head)?;
        Ok(self
            .merge
            .analyze_conflicts(&base_tree, &source_tree, &target_tree))
    }

    fn head_or_err(&self, branch: &str) -> OntosResult<CommitId> {
        self.store
            .head(branch)?
            .ok_or_else(|| OntosError::invalid_input(format!("branch '{}' has no commits", branch)))
    }

    fn audit_quietly(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(event) {
            warn!(error = %e, "failed to record audit event");
        }
    }

    fn publish_quietly(&self, spec: EventSpec) {
        if let Err(e) = self.outbox.publish(spec) {
            warn!(error = %e, "failed to stage outbox event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ontos_core::OntosResult;
    use ontos_store::MemoryDocStore;
    use std::time::Duration;

    struct NoopBus;

    impl MessageBus for NoopBus {
        fn publish(
            &self,
            _subject: &str,
            _payload: &[u8],
            _headers: &[(&str, &str)],
            _deadline: Duration,
        ) -> OntosResult<()> {
            Ok(())
        }
    }

    fn service() -> Arc<OntologyService<MemoryDocStore>> {
        Arc::new(
            OntologyService::new(
                Arc::new(MemoryDocStore::new()),
                Arc::new(NoopBus),
                None,
                OntosConfig::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_protected_branch_predicate() {
        assert!(is_protected_branch("main"));
        assert!(is_protected_branch("production"));
        assert!(is_protected_branch("system"));
        assert!(is_protected_branch("system-config"));
        assert!(!is_protected_branch("feature-x"));
        assert!(!is_protected_branch("dev"));
    }

    #[test]
    fn test_construction_rejects_bad_config() {
        let mut config = OntosConfig::default();
        config.outbox.batch_size = 0;

        let err = OntologyService::new(
            Arc::new(MemoryDocStore::new()),
            Arc::new(NoopBus),
            None,
            config,
        )
        .unwrap_err();
        assert!(matches!(err, OntosError::Config { .. }));
    }

    #[test]
    fn test_create_branch_audits_and_stages_event() {
        let service = service();
        let actor = Actor::user("u-1", "alice");
        service.create_branch("feature", "main", &actor).unwrap();

        let stats = service.outbox().statistics().unwrap();
        assert_eq!(stats.pending, 1);

        let page = service
            .audit()
            .query(&ontos_audit::AuditFilter {
                actions: vec!["branch.create".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total_count, 1);
    }

    #[test]
    fn test_commit_denied_while_branch_is_frozen() {
        let service = service();
        let actor = Actor::user("u-1", "alice");

        service
            .locks()
            .lock_for_indexing("main", "indexer", None, true)
            .unwrap();

        let err = service
            .commit_schema("main", json!({"v": 1}), &actor, "blocked", None)
            .unwrap_err();
        assert!(err.to_string().contains("LOCKED_FOR_WRITE"));
    }

    #[test]
    fn test_merge_requires_commits_on_both_branches() {
        let service = service();
        let actor = Actor::user("u-1", "alice");
        service.create_branch("feature", "main", &actor).unwrap();

        // Neither branch has a head yet
        let err = service
            .merge_branches("feature", "main", MergeStrategy::Auto, &actor, false)
            .unwrap_err();
        assert!(err.to_string().contains("no commits"));
        // The failed attempt left the branch errored for investigation
        assert_eq!(
            service.branch_state("main").current_state,
            BranchState::Error
        );
    }
}
