//! Lock manager: acquisition, release, heartbeats, and branch state
//!
//! ## Thread safety
//!
//! Acquisition must be atomic with respect to other acquires on the same
//! branch. Each branch has a guard mutex in a `DashMap`; the critical
//! section (conflict check + lock table update) runs under that guard and
//! never blocks on external work except the DocStore write, which is the
//! atomic persistence boundary. Operations on different branches proceed
//! in parallel.
//!
//! ## Persistence
//!
//! The in-memory tables are a cache; every mutation writes through to the
//! `locks` / `branch_state` / `branch_state_journal` collections, and
//! [`LockManager::load_from_store`] rebuilds the cache on startup.

use crate::lock::{AcquireRequest, Lock, LockHealth, LockKind, LockScope, ReleaseReason};
use crate::state::{is_valid_transition, BranchState, BranchStateInfo, StateTransition};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ontos_audit::{AuditEvent, AuditStore, AuditTarget};
use ontos_core::{
    now_utc, Actor, AuditId, DocStore, Document, LockConfig, LockId, OntosError, OntosResult,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Collection holding active lock leases
pub const LOCKS: &str = "locks";
/// Collection holding per-branch state records
pub const BRANCH_STATE: &str = "branch_state";
/// Collection journaling every state transition
pub const BRANCH_STATE_JOURNAL: &str = "branch_state_journal";

/// Resource types locked by default when indexing without an explicit list.
const DEFAULT_INDEXING_RESOURCE_TYPES: &[&str] = &["object_type", "link_type", "action_type"];

/// Heartbeat period used for indexing locks.
const INDEXING_HEARTBEAT_SECS: i64 = 120;

/// Lease-based lock manager over a DocStore.
pub struct LockManager<S: DocStore> {
    store: Arc<S>,
    audit: Arc<AuditStore<S>>,
    config: LockConfig,
    branch_states: DashMap<String, BranchStateInfo>,
    active_locks: DashMap<LockId, Lock>,
    branch_guards: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: DocStore> LockManager<S> {
    /// Create a manager with empty caches.
    pub fn new(store: Arc<S>, audit: Arc<AuditStore<S>>, config: LockConfig) -> Self {
        LockManager {
            store,
            audit,
            config,
            branch_states: DashMap::new(),
            active_locks: DashMap::new(),
            branch_guards: DashMap::new(),
        }
    }

    /// The lock configuration in effect.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Rebuild the in-memory tables from persisted state. Returns
    /// `(locks, branch_states)` loaded.
    pub fn load_from_store(&self) -> OntosResult<(usize, usize)> {
        let lock_docs = self.store.find(LOCKS, &|_| true)?;
        let mut locks = 0usize;
        for doc in lock_docs {
            let lock: Lock = doc.to_record()?;
            self.active_locks.insert(lock.id, lock);
            locks += 1;
        }

        let state_docs = self.store.find(BRANCH_STATE, &|_| true)?;
        let mut states = 0usize;
        for doc in state_docs {
            let info: BranchStateInfo = doc.to_record()?;
            self.branch_states.insert(info.branch.clone(), info);
            states += 1;
        }

        info!(locks, states, "lock manager state loaded");
        Ok((locks, states))
    }

    fn branch_guard(&self, branch: &str) -> Arc<Mutex<()>> {
        self.branch_guards
            .entry(branch.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Current state of a branch. Unknown branches default to `ACTIVE`.
    /// Never fails.
    pub fn get_branch_state(&self, branch: &str) -> BranchStateInfo {
        self.branch_states
            .entry(branch.to_string())
            .or_insert_with(|| BranchStateInfo::initial(branch))
            .clone()
    }

    /// Set a branch state directly (for external event handlers).
    ///
    /// Setting the current state again is a no-op. Entering `ERROR`
    /// releases every lock on the branch.
    pub fn set_branch_state(
        &self,
        branch: &str,
        new_state: BranchState,
        changed_by: &str,
        reason: &str,
    ) -> OntosResult<()> {
        let guard = self.branch_guard(branch);
        let _held = guard.lock();

        let current = self.get_branch_state(branch);
        if current.current_state == new_state {
            debug!(branch, state = %new_state, "branch already in requested state");
            return Ok(());
        }

        self.transition_locked(branch, new_state, changed_by, reason)?;

        if new_state == BranchState::Error {
            self.release_all_for_branch(branch, ReleaseReason::ErrorState, changed_by);
        }
        Ok(())
    }

    /// Apply and persist a validated transition. Caller holds the branch
    /// guard.
    fn transition_locked(
        &self,
        branch: &str,
        to: BranchState,
        changed_by: &str,
        reason: &str,
    ) -> OntosResult<StateTransition> {
        let mut info = self.get_branch_state(branch);
        let from = info.current_state;
        if !is_valid_transition(from, to) {
            return Err(OntosError::invalid_transition(
                branch,
                from.as_str(),
                to.as_str(),
            ));
        }

        let transition = info.apply_transition(to, changed_by, reason);
        self.persist_state(&info, Some(&transition))?;
        self.branch_states.insert(branch.to_string(), info);

        info!(branch, from = %from, to = %to, by = changed_by, "branch state transition");
        self.audit_quietly(
            AuditEvent::new(
                "branch.state_changed",
                Actor::service(changed_by),
                AuditTarget::new("branch", branch).on_branch(branch),
            )
            .with_metadata(json!({
                "from": from.as_str(),
                "to": to.as_str(),
                "reason": reason,
            })),
        );
        Ok(transition)
    }

    fn persist_state(
        &self,
        info: &BranchStateInfo,
        transition: Option<&StateTransition>,
    ) -> OntosResult<()> {
        let state_doc = Document::from_record(info.branch.clone(), info)?;
        let journal_doc = match transition {
            Some(t) => Some(Document::from_record(AuditId::new().to_string(), t)?),
            None => None,
        };
        self.store.txn(&mut |t| {
            t.replace(BRANCH_STATE, state_doc.clone())?;
            if let Some(doc) = &journal_doc {
                t.insert(BRANCH_STATE_JOURNAL, doc.clone())?;
            }
            Ok(())
        })
    }

    /// Acquire a lock. Fails with `LockConflict` carrying the id of the
    /// first live conflicting lock.
    pub fn acquire_lock(&self, request: AcquireRequest) -> OntosResult<LockId> {
        match request.scope {
            LockScope::ResourceType if request.resource_type.is_none() => {
                return Err(OntosError::invalid_input(
                    "resource_type scope requires a resource_type",
                ));
            }
            LockScope::Resource
                if request.resource_type.is_none() || request.resource_id.is_none() =>
            {
                return Err(OntosError::invalid_input(
                    "resource scope requires resource_type and resource_id",
                ));
            }
            _ => {}
        }

        let now = now_utc();
        let ttl = request
            .ttl
            .unwrap_or_else(|| request.kind.default_ttl(&self.config));
        let heartbeat_interval_secs = request
            .heartbeat_interval
            .map(|d| d.num_seconds().max(0) as u64)
            .unwrap_or(0);

        let lock = Lock {
            id: LockId::new(),
            branch: request.branch.clone(),
            kind: request.kind,
            scope: request.scope,
            resource_type: request.resource_type,
            resource_id: request.resource_id,
            holder: request.holder.clone(),
            reason: request.reason.clone(),
            acquired_at: now,
            expires_at: now + ttl,
            heartbeat_interval_secs,
            last_heartbeat: (heartbeat_interval_secs > 0).then_some(now),
            heartbeat_source: (heartbeat_interval_secs > 0).then(|| request.holder.clone()),
            auto_release: request.auto_release,
        };

        let guard = self.branch_guard(&request.branch);
        let _held = guard.lock();

        // Conflict set against all live locks on this branch
        for existing in self.active_locks.iter() {
            if existing.is_live(now, self.config.heartbeat_grace)
                && existing.conflicts_with(&lock)
            {
                debug!(
                    branch = %request.branch,
                    conflicting = %existing.id,
                    "lock acquisition blocked"
                );
                return Err(OntosError::lock_conflict(request.branch, existing.id));
            }
        }

        // Branch-wide indexing freezes the branch
        let transitions = lock.kind == LockKind::Indexing
            && lock.scope == LockScope::Branch
            && self.get_branch_state(&lock.branch).current_state == BranchState::Active;

        let lock_doc = Document::from_record(lock.id.to_string(), &lock)?;
        if transitions {
            let mut info = self.get_branch_state(&lock.branch);
            let transition = info.apply_transition(
                BranchState::LockedForWrite,
                &lock.holder,
                &format!("Indexing lock acquired: {}", lock.reason),
            );
            let state_doc = Document::from_record(info.branch.clone(), &info)?;
            let journal_doc = Document::from_record(AuditId::new().to_string(), &transition)?;
            self.store.txn(&mut |t| {
                t.insert(LOCKS, lock_doc.clone())?;
                t.replace(BRANCH_STATE, state_doc.clone())?;
                t.insert(BRANCH_STATE_JOURNAL, journal_doc.clone())?;
                Ok(())
            })?;
            self.branch_states.insert(info.branch.clone(), info);
        } else {
            self.store.insert(LOCKS, lock_doc)?;
        }

        let id = lock.id;
        info!(
            lock_id = %id,
            branch = %lock.branch,
            kind = %lock.kind,
            holder = %lock.holder,
            expires_at = %lock.expires_at,
            "lock acquired"
        );
        self.audit_quietly(
            AuditEvent::new(
                "lock.acquired",
                Actor::service(&lock.holder),
                AuditTarget::new("lock", id.to_string()).on_branch(&lock.branch),
            )
            .with_metadata(json!({
                "kind": lock.kind.as_str(),
                "scope": format!("{:?}", lock.scope),
                "resource_type": lock.resource_type,
                "reason": lock.reason,
            })),
        );
        self.active_locks.insert(id, lock);
        Ok(id)
    }

    /// Release a lock. Releasing an unknown lock is a non-fatal no-op.
    pub fn release_lock(&self, lock_id: LockId, released_by: &str) -> OntosResult<bool> {
        self.release_with_reason(lock_id, released_by, ReleaseReason::Released)
    }

    fn release_with_reason(
        &self,
        lock_id: LockId,
        released_by: &str,
        reason: ReleaseReason,
    ) -> OntosResult<bool> {
        let Some(lock) = self.active_locks.get(&lock_id).map(|l| l.clone()) else {
            warn!(lock_id = %lock_id, "attempted to release unknown lock");
            return Ok(false);
        };

        let guard = self.branch_guard(&lock.branch);
        let _held = guard.lock();

        // Releasing twice is a no-op; another thread may have won the race
        if self.active_locks.remove(&lock_id).is_none() {
            return Ok(false);
        }
        self.store.delete(LOCKS, &lock_id.to_string())?;

        info!(
            lock_id = %lock_id,
            branch = %lock.branch,
            by = released_by,
            reason = reason.as_str(),
            "lock released"
        );
        self.audit_quietly(
            AuditEvent::new(
                "lock.released",
                Actor::service(released_by),
                AuditTarget::new("lock", lock_id.to_string()).on_branch(&lock.branch),
            )
            .with_metadata(json!({
                "reason": reason.as_str(),
                "kind": lock.kind.as_str(),
                "holder": lock.holder,
            })),
        );

        // Last indexing lock gone moves a frozen branch to READY
        if lock.kind == LockKind::Indexing
            && self.get_branch_state(&lock.branch).current_state == BranchState::LockedForWrite
            && !self.has_live_indexing_locks(&lock.branch)
        {
            self.transition_locked(
                &lock.branch,
                BranchState::Ready,
                released_by,
                "All indexing locks released, ready for merge",
            )?;
        }
        Ok(true)
    }

    fn has_live_indexing_locks(&self, branch: &str) -> bool {
        let now = now_utc();
        self.active_locks.iter().any(|l| {
            l.branch == branch
                && l.kind == LockKind::Indexing
                && l.is_live(now, self.config.heartbeat_grace)
        })
    }

    fn release_all_for_branch(&self, branch: &str, reason: ReleaseReason, by: &str) -> usize {
        let ids: Vec<LockId> = self
            .active_locks
            .iter()
            .filter(|l| l.branch == branch)
            .map(|l| l.id)
            .collect();

        let mut released = 0usize;
        for id in &ids {
            if self.active_locks.remove(id).is_some() {
                if let Err(e) = self.store.delete(LOCKS, &id.to_string()) {
                    warn!(lock_id = %id, error = %e, "failed to delete released lock");
                }
                self.audit_quietly(
                    AuditEvent::new(
                        "lock.released",
                        Actor::service(by),
                        AuditTarget::new("lock", id.to_string()).on_branch(branch),
                    )
                    .with_metadata(json!({"reason": reason.as_str()})),
                );
                released += 1;
            }
        }
        if released > 0 {
            info!(branch, released, reason = reason.as_str(), "branch locks released");
        }
        released
    }

    /// Record a heartbeat for a lock. Unknown or dead locks fail silently
    /// for the caller but are logged.
    pub fn send_heartbeat(
        &self,
        lock_id: LockId,
        service: &str,
        status: &str,
        progress: Option<serde_json::Value>,
    ) -> OntosResult<bool> {
        let now = now_utc();
        let updated = match self.active_locks.get_mut(&lock_id) {
            Some(mut lock) if lock.is_live(now, self.config.heartbeat_grace) => {
                lock.last_heartbeat = Some(now);
                lock.heartbeat_source = Some(service.to_string());
                lock.clone()
            }
            _ => {
                warn!(lock_id = %lock_id, service, "heartbeat for unknown or dead lock");
                return Ok(false);
            }
        };

        let doc = Document::from_record(lock_id.to_string(), &updated)?;
        self.store.replace(LOCKS, doc)?;
        debug!(lock_id = %lock_id, service, status, progress = ?progress, "heartbeat recorded");
        Ok(true)
    }

    /// Extend a live lock's TTL. Dead or unknown locks return false.
    pub fn extend_lock_ttl(
        &self,
        lock_id: LockId,
        extension: chrono::Duration,
        extended_by: &str,
        reason: &str,
    ) -> OntosResult<bool> {
        let now = now_utc();
        let updated = match self.active_locks.get_mut(&lock_id) {
            Some(mut lock) if lock.is_live(now, self.config.heartbeat_grace) => {
                lock.expires_at = lock.expires_at + extension;
                lock.clone()
            }
            _ => {
                warn!(lock_id = %lock_id, "attempted to extend unknown or dead lock");
                return Ok(false);
            }
        };

        let doc = Document::from_record(lock_id.to_string(), &updated)?;
        self.store.replace(LOCKS, doc)?;
        info!(
            lock_id = %lock_id,
            by = extended_by,
            new_expiry = %updated.expires_at,
            reason,
            "lock TTL extended"
        );
        self.audit_quietly(
            AuditEvent::new(
                "lock.extended",
                Actor::service(extended_by),
                AuditTarget::new("lock", lock_id.to_string()).on_branch(&updated.branch),
            )
            .with_metadata(json!({
                "new_expiry": updated.expires_at.to_rfc3339(),
                "reason": reason,
            })),
        );
        Ok(true)
    }

    /// Release every lock on a branch and reset it to `ACTIVE` (admin
    /// override). Returns the number of locks released.
    pub fn force_unlock(&self, branch: &str, admin: &str, reason: &str) -> OntosResult<usize> {
        let guard = self.branch_guard(branch);
        let _held = guard.lock();

        let released = self.release_all_for_branch(branch, ReleaseReason::ForceUnlock, admin);

        // Compose legal transitions back to ACTIVE where needed
        let mut state = self.get_branch_state(branch).current_state;
        if state == BranchState::LockedForWrite {
            self.transition_locked(branch, BranchState::Ready, admin, reason)?;
            state = BranchState::Ready;
        }
        if state != BranchState::Active && is_valid_transition(state, BranchState::Active) {
            self.transition_locked(
                branch,
                BranchState::Active,
                admin,
                &format!("Force unlock: {}", reason),
            )?;
        }

        warn!(branch, admin, released, reason, "force unlock performed");
        self.audit_quietly(
            AuditEvent::new(
                "branch.force_unlocked",
                Actor::user(admin, admin),
                AuditTarget::new("branch", branch).on_branch(branch),
            )
            .with_metadata(json!({"released": released, "reason": reason})),
        );
        Ok(released)
    }

    /// Check whether a write is currently allowed on a branch.
    /// Returns `(allowed, reason_if_not)`.
    pub fn check_write_permission(
        &self,
        branch: &str,
        action: &str,
        resource_type: Option<&str>,
    ) -> (bool, String) {
        let info = self.get_branch_state(branch);
        if !info.current_state.allows_writes() {
            return (
                false,
                format!(
                    "branch '{}' is in state {} which blocks {}",
                    branch, info.current_state, action
                ),
            );
        }

        let now = now_utc();
        for lock in self.active_locks.iter() {
            if lock.branch == branch
                && lock.is_live(now, self.config.heartbeat_grace)
                && lock.covers_resource_type(resource_type)
            {
                return (
                    false,
                    format!(
                        "{} blocked by {} lock {} held by {}",
                        action, lock.kind, lock.id, lock.holder
                    ),
                );
            }
        }
        (true, String::new())
    }

    /// Lock resources for indexing with minimal scope.
    ///
    /// By default one lock per resource type is taken so unrelated types
    /// stay editable; a conflict on one type skips it without aborting the
    /// rest. `force` requests a single branch-wide lock instead (which
    /// freezes the branch).
    pub fn lock_for_indexing(
        &self,
        branch: &str,
        holder: &str,
        resource_types: Option<Vec<String>>,
        force: bool,
    ) -> OntosResult<Vec<LockId>> {
        let mut ids = Vec::new();

        if force {
            warn!(branch, holder, "full branch indexing lock requested");
            let id = self.acquire_lock(
                AcquireRequest::new(branch, LockKind::Indexing, LockScope::Branch, holder)
                    .reason("Full branch indexing")
                    .heartbeat(chrono::Duration::seconds(INDEXING_HEARTBEAT_SECS)),
            )?;
            ids.push(id);
        } else {
            let types = resource_types.unwrap_or_else(|| {
                DEFAULT_INDEXING_RESOURCE_TYPES
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            });
            for resource_type in types {
                let request =
                    AcquireRequest::new(branch, LockKind::Indexing, LockScope::ResourceType, holder)
                        .resource_type(resource_type.clone())
                        .reason(format!("Indexing {}", resource_type))
                        .heartbeat(chrono::Duration::seconds(INDEXING_HEARTBEAT_SECS));
                match self.acquire_lock(request) {
                    Ok(id) => ids.push(id),
                    Err(e) if e.is_conflict() => {
                        // Partial indexing is allowed; skip the contended type
                        warn!(branch, resource_type = %resource_type, error = %e,
                              "indexing lock skipped due to conflict");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let mut info = self.get_branch_state(branch);
        info.indexing_started_at = Some(now_utc());
        info.indexing_service = Some(holder.to_string());
        self.persist_state(&info, None)?;
        self.branch_states.insert(branch.to_string(), info);

        Ok(ids)
    }

    /// Release indexing locks and, when the last one goes, move a frozen
    /// branch to `READY`. Returns false when no indexing locks were held.
    pub fn complete_indexing(
        &self,
        branch: &str,
        completed_by: &str,
        resource_types: Option<Vec<String>>,
    ) -> OntosResult<bool> {
        let to_release: Vec<LockId> = self
            .active_locks
            .iter()
            .filter(|l| l.branch == branch && l.kind == LockKind::Indexing)
            .filter(|l| match &resource_types {
                Some(types) => l
                    .resource_type
                    .as_ref()
                    .is_some_and(|rt| types.contains(rt)),
                None => true,
            })
            .map(|l| l.id)
            .collect();

        if to_release.is_empty() {
            warn!(branch, "no active indexing locks to complete");
            return Ok(false);
        }

        for id in to_release {
            self.release_lock(id, completed_by)?;
        }

        let mut info = self.get_branch_state(branch);
        info.indexing_completed_at = Some(now_utc());
        self.persist_state(&info, None)?;
        self.branch_states.insert(branch.to_string(), info);

        info!(branch, by = completed_by, "indexing completed");
        Ok(true)
    }

    /// All live locks, optionally restricted to one branch.
    pub fn list_active_locks(&self, branch: Option<&str>) -> Vec<Lock> {
        let now = now_utc();
        let mut locks: Vec<Lock> = self
            .active_locks
            .iter()
            .filter(|l| branch.map_or(true, |b| l.branch == b))
            .filter(|l| l.is_live(now, self.config.heartbeat_grace))
            .map(|l| l.clone())
            .collect();
        locks.sort_by(|a, b| a.acquired_at.cmp(&b.acquired_at));
        locks
    }

    /// Look up a lock by id.
    pub fn get_lock(&self, lock_id: LockId) -> Option<Lock> {
        self.active_locks.get(&lock_id).map(|l| l.clone())
    }

    /// Health report for a lock, if it exists.
    pub fn lock_health(&self, lock_id: LockId) -> Option<LockHealth> {
        self.active_locks
            .get(&lock_id)
            .map(|l| LockHealth::assess(&l, now_utc(), self.config.heartbeat_grace))
    }

    /// Release every auto-release lock whose TTL lapsed as of `now`.
    /// Idempotent; returns the released lock ids.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<LockId> {
        let expired: Vec<LockId> = self
            .active_locks
            .iter()
            .filter(|l| l.auto_release && l.ttl_expired(now))
            .map(|l| l.id)
            .collect();

        let mut released = Vec::new();
        for id in expired {
            match self.release_with_reason(id, "system", ReleaseReason::TtlExpired) {
                Ok(true) => released.push(id),
                Ok(false) => {}
                Err(e) => warn!(lock_id = %id, error = %e, "TTL sweep release failed"),
            }
        }
        if !released.is_empty() {
            info!(count = released.len(), "TTL-expired locks released");
        }
        released
    }

    /// Release every auto-release lock whose heartbeats lapsed as of
    /// `now`. Idempotent; returns the released lock ids.
    pub fn sweep_heartbeats_at(&self, now: DateTime<Utc>) -> Vec<LockId> {
        let grace = self.config.heartbeat_grace;
        let missed: Vec<LockId> = self
            .active_locks
            .iter()
            .filter(|l| l.auto_release && l.heartbeat_expired(now, grace))
            .map(|l| l.id)
            .collect();

        let mut released = Vec::new();
        for id in missed {
            match self.release_with_reason(id, "system", ReleaseReason::HeartbeatMissed) {
                Ok(true) => released.push(id),
                Ok(false) => {}
                Err(e) => warn!(lock_id = %id, error = %e, "heartbeat sweep release failed"),
            }
        }
        if !released.is_empty() {
            warn!(count = released.len(), "heartbeat-expired locks released");
        }
        released
    }

    /// TTL sweep at the current time.
    pub fn sweep_expired(&self) -> Vec<LockId> {
        self.sweep_expired_at(now_utc())
    }

    /// Heartbeat sweep at the current time.
    pub fn sweep_heartbeats(&self) -> Vec<LockId> {
        self.sweep_heartbeats_at(now_utc())
    }

    /// Audit failures must not fail lock operations.
    fn audit_quietly(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(event) {
            warn!(error = %e, "failed to record lock audit event");
        }
    }
}
