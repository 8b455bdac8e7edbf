//! Append-only audit storage with integrity hashing
//!
//! Events are stored as documents in the `audit_events` collection with a
//! SHA-256 hash over a canonical subset of fields. Batch inserts also
//! write a row to `audit_integrity` whose hash covers the whole batch, so
//! removal or mutation of any member is detectable.
//!
//! Stored events are never updated except to flip `archived` during
//! retention cleanup, which is itself logged to `audit_retention_log`.

use crate::event::AuditEvent;
use crate::retention::RetentionPolicy;
use chrono::{DateTime, Utc};
use ontos_core::{
    canon, now_utc, AuditConfig, AuditId, DocStore, Document, OntosError, OntosResult,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Collection holding audit event rows
pub const AUDIT_EVENTS: &str = "audit_events";
/// Collection holding per-batch integrity rows
pub const AUDIT_INTEGRITY: &str = "audit_integrity";
/// Collection holding retention cleanup log rows
pub const AUDIT_RETENTION_LOG: &str = "audit_retention_log";

/// A stored audit event: the event plus integrity and retention columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// The event as recorded
    #[serde(flatten)]
    pub event: AuditEvent,
    /// SHA-256 over the canonical hash subset
    pub event_hash: String,
    /// Hash of the batch this event was inserted with, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_hash: Option<String>,
    /// When retention for this event ends
    pub retention_until: DateTime<Utc>,
    /// Soft-delete flag flipped by retention cleanup
    pub archived: bool,
}

/// One row of the batch integrity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityRow {
    /// Earliest event time in the batch
    pub batch_start: DateTime<Utc>,
    /// Latest event time in the batch
    pub batch_end: DateTime<Utc>,
    /// Number of events covered
    pub event_count: usize,
    /// SHA-256 over the sorted, `|`-joined event hashes
    pub batch_hash: String,
    /// When the batch was stored
    pub created_at: DateTime<Utc>,
}

/// Filter for audit queries. Empty vectors match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Events at or after this time
    pub start_time: Option<DateTime<Utc>>,
    /// Events at or before this time
    pub end_time: Option<DateTime<Utc>>,
    /// Restrict to these actor ids
    pub actor_ids: Vec<String>,
    /// Restrict to these actions
    pub actions: Vec<String>,
    /// Restrict to these target kinds
    pub target_kinds: Vec<String>,
    /// Restrict to these target ids
    pub target_ids: Vec<String>,
    /// Restrict to these branches
    pub branches: Vec<String>,
    /// Restrict by success flag
    pub success: Option<bool>,
    /// Page size (0 means the default of 100)
    pub limit: usize,
    /// Page offset
    pub offset: usize,
}

impl AuditFilter {
    fn matches(&self, record: &AuditRecord) -> bool {
        let e = &record.event;
        if let Some(start) = self.start_time {
            if e.time < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if e.time > end {
                return false;
            }
        }
        if !self.actor_ids.is_empty() && !self.actor_ids.contains(&e.actor.id) {
            return false;
        }
        if !self.actions.is_empty() && !self.actions.contains(&e.action) {
            return false;
        }
        if !self.target_kinds.is_empty() && !self.target_kinds.contains(&e.target.kind) {
            return false;
        }
        if !self.target_ids.is_empty() && !self.target_ids.contains(&e.target.id) {
            return false;
        }
        if !self.branches.is_empty() {
            match &e.target.branch {
                Some(b) if self.branches.contains(b) => {}
                _ => return false,
            }
        }
        if let Some(success) = self.success {
            if e.success != success {
                return false;
            }
        }
        true
    }
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct AuditPage {
    /// Matching records for this page, newest first
    pub events: Vec<AuditRecord>,
    /// Total matches across all pages
    pub total_count: usize,
}

/// Aggregate statistics over a time window.
#[derive(Debug, Clone, Default)]
pub struct AuditStatistics {
    /// Total events in the window
    pub total_events: usize,
    /// Event counts per action
    pub by_action: BTreeMap<String, usize>,
    /// Most active actors, descending
    pub top_actors: Vec<(String, usize)>,
    /// Fraction of successful events
    pub success_rate: f64,
    /// Fraction of failed events
    pub failure_rate: f64,
    /// Event counts per target kind
    pub by_target_kind: BTreeMap<String, usize>,
}

/// Result of an integrity verification pass.
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    /// True when every checked hash matched
    pub verified: bool,
    /// Ids of records whose recomputed hash differed
    pub corrupted: Vec<String>,
    /// Number of records checked
    pub checked: usize,
}

/// Append-only audit store over a DocStore.
pub struct AuditStore<S: DocStore> {
    store: Arc<S>,
    config: AuditConfig,
    retention: RetentionPolicy,
}

impl<S: DocStore> AuditStore<S> {
    /// Create a store with the given configuration.
    pub fn new(store: Arc<S>, config: AuditConfig) -> Self {
        let retention = RetentionPolicy::new(config.default_retention_days);
        AuditStore {
            store,
            config,
            retention,
        }
    }

    /// The retention policy in effect.
    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    /// Hash the canonical subset of an event.
    ///
    /// The subset is fixed: `{id, time, action, actor_id, target, success}`
    /// with the target as `kind:id`. Everything else can be enriched later
    /// without invalidating stored hashes.
    pub fn event_hash(event: &AuditEvent) -> String {
        let subset = json!({
            "id": event.id.to_string(),
            "time": canon::format_utc(event.time),
            "action": event.action,
            "actor_id": event.actor.id,
            "target": event.target.key(),
            "success": event.success,
        });
        canon::hash_value(&subset)
    }

    /// Hash a batch: SHA-256 over the sorted, `|`-joined event hashes.
    pub fn batch_hash(event_hashes: &[String]) -> String {
        let mut sorted = event_hashes.to_vec();
        sorted.sort();
        canon::sha256_hex(&sorted.join("|"))
    }

    /// Store a single event. Returns its id.
    pub fn record(&self, event: AuditEvent) -> OntosResult<AuditId> {
        let id = event.id;
        let record = self.build_record(event, None);
        let doc = Document::from_record(id.to_string(), &record)?;
        self.store.insert(AUDIT_EVENTS, doc)?;
        Ok(id)
    }

    /// Store a batch of events atomically, plus one integrity-log row
    /// covering the batch (when batch hashing is enabled).
    pub fn record_batch(&self, events: Vec<AuditEvent>) -> OntosResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let batch_start = events.iter().map(|e| e.time).min().expect("non-empty");
        let batch_end = events.iter().map(|e| e.time).max().expect("non-empty");
        let hashes: Vec<String> = events.iter().map(Self::event_hash).collect();
        let batch_hash = if self.config.batch_hash_enabled {
            Some(Self::batch_hash(&hashes))
        } else {
            None
        };

        let count = events.len();
        let mut docs = Vec::with_capacity(count);
        for event in events {
            let id = event.id.to_string();
            let record = self.build_record(event, batch_hash.clone());
            docs.push(Document::from_record(id, &record)?);
        }

        let integrity_doc = match &batch_hash {
            Some(hash) => Some(Document::from_record(
                AuditId::new().to_string(),
                &IntegrityRow {
                    batch_start,
                    batch_end,
                    event_count: count,
                    batch_hash: hash.clone(),
                    created_at: now_utc(),
                },
            )?),
            None => None,
        };

        self.store.txn(&mut |t| {
            for doc in &docs {
                t.insert(AUDIT_EVENTS, doc.clone())?;
            }
            if let Some(doc) = &integrity_doc {
                t.insert(AUDIT_INTEGRITY, doc.clone())?;
            }
            Ok(())
        })?;

        info!(count, "audit batch stored");
        Ok(count)
    }

    fn build_record(&self, event: AuditEvent, batch_hash: Option<String>) -> AuditRecord {
        let event_hash = Self::event_hash(&event);
        let retention_until = self.retention.retention_until(&event.action, event.time);
        AuditRecord {
            event,
            event_hash,
            batch_hash,
            retention_until,
            archived: false,
        }
    }

    /// Fetch one record by id.
    pub fn get(&self, id: AuditId) -> OntosResult<Option<AuditRecord>> {
        match self.store.get(AUDIT_EVENTS, &id.to_string())? {
            Some(doc) => Ok(Some(doc.to_record()?)),
            None => Ok(None),
        }
    }

    /// Query with filtering and pagination; newest first.
    pub fn query(&self, filter: &AuditFilter) -> OntosResult<AuditPage> {
        let mut matches = self.load_records(|record| filter.matches(record))?;
        matches.sort_by(|a, b| b.event.time.cmp(&a.event.time).then(
            b.event.id.to_string().cmp(&a.event.id.to_string()),
        ));

        let total_count = matches.len();
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        let events = matches
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .collect();
        Ok(AuditPage {
            events,
            total_count,
        })
    }

    /// Aggregate statistics over an optional time window.
    pub fn statistics(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> OntosResult<AuditStatistics> {
        let records = self.load_records(|record| {
            start_time.map_or(true, |s| record.event.time >= s)
                && end_time.map_or(true, |e| record.event.time <= e)
        })?;

        let mut stats = AuditStatistics {
            total_events: records.len(),
            ..Default::default()
        };
        let mut actor_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut successes = 0usize;

        for record in &records {
            *stats
                .by_action
                .entry(record.event.action.clone())
                .or_default() += 1;
            *stats
                .by_target_kind
                .entry(record.event.target.kind.clone())
                .or_default() += 1;
            *actor_counts.entry(record.event.actor.name.clone()).or_default() += 1;
            if record.event.success {
                successes += 1;
            }
        }

        if !records.is_empty() {
            stats.success_rate = successes as f64 / records.len() as f64;
            stats.failure_rate = 1.0 - stats.success_rate;
        }

        let mut actors: Vec<(String, usize)> = actor_counts.into_iter().collect();
        actors.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        actors.truncate(10);
        stats.top_actors = actors;

        Ok(stats)
    }

    /// Recompute the hash of every non-archived record and report
    /// mismatches. No remediation is attempted.
    pub fn verify_integrity(&self) -> OntosResult<IntegrityReport> {
        let records = self.load_records(|record| !record.archived)?;
        let checked = records.len();
        let mut corrupted = Vec::new();

        for record in records {
            let recomputed = Self::event_hash(&record.event);
            if recomputed != record.event_hash {
                corrupted.push(record.event.id.to_string());
            }
        }

        if !corrupted.is_empty() {
            warn!(count = corrupted.len(), "audit integrity violations found");
        }

        Ok(IntegrityReport {
            verified: corrupted.is_empty(),
            corrupted,
            checked,
        })
    }

    /// Archive every event whose retention has lapsed as of `now`, and log
    /// the action. Returns the number archived.
    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> OntosResult<usize> {
        let expired = self.load_records(|record| !record.archived && record.retention_until <= now)?;
        if expired.is_empty() {
            return Ok(0);
        }

        let count = expired.len();
        let mut docs = Vec::with_capacity(count);
        for mut record in expired {
            record.archived = true;
            docs.push(Document::from_record(record.event.id.to_string(), &record)?);
        }
        let log_doc = Document::from_record(
            AuditId::new().to_string(),
            &json!({
                "action": "ARCHIVE",
                "event_count": count,
                "cutoff_date": canon::format_utc(now),
                "executed_at": canon::format_utc(now_utc()),
            }),
        )?;

        self.store.txn(&mut |t| {
            for doc in &docs {
                t.replace(AUDIT_EVENTS, doc.clone())?;
            }
            t.insert(AUDIT_RETENTION_LOG, log_doc.clone())?;
            Ok(())
        })?;

        info!(count, "expired audit events archived");
        Ok(count)
    }

    /// Archive expired events as of the current time.
    pub fn cleanup_expired(&self) -> OntosResult<usize> {
        self.cleanup_expired_at(now_utc())
    }

    fn load_records(
        &self,
        keep: impl Fn(&AuditRecord) -> bool,
    ) -> OntosResult<Vec<AuditRecord>> {
        let docs = self.store.find(AUDIT_EVENTS, &|_| true)?;
        let mut records = Vec::with_capacity(docs.len());
        for doc in docs {
            let record: AuditRecord = doc
                .to_record()
                .map_err(|e| OntosError::serialization(format!("audit record {}: {}", doc.id, e)))?;
            if keep(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }
}
