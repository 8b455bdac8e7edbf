//! Transactional event publication and record management
//!
//! `publish_event` runs inside the caller's DocStore transaction: if the
//! business write rolls back, the outbox row rolls back with it. The
//! idempotency index collection is keyed by the idempotency key itself,
//! so duplicate publication resolves to the existing event id instead of
//! a second row.

use crate::record::{idempotency_key, OutboxRecord, OutboxStatus};
use chrono::{DateTime, Utc};
use ontos_core::{
    now_utc, DocStore, Document, EventId, OntosError, OntosResult, OutboxConfig, TxnOps,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Collection holding outbox event rows, keyed by event id
pub const OUTBOX_EVENTS: &str = "outbox_events";
/// Collection enforcing idempotency-key uniqueness, keyed by the key
pub const OUTBOX_IDEMPOTENCY_INDEX: &str = "outbox_idempotency_index";

/// Parameters for publishing one event.
#[derive(Debug, Clone)]
pub struct EventSpec {
    /// Event type, dotted
    pub event_type: String,
    /// Payload
    pub payload: Value,
    /// Source URI
    pub source: String,
    /// Subject; defaults to `outbox/{event_id}`
    pub subject: Option<String>,
    /// Correlation id
    pub correlation_id: Option<String>,
    /// Explicit idempotency key; computed from the content when omitted
    pub idempotency_key: Option<String>,
    /// Extra metadata stored with the record
    pub metadata: Option<Value>,
    /// Override for the retry budget
    pub max_retries: Option<u32>,
}

impl EventSpec {
    /// Spec with required fields; source defaults to `/oms`.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        EventSpec {
            event_type: event_type.into(),
            payload,
            source: "/oms".to_string(),
            subject: None,
            correlation_id: None,
            idempotency_key: None,
            metadata: None,
            max_retries: None,
        }
    }

    /// Override the source URI
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the subject
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the correlation id
    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Supply an explicit idempotency key
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Attach metadata
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxStatistics {
    /// Records awaiting delivery
    pub pending: usize,
    /// Records claimed by the dispatcher
    pub processing: usize,
    /// Delivered records
    pub completed: usize,
    /// Records awaiting retry
    pub failed: usize,
    /// Dead-lettered records
    pub dead_letter: usize,
    /// All records
    pub total: usize,
}

/// Transactional outbox over a DocStore.
pub struct Outbox<S: DocStore> {
    store: Arc<S>,
    config: OutboxConfig,
}

impl<S: DocStore> Outbox<S> {
    /// Create an outbox with the given configuration.
    pub fn new(store: Arc<S>, config: OutboxConfig) -> Self {
        Outbox { store, config }
    }

    /// The configuration in effect.
    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Publish an event within the caller's transaction.
    ///
    /// Duplicate idempotency keys resolve to the existing event id; at
    /// most one live record per key ever exists.
    pub fn publish_event(&self, txn: &mut dyn TxnOps, spec: EventSpec) -> OntosResult<EventId> {
        let event_id = EventId::new();
        let subject = spec
            .subject
            .clone()
            .unwrap_or_else(|| format!("outbox/{}", event_id));
        let key = spec.idempotency_key.clone().unwrap_or_else(|| {
            idempotency_key(&spec.event_type, &spec.source, &subject, &spec.payload)
        });

        // Deduplication at source: an existing index row wins
        if let Some(existing) = txn.get(OUTBOX_IDEMPOTENCY_INDEX, &key)? {
            let existing_id = existing
                .body
                .get("event_id")
                .and_then(Value::as_str)
                .and_then(EventId::parse)
                .ok_or_else(|| {
                    OntosError::internal(format!("malformed idempotency index row '{}'", key))
                })?;
            debug!(idempotency_key = %key, event_id = %existing_id, "duplicate event deduplicated");
            return Ok(existing_id);
        }

        let record = OutboxRecord {
            event_id,
            event_type: spec.event_type,
            source: spec.source,
            subject,
            payload: spec.payload,
            correlation_id: spec.correlation_id,
            idempotency_key: key.clone(),
            metadata: spec.metadata.unwrap_or(Value::Null),
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(self.config.max_retries),
            created_at: now_utc(),
            processed_at: None,
            next_attempt_at: None,
            error_message: None,
        };

        txn.insert(
            OUTBOX_IDEMPOTENCY_INDEX,
            Document::new(key, json!({"event_id": event_id.to_string()})),
        )?;
        txn.insert(
            OUTBOX_EVENTS,
            Document::from_record(event_id.to_string(), &record)?,
        )?;

        debug!(event_id = %event_id, event_type = %record.event_type, "event staged in outbox");
        Ok(event_id)
    }

    /// Publish in a transaction of its own (no accompanying business
    /// write).
    pub fn publish(&self, spec: EventSpec) -> OntosResult<EventId> {
        let mut result = None;
        self.store.txn(&mut |t| {
            result = Some(self.publish_event(t, spec.clone())?);
            Ok(())
        })?;
        result.ok_or_else(|| OntosError::internal("transaction completed without a result"))
    }

    /// Fetch one record by event id.
    pub fn get_record(&self, event_id: EventId) -> OntosResult<Option<OutboxRecord>> {
        match self.store.get(OUTBOX_EVENTS, &event_id.to_string())? {
            Some(doc) => Ok(Some(doc.to_record()?)),
            None => Ok(None),
        }
    }

    /// Records eligible for delivery at `now`, oldest first, capped at
    /// `batch_size`.
    pub fn due_records(&self, now: DateTime<Utc>) -> OntosResult<Vec<OutboxRecord>> {
        let docs = self.store.find(OUTBOX_EVENTS, &|_| true)?;
        let mut due = Vec::new();
        for doc in docs {
            let record: OutboxRecord = doc.to_record()?;
            if record.is_due(now) {
                due.push(record);
            }
        }
        due.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.event_id.to_string().cmp(&b.event_id.to_string()))
        });
        due.truncate(self.config.batch_size);
        Ok(due)
    }

    /// Claim a record for delivery: CAS its status to `Processing`.
    /// Returns false when another worker (or state change) won.
    pub fn claim(&self, event_id: EventId) -> OntosResult<bool> {
        let mut claimed = false;
        self.store.txn(&mut |t| {
            let Some(doc) = t.get(OUTBOX_EVENTS, &event_id.to_string())? else {
                return Ok(());
            };
            let mut record: OutboxRecord = doc.to_record()?;
            if !matches!(
                record.status,
                OutboxStatus::Pending | OutboxStatus::Failed
            ) {
                return Ok(());
            }
            record.status = OutboxStatus::Processing;
            t.replace(
                OUTBOX_EVENTS,
                Document::from_record(event_id.to_string(), &record)?,
            )?;
            claimed = true;
            Ok(())
        })?;
        Ok(claimed)
    }

    /// Mark a claimed record delivered.
    pub fn mark_completed(&self, event_id: EventId) -> OntosResult<()> {
        self.update_record(event_id, |record| {
            record.status = OutboxStatus::Completed;
            record.processed_at = Some(now_utc());
            record.error_message = None;
        })
    }

    /// Mark a claimed record failed: bump the retry counter, schedule the
    /// next attempt, dead-letter once the budget is spent. Returns the
    /// resulting status.
    pub fn mark_failed(
        &self,
        event_id: EventId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> OntosResult<OutboxStatus> {
        let mut resulting = OutboxStatus::Failed;
        self.store.txn(&mut |t| {
            let Some(doc) = t.get(OUTBOX_EVENTS, &event_id.to_string())? else {
                return Err(OntosError::not_found("outbox_record", event_id.to_string()));
            };
            let mut record: OutboxRecord = doc.to_record()?;
            record.retry_count += 1;
            record.error_message = Some(error.to_string());
            if record.retry_count >= record.max_retries {
                record.status = OutboxStatus::DeadLetter;
                record.next_attempt_at = None;
            } else {
                record.status = OutboxStatus::Failed;
                record.next_attempt_at = Some(next_attempt_at);
            }
            resulting = record.status;
            t.replace(
                OUTBOX_EVENTS,
                Document::from_record(event_id.to_string(), &record)?,
            )?;
            Ok(())
        })?;
        Ok(resulting)
    }

    /// Counts by status.
    pub fn statistics(&self) -> OntosResult<OutboxStatistics> {
        let docs = self.store.find(OUTBOX_EVENTS, &|_| true)?;
        let mut stats = OutboxStatistics::default();
        for doc in docs {
            let record: OutboxRecord = doc.to_record()?;
            match record.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Processing => stats.processing += 1,
                OutboxStatus::Completed => stats.completed += 1,
                OutboxStatus::Failed => stats.failed += 1,
                OutboxStatus::DeadLetter => stats.dead_letter += 1,
            }
            stats.total += 1;
        }
        Ok(stats)
    }

    /// Delete completed records older than the given age, along with
    /// their idempotency rows, in one transaction per batch.
    /// Dead-lettered records are never auto-deleted.
    pub fn cleanup_completed(&self, older_than_hours: u64) -> OntosResult<usize> {
        let cutoff = now_utc() - chrono::Duration::hours(older_than_hours as i64);
        let docs = self.store.find(OUTBOX_EVENTS, &|_| true)?;

        let mut expired: Vec<OutboxRecord> = Vec::new();
        for doc in docs {
            let record: OutboxRecord = doc.to_record()?;
            if record.status == OutboxStatus::Completed
                && record.processed_at.is_some_and(|t| t <= cutoff)
            {
                expired.push(record);
            }
        }
        if expired.is_empty() {
            return Ok(0);
        }

        let count = expired.len();
        self.store.txn(&mut |t| {
            for record in &expired {
                t.delete(OUTBOX_EVENTS, &record.event_id.to_string())?;
                t.delete(OUTBOX_IDEMPOTENCY_INDEX, &record.idempotency_key)?;
            }
            Ok(())
        })?;

        info!(count, "completed outbox records cleaned up");
        Ok(count)
    }

    fn update_record(
        &self,
        event_id: EventId,
        mutate: impl Fn(&mut OutboxRecord),
    ) -> OntosResult<()> {
        self.store.txn(&mut |t| {
            let Some(doc) = t.get(OUTBOX_EVENTS, &event_id.to_string())? else {
                return Err(OntosError::not_found("outbox_record", event_id.to_string()));
            };
            let mut record: OutboxRecord = doc.to_record()?;
            mutate(&mut record);
            t.replace(
                OUTBOX_EVENTS,
                Document::from_record(event_id.to_string(), &record)?,
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ontos_store::MemoryDocStore;
    use serde_json::json;

    fn outbox() -> (Arc<MemoryDocStore>, Outbox<MemoryDocStore>) {
        let store = Arc::new(MemoryDocStore::new());
        (store.clone(), Outbox::new(store, OutboxConfig::default()))
    }

    #[test]
    fn test_publish_creates_record_and_index() {
        let (store, outbox) = outbox();
        let id = outbox
            .publish(EventSpec::new(
                "com.oms.schema.created",
                json!({"name": "Person"}),
            ))
            .unwrap();

        let record = outbox.get_record(id).unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.max_retries, 3);
        assert_eq!(record.idempotency_key.len(), 32);
        assert_eq!(store.collection_len(OUTBOX_IDEMPOTENCY_INDEX), 1);
    }

    #[test]
    fn test_duplicate_key_returns_existing_id() {
        let (store, outbox) = outbox();
        let spec =
            EventSpec::new("com.oms.schema.created", json!({"x": 1})).idempotency_key("k1");

        let first = outbox.publish(spec.clone()).unwrap();
        let second = outbox.publish(spec).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.collection_len(OUTBOX_EVENTS), 1);
    }

    #[test]
    fn test_duplicate_within_one_transaction() {
        let (store, outbox) = outbox();
        let spec =
            EventSpec::new("com.oms.schema.created", json!({"x": 1})).idempotency_key("k1");

        let mut ids = Vec::new();
        store
            .txn(&mut |t| {
                ids.push(outbox.publish_event(t, spec.clone())?);
                ids.push(outbox.publish_event(t, spec.clone())?);
                Ok(())
            })
            .unwrap();

        assert_eq!(ids[0], ids[1]);
        assert_eq!(store.collection_len(OUTBOX_EVENTS), 1);
    }

    #[test]
    fn test_rollback_discards_outbox_row() {
        let (store, outbox) = outbox();
        let result = store.txn(&mut |t| {
            t.insert("business", Document::new("b1", json!({})))?;
            outbox.publish_event(t, EventSpec::new("com.oms.schema.created", json!({})))?;
            Err(OntosError::transient("simulated failure"))
        });

        assert!(result.is_err());
        assert_eq!(store.collection_len("business"), 0);
        assert_eq!(store.collection_len(OUTBOX_EVENTS), 0);
        assert_eq!(store.collection_len(OUTBOX_IDEMPOTENCY_INDEX), 0);
    }

    #[test]
    fn test_default_subject_references_event_id() {
        let (_, outbox) = outbox();
        let id = outbox
            .publish(EventSpec::new("t", json!({})))
            .unwrap();
        let record = outbox.get_record(id).unwrap().unwrap();
        assert_eq!(record.subject, format!("outbox/{}", id));
    }

    #[test]
    fn test_claim_transitions_to_processing_once() {
        let (_, outbox) = outbox();
        let id = outbox.publish(EventSpec::new("t", json!({}))).unwrap();

        assert!(outbox.claim(id).unwrap());
        assert!(!outbox.claim(id).unwrap());
        assert_eq!(
            outbox.get_record(id).unwrap().unwrap().status,
            OutboxStatus::Processing
        );
    }

    #[test]
    fn test_mark_completed() {
        let (_, outbox) = outbox();
        let id = outbox.publish(EventSpec::new("t", json!({}))).unwrap();
        outbox.claim(id).unwrap();
        outbox.mark_completed(id).unwrap();

        let record = outbox.get_record(id).unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Completed);
        assert!(record.processed_at.is_some());
    }

    #[test]
    fn test_mark_failed_until_dead_letter() {
        let (_, outbox) = outbox();
        let id = outbox.publish(EventSpec::new("t", json!({}))).unwrap();
        let later = now_utc() + Duration::seconds(2);

        assert_eq!(
            outbox.mark_failed(id, "boom", later).unwrap(),
            OutboxStatus::Failed
        );
        assert_eq!(
            outbox.mark_failed(id, "boom", later).unwrap(),
            OutboxStatus::Failed
        );
        assert_eq!(
            outbox.mark_failed(id, "boom", later).unwrap(),
            OutboxStatus::DeadLetter
        );

        let record = outbox.get_record(id).unwrap().unwrap();
        assert_eq!(record.retry_count, 3);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
        assert!(record.next_attempt_at.is_none());
    }

    #[test]
    fn test_zero_max_retries_dead_letters_immediately() {
        let (_, outbox) = outbox();
        let mut spec = EventSpec::new("t", json!({}));
        spec.max_retries = Some(0);
        let id = outbox.publish(spec).unwrap();

        assert_eq!(
            outbox.mark_failed(id, "boom", now_utc()).unwrap(),
            OutboxStatus::DeadLetter
        );
    }

    #[test]
    fn test_due_records_ordered_and_capped() {
        let store = Arc::new(MemoryDocStore::new());
        let config = OutboxConfig {
            batch_size: 2,
            ..OutboxConfig::default()
        };
        let outbox = Outbox::new(store, config);

        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(
                outbox
                    .publish(EventSpec::new("t", json!({"i": i})))
                    .unwrap(),
            );
        }

        let due = outbox.due_records(now_utc()).unwrap();
        assert_eq!(due.len(), 2);
        // Oldest first
        assert!(due[0].created_at <= due[1].created_at);
    }

    #[test]
    fn test_failed_record_due_only_after_backoff() {
        let (_, outbox) = outbox();
        let id = outbox.publish(EventSpec::new("t", json!({}))).unwrap();
        let next = now_utc() + Duration::seconds(30);
        outbox.mark_failed(id, "x", next).unwrap();

        assert!(outbox.due_records(now_utc()).unwrap().is_empty());
        let later = outbox.due_records(next + Duration::seconds(1)).unwrap();
        assert_eq!(later.len(), 1);
    }

    #[test]
    fn test_statistics() {
        let (_, outbox) = outbox();
        let a = outbox.publish(EventSpec::new("t", json!({"n": 1}))).unwrap();
        let b = outbox.publish(EventSpec::new("t", json!({"n": 2}))).unwrap();
        let _c = outbox.publish(EventSpec::new("t", json!({"n": 3}))).unwrap();

        outbox.claim(a).unwrap();
        outbox.mark_completed(a).unwrap();
        outbox.mark_failed(b, "x", now_utc()).unwrap();

        let stats = outbox.statistics().unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total, 3);
    }

    #[test]
    fn test_cleanup_removes_completed_and_index_rows() {
        let (store, outbox) = outbox();
        let done = outbox.publish(EventSpec::new("t", json!({"n": 1}))).unwrap();
        let pending = outbox.publish(EventSpec::new("t", json!({"n": 2}))).unwrap();
        outbox.claim(done).unwrap();
        outbox.mark_completed(done).unwrap();

        // Backdate the completion so the retention window has passed
        let mut record = outbox.get_record(done).unwrap().unwrap();
        record.processed_at = Some(now_utc() - Duration::hours(48));
        store
            .replace(
                OUTBOX_EVENTS,
                Document::from_record(done.to_string(), &record).unwrap(),
            )
            .unwrap();

        let removed = outbox.cleanup_completed(24).unwrap();
        assert_eq!(removed, 1);
        assert!(outbox.get_record(done).unwrap().is_none());
        assert!(outbox.get_record(pending).unwrap().is_some());
        assert_eq!(store.collection_len(OUTBOX_IDEMPOTENCY_INDEX), 1);
    }

    #[test]
    fn test_dead_letters_never_cleaned_up() {
        let (store, outbox) = outbox();
        let mut spec = EventSpec::new("t", json!({}));
        spec.max_retries = Some(0);
        let id = outbox.publish(spec).unwrap();
        outbox.mark_failed(id, "poison", now_utc()).unwrap();

        assert_eq!(outbox.cleanup_completed(0).unwrap(), 0);
        assert_eq!(
            outbox.get_record(id).unwrap().unwrap().status,
            OutboxStatus::DeadLetter
        );
        let _ = store;
    }
}
