//! Outbox record model and retry accounting

use chrono::{DateTime, Duration, Utc};
use ontos_core::{canon, EventId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle of an outbox record.
///
/// A record leaves `Processing` only via `Completed`, `Failed`, or
/// `DeadLetter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Awaiting first delivery attempt
    Pending,
    /// Claimed by the dispatcher
    Processing,
    /// Delivered to the bus
    Completed,
    /// Delivery failed; eligible again after backoff
    Failed,
    /// Retries exhausted; retained for inspection
    DeadLetter,
}

impl OutboxStatus {
    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Completed => "COMPLETED",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::DeadLetter => "DEAD_LETTER",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One event awaiting (or past) delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Event id
    pub event_id: EventId,
    /// Event type, dotted (e.g. `com.oms.schema.created`)
    pub event_type: String,
    /// Source URI
    pub source: String,
    /// Event subject
    pub subject: String,
    /// Payload delivered as the envelope's `data`
    pub payload: Value,
    /// Correlation id shared across a request chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Deduplication key, unique across live records
    pub idempotency_key: String,
    /// Extra metadata, not delivered on the wire
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    /// Delivery status
    pub status: OutboxStatus,
    /// Delivery attempts so far
    pub retry_count: u32,
    /// Attempts before dead-lettering
    pub max_retries: u32,
    /// When the record was written
    pub created_at: DateTime<Utc>,
    /// When delivery completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// Earliest time the next attempt may run (set on failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Last delivery error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl OutboxRecord {
    /// True when the dispatcher may pick this record up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Failed => {
                self.retry_count < self.max_retries
                    && self.next_attempt_at.map_or(true, |t| t <= now)
            }
            _ => false,
        }
    }
}

/// Compute the stable idempotency key for an event: the first 32 hex
/// chars of `SHA256("{type}:{source}:{subject}:{canonical(payload)}")`.
pub fn idempotency_key(event_type: &str, source: &str, subject: &str, payload: &Value) -> String {
    let input = format!(
        "{}:{}:{}:{}",
        event_type,
        source,
        subject,
        canon::canonical_json(payload)
    );
    canon::sha256_hex(&input)[..32].to_string()
}

/// Exponential backoff without jitter: `base * 2^retry_count`, capped.
pub fn backoff_delay_ms(retry_count: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}

/// Backoff as a chrono duration.
pub fn backoff_delay(retry_count: u32, base_ms: u64, cap_ms: u64) -> Duration {
    Duration::milliseconds(backoff_delay_ms(retry_count, base_ms, cap_ms) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ontos_core::now_utc;
    use serde_json::json;

    fn record(status: OutboxStatus) -> OutboxRecord {
        OutboxRecord {
            event_id: EventId::new(),
            event_type: "com.oms.schema.created".to_string(),
            source: "/oms".to_string(),
            subject: "schema/Person".to_string(),
            payload: json!({"name": "Person"}),
            correlation_id: None,
            idempotency_key: "k".to_string(),
            metadata: Value::Null,
            status,
            retry_count: 0,
            max_retries: 3,
            created_at: now_utc(),
            processed_at: None,
            next_attempt_at: None,
            error_message: None,
        }
    }

    #[test]
    fn test_idempotency_key_is_stable_and_short() {
        let payload = json!({"b": 2, "a": 1});
        let k1 = idempotency_key("t", "/s", "subj", &payload);
        let k2 = idempotency_key("t", "/s", "subj", &json!({"a": 1, "b": 2}));
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 32);

        let k3 = idempotency_key("t2", "/s", "subj", &payload);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay_ms(0, 1000, 300_000), 1000);
        assert_eq!(backoff_delay_ms(1, 1000, 300_000), 2000);
        assert_eq!(backoff_delay_ms(2, 1000, 300_000), 4000);
        assert_eq!(backoff_delay_ms(8, 1000, 300_000), 256_000);
        assert_eq!(backoff_delay_ms(9, 1000, 300_000), 300_000);
        assert_eq!(backoff_delay_ms(63, 1000, 300_000), 300_000);
        // Shift overflow saturates at the cap
        assert_eq!(backoff_delay_ms(200, 1000, 300_000), 300_000);
    }

    #[test]
    fn test_pending_is_always_due() {
        let r = record(OutboxStatus::Pending);
        assert!(r.is_due(now_utc()));
    }

    #[test]
    fn test_failed_waits_for_backoff() {
        let now = now_utc();
        let mut r = record(OutboxStatus::Failed);
        r.retry_count = 1;
        r.next_attempt_at = Some(now + Duration::seconds(10));

        assert!(!r.is_due(now));
        assert!(r.is_due(now + Duration::seconds(11)));
    }

    #[test]
    fn test_exhausted_record_is_never_due() {
        let mut r = record(OutboxStatus::Failed);
        r.retry_count = 3;
        assert!(!r.is_due(now_utc()));
    }

    #[test]
    fn test_terminal_statuses_not_due() {
        for status in [
            OutboxStatus::Processing,
            OutboxStatus::Completed,
            OutboxStatus::DeadLetter,
        ] {
            assert!(!record(status).is_due(now_utc()));
        }
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&OutboxStatus::DeadLetter).unwrap(),
            r#""DEAD_LETTER""#
        );
        let back: OutboxStatus = serde_json::from_str(r#""PENDING""#).unwrap();
        assert_eq!(back, OutboxStatus::Pending);
    }
}
