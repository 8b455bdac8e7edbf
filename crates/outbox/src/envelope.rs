//! CloudEvents-compatible wire envelope

use crate::record::OutboxRecord;
use ontos_core::canon;
use serde_json::{json, Value};

/// Protocol header carrying the idempotency key, outside the envelope.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Protocol header carrying the correlation id, when present.
pub const CORRELATION_HEADER: &str = "correlation-id";

/// Serialize a record as a CloudEvents 1.0 envelope.
///
/// The idempotency key is NOT part of the envelope; it travels as the
/// [`IDEMPOTENCY_HEADER`] protocol header.
pub fn cloud_event(record: &OutboxRecord) -> Value {
    json!({
        "specversion": "1.0",
        "id": record.event_id.to_string(),
        "type": record.event_type,
        "source": record.source,
        "subject": record.subject,
        "time": canon::format_utc(record.created_at),
        "datacontenttype": "application/json",
        "data": record.payload,
    })
}

/// Bus subject for an event type: `oms.` plus the type with dots
/// flattened to underscores.
pub fn bus_subject(event_type: &str) -> String {
    format!("oms.{}", event_type.replace('.', "_"))
}
