//! Transactional outbox and event dispatcher
//!
//! Guarantees that every externally-visible change event is eventually
//! delivered exactly once from the producer's perspective:
//! - [`Outbox::publish_event`] writes the event row in the same DocStore
//!   transaction as the business change, deduplicating on an idempotency
//!   key at insert time
//! - [`Dispatcher`] drains pending rows to the message bus with retry,
//!   exponential backoff with jitter, and dead-lettering
//!
//! Delivery to the bus is at-least-once; consumers deduplicate with the
//! idempotency key carried as a protocol header.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod dispatcher;
mod envelope;
mod outbox;
mod record;

pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use envelope::{bus_subject, cloud_event, IDEMPOTENCY_HEADER};
pub use outbox::{
    EventSpec, Outbox, OutboxStatistics, OUTBOX_EVENTS, OUTBOX_IDEMPOTENCY_INDEX,
};
pub use record::{backoff_delay, backoff_delay_ms, idempotency_key, OutboxRecord, OutboxStatus};
