//! Background dispatcher: drains the outbox to the message bus
//!
//! One logical processor per outbox. Each iteration picks up to
//! `batch_size` due records in `created_at` order, claims each with a CAS
//! to `PROCESSING`, publishes the CloudEvents envelope with the
//! idempotency key as a protocol header, and settles the record:
//! `COMPLETED` on success, `FAILED` with exponential backoff plus jitter
//! on failure, `DEAD_LETTER` once the retry budget is spent.
//!
//! Dead-lettered records emit an `outbox.dead_letter` audit event and are
//! retained until admin action; they never block the queue.

use crate::envelope::{bus_subject, cloud_event, CORRELATION_HEADER, IDEMPOTENCY_HEADER};
use crate::outbox::Outbox;
use crate::record::{backoff_delay_ms, OutboxRecord, OutboxStatus};
use chrono::Duration as ChronoDuration;
use ontos_audit::{AuditEvent, AuditStore, AuditTarget};
use ontos_core::{now_utc, Actor, DocStore, MessageBus, OntosResult};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outbox dispatcher. Use [`Dispatcher::run_once`] for synchronous
/// draining (tests, shutdown flushes) and [`Dispatcher::start`] for the
/// background loop.
pub struct Dispatcher<S: DocStore> {
    outbox: Arc<Outbox<S>>,
    bus: Arc<dyn MessageBus>,
    audit: Arc<AuditStore<S>>,
}

impl<S: DocStore + 'static> Dispatcher<S> {
    /// Create a dispatcher over an outbox and bus.
    pub fn new(outbox: Arc<Outbox<S>>, bus: Arc<dyn MessageBus>, audit: Arc<AuditStore<S>>) -> Self {
        Dispatcher { outbox, bus, audit }
    }

    /// Run one dispatch iteration. Returns the number of records
    /// attempted (delivered or failed).
    pub fn run_once(&self) -> OntosResult<usize> {
        let now = now_utc();
        let batch = self.outbox.due_records(now)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut attempted = 0usize;
        for record in batch {
            // CAS claim: skip records another worker (or a state change)
            // got to first
            if !self.outbox.claim(record.event_id)? {
                continue;
            }
            attempted += 1;
            self.deliver(&record)?;
        }
        Ok(attempted)
    }

    fn deliver(&self, record: &OutboxRecord) -> OntosResult<()> {
        let envelope = cloud_event(record);
        let payload = serde_json::to_vec(&envelope)?;
        let subject = bus_subject(&record.event_type);

        let correlation = record.correlation_id.clone().unwrap_or_default();
        let mut headers: Vec<(&str, &str)> =
            vec![(IDEMPOTENCY_HEADER, record.idempotency_key.as_str())];
        if record.correlation_id.is_some() {
            headers.push((CORRELATION_HEADER, correlation.as_str()));
        }

        let outcome = self.bus.publish(
            &subject,
            &payload,
            &headers,
            self.outbox.config().bus_timeout(),
        );

        match outcome {
            Ok(()) => {
                self.outbox.mark_completed(record.event_id)?;
                debug!(event_id = %record.event_id, subject = %subject, "event delivered");
                Ok(())
            }
            Err(e) => {
                let delay_ms = self.jittered_backoff_ms(record.retry_count);
                let next_attempt = now_utc() + ChronoDuration::milliseconds(delay_ms as i64);
                let status =
                    self.outbox
                        .mark_failed(record.event_id, &e.to_string(), next_attempt)?;

                if status == OutboxStatus::DeadLetter {
                    warn!(event_id = %record.event_id, error = %e, "outbox record dead-lettered");
                    self.audit_dead_letter(record, &e.to_string());
                } else {
                    debug!(
                        event_id = %record.event_id,
                        retry_in_ms = delay_ms,
                        error = %e,
                        "delivery failed, will retry"
                    );
                }
                Ok(())
            }
        }
    }

    /// Exponential backoff with jitter: up to 25% is added on top of the
    /// deterministic delay, still capped by the ceiling.
    fn jittered_backoff_ms(&self, retry_count: u32) -> u64 {
        let config = self.outbox.config();
        let base = backoff_delay_ms(retry_count, config.retry_base_delay_ms, config.retry_cap_ms);
        let jitter = rand::thread_rng().gen_range(0..=base / 4);
        (base + jitter).min(config.retry_cap_ms)
    }

    fn audit_dead_letter(&self, record: &OutboxRecord, error: &str) {
        let event = AuditEvent::new(
            "outbox.dead_letter",
            Actor::system(),
            AuditTarget::new("outbox_record", record.event_id.to_string()),
        )
        .failed("DEAD_LETTER", error)
        .with_metadata(serde_json::json!({
            "event_type": record.event_type,
            "idempotency_key": record.idempotency_key,
            "retry_count": record.retry_count + 1,
        }));

        if let Err(e) = self.audit.record(event) {
            warn!(event_id = %record.event_id, error = %e, "failed to audit dead letter");
        }
    }

    /// Start the background loop. The dispatcher wakes every
    /// `process_interval` when idle and immediately after a non-empty
    /// batch; a failed iteration backs off for five intervals.
    pub fn start(self: Arc<Self>) -> DispatcherHandle {
        let shared = Arc::new(DispatcherShared {
            shutdown: AtomicBool::new(false),
            wakeup: Condvar::new(),
            wakeup_lock: Mutex::new(()),
        });

        let loop_shared = Arc::clone(&shared);
        let interval = self.outbox.config().process_interval();
        let handle = std::thread::Builder::new()
            .name("ontos-outbox-dispatcher".to_string())
            .spawn(move || {
                info!("outbox dispatcher started");
                loop {
                    if loop_shared.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    let sleep = match self.run_once() {
                        Ok(0) => interval,
                        Ok(_) => Duration::ZERO,
                        Err(e) => {
                            error!(error = %e, "dispatcher iteration failed");
                            interval * 5
                        }
                    };
                    if !sleep.is_zero() {
                        let mut guard = loop_shared.wakeup_lock.lock();
                        if loop_shared.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        loop_shared.wakeup.wait_for(&mut guard, sleep);
                    }
                }
                info!("outbox dispatcher stopped");
            })
            .expect("failed to spawn dispatcher thread");

        DispatcherHandle {
            shared,
            handle: Some(handle),
        }
    }
}

struct DispatcherShared {
    shutdown: AtomicBool,
    wakeup: Condvar,
    wakeup_lock: Mutex<()>,
}

/// Handle to a running dispatcher loop.
pub struct DispatcherHandle {
    shared: Arc<DispatcherShared>,
    handle: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Signal the loop to stop and join it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
