//! Ownership of the four long-lived background loops
//!
//! - Lock TTL sweeper (5 min period)
//! - Lock heartbeat sweeper (30 s period)
//! - Outbox dispatcher (1 s idle period, immediate when busy)
//! - Audit cleanup (daily), which also runs policy tamper verification
//!
//! Each loop is owned by a single logical instance; graceful shutdown
//! signals every loop, lets in-flight work finish within the configured
//! budget, and joins the threads.

use crate::service::OntologyService;
use ontos_core::DocStore;
use ontos_locks::LockSweeper;
use ontos_outbox::DispatcherHandle;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

struct CleanupShared {
    shutdown: AtomicBool,
    wakeup: Condvar,
    wakeup_lock: Mutex<()>,
}

/// Owns every background loop of a running service.
pub struct BackgroundTasks {
    sweepers: Option<LockSweeper>,
    dispatcher: Option<DispatcherHandle>,
    cleanup_shared: Arc<CleanupShared>,
    cleanup_handle: Option<JoinHandle<()>>,
    shutdown_budget: Duration,
}

impl BackgroundTasks {
    /// Start all four loops for a service.
    pub fn start<S: DocStore + 'static>(service: &Arc<OntologyService<S>>) -> Self {
        let sweepers = LockSweeper::start(service.locks().clone());
        let dispatcher = service.dispatcher().start();

        let cleanup_shared = Arc::new(CleanupShared {
            shutdown: AtomicBool::new(false),
            wakeup: Condvar::new(),
            wakeup_lock: Mutex::new(()),
        });
        let period = Duration::from_secs(service.config().audit.cleanup_interval_secs);
        let loop_shared = Arc::clone(&cleanup_shared);
        let loop_service = Arc::clone(service);
        let cleanup_handle = std::thread::Builder::new()
            .name("ontos-audit-cleanup".to_string())
            .spawn(move || loop {
                {
                    let mut guard = loop_shared.wakeup_lock.lock();
                    if loop_shared.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    loop_shared.wakeup.wait_for(&mut guard, period);
                }
                if loop_shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Err(e) = loop_service.audit().cleanup_expired() {
                    warn!(error = %e, "audit cleanup failed");
                }
                if let Err(e) = loop_service.policy_checker().verify_all() {
                    warn!(error = %e, "policy verification failed");
                }
            })
            .expect("failed to spawn audit cleanup thread");

        info!("background tasks started");
        BackgroundTasks {
            sweepers: Some(sweepers),
            dispatcher: Some(dispatcher),
            cleanup_shared,
            cleanup_handle: Some(cleanup_handle),
            shutdown_budget: service.config().engine.shutdown_budget(),
        }
    }

    /// Graceful shutdown: stop accepting work, let in-flight loops finish
    /// within the budget, then join.
    pub fn shutdown(mut self) {
        let started = Instant::now();

        self.cleanup_shared.shutdown.store(true, Ordering::Release);
        self.cleanup_shared.wakeup.notify_all();

        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown();
        }
        if let Some(sweepers) = self.sweepers.take() {
            sweepers.shutdown();
        }
        if let Some(handle) = self.cleanup_handle.take() {
            let _ = handle.join();
        }

        let elapsed = started.elapsed();
        if elapsed > self.shutdown_budget {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.shutdown_budget.as_millis() as u64,
                "shutdown exceeded its budget"
            );
        } else {
            info!(elapsed_ms = elapsed.as_millis() as u64, "background tasks stopped");
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.cleanup_shared.shutdown.store(true, Ordering::Release);
        self.cleanup_shared.wakeup.notify_all();
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown();
        }
        if let Some(sweepers) = self.sweepers.take() {
            sweepers.shutdown();
        }
        if let Some(handle) = self.cleanup_handle.take() {
            let _ = handle.join();
        }
    }
}
