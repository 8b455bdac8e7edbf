//! Background sweepers for expired leases
//!
//! Two loops run per process, each on its own named thread:
//! - TTL sweeper (default period 5 min) releases auto-release locks whose
//!   lease lapsed, with reason `TTL_EXPIRED`
//! - Heartbeat sweeper (default period 30 s) releases locks whose holder
//!   stopped heartbeating beyond the grace window, with reason
//!   `HEARTBEAT_MISSED`
//!
//! Both sweeps are idempotent; a crashed holder is reconciled within
//! `heartbeat_interval * grace + sweeper_period`.

use crate::manager::LockManager;
use ontos_core::DocStore;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::info;

struct SweeperShared {
    shutdown: AtomicBool,
    wakeup: Condvar,
    wakeup_lock: Mutex<()>,
}

/// Owns the two sweeper threads for a lock manager.
pub struct LockSweeper {
    shared: Arc<SweeperShared>,
    handles: Vec<JoinHandle<()>>,
}

impl LockSweeper {
    /// Start both sweeper loops with the manager's configured periods.
    pub fn start<S: DocStore + 'static>(manager: Arc<LockManager<S>>) -> Self {
        let shared = Arc::new(SweeperShared {
            shutdown: AtomicBool::new(false),
            wakeup: Condvar::new(),
            wakeup_lock: Mutex::new(()),
        });

        let ttl_period = manager.config().ttl_check_interval();
        let heartbeat_period = manager.config().heartbeat_check_interval();

        let mut handles = Vec::with_capacity(2);

        let ttl_shared = Arc::clone(&shared);
        let ttl_manager = Arc::clone(&manager);
        handles.push(
            std::thread::Builder::new()
                .name("ontos-lock-ttl".to_string())
                .spawn(move || {
                    sweep_loop(&ttl_shared, ttl_period, || {
                        ttl_manager.sweep_expired();
                    })
                })
                .expect("failed to spawn TTL sweeper thread"),
        );

        let hb_shared = Arc::clone(&shared);
        let hb_manager = Arc::clone(&manager);
        handles.push(
            std::thread::Builder::new()
                .name("ontos-lock-heartbeat".to_string())
                .spawn(move || {
                    sweep_loop(&hb_shared, heartbeat_period, || {
                        hb_manager.sweep_heartbeats();
                    })
                })
                .expect("failed to spawn heartbeat sweeper thread"),
        );

        info!(
            ttl_period_secs = ttl_period.as_secs(),
            heartbeat_period_secs = heartbeat_period.as_secs(),
            "lock sweepers started"
        );
        LockSweeper { shared, handles }
    }

    /// Signal both loops to stop and join them.
    pub fn shutdown(mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wakeup.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        info!("lock sweepers stopped");
    }
}

impl Drop for LockSweeper {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wakeup.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn sweep_loop(shared: &SweeperShared, period: Duration, mut sweep: impl FnMut()) {
    loop {
        {
            let mut guard = shared.wakeup_lock.lock();
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            shared.wakeup.wait_for(&mut guard, period);
        }
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        sweep();
    }
}
