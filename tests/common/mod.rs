#![allow(dead_code)]

//! Shared fixtures for the integration suites

use ontos::{
    MemoryDocStore, MessageBus, OntologyService, OntosConfig, OntosError, OntosResult,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One published message: subject, payload bytes, headers.
pub type Published = (String, Vec<u8>, Vec<(String, String)>);

/// A bus that records every publish and can be told to fail.
pub struct RecordingBus {
    pub published: Mutex<Vec<Published>>,
    pub fail_all: AtomicBool,
}

impl RecordingBus {
    pub fn new() -> Self {
        RecordingBus {
            published: Mutex::new(Vec::new()),
            fail_all: AtomicBool::new(false),
        }
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().len()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }
}

impl MessageBus for RecordingBus {
    fn publish(
        &self,
        subject: &str,
        payload: &[u8],
        headers: &[(&str, &str)],
        _deadline: Duration,
    ) -> OntosResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(OntosError::timeout("bus publish", 10_000));
        }
        self.published.lock().push((
            subject.to_string(),
            payload.to_vec(),
            headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
        Ok(())
    }
}

/// A fully wired service over a fresh in-memory store.
pub fn service() -> (
    Arc<MemoryDocStore>,
    Arc<RecordingBus>,
    Arc<OntologyService<MemoryDocStore>>,
) {
    service_with_config(OntosConfig::default())
}

pub fn service_with_config(
    config: OntosConfig,
) -> (
    Arc<MemoryDocStore>,
    Arc<RecordingBus>,
    Arc<OntologyService<MemoryDocStore>>,
) {
    let store = Arc::new(MemoryDocStore::new());
    let bus = Arc::new(RecordingBus::new());
    let service =
        Arc::new(OntologyService::new(store.clone(), bus.clone(), None, config).unwrap());
    (store, bus, service)
}
