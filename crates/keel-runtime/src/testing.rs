//! Test doubles shared by the runtime's unit tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use keel_common::LeaseTiming;

use crate::leader_election::{LeaderElectionError, LeaseLock, LeaseRecord};

/// Lease timing short enough for tests, still satisfying the ordering rules
pub(crate) fn fast_timing() -> LeaseTiming {
    LeaseTiming {
        lease_duration: Duration::from_millis(400),
        renew_deadline: Duration::from_millis(200),
        retry_period: Duration::from_millis(40),
    }
}

#[derive(Default)]
struct Store {
    record: Option<LeaseRecord>,
    version: u64,
    failing: bool,
}

/// In-memory lease with resourceVersion-style compare-and-swap
///
/// Clones share the same lease, so several electors can compete for it.
#[derive(Clone, Default)]
pub(crate) struct MemoryLeaseLock {
    store: Arc<Mutex<Store>>,
}

impl MemoryLeaseLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn snapshot(&self) -> Option<LeaseRecord> {
        self.store.lock().unwrap().record.clone()
    }

    pub(crate) fn seed(&self, mut record: LeaseRecord) {
        let mut store = self.store.lock().unwrap();
        store.version += 1;
        record.version = Some(store.version.to_string());
        store.record = Some(record);
    }

    /// Overwrite the holder as if another replica had won a race
    pub(crate) fn steal(&self, holder: &str) {
        let now = Utc::now();
        self.seed(LeaseRecord {
            holder: Some(holder.to_string()),
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_duration: Duration::from_secs(60),
            transitions: 99,
            version: None,
        });
    }

    /// Make every call fail as if the API server were unreachable
    pub(crate) fn set_failing(&self, failing: bool) {
        self.store.lock().unwrap().failing = failing;
    }

    fn check(store: &Store) -> Result<(), LeaderElectionError> {
        if store.failing {
            return Err(LeaderElectionError::InvalidLease {
                lease: "memory/lease".to_string(),
                message: "store unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseLock for MemoryLeaseLock {
    fn describe(&self) -> String {
        "memory/lease".to_string()
    }

    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError> {
        let store = self.store.lock().unwrap();
        Self::check(&store)?;
        Ok(store.record.clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<bool, LeaderElectionError> {
        let mut store = self.store.lock().unwrap();
        Self::check(&store)?;
        if store.record.is_some() {
            return Ok(false);
        }
        store.version += 1;
        let mut record = record.clone();
        record.version = Some(store.version.to_string());
        store.record = Some(record);
        Ok(true)
    }

    async fn update(&self, record: &LeaseRecord) -> Result<bool, LeaderElectionError> {
        let mut store = self.store.lock().unwrap();
        Self::check(&store)?;
        let current = store.record.as_ref().and_then(|r| r.version.clone());
        if current.is_none() || current != record.version {
            return Ok(false);
        }
        store.version += 1;
        let mut record = record.clone();
        record.version = Some(store.version.to_string());
        store.record = Some(record);
        Ok(true)
    }
}
