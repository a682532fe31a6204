//! Leader election using Kubernetes Leases
//!
//! At most one replica sharing a lease name and namespace is leading at any
//! time. The Lease object is the external consensus primitive; this module only
//! reads it and writes it with compare-and-swap semantics through the
//! [`LeaseLock`] trait.
//!
//! # Atomicity
//!
//! [`KubeLeaseLock`] writes with the observed resourceVersion. If the lease
//! changed between read and write, the API server answers 409 Conflict and the
//! attempt counts as "not acquired". Two replicas can therefore never both
//! believe they won the same lease generation.
//!
//! # Timing
//!
//! The leader renews every retry period and steps down once it has gone a full
//! renew deadline without a successful renewal. Because the renew deadline plus
//! one retry period never exceeds the lease duration, the old leader has
//! stopped acting before a standby may treat the lease as expired.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use keel_common::{ExecutionContext, LeaseTiming};

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease object is malformed
    #[error("invalid lease {lease}: {message}")]
    InvalidLease {
        /// Lease being read or written
        lease: String,
        /// What is wrong with it
        message: String,
    },
}

impl From<LeaderElectionError> for keel_common::Error {
    fn from(err: LeaderElectionError) -> Self {
        match err {
            LeaderElectionError::Kube(source) => keel_common::Error::Kube { source },
            other => keel_common::Error::internal("leader-election", other.to_string()),
        }
    }
}

/// Leadership as observed by this replica
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeadershipState {
    /// This replica holds the lease
    Leading,
    /// Another replica holds the lease, or nobody does yet
    NotLeading,
}

/// Snapshot of a lease as seen by the elector
#[derive(Clone, Debug, PartialEq)]
pub struct LeaseRecord {
    /// Identity of the current holder
    pub holder: Option<String>,
    /// When the current holder acquired the lease
    pub acquire_time: Option<DateTime<Utc>>,
    /// When the current holder last renewed the lease
    pub renew_time: Option<DateTime<Utc>>,
    /// Validity window after the last renewal
    pub lease_duration: Duration,
    /// Number of holder changes
    pub transitions: i32,
    /// Opaque version used for compare-and-swap (resourceVersion)
    pub version: Option<String>,
}

impl LeaseRecord {
    /// Whether the lease has lapsed at `now`
    ///
    /// A lease without holder or renew time is treated as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (&self.holder, self.renew_time) {
            (Some(_), Some(renewed)) => {
                let duration = chrono::Duration::from_std(self.lease_duration)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                now > renewed + duration
            }
            _ => true,
        }
    }
}

/// Storage for a single lease with compare-and-swap writes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Human-readable `namespace/name` of the lease
    fn describe(&self) -> String;

    /// Read the lease, `None` when it does not exist
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError>;

    /// Create the lease; `Ok(false)` when someone else created it first
    async fn create(&self, record: &LeaseRecord) -> Result<bool, LeaderElectionError>;

    /// Replace the lease if `record.version` is still current; `Ok(false)` on conflict
    async fn update(&self, record: &LeaseRecord) -> Result<bool, LeaderElectionError>;
}

/// [`LeaseLock`] backed by a `coordination.k8s.io/v1` Lease
pub struct KubeLeaseLock {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl KubeLeaseLock {
    /// Lock over the Lease `name` in `namespace`
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord) -> Result<Lease, LeaderElectionError> {
        let lease_duration_seconds = i32::try_from(record.lease_duration.as_secs().max(1))
            .map_err(|_| LeaderElectionError::InvalidLease {
                lease: self.describe(),
                message: format!(
                    "lease duration of {}s does not fit leaseDurationSeconds",
                    record.lease_duration.as_secs()
                ),
            })?;
        Ok(Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: record.version.clone(),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder.clone(),
                lease_duration_seconds: Some(lease_duration_seconds),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_transitions: Some(record.transitions),
                ..Default::default()
            }),
        })
    }
}

fn record_from_lease(lease: Lease) -> LeaseRecord {
    let spec = lease.spec.unwrap_or_default();
    LeaseRecord {
        holder: spec.holder_identity.filter(|h| !h.is_empty()),
        acquire_time: spec.acquire_time.map(|t| t.0),
        renew_time: spec.renew_time.map(|t| t.0),
        lease_duration: Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64),
        transitions: spec.lease_transitions.unwrap_or(0),
        version: lease.metadata.resource_version,
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError> {
        match self.api.get(&self.name).await {
            Ok(lease) => Ok(Some(record_from_lease(lease))),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, record: &LeaseRecord) -> Result<bool, LeaderElectionError> {
        let mut lease = self.to_lease(record)?;
        lease.metadata.resource_version = None;
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, record: &LeaseRecord) -> Result<bool, LeaderElectionError> {
        if record.version.is_none() {
            return Err(LeaderElectionError::InvalidLease {
                lease: self.describe(),
                message: "missing resourceVersion".to_string(),
            });
        }
        let lease = self.to_lease(record)?;
        match self
            .api
            .replace(&self.name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Identity for this replica: `<hostname>_<uuid>`
///
/// The random suffix keeps identities unique when a pod restarts with the same
/// name before its old lease has expired.
pub fn default_identity() -> String {
    let host = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "keel".to_string());
    format!("{}_{}", host, uuid::Uuid::new_v4())
}

/// How holding leadership ended
#[derive(Debug, PartialEq, Eq)]
enum HoldOutcome {
    Cancelled,
    Lost,
}

/// Leader elector over a [`LeaseLock`]
pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    identity: String,
    timing: LeaseTiming,
    is_leader: AtomicBool,
    state_tx: watch::Sender<LeadershipState>,
}

impl LeaderElector {
    /// Create an elector for `identity` over `lock`
    pub fn new(lock: Arc<dyn LeaseLock>, identity: impl Into<String>, timing: LeaseTiming) -> Self {
        let (state_tx, _) = watch::channel(LeadershipState::NotLeading);
        Self {
            lock,
            identity: identity.into(),
            timing,
            is_leader: AtomicBool::new(false),
            state_tx,
        }
    }

    /// Identity this elector competes with
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether this replica currently holds leadership
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Subscribe to leadership transitions
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state_tx.subscribe()
    }

    /// Compete for, hold, and finally release leadership
    ///
    /// Returns `Ok(())` when `ctx` is cancelled (the lease is released first if
    /// held) and [`keel_common::Error::LeadershipLost`] when leadership was held
    /// and then lost.
    pub async fn run(&self, ctx: ExecutionContext) -> keel_common::Result<()> {
        if !self.acquire(&ctx).await {
            return Ok(());
        }

        self.set_state(LeadershipState::Leading);
        let outcome = self.hold(&ctx).await;
        self.set_state(LeadershipState::NotLeading);

        match outcome {
            HoldOutcome::Cancelled => {
                if let Err(e) = self.release().await {
                    warn!(identity = %self.identity, error = %e, "Failed to release lease");
                }
                Ok(())
            }
            HoldOutcome::Lost => Err(keel_common::Error::LeadershipLost {
                identity: self.identity.clone(),
            }),
        }
    }

    /// Block until leadership is acquired (`true`) or `ctx` is cancelled (`false`)
    async fn acquire(&self, ctx: &ExecutionContext) -> bool {
        info!(
            identity = %self.identity,
            lease = %self.lock.describe(),
            "Waiting for leadership..."
        );

        loop {
            if ctx.is_cancelled() {
                return false;
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return true;
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_ms = self.timing.retry_period.as_millis() as u64,
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_ms = self.timing.retry_period.as_millis() as u64,
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            if ctx
                .run_until_cancelled(tokio::time::sleep(self.timing.retry_period))
                .await
                .is_none()
            {
                return false;
            }
        }
    }

    /// Renew until cancelled or until the renew deadline passes without success
    async fn hold(&self, ctx: &ExecutionContext) -> HoldOutcome {
        let mut last_renewal = Instant::now();

        loop {
            if ctx
                .run_until_cancelled(tokio::time::sleep(self.timing.retry_period))
                .await
                .is_none()
            {
                return HoldOutcome::Cancelled;
            }

            let attempt =
                tokio::time::timeout(self.timing.renew_deadline, self.try_acquire_or_renew())
                    .await;
            match attempt {
                Ok(Ok(true)) => {
                    debug!(identity = %self.identity, "Lease renewed");
                    last_renewal = Instant::now();
                }
                Ok(Ok(false)) => {
                    warn!(identity = %self.identity, "Lease taken by another replica");
                    return HoldOutcome::Lost;
                }
                Ok(Err(e)) => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed");
                }
                Err(_) => {
                    warn!(identity = %self.identity, "Lease renewal timed out");
                }
            }

            if last_renewal.elapsed() >= self.timing.renew_deadline {
                warn!(
                    identity = %self.identity,
                    deadline_ms = self.timing.renew_deadline.as_millis() as u64,
                    "Renew deadline exceeded, leadership lost"
                );
                return HoldOutcome::Lost;
            }
        }
    }

    fn set_state(&self, state: LeadershipState) {
        self.is_leader
            .store(state == LeadershipState::Leading, Ordering::SeqCst);
        self.state_tx.send_replace(state);
    }

    /// Try to acquire or renew the lease atomically
    ///
    /// - no lease: create it (first leader)
    /// - held by us: renew
    /// - held by another and expired: take over, bumping transitions
    /// - held by another and live: not acquired
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let now = Utc::now();

        let Some(existing) = self.lock.get().await? else {
            let record = LeaseRecord {
                holder: Some(self.identity.clone()),
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_duration: self.timing.lease_duration,
                transitions: 0,
                version: None,
            };
            let created = self.lock.create(&record).await?;
            if created {
                info!(identity = %self.identity, "Created new lease");
            }
            return Ok(created);
        };

        if existing.holder.as_deref() == Some(self.identity.as_str()) {
            let renewed = LeaseRecord {
                renew_time: Some(now),
                lease_duration: self.timing.lease_duration,
                ..existing
            };
            return self.lock.update(&renewed).await;
        }

        if !existing.is_expired(now) {
            return Ok(false);
        }

        let taken = LeaseRecord {
            holder: Some(self.identity.clone()),
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_duration: self.timing.lease_duration,
            transitions: existing.transitions + 1,
            version: existing.version,
        };
        let acquired = self.lock.update(&taken).await?;
        if acquired {
            info!(
                identity = %self.identity,
                transitions = taken.transitions,
                "Took over expired lease"
            );
        }
        Ok(acquired)
    }

    /// Clear the holder so a standby can acquire without waiting for expiry
    async fn release(&self) -> Result<(), LeaderElectionError> {
        let Some(existing) = self.lock.get().await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };
        if existing.holder.as_deref() != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let released = LeaseRecord {
            holder: None,
            renew_time: Some(Utc::now()),
            lease_duration: Duration::from_secs(1),
            ..existing
        };
        if self.lock.update(&released).await? {
            info!(identity = %self.identity, "Lease released for fast failover");
        }
        Ok(())
    }
}
