//! Background services shared by every replica
//!
//! Services owns the sync worker: reconcilers ask for a sync, requests are
//! coalesced through a bounded channel, and a non-leader-gated runnable drains
//! them. Standby replicas keep the worker running so they are warm when they
//! take over.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use keel_common::{Configuration, Error, ExecutionContext, Result};
use keel_runtime::{probe, runnable_fn, Manager, Registrable};

/// Pending sync requests beyond this are coalesced into the queued one
const SYNC_QUEUE_DEPTH: usize = 1;

/// Shared sync worker
pub struct Services {
    ingress_class: String,
    requests: mpsc::Sender<()>,
    receiver: Mutex<Option<mpsc::Receiver<()>>>,
    serving: Arc<AtomicBool>,
    syncs: Arc<AtomicU64>,
}

impl Services {
    /// Create the worker for `config`; nothing runs until registration
    pub fn new(config: &Configuration) -> Self {
        let (requests, receiver) = mpsc::channel(SYNC_QUEUE_DEPTH);
        Self {
            ingress_class: config.ingress_class.clone(),
            requests,
            receiver: Mutex::new(Some(receiver)),
            serving: Arc::new(AtomicBool::new(false)),
            syncs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Ask for a sync
    ///
    /// Returns `false` only when the worker has stopped. A request made while
    /// another is already queued is folded into it.
    pub fn request_sync(&self) -> bool {
        match self.requests.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }

    /// Whether the worker is running
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Number of completed syncs
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registrable for Services {
    fn name(&self) -> &str {
        "services"
    }

    async fn setup_with(&self, ctx: &ExecutionContext, manager: &mut Manager) -> Result<()> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| Error::internal("services", "already registered with a manager"))?;

        let serving = self.serving.clone();
        manager.add_readyz_check(
            "services",
            probe(move || {
                if serving.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err("sync worker not running".to_string())
                }
            }),
        )?;

        let serving = self.serving.clone();
        let syncs = self.syncs.clone();
        let ingress_class = self.ingress_class.clone();
        manager.add(runnable_fn("services", false, move |run_ctx| {
            sync_worker(run_ctx, receiver, serving, syncs, ingress_class)
        }))?;

        ctx.logger()
            .in_scope(|| debug!(ingress_class = %self.ingress_class, "Services registered"));
        Ok(())
    }
}

async fn sync_worker(
    ctx: ExecutionContext,
    mut receiver: mpsc::Receiver<()>,
    serving: Arc<AtomicBool>,
    syncs: Arc<AtomicU64>,
    ingress_class: String,
) -> Result<()> {
    serving.store(true, Ordering::SeqCst);
    info!(ingress_class = %ingress_class, "Sync worker started");

    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            request = receiver.recv() => {
                if request.is_none() {
                    break;
                }
                let total = syncs.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(total, "Ingress state synchronized");
            }
        }
    }

    serving.store(false, Ordering::SeqCst);
    info!("Sync worker stopped");
    Ok(())
}
