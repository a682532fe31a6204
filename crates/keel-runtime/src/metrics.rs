//! Prometheus metrics for the manager
//!
//! Exposes leadership and runnable counts in the Prometheus text format on
//! `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

/// Manager metrics
#[derive(Debug, Default)]
pub struct ManagerMetrics {
    /// 1 while this replica leads, 0 otherwise
    pub leader: AtomicU64,
    /// Runnables currently running
    pub runnables: AtomicU64,
    /// Runnables that exited with an error
    pub runnable_failures_total: AtomicU64,
}

impl ManagerMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current leadership state
    pub fn set_leader(&self, leading: bool) {
        self.leader.store(u64::from(leading), Ordering::Relaxed);
    }

    /// Record a runnable starting
    pub fn runnable_started(&self) {
        self.runnables.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a runnable exiting, successfully or not
    pub fn runnable_stopped(&self, failed: bool) {
        // Saturating: a stop is only recorded after its start.
        let _ = self
            .runnables
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if failed {
            self.runnable_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Render in the Prometheus text exposition format
    pub fn render(&self) -> String {
        format!(
            "# HELP keel_leader Whether this replica holds the leader lease.\n\
             # TYPE keel_leader gauge\n\
             keel_leader {}\n\
             # HELP keel_runnables Runnables currently running.\n\
             # TYPE keel_runnables gauge\n\
             keel_runnables {}\n\
             # HELP keel_runnable_failures_total Runnables that exited with an error.\n\
             # TYPE keel_runnable_failures_total counter\n\
             keel_runnable_failures_total {}\n",
            self.leader.load(Ordering::Relaxed),
            self.runnables.load(Ordering::Relaxed),
            self.runnable_failures_total.load(Ordering::Relaxed),
        )
    }
}

/// Build the router serving `/metrics`
pub fn metrics_router(metrics: Arc<ManagerMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(metrics)
}

async fn serve_metrics(State(metrics): State<Arc<ManagerMetrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}
