//! Liveness and readiness checks
//!
//! Checks are registered by name per category before the manager starts and
//! served over HTTP:
//! - `/healthz`, `/readyz` run every check in the category
//! - `/healthz/{name}`, `/readyz/{name}` run a single check
//! - `?verbose` lists the outcome of each check
//!
//! Probes never consult leadership, so standby replicas stay live and ready.

use std::fmt;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::debug;

use keel_common::{Error, Result};

/// A zero-argument check returning success or a failure reason
pub type Probe = Arc<dyn Fn() -> std::result::Result<(), String> + Send + Sync>;

/// Probe that always succeeds
pub fn ping() -> Probe {
    Arc::new(|| Ok(()))
}

/// Wrap a closure as a [`Probe`]
pub fn probe<F>(check: F) -> Probe
where
    F: Fn() -> std::result::Result<(), String> + Send + Sync + 'static,
{
    Arc::new(check)
}

/// Which endpoint a check is served on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckCategory {
    /// `/healthz`: restart the process when failing
    Liveness,
    /// `/readyz`: withhold traffic when failing
    Readiness,
}

impl CheckCategory {
    /// URL path segment for the category
    pub fn path(&self) -> &'static str {
        match self {
            Self::Liveness => "healthz",
            Self::Readiness => "readyz",
        }
    }
}

impl fmt::Display for CheckCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Outcome of one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    /// Check name
    pub name: String,
    /// Failure reason, `None` when the check passed
    pub failure: Option<String>,
}

impl CheckResult {
    /// Whether the check passed
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Ordered set of uniquely named checks in one category
#[derive(Clone)]
pub struct CheckSet {
    category: CheckCategory,
    checks: Vec<(String, Probe)>,
}

impl CheckSet {
    /// Create an empty set
    pub fn new(category: CheckCategory) -> Self {
        Self {
            category,
            checks: Vec::new(),
        }
    }

    /// Category of every check in this set
    pub fn category(&self) -> CheckCategory {
        self.category
    }

    /// Register a check; names must be unique, non-empty and free of `/`
    pub fn add(&mut self, name: &str, probe: Probe) -> Result<()> {
        if name.is_empty() {
            return Err(Error::registration(
                self.category.path(),
                name,
                "name must not be empty",
            ));
        }
        if name.contains('/') {
            return Err(Error::registration(
                self.category.path(),
                name,
                "name must not contain '/'",
            ));
        }
        if self.checks.iter().any(|(existing, _)| existing == name) {
            return Err(Error::registration(
                self.category.path(),
                name,
                "already registered",
            ));
        }
        self.checks.push((name.to_string(), probe));
        Ok(())
    }

    /// Registered names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.checks.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Run every check
    pub fn run_all(&self) -> Vec<CheckResult> {
        self.checks
            .iter()
            .map(|(name, probe)| CheckResult {
                name: name.clone(),
                failure: probe().err(),
            })
            .collect()
    }

    /// Run a single check, `None` when it is not registered
    pub fn run_one(&self, name: &str) -> Option<CheckResult> {
        self.checks
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(name, probe)| CheckResult {
                name: name.clone(),
                failure: probe().err(),
            })
    }
}

#[derive(Clone)]
struct ProbeState {
    liveness: Arc<CheckSet>,
    readiness: Arc<CheckSet>,
}

impl ProbeState {
    fn set(&self, category: CheckCategory) -> &CheckSet {
        match category {
            CheckCategory::Liveness => &self.liveness,
            CheckCategory::Readiness => &self.readiness,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeQuery {
    verbose: Option<String>,
}

/// Build the router serving both check categories
pub fn probe_router(liveness: Arc<CheckSet>, readiness: Arc<CheckSet>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/healthz/{name}", get(healthz_one))
        .route("/readyz", get(readyz))
        .route("/readyz/{name}", get(readyz_one))
        .with_state(ProbeState {
            liveness,
            readiness,
        })
}

async fn healthz(State(state): State<ProbeState>, Query(query): Query<ProbeQuery>) -> Response {
    render_all(state.set(CheckCategory::Liveness), query.verbose.is_some())
}

async fn readyz(State(state): State<ProbeState>, Query(query): Query<ProbeQuery>) -> Response {
    render_all(state.set(CheckCategory::Readiness), query.verbose.is_some())
}

async fn healthz_one(State(state): State<ProbeState>, Path(name): Path<String>) -> Response {
    render_one(state.set(CheckCategory::Liveness), &name)
}

async fn readyz_one(State(state): State<ProbeState>, Path(name): Path<String>) -> Response {
    render_one(state.set(CheckCategory::Readiness), &name)
}

fn render_all(set: &CheckSet, verbose: bool) -> Response {
    let results = set.run_all();
    let failed = results.iter().any(|r| !r.passed());

    if !failed && !verbose {
        return (StatusCode::OK, "ok").into_response();
    }

    let mut body = String::new();
    for result in &results {
        match &result.failure {
            None if verbose => body.push_str(&format!("[+]{} ok\n", result.name)),
            None => {}
            Some(reason) => body.push_str(&format!("[-]{} failed: {}\n", result.name, reason)),
        }
    }

    if failed {
        debug!(category = %set.category(), "Probe failed");
        body.push_str(&format!("{} check failed", set.category()));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    } else {
        body.push_str(&format!("{} check passed", set.category()));
        (StatusCode::OK, body).into_response()
    }
}

fn render_one(set: &CheckSet, name: &str) -> Response {
    match set.run_one(name) {
        None => (
            StatusCode::NOT_FOUND,
            format!("no {} check named {name}", set.category()),
        )
            .into_response(),
        Some(result) => match result.failure {
            None => (StatusCode::OK, "ok").into_response(),
            Some(reason) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal server error: {reason}"),
            )
                .into_response(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    async fn get_path(router: Router, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn sets() -> (CheckSet, CheckSet) {
        (
            CheckSet::new(CheckCategory::Liveness),
            CheckSet::new(CheckCategory::Readiness),
        )
    }

    #[test]
    fn duplicate_names_rejected_per_category() {
        let (mut live, mut ready) = sets();
        live.add("ping", ping()).unwrap();
        ready.add("ping", ping()).unwrap();

        let err = live.add("ping", ping()).unwrap_err();
        assert!(matches!(err, Error::Registration { ref category, .. } if category == "healthz"));
        assert_eq!(live.names(), vec!["ping"]);
    }

    #[test]
    fn invalid_names_rejected() {
        let (mut live, _) = sets();
        assert!(live.add("", ping()).is_err());
        assert!(live.add("a/b", ping()).is_err());
        assert!(live.names().is_empty());
    }

    #[test]
    fn run_all_reports_each_outcome() {
        let (mut live, _) = sets();
        live.add("ok", ping()).unwrap();
        live.add("bad", probe(|| Err("disk full".into()))).unwrap();

        let results = live.run_all();
        assert_eq!(results.len(), 2);
        assert!(results[0].passed());
        assert_eq!(results[1].failure.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn empty_sets_are_healthy() {
        let (live, ready) = sets();
        let router = probe_router(Arc::new(live), Arc::new(ready));

        assert_eq!(
            get_path(router.clone(), "/healthz").await,
            (StatusCode::OK, "ok".to_string())
        );
        assert_eq!(get_path(router, "/readyz").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn failing_check_returns_500_with_reason() {
        let (live, mut ready) = sets();
        ready.add("ping", ping()).unwrap();
        ready
            .add("backend", probe(|| Err("not synced".into())))
            .unwrap();
        let router = probe_router(Arc::new(live), Arc::new(ready));

        let (status, body) = get_path(router.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("[-]backend failed: not synced"));
        assert!(body.ends_with("readyz check failed"));

        let (status, _) = get_path(router, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn verbose_lists_passing_checks() {
        let (mut live, ready) = sets();
        live.add("healthz", ping()).unwrap();
        let router = probe_router(Arc::new(live), Arc::new(ready));

        let (status, body) = get_path(router, "/healthz?verbose").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[+]healthz ok\nhealthz check passed");
    }

    #[tokio::test]
    async fn single_check_paths() {
        let (mut live, ready) = sets();
        live.add("healthz", ping()).unwrap();
        let router = probe_router(Arc::new(live), Arc::new(ready));

        assert_eq!(
            get_path(router.clone(), "/healthz/healthz").await.0,
            StatusCode::OK
        );
        assert_eq!(
            get_path(router, "/healthz/missing").await.0,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn probes_are_evaluated_per_request() {
        let healthy = Arc::new(AtomicBool::new(false));
        let (live, mut ready) = sets();
        let flag = healthy.clone();
        ready
            .add(
                "warm",
                probe(move || {
                    if flag.load(Ordering::SeqCst) {
                        Ok(())
                    } else {
                        Err("warming up".into())
                    }
                }),
            )
            .unwrap();
        let router = probe_router(Arc::new(live), Arc::new(ready));

        assert_eq!(
            get_path(router.clone(), "/readyz").await.0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        healthy.store(true, Ordering::SeqCst);
        assert_eq!(get_path(router, "/readyz").await.0, StatusCode::OK);
    }
}
