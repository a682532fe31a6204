//! Manager: host for checks, runnables and leader election
//!
//! The manager is built once, mutated only during registration, and consumed
//! by [`Manager::start`], which runs until the execution context is cancelled
//! or something fatal happens.
//!
//! # Run loop
//!
//! On start the manager:
//! 1. serves `/healthz`, `/readyz` and `/metrics` on the listeners bound at
//!    construction, regardless of leadership
//! 2. starts runnables that do not need leadership
//! 3. with election enabled, competes for the lease and starts leader-gated
//!    runnables once leading; without election starts them immediately
//! 4. stops on cancellation (clean), a runnable error, or lost leadership
//!
//! # Shutdown
//!
//! Every runnable gets a child context that is cancelled on shutdown. They are
//! awaited for at most the graceful shutdown timeout; anything still running
//! is aborted and reported as [`Error::ShutdownTimeout`]. The lease is released
//! only after leader-gated work has stopped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use k8s_openapi::api::coordination::v1::Lease;
use kube::Client;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use keel_common::{BindAddress, Configuration, Error, ExecutionContext, LeaseTiming, Result, Scheme};

use crate::health::{probe_router, CheckCategory, CheckSet, Probe};
use crate::leader_election::{
    default_identity, KubeLeaseLock, LeaderElector, LeadershipState, LeaseLock,
};
use crate::metrics::{metrics_router, ManagerMetrics};
use crate::runnable::Runnable;

/// Default bound on how long shutdown waits for runnables
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Roughly 30 years; stands in for deadlines that overflow `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Options fixed at manager construction
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// Kinds this manager works with
    pub scheme: Scheme,
    /// Whether leader election gates leader-only runnables
    pub leader_election: bool,
    /// Lease name for leader election
    pub leader_election_id: String,
    /// Namespace holding the election Lease
    pub leader_election_namespace: String,
    /// Lease timing
    pub lease_timing: LeaseTiming,
    /// Where `/healthz` and `/readyz` are served
    pub health_probe_bind_address: BindAddress,
    /// Where `/metrics` is served
    pub metrics_bind_address: BindAddress,
    /// Bound on how long shutdown waits for runnables
    pub graceful_shutdown_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            scheme: Scheme::ingress_default(),
            leader_election: false,
            leader_election_id: String::new(),
            leader_election_namespace: String::new(),
            lease_timing: LeaseTiming::default(),
            health_probe_bind_address: BindAddress::Disabled,
            metrics_bind_address: BindAddress::Disabled,
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
        }
    }
}

impl ManagerOptions {
    /// Options taken from the process configuration
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            scheme: config.scheme.clone(),
            leader_election: config.election,
            leader_election_id: config.election_id.clone(),
            leader_election_namespace: config.election_namespace.clone(),
            lease_timing: config.lease_timing,
            health_probe_bind_address: config.probe_addr,
            metrics_bind_address: config.metrics_addr,
            graceful_shutdown_timeout: config.graceful_shutdown_timeout,
        }
    }

    /// Reject option combinations the manager cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.scheme.is_empty() {
            return Err(Error::scheme("no kinds registered"));
        }
        if self.leader_election {
            if !self.scheme.contains::<Lease>() {
                return Err(Error::scheme(
                    "coordination.k8s.io/v1 Lease must be registered for leader election",
                ));
            }
            if self.leader_election_id.is_empty() {
                return Err(Error::config_field(
                    "election-id",
                    "required when leader election is enabled",
                ));
            }
            if self.leader_election_namespace.is_empty() {
                return Err(Error::config_field(
                    "election-namespace",
                    "required when leader election is enabled",
                ));
            }
            self.lease_timing.validate()?;
        }
        Ok(())
    }
}

/// Host for checks, runnables and leader election
pub struct Manager {
    client: Client,
    options: ManagerOptions,
    liveness: CheckSet,
    readiness: CheckSet,
    runnables: Vec<Box<dyn Runnable>>,
    elector: Option<Arc<LeaderElector>>,
    always_leading: watch::Sender<LeadershipState>,
    probe_listener: Option<TcpListener>,
    metrics_listener: Option<TcpListener>,
    metrics: Arc<ManagerMetrics>,
}

impl Manager {
    /// Connect to the cluster described by `cluster` and build a manager
    ///
    /// Fails when the options are invalid, the API server is unreachable, or a
    /// listener cannot be bound.
    pub async fn new(
        ctx: &ExecutionContext,
        cluster: &kube::Config,
        options: ManagerOptions,
    ) -> Result<Self> {
        options.validate()?;

        let client = Client::try_from(cluster.clone())?;
        let version = client.apiserver_version().await?;
        ctx.logger().in_scope(|| {
            info!(
                server = %cluster.cluster_url,
                version = %version.git_version,
                "Connected to API server"
            )
        });

        Self::with_client(ctx, client, options).await
    }

    /// Build a manager around an existing client without contacting the cluster
    pub async fn with_client(
        ctx: &ExecutionContext,
        client: Client,
        options: ManagerOptions,
    ) -> Result<Self> {
        options.validate()?;

        let probe_listener = bind(options.health_probe_bind_address, "health probe").await?;
        let metrics_listener = bind(options.metrics_bind_address, "metrics").await?;

        let elector = options.leader_election.then(|| {
            let lock = KubeLeaseLock::new(
                client.clone(),
                &options.leader_election_namespace,
                &options.leader_election_id,
            );
            Arc::new(LeaderElector::new(
                Arc::new(lock),
                default_identity(),
                options.lease_timing,
            ))
        });

        ctx.logger().in_scope(|| {
            info!(
                leader_election = options.leader_election,
                probe_addr = %options.health_probe_bind_address,
                metrics_addr = %options.metrics_bind_address,
                "Manager configured"
            )
        });

        let (always_leading, _) = watch::channel(LeadershipState::Leading);
        Ok(Self {
            client,
            options,
            liveness: CheckSet::new(CheckCategory::Liveness),
            readiness: CheckSet::new(CheckCategory::Readiness),
            runnables: Vec::new(),
            elector,
            always_leading,
            probe_listener,
            metrics_listener,
            metrics: Arc::new(ManagerMetrics::new()),
        })
    }

    /// Replace the lease backend used for leader election
    ///
    /// Has no effect when leader election is disabled.
    pub fn with_lease_lock(mut self, lock: Arc<dyn LeaseLock>) -> Self {
        if let Some(existing) = &self.elector {
            let identity = existing.identity().to_string();
            self.elector = Some(Arc::new(LeaderElector::new(
                lock,
                identity,
                self.options.lease_timing,
            )));
        }
        self
    }

    /// Cluster client shared with subsystems
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Register a liveness check
    pub fn add_healthz_check(&mut self, name: &str, probe: Probe) -> Result<()> {
        self.liveness.add(name, probe)?;
        debug!(check = name, "Registered liveness check");
        Ok(())
    }

    /// Register a readiness check
    pub fn add_readyz_check(&mut self, name: &str, probe: Probe) -> Result<()> {
        self.readiness.add(name, probe)?;
        debug!(check = name, "Registered readiness check");
        Ok(())
    }

    /// Register a runnable to start with the manager
    pub fn add(&mut self, runnable: Box<dyn Runnable>) -> Result<()> {
        if runnable.name().is_empty() {
            return Err(Error::internal("manager", "runnable name must not be empty"));
        }
        debug!(
            runnable = runnable.name(),
            leader_only = runnable.needs_leader_election(),
            "Registered runnable"
        );
        self.runnables.push(runnable);
        Ok(())
    }

    /// Names of registered liveness checks
    pub fn healthz_checks(&self) -> Vec<&str> {
        self.liveness.names()
    }

    /// Names of registered readiness checks
    pub fn readyz_checks(&self) -> Vec<&str> {
        self.readiness.names()
    }

    /// Names of registered runnables in registration order
    pub fn runnables(&self) -> Vec<&str> {
        self.runnables.iter().map(|r| r.name()).collect()
    }

    /// Whether this replica may run leader-gated work right now
    ///
    /// Always `true` when leader election is disabled.
    pub fn is_leader(&self) -> bool {
        self.elector.as_ref().map_or(true, |e| e.is_leader())
    }

    /// Leadership transitions for this replica
    pub fn elected(&self) -> watch::Receiver<LeadershipState> {
        match &self.elector {
            Some(elector) => elector.subscribe(),
            None => self.always_leading.subscribe(),
        }
    }

    /// Identity used for leader election, if enabled
    pub fn identity(&self) -> Option<&str> {
        self.elector.as_ref().map(|e| e.identity())
    }

    /// Manager metrics
    pub fn metrics(&self) -> Arc<ManagerMetrics> {
        self.metrics.clone()
    }

    /// Local address of the probe listener, if enabled
    pub fn probe_addr(&self) -> Option<SocketAddr> {
        self.probe_listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    /// Run until `ctx` is cancelled or a fatal error occurs
    ///
    /// Returns `Ok(())` only for a cancellation-driven shutdown that finished
    /// within the grace period.
    pub async fn start(self, ctx: ExecutionContext) -> Result<()> {
        let Manager {
            liveness,
            readiness,
            runnables,
            elector,
            always_leading: _always_leading,
            probe_listener,
            metrics_listener,
            metrics,
            options,
            ..
        } = self;

        let run_ctx = ctx.child("manager");
        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();

        if let Some(listener) = probe_listener {
            let router = probe_router(Arc::new(liveness), Arc::new(readiness));
            spawn_server(&mut tasks, &run_ctx, "health-probe", listener, router);
        }
        if let Some(listener) = metrics_listener {
            let router = metrics_router(metrics.clone());
            spawn_server(&mut tasks, &run_ctx, "metrics", listener, router);
        }

        let (leader_only, everywhere): (Vec<_>, Vec<_>) = runnables
            .into_iter()
            .partition(|r| r.needs_leader_election());
        for runnable in everywhere {
            spawn_runnable(&mut tasks, &run_ctx, runnable, &metrics);
        }

        // The elector outlives the run context so the lease is only released
        // after leader-gated runnables have stopped.
        let elector_ctx = ExecutionContext::new("leader-election");
        let mut elected = None;
        let mut elector_task: Option<JoinHandle<Result<()>>> = None;
        let mut pending_leader_only = Some(leader_only);

        match &elector {
            Some(elector) => {
                elected = Some(elector.subscribe());
                let elector = elector.clone();
                let elector_run_ctx = elector_ctx.clone();
                elector_task = Some(tokio::spawn(
                    async move { elector.run(elector_run_ctx).await }
                        .instrument(elector_ctx.logger().clone()),
                ));
            }
            None => {
                metrics.set_leader(true);
                for runnable in pending_leader_only.take().unwrap_or_default() {
                    spawn_runnable(&mut tasks, &run_ctx, runnable, &metrics);
                }
            }
        }

        info!("Manager started");

        let outcome: Result<()> = loop {
            tokio::select! {
                _ = run_ctx.cancelled() => {
                    info!("Stopping manager");
                    break Ok(());
                }
                _ = became_leader(&mut elected), if pending_leader_only.is_some() => {
                    info!("Leadership acquired, starting leader-only runnables");
                    metrics.set_leader(true);
                    for runnable in pending_leader_only.take().unwrap_or_default() {
                        spawn_runnable(&mut tasks, &run_ctx, runnable, &metrics);
                    }
                }
                joined = join_elector(&mut elector_task) => {
                    elector_task = None;
                    metrics.set_leader(false);
                    break match joined {
                        Ok(Err(e)) => Err(e),
                        Ok(Ok(())) => Err(Error::internal("leader-election", "elector stopped unexpectedly")),
                        Err(e) => Err(Error::internal("leader-election", e.to_string())),
                    };
                }
                Some(joined) = tasks.join_next() => {
                    match flatten_join(joined) {
                        (name, Ok(())) => debug!(runnable = %name, "Runnable finished"),
                        (name, Err(e)) => {
                            error!(runnable = %name, error = %e, "Runnable failed");
                            break Err(e);
                        }
                    }
                }
            }
        };

        let deadline = shutdown_deadline(options.graceful_shutdown_timeout);
        run_ctx.cancel();

        let drained = tokio::time::timeout_at(deadline, drain(&mut tasks)).await;
        let shutdown = match drained {
            Ok(()) => Ok(()),
            Err(_) => {
                let pending = tasks.len();
                warn!(
                    pending,
                    timeout_secs = options.graceful_shutdown_timeout.as_secs(),
                    "Grace period exceeded, aborting remaining runnables"
                );
                tasks.abort_all();
                Err(Error::ShutdownTimeout {
                    pending,
                    timeout: options.graceful_shutdown_timeout,
                })
            }
        };

        elector_ctx.cancel();
        if let Some(task) = elector_task {
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(Err(e))) => warn!(error = %e, "Leader election ended with error during shutdown"),
                Ok(_) => {}
                Err(_) => warn!("Lease release did not finish within the grace period"),
            }
        }
        metrics.set_leader(false);

        info!("Manager stopped");
        outcome.and(shutdown)
    }
}

/// Deadline for shutdown, saturating far in the future for huge timeouts
fn shutdown_deadline(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

async fn bind(addr: BindAddress, purpose: &str) -> Result<Option<TcpListener>> {
    let Some(socket) = addr.socket_addr() else {
        return Ok(None);
    };
    TcpListener::bind(socket)
        .await
        .map(Some)
        .map_err(|source| Error::Bind {
            purpose: purpose.to_string(),
            addr: socket,
            source,
        })
}

fn spawn_server(
    tasks: &mut JoinSet<(String, Result<()>)>,
    parent: &ExecutionContext,
    name: &'static str,
    listener: TcpListener,
    router: Router,
) {
    let ctx = parent.child(name);
    let span = ctx.logger().clone();
    tasks.spawn(
        async move {
            let addr = listener.local_addr().ok();
            info!(addr = ?addr, "Serving {}", name);
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { ctx.cancelled().await })
                .await
                .map_err(|e| Error::runnable(name, e.to_string()));
            (name.to_string(), result)
        }
        .instrument(span),
    );
}

fn spawn_runnable(
    tasks: &mut JoinSet<(String, Result<()>)>,
    parent: &ExecutionContext,
    runnable: Box<dyn Runnable>,
    metrics: &Arc<ManagerMetrics>,
) {
    let name = runnable.name().to_string();
    let ctx = parent.child(&name);
    let span = ctx.logger().clone();
    let metrics = metrics.clone();
    metrics.runnable_started();
    tasks.spawn(
        async move {
            debug!("Starting runnable");
            let result = runnable.start(ctx).await;
            metrics.runnable_stopped(result.is_err());
            (name, result)
        }
        .instrument(span),
    );
}

async fn became_leader(elected: &mut Option<watch::Receiver<LeadershipState>>) {
    if let Some(rx) = elected {
        if rx.wait_for(|s| *s == LeadershipState::Leading).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

async fn join_elector(
    task: &mut Option<JoinHandle<Result<()>>>,
) -> std::result::Result<Result<()>, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn flatten_join(
    joined: std::result::Result<(String, Result<()>), JoinError>,
) -> (String, Result<()>) {
    joined.unwrap_or_else(|e| {
        (
            "unknown".to_string(),
            Err(Error::internal("manager", format!("runnable panicked: {e}"))),
        )
    })
}

async fn drain(tasks: &mut JoinSet<(String, Result<()>)>) {
    while let Some(joined) = tasks.join_next().await {
        match flatten_join(joined) {
            (name, Ok(())) => debug!(runnable = %name, "Runnable stopped"),
            (name, Err(e)) => warn!(runnable = %name, error = %e, "Runnable failed during shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::health::ping;
    use crate::runnable::runnable_fn;
    use crate::testing::{fast_timing, MemoryLeaseLock};

    fn test_client() -> Client {
        let config = kube::Config::new("http://127.0.0.1:1".parse().expect("valid uri"));
        Client::try_from(config).expect("client builds without contacting the server")
    }

    fn local_addr() -> BindAddress {
        BindAddress::Addr(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    fn options() -> ManagerOptions {
        ManagerOptions {
            health_probe_bind_address: local_addr(),
            graceful_shutdown_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn election_options() -> ManagerOptions {
        ManagerOptions {
            leader_election: true,
            leader_election_id: "keel-test".to_string(),
            leader_election_namespace: "default".to_string(),
            lease_timing: fast_timing(),
            ..options()
        }
    }

    async fn manager(options: ManagerOptions) -> Manager {
        Manager::with_client(&ExecutionContext::new("test"), test_client(), options)
            .await
            .unwrap()
    }

    async fn http_get(addr: SocketAddr, path: &str) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap_or(0)
    }

    /// Runnable that flips `started` and waits for cancellation
    fn tracking(name: &str, leader_only: bool, started: Arc<AtomicBool>) -> Box<dyn Runnable> {
        runnable_fn(name, leader_only, move |ctx: ExecutionContext| async move {
            started.store(true, Ordering::SeqCst);
            ctx.cancelled().await;
            Ok(())
        })
    }

    #[test]
    fn validate_rejects_empty_scheme() {
        let opts = ManagerOptions {
            scheme: Scheme::new(),
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(Error::Scheme { .. })));
    }

    #[test]
    fn validate_requires_lease_kind_for_election() {
        let mut scheme = Scheme::new();
        scheme
            .register::<k8s_openapi::api::networking::v1::Ingress>()
            .unwrap();
        let opts = ManagerOptions {
            scheme,
            ..election_options()
        };
        let err = opts.validate().unwrap_err();
        assert!(err.to_string().contains("Lease must be registered"));
    }

    #[test]
    fn validate_requires_election_id() {
        let opts = ManagerOptions {
            leader_election_id: String::new(),
            ..election_options()
        };
        assert!(matches!(opts.validate(), Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn bind_conflict_fails_construction() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = holder.local_addr().unwrap();
        let opts = ManagerOptions {
            health_probe_bind_address: BindAddress::Addr(taken),
            ..Default::default()
        };

        let err = Manager::with_client(&ExecutionContext::new("test"), test_client(), opts)
            .await
            .err()
            .expect("bind must fail");
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[tokio::test]
    async fn unreachable_cluster_fails_construction() {
        let cluster = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let result = Manager::new(&ExecutionContext::new("test"), &cluster, options()).await;
        assert!(matches!(result, Err(Error::Kube { .. })));
    }

    #[tokio::test]
    async fn duplicate_checks_rejected() {
        let mut mgr = manager(options()).await;
        mgr.add_healthz_check("healthz", ping()).unwrap();
        mgr.add_readyz_check("readyz", ping()).unwrap();

        assert!(mgr.add_healthz_check("healthz", ping()).is_err());
        assert_eq!(mgr.healthz_checks(), vec!["healthz"]);
        assert_eq!(mgr.readyz_checks(), vec!["readyz"]);
    }

    #[tokio::test]
    async fn disabled_election_always_leads() {
        let mgr = manager(options()).await;
        assert!(mgr.is_leader());
        assert_eq!(*mgr.elected().borrow(), LeadershipState::Leading);
        assert!(mgr.identity().is_none());
    }

    #[tokio::test]
    async fn runs_all_runnables_without_election_and_stops_on_cancel() {
        let mut mgr = manager(options()).await;
        let leader_started = Arc::new(AtomicBool::new(false));
        let everywhere_started = Arc::new(AtomicBool::new(false));
        mgr.add(tracking("reconciler", true, leader_started.clone()))
            .unwrap();
        mgr.add(tracking("cache", false, everywhere_started.clone()))
            .unwrap();
        assert_eq!(mgr.runnables(), vec!["reconciler", "cache"]);

        let ctx = ExecutionContext::new("test");
        let run = tokio::spawn(mgr.start(ctx.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(leader_started.load(Ordering::SeqCst));
        assert!(everywhere_started.load(Ordering::SeqCst));

        ctx.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn runnable_error_stops_manager() {
        let mut mgr = manager(options()).await;
        let stopped = Arc::new(AtomicUsize::new(0));
        let counter = stopped.clone();
        mgr.add(runnable_fn("sibling", false, move |ctx: ExecutionContext| async move {
            ctx.cancelled().await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
        mgr.add(runnable_fn("broken", false, |_ctx| async move {
            Err::<(), _>(Error::runnable("broken", "watch failed"))
        }))
        .unwrap();

        let err = mgr
            .start(ExecutionContext::new("test"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "runnable broken failed: watch failed");
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn grace_period_bounds_shutdown() {
        let opts = ManagerOptions {
            health_probe_bind_address: BindAddress::Disabled,
            graceful_shutdown_timeout: Duration::from_millis(100),
            ..options()
        };
        let mut mgr = manager(opts).await;
        mgr.add(runnable_fn("stubborn", false, |_ctx| async move {
            std::future::pending::<()>().await;
            Ok(())
        }))
        .unwrap();

        let ctx = ExecutionContext::new("test");
        ctx.cancel();
        let err = mgr.start(ctx).await.unwrap_err();
        assert!(matches!(err, Error::ShutdownTimeout { pending: 1, .. }));
    }

    #[tokio::test]
    async fn unbounded_grace_period_still_shuts_down() {
        let opts = ManagerOptions {
            graceful_shutdown_timeout: Duration::from_secs(u64::MAX),
            ..options()
        };
        let mut mgr = manager(opts).await;
        mgr.add(tracking("cache", false, Arc::new(AtomicBool::new(false))))
            .unwrap();

        let ctx = ExecutionContext::new("test");
        ctx.cancel();
        mgr.start(ctx).await.unwrap();
    }

    #[test]
    fn shutdown_deadline_saturates() {
        let deadline = shutdown_deadline(Duration::from_secs(u64::MAX));
        assert!(deadline > Instant::now() + Duration::from_secs(86400));
    }

    #[tokio::test]
    async fn standby_does_not_start_leader_runnables() {
        let lock = MemoryLeaseLock::new();
        lock.steal("other-replica");
        let mut mgr = manager(election_options())
            .await
            .with_lease_lock(Arc::new(lock.clone()));
        mgr.add_healthz_check("healthz", ping()).unwrap();
        mgr.add_readyz_check("readyz", ping()).unwrap();
        let leader_started = Arc::new(AtomicBool::new(false));
        let everywhere_started = Arc::new(AtomicBool::new(false));
        mgr.add(tracking("reconciler", true, leader_started.clone()))
            .unwrap();
        mgr.add(tracking("cache", false, everywhere_started.clone()))
            .unwrap();
        let probe_addr = mgr.probe_addr().unwrap();
        assert!(!mgr.is_leader());

        let ctx = ExecutionContext::new("test");
        let run = tokio::spawn(mgr.start(ctx.clone()));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(everywhere_started.load(Ordering::SeqCst));
        assert!(!leader_started.load(Ordering::SeqCst));
        assert_eq!(http_get(probe_addr, "/healthz").await, 200);
        assert_eq!(http_get(probe_addr, "/readyz").await, 200);

        ctx.cancel();
        run.await.unwrap().unwrap();
        assert!(!leader_started.load(Ordering::SeqCst));
        assert_eq!(
            lock.snapshot().unwrap().holder.as_deref(),
            Some("other-replica")
        );
    }

    #[tokio::test]
    async fn leader_starts_gated_runnables_and_releases_lease() {
        let lock = MemoryLeaseLock::new();
        let mut mgr = manager(election_options())
            .await
            .with_lease_lock(Arc::new(lock.clone()));
        mgr.add_healthz_check("healthz", ping()).unwrap();
        let leader_started = Arc::new(AtomicBool::new(false));
        mgr.add(tracking("reconciler", true, leader_started.clone()))
            .unwrap();
        let probe_addr = mgr.probe_addr().unwrap();
        let mut elected = mgr.elected();

        let ctx = ExecutionContext::new("test");
        let run = tokio::spawn(mgr.start(ctx.clone()));

        elected
            .wait_for(|s| *s == LeadershipState::Leading)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(leader_started.load(Ordering::SeqCst));
        assert_eq!(http_get(probe_addr, "/healthz").await, 200);

        ctx.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(lock.snapshot().unwrap().holder, None);
    }

    #[tokio::test]
    async fn lost_leadership_is_fatal() {
        let lock = MemoryLeaseLock::new();
        let mut mgr = manager(election_options())
            .await
            .with_lease_lock(Arc::new(lock.clone()));
        let leader_started = Arc::new(AtomicBool::new(false));
        mgr.add(tracking("reconciler", true, leader_started.clone()))
            .unwrap();
        let mut elected = mgr.elected();

        let run = tokio::spawn(mgr.start(ExecutionContext::new("test")));
        elected
            .wait_for(|s| *s == LeadershipState::Leading)
            .await
            .unwrap();

        lock.steal("usurper");

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::LeadershipLost { .. }));
    }
}
