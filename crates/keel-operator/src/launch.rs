//! Bootstrap sequence
//!
//! The [`Launcher`] walks a fixed order of stages:
//!
//! 1. load configuration
//! 2. construct the manager
//! 3. register the `healthz` and `readyz` checks
//! 4. register each subsystem in order (services, then the Ingress reconciler)
//! 5. run the manager until cancellation or a fatal error
//!
//! The first failing stage ends the sequence; later stages never run and
//! nothing is rolled back. [`exit_code`] turns the outcome into the process
//! exit status in one place.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, Instrument};

use keel_common::{ConfigLoader, Configuration, Error, ExecutionContext, Result};
use keel_runtime::{ping, Manager, ManagerOptions, Registrable};

use crate::reconciler::IngressReconciler;
use crate::services::Services;

/// Bootstrap stage, named by the message logged when it fails
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Loading configuration
    Config,
    /// Constructing the manager
    Manager,
    /// Registering the liveness check
    HealthCheck,
    /// Registering the readiness check
    ReadyCheck,
    /// Registering the named subsystem
    Subsystem(String),
    /// Running the manager
    Run,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => f.write_str("unable to parse static config"),
            Self::Manager => f.write_str("unable to start manager"),
            Self::HealthCheck => f.write_str("unable to set up health check"),
            Self::ReadyCheck => f.write_str("unable to set up ready check"),
            Self::Subsystem(name) => write!(f, "unable to create {name}"),
            Self::Run => f.write_str("problem running manager"),
        }
    }
}

/// A fatal failure and the stage it happened in
#[derive(Debug, Error)]
#[error("{stage}: {source}")]
pub struct LaunchError {
    /// Where the sequence stopped
    pub stage: Stage,
    /// What went wrong
    #[source]
    pub source: Error,
}

impl LaunchError {
    fn at(stage: Stage) -> impl FnOnce(Error) -> Self {
        move |source| Self { stage, source }
    }
}

/// Observable progress of the bootstrap sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Loading configuration and constructing the manager
    Initializing,
    /// Registering probes and subsystems
    Registering,
    /// Manager running
    Running,
    /// Manager stopping
    ShuttingDown,
    /// Sequence finished, successfully or not
    Terminated,
}

/// Builds the manager from the loaded configuration
#[async_trait]
pub trait ManagerProvider: Send + Sync {
    /// Construct a manager for `config`
    async fn create(&self, ctx: &ExecutionContext, config: &Configuration) -> Result<Manager>;
}

/// Connects to the configured cluster
pub struct ClusterManagerProvider;

#[async_trait]
impl ManagerProvider for ClusterManagerProvider {
    async fn create(&self, ctx: &ExecutionContext, config: &Configuration) -> Result<Manager> {
        Manager::new(ctx, &config.cluster, ManagerOptions::from_config(config)).await
    }
}

/// Produces the ordered subsystems from the manager's client and configuration
pub type SubsystemBuilder =
    Box<dyn FnOnce(Client, Arc<Configuration>) -> Vec<Arc<dyn Registrable>> + Send>;

/// Services first, then the Ingress reconciler feeding it
pub fn default_subsystems(client: Client, config: Arc<Configuration>) -> Vec<Arc<dyn Registrable>> {
    let services = Arc::new(Services::new(&config));
    let reconciler = IngressReconciler::new(client, config, services.clone());
    vec![services, Arc::new(reconciler)]
}

/// Drives the bootstrap sequence
pub struct Launcher {
    loader: Arc<dyn ConfigLoader>,
    provider: Arc<dyn ManagerProvider>,
    subsystems: SubsystemBuilder,
    state: watch::Sender<LifecycleState>,
}

impl Launcher {
    /// Launcher with the production manager provider and subsystems
    pub fn new(loader: impl ConfigLoader + 'static) -> Self {
        let (state, _) = watch::channel(LifecycleState::Initializing);
        Self {
            loader: Arc::new(loader),
            provider: Arc::new(ClusterManagerProvider),
            subsystems: Box::new(default_subsystems),
            state,
        }
    }

    /// Replace how the manager is constructed
    pub fn with_manager_provider(mut self, provider: impl ManagerProvider + 'static) -> Self {
        self.provider = Arc::new(provider);
        self
    }

    /// Replace the subsystems registered with the manager
    pub fn with_subsystems<F>(mut self, build: F) -> Self
    where
        F: FnOnce(Client, Arc<Configuration>) -> Vec<Arc<dyn Registrable>> + Send + 'static,
    {
        self.subsystems = Box::new(build);
        self
    }

    /// Watch the lifecycle state
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Run the whole sequence under `ctx`
    ///
    /// Returns `Ok(())` only when the manager shut down cleanly after `ctx`
    /// was cancelled.
    pub async fn run(self, ctx: ExecutionContext) -> std::result::Result<(), LaunchError> {
        let launch_ctx = ctx.child("launch");
        let span = launch_ctx.logger().clone();
        let state = self.state.clone();
        let result = self.sequence(ctx, launch_ctx).instrument(span).await;
        state.send_replace(LifecycleState::Terminated);
        result
    }

    async fn sequence(
        self,
        ctx: ExecutionContext,
        launch_ctx: ExecutionContext,
    ) -> std::result::Result<(), LaunchError> {
        let Launcher {
            loader,
            provider,
            subsystems,
            state,
        } = self;

        let config = Arc::new(loader.load().await.map_err(LaunchError::at(Stage::Config))?);

        info!("configuring manager");
        let mut manager = provider
            .create(&launch_ctx, &config)
            .await
            .map_err(LaunchError::at(Stage::Manager))?;
        state.send_replace(LifecycleState::Registering);

        info!("configuring probes");
        manager
            .add_healthz_check("healthz", ping())
            .map_err(LaunchError::at(Stage::HealthCheck))?;
        manager
            .add_readyz_check("readyz", ping())
            .map_err(LaunchError::at(Stage::ReadyCheck))?;

        for subsystem in subsystems(manager.client(), config.clone()) {
            let name = subsystem.name().to_string();
            info!("configuring {}", subsystem.label());
            subsystem
                .setup_with(&launch_ctx, &mut manager)
                .await
                .map_err(LaunchError::at(Stage::Subsystem(name)))?;
        }

        info!("starting manager");
        state.send_replace(LifecycleState::Running);
        let run = manager.start(ctx.clone());
        tokio::pin!(run);

        let result = tokio::select! {
            result = &mut run => result,
            _ = ctx.cancelled() => {
                state.send_replace(LifecycleState::ShuttingDown);
                run.await
            }
        };
        state.send_replace(LifecycleState::ShuttingDown);
        result.map_err(LaunchError::at(Stage::Run))
    }
}

/// Map the launch outcome to the process exit code, logging failures
pub fn exit_code(result: &std::result::Result<(), LaunchError>) -> i32 {
    match result {
        Ok(()) => {
            info!("shutdown complete");
            0
        }
        Err(e) => {
            let phase = if e.source.is_runtime() { "run" } else { "startup" };
            error!(stage = %e.stage, phase, error = %e.source, "{}", e.stage);
            1
        }
    }
}

/// Ends the process with an exit code
pub trait Terminator {
    /// Terminate with `code`
    fn exit(&self, code: i32);
}

/// Terminates the real process
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn exit(&self, code: i32) {
        std::process::exit(code)
    }
}

/// Run `launcher` to completion and hand the exit code to `terminator`
pub async fn run_to_exit(
    launcher: Launcher,
    ctx: ExecutionContext,
    terminator: &(dyn Terminator + Sync),
) -> i32 {
    let result = launcher.run(ctx).await;
    let code = exit_code(&result);
    terminator.exit(code);
    code
}
