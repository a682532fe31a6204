//! Units of work hosted by the manager
//!
//! Subsystems implement [`Registrable`] and, during setup, hand the manager
//! one or more [`Runnable`]s. Nothing executes until the manager starts.

use std::future::Future;

use async_trait::async_trait;

use keel_common::{ExecutionContext, Result};

use crate::manager::Manager;

/// Long-running work started by the manager's run loop
#[async_trait]
pub trait Runnable: Send + 'static {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Whether this work may only run while the replica leads
    ///
    /// Reconciliation-class work must return `true` (the default); work every
    /// replica performs, such as serving or local caches, returns `false`.
    fn needs_leader_election(&self) -> bool {
        true
    }

    /// Run until `ctx` is cancelled; returning an error stops the manager
    async fn start(self: Box<Self>, ctx: ExecutionContext) -> Result<()>;
}

/// A subsystem that registers itself with the manager before start
#[async_trait]
pub trait Registrable: Send + Sync {
    /// Name used in the startup failure message (`unable to create <name>`)
    fn name(&self) -> &str;

    /// Label for the progress log line (`configuring <label>`)
    fn label(&self) -> &str {
        self.name()
    }

    /// Register watches, checks and runnables against `manager`
    ///
    /// Called exactly once, before the manager starts. Must not spawn work of
    /// its own.
    async fn setup_with(&self, ctx: &ExecutionContext, manager: &mut Manager) -> Result<()>;
}

/// [`Runnable`] built from a closure
pub struct RunnableFn<F> {
    name: String,
    needs_leader: bool,
    run: F,
}

/// Wrap an async closure as a boxed [`Runnable`]
pub fn runnable_fn<F, Fut>(name: &str, needs_leader: bool, run: F) -> Box<dyn Runnable>
where
    F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(RunnableFn {
        name: name.to_string(),
        needs_leader,
        run,
    })
}

#[async_trait]
impl<F, Fut> Runnable for RunnableFn<F>
where
    F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_leader_election(&self) -> bool {
        self.needs_leader
    }

    async fn start(self: Box<Self>, ctx: ExecutionContext) -> Result<()> {
        let this = *self;
        (this.run)(ctx).await
    }
}
