//! Cancellable execution context
//!
//! One root context is built per process, bound to SIGINT/SIGTERM, and handed
//! by value to every component. Components derive children with
//! [`ExecutionContext::child`]; cancelling the root cancels every child, while
//! cancelling a child leaves its parent running.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{info, Span};

use crate::{Error, Result};

/// Cancellable handle carrying a logger binding
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    name: String,
    token: CancellationToken,
    span: Span,
}

impl ExecutionContext {
    /// Create a root context that is only cancelled explicitly
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            token: CancellationToken::new(),
            span: tracing::info_span!("keel", component = %name),
        }
    }

    /// Create the process root context, cancelled on the first SIGINT or SIGTERM
    ///
    /// Must be called from within a tokio runtime. Failing to install the
    /// signal listeners is an unrecoverable startup fault.
    pub fn from_signals(name: &str) -> Result<Self> {
        let ctx = Self::new(name);
        let token = ctx.token.clone();
        let span = ctx.span.clone();
        let signals = TerminationSignals::install()?;

        tokio::spawn(async move {
            tokio::select! {
                received = signals.recv() => {
                    let _entered = span.enter();
                    info!(signal = received, "Termination signal received, shutting down");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });

        Ok(ctx)
    }

    /// Derive a named child context that inherits cancellation
    pub fn child(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            token: self.token.child_token(),
            span: tracing::info_span!(parent: &self.span, "keel", component = %name),
        }
    }

    /// Name this context was created with
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logger binding for this context
    pub fn logger(&self) -> &Span {
        &self.span
    }

    /// Cancel this context and all of its children. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether this context (or an ancestor) has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the context is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Run `fut` until it completes or the context is cancelled
    ///
    /// Returns `None` when cancellation won the race.
    pub async fn run_until_cancelled<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            out = fut => Some(out),
            _ = self.token.cancelled() => None,
        }
    }
}

#[cfg(unix)]
struct TerminationSignals {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate()).map_err(|source| Error::Signal { source })?;
        let sigint = signal(SignalKind::interrupt()).map_err(|source| Error::Signal { source })?;
        Ok(Self { sigterm, sigint })
    }

    async fn recv(mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "ctrl-c",
            Err(e) => {
                tracing::error!(error = %e, "ctrl-c listener failed, shutting down");
                "ctrl-c"
            }
        }
    }
}
