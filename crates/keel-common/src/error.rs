//! Error types for the keel controller
//!
//! Errors carry enough context (check category, runnable name, bind address)
//! to make the single fatal log line emitted at exit useful on its own.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Main error type for keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API or client construction error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Static configuration could not be loaded or is invalid
    #[error("configuration error: {}{message}", field_prefix(.field))]
    Config {
        /// Description of what's invalid
        message: String,
        /// The flag or field at fault, if known
        field: Option<String>,
    },

    /// Termination-signal handling could not be installed
    #[error("failed to install signal handler: {source}")]
    Signal {
        /// The underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// A health or readiness check could not be registered
    #[error("cannot register {category} check {name:?}: {message}")]
    Registration {
        /// Check category (`healthz` or `readyz`)
        category: String,
        /// Name of the rejected check
        name: String,
        /// Why it was rejected
        message: String,
    },

    /// The type registry is unusable for the requested options
    #[error("invalid scheme: {message}")]
    Scheme {
        /// Description of what's missing or duplicated
        message: String,
    },

    /// A listener could not be bound
    #[error("cannot bind {purpose} listener on {addr}: {source}")]
    Bind {
        /// What the listener serves (probes, metrics)
        purpose: String,
        /// The address that failed
        addr: SocketAddr,
        /// The underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// A runnable registered with the manager failed
    #[error("runnable {name} failed: {message}")]
    Runnable {
        /// Runnable name
        name: String,
        /// Description of what failed
        message: String,
    },

    /// This replica held leadership and lost it
    #[error("leader election lost for {identity}")]
    LeadershipLost {
        /// Identity of the replica that lost the lease
        identity: String,
    },

    /// Runnables did not stop within the grace period
    #[error("{pending} runnable(s) did not stop within the {timeout:?} grace period")]
    ShutdownTimeout {
        /// Number of tasks still running when the timer fired
        pending: usize,
        /// The grace period that was exceeded
        timeout: Duration,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "manager", "elector")
        context: String,
    },
}

impl Error {
    /// Create a configuration error without a field reference
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error pointing at a specific flag
    pub fn config_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a check registration error
    pub fn registration(
        category: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Registration {
            category: category.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a scheme error
    pub fn scheme(msg: impl Into<String>) -> Self {
        Self::Scheme {
            message: msg.into(),
        }
    }

    /// Create a runnable failure
    pub fn runnable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Runnable {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error came from the run phase rather than bootstrap
    ///
    /// Used by the exit path to tell a failed startup from a failed run.
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            Self::Runnable { .. } | Self::LeadershipLost { .. } | Self::ShutdownTimeout { .. }
        )
    }
}

fn field_prefix(field: &Option<String>) -> String {
    field
        .as_deref()
        .map(|f| format!("--{f}: "))
        .unwrap_or_default()
}
