//! Runtime for keel controllers
//!
//! Provides the [`Manager`] that hosts health probes, metrics, leader election
//! and the runnables subsystems register with it.

#![deny(missing_docs)]

pub mod health;
pub mod leader_election;
pub mod manager;
pub mod metrics;
pub mod runnable;

#[cfg(test)]
mod testing;

pub use health::{ping, probe, CheckCategory, CheckSet, Probe};
pub use leader_election::{
    default_identity, KubeLeaseLock, LeaderElectionError, LeaderElector, LeadershipState,
    LeaseLock, LeaseRecord,
};
pub use manager::{Manager, ManagerOptions, DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT};
pub use metrics::{metrics_router, ManagerMetrics};
pub use runnable::{runnable_fn, Registrable, Runnable, RunnableFn};
