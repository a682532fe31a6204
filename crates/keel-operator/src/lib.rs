//! Keel ingress controller: bootstrap sequence and subsystems
//!
//! [`launch::Launcher`] drives configuration, manager construction, probe and
//! subsystem registration, and the run loop, and decides the exit code.

#![deny(missing_docs)]

pub mod launch;
pub mod reconciler;
pub mod services;

pub use launch::{
    default_subsystems, exit_code, run_to_exit, ClusterManagerProvider, LaunchError, Launcher,
    LifecycleState, ManagerProvider, ProcessExit, Stage, SubsystemBuilder, Terminator,
};
pub use reconciler::IngressReconciler;
pub use services::Services;
