//! Common types for keel: configuration, execution context and errors

#![deny(missing_docs)]

pub mod config;
pub mod context;
pub mod error;

pub use config::{
    ArgsConfigLoader, BindAddress, ConfigLoader, Configuration, LaunchArgs, LeaseTiming, Scheme,
};
pub use context::ExecutionContext;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
