//! Core domain types and shared plumbing for the vigil daemon.

pub mod config;
pub mod shutdown;
pub mod tokens;
pub mod types;

pub use config::{Config, ConfigError};
pub use shutdown::ShutdownSignal;
