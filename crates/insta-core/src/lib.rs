//! Orchestration layer for insta.
//!
//! `InfraManager` ties the compose configuration model, the selected container
//! runtime, and the service registry together. It answers status queries from
//! a short-TTL bulk cache combined with an optimistic overlay of in-flight
//! start/stop mutations, and owns the log and image-pull streams.

pub mod config;
pub mod manager;
pub mod overlay;
pub mod shutdown;
pub mod status_cache;

pub use config::{default_config_path, InstaConfig};
pub use manager::{InfraManager, ServiceStatus};
pub use overlay::{PendingTransitions, Transition};
pub use shutdown::{install_signal_handler, shutdown_requested, wait_until};
pub use status_cache::{StatusCache, StatusSnapshot};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(String),
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("compose error: {0}")]
    Schema(#[from] insta_schema::SchemaError),
    #[error("runtime error: {0}")]
    Runtime(#[from] insta_runtime::RuntimeError),
}
