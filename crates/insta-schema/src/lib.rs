//! Configuration model for insta.
//!
//! This crate defines the schema layer: decoding of layered compose documents
//! into a normalized `ComposeGraph` (`compose`, `loader`), the merge rules applied
//! when a service is declared in more than one document (`merge`), the read-only
//! `ServiceRegistry` of known service definitions (`registry`), and the
//! backend-agnostic `DependencyResolver` (`deps`).

pub mod compose;
pub mod deps;
pub mod loader;
pub mod merge;
pub mod registry;

pub use compose::{
    parse_compose_str, ComposeServiceSpec, Dependency, DependencyCondition, FlexField,
    HealthCheck,
};
pub use deps::{DependencyEdge, DependencyResolver};
pub use loader::{ComposeDocuments, ComposeGraph, ConfigCache, RefreshPolicy};
pub use merge::merge_service;
pub use registry::{PortType, ServiceDefinition, ServicePort, ServiceRegistry};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse compose document {origin}: {message}")]
    Parse { origin: String, message: String },
    #[error("compose document not found: {0}")]
    MissingDocument(PathBuf),
    #[error("invalid service registry: {0}")]
    Registry(String),
}
