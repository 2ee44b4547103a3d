//! Container runtime backends for insta.
//!
//! This crate implements the execution layer: the `ContainerRuntime` trait with
//! Docker and Podman backends (plus an in-memory mock), staged availability
//! probes and remediation, canonical status normalization, image pull progress
//! parsing, and the cancellable `StreamManager` for log and pull streams.

pub mod backend;
pub mod docker;
pub mod mock;
pub mod podman;
pub mod probe;
pub mod process;
pub mod pull;
pub mod remediate;
pub mod status;
pub mod stream;

pub use backend::{ComposeRequest, ContainerRuntime, Provider, RuntimeSettings};
pub use docker::DockerRuntime;
pub use mock::MockRuntime;
pub use podman::PodmanRuntime;
pub use probe::{Platform, ProbeStage, RuntimeStatus, StartupCommand, SystemRuntimeStatus};
pub use process::{CapturedOutput, ProcessSpec};
pub use pull::{PullDialect, PullParser, PullPhase, PullProgressEvent};
pub use remediate::{attempt_start, wait_until_ready, StartupOutcome};
pub use status::{ContainerStatus, ContainerStatusRecord};
pub use stream::{
    EventSink, LineDecoder, LogLine, OutputStream, StreamEvent, StreamHandle, StreamKind,
    StreamManager,
};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("{context}: {output}")]
    OperationFailed { context: String, output: String },
    #[error("a {kind} stream is already active for '{target}'")]
    Conflict { kind: StreamKind, target: String },
    #[error("'{command}' did not finish within {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
}
