use crate::docker::DockerRuntime;
use crate::podman::PodmanRuntime;
use crate::probe::{Platform, RuntimeStatus, SystemRuntimeStatus};
use crate::process::ProcessSpec;
use crate::pull::PullDialect;
use crate::status::{ContainerStatus, ContainerStatusRecord};
use crate::RuntimeError;
use insta_schema::{ComposeGraph, DependencyResolver};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Environment defaults some bundled compose documents interpolate. Values
/// already present in the process environment win.
const COMPOSE_ENV_DEFAULTS: &[(&str, &str)] = &[
    ("DB_USER", "root"),
    ("DB_USER_PASSWORD", "root"),
    ("ELASTICSEARCH_USER", "elastic"),
    ("ELASTICSEARCH_PASSWORD", "changeme"),
    ("MYSQL_USER", "root"),
    ("MYSQL_PASSWORD", "root"),
];

/// Settings shared by the process-backed runtimes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub project_name: String,
    pub network_name: String,
    pub command_timeout: Duration,
    /// Deadline for status queries, which sit on interactive read paths.
    pub status_timeout: Duration,
    pub probe_timeout: Duration,
    pub docker_path: Option<PathBuf>,
    pub podman_path: Option<PathBuf>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            project_name: "insta".to_owned(),
            network_name: "insta-network".to_owned(),
            command_timeout: Duration::from_secs(300),
            status_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(15),
            docker_path: None,
            podman_path: None,
        }
    }
}

/// Services to bring up or down, and the compose documents describing them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeRequest {
    pub files: Vec<PathBuf>,
    pub services: Vec<String>,
    pub quiet_pull: bool,
}

impl ComposeRequest {
    pub fn new(files: Vec<PathBuf>, services: Vec<String>) -> Self {
        Self {
            files,
            services,
            quiet_pull: false,
        }
    }

    #[must_use]
    pub fn quiet_pull(mut self, quiet: bool) -> Self {
        self.quiet_pull = quiet;
        self
    }

    /// Compose resolves relative paths against the first document's directory.
    pub fn working_dir(&self) -> Option<&Path> {
        self.files
            .first()
            .and_then(|f| f.parent())
            .filter(|p| !p.as_os_str().is_empty())
    }
}

/// One container runtime, driven through its command-line interface.
///
/// Request/response methods block until the backend answers (bounded by the
/// configured command timeout). Streaming is split: the runtime describes the
/// process to run (`log_stream_spec`, `pull_spec`) and a
/// [`StreamManager`](crate::stream::StreamManager) runs it.
///
/// Status queries never fail on unexpected output; they degrade to
/// [`ContainerStatus::Unknown`].
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn project_name(&self) -> &str;

    /// Staged availability probe.
    fn probe(&self) -> RuntimeStatus;

    fn compose_up(&self, request: &ComposeRequest) -> Result<(), RuntimeError>;

    /// Stop then remove the requested services' containers. Volumes are kept.
    fn compose_down(&self, request: &ComposeRequest) -> Result<(), RuntimeError>;

    /// Run `bash -c <command>` in a container. Interactive sessions inherit
    /// the terminal and return an empty string.
    fn exec(&self, container: &str, command: &str, interactive: bool) -> Result<String, RuntimeError>;

    /// Container port (`80/tcp`) to host port (`8080`).
    fn port_mappings(&self, container: &str) -> Result<BTreeMap<String, String>, RuntimeError>;

    fn container_exists(&self, container: &str) -> bool;

    fn logs(&self, container: &str, tail: usize) -> Result<Vec<String>, RuntimeError>;

    fn log_stream_spec(&self, container: &str) -> ProcessSpec;

    fn pull_spec(&self, image: &str) -> ProcessSpec;

    fn pull_dialect(&self) -> PullDialect;

    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Local images as `repository:tag`.
    fn list_images(&self) -> Result<Vec<String>, RuntimeError>;

    fn container_status(&self, container: &str) -> ContainerStatus;

    /// Every container of the project in one backend call.
    fn all_container_statuses(&self) -> Result<Vec<ContainerStatusRecord>, RuntimeError>;

    /// Existence of several images from a single listing.
    fn images_exist(&self, images: &[String]) -> Result<BTreeMap<String, bool>, RuntimeError> {
        let listed: HashSet<String> = self.list_images()?.into_iter().collect();
        Ok(images
            .iter()
            .map(|image| (image.clone(), image_listed(&listed, image)))
            .collect())
    }

    /// Container identity for a service: explicit `container_name`, else the
    /// first existing candidate among the compose naming schemes, else the
    /// service name.
    fn container_name(&self, graph: &ComposeGraph, service: &str) -> String {
        if let Some(explicit) = graph.get(service).and_then(|s| s.container_name.clone()) {
            return explicit;
        }
        let project = self.project_name();
        let candidates = [
            service.to_owned(),
            format!("{project}_{service}_1"),
            format!("{project}-{service}-1"),
        ];
        candidates
            .into_iter()
            .find(|c| self.container_exists(c))
            .unwrap_or_else(|| service.to_owned())
    }

    /// Transitive dependencies of a service, as container identities.
    fn dependencies(&self, graph: &ComposeGraph, service: &str, include_self: bool) -> Vec<String> {
        DependencyResolver::new(graph).resolve(service, include_self)
    }
}

/// Ordered set of runtimes with detection and explicit selection.
pub struct Provider {
    runtimes: Vec<Arc<dyn ContainerRuntime>>,
    platform: Platform,
}

impl Provider {
    pub fn new(runtimes: Vec<Arc<dyn ContainerRuntime>>) -> Self {
        Self {
            runtimes,
            platform: Platform::current(),
        }
    }

    /// Docker then Podman, sharing `settings`.
    pub fn with_settings(settings: &RuntimeSettings) -> Self {
        Self::new(vec![
            Arc::new(DockerRuntime::new(settings.clone())),
            Arc::new(PodmanRuntime::new(settings.clone())),
        ])
    }

    pub fn names(&self) -> Vec<&str> {
        self.runtimes.iter().map(|r| r.name()).collect()
    }

    /// First runtime whose probe succeeds.
    pub fn detect(&self) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        let mut failures = Vec::new();
        for runtime in &self.runtimes {
            let status = runtime.probe();
            if status.available {
                debug!("selected runtime {}", runtime.name());
                return Ok(Arc::clone(runtime));
            }
            failures.push(format!(
                "{}: {}",
                runtime.name(),
                status.error.as_deref().unwrap_or("unavailable")
            ));
        }
        Err(RuntimeError::Unavailable(format!(
            "no supported container runtime found (tried: {})",
            failures.join("; ")
        )))
    }

    /// Select a runtime by name; it must pass its probe.
    pub fn select(&self, name: &str) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        let wanted = name.trim().to_ascii_lowercase();
        let runtime = self
            .runtimes
            .iter()
            .find(|r| r.name() == wanted)
            .ok_or_else(|| {
                RuntimeError::Unavailable(format!(
                    "unsupported runtime: {name} (supported: {})",
                    self.names().join(", ")
                ))
            })?;
        let status = runtime.probe();
        if !status.available {
            let mut reason = status.error.clone().unwrap_or_else(|| "unavailable".to_owned());
            if let Some(hint) = status.remediation() {
                reason = format!("{reason}; {hint}");
            }
            return Err(RuntimeError::Unavailable(format!(
                "runtime {wanted} is not available: {reason}"
            )));
        }
        Ok(Arc::clone(runtime))
    }

    pub fn system_status(&self) -> SystemRuntimeStatus {
        let statuses = self.runtimes.iter().map(|r| r.probe()).collect();
        SystemRuntimeStatus::from_statuses(statuses, self.platform)
    }
}

/// `<prefix> --project-name <p> -f <file>... <action...> [services...]`
pub(crate) fn compose_spec(
    program: &Path,
    prefix: &[&str],
    project: &str,
    request: &ComposeRequest,
    action: &[&str],
) -> ProcessSpec {
    let mut spec = ProcessSpec::new(program)
        .args(prefix.iter().copied())
        .args(["--project-name", project]);
    for file in &request.files {
        spec = spec.arg("-f").arg(file.display().to_string());
    }
    spec = spec
        .args(action.iter().copied())
        .args(request.services.iter().cloned());
    if let Some(dir) = request.working_dir() {
        spec = spec.current_dir(dir);
    }
    for (key, value) in COMPOSE_ENV_DEFAULTS {
        if std::env::var_os(key).is_none() {
            spec = spec.env(*key, *value);
        }
    }
    spec
}

/// `exec [-it] <container> bash [-c <command>]`
pub(crate) fn exec_args(container: &str, command: &str, interactive: bool) -> Vec<String> {
    let mut args = vec!["exec".to_owned()];
    if interactive {
        args.push("-it".to_owned());
    }
    args.push(container.to_owned());
    args.push("bash".to_owned());
    if !command.is_empty() {
        args.push("-c".to_owned());
        args.push(command.to_owned());
    }
    args
}

/// `logs --tail N <container>` or `logs --follow --tail 50 <container>`.
pub(crate) fn log_args(container: &str, tail: usize, follow: bool) -> Vec<String> {
    let mut args = vec!["logs".to_owned()];
    if follow {
        args.push("--follow".to_owned());
        args.extend(["--tail".to_owned(), "50".to_owned()]);
    } else {
        args.extend(["--tail".to_owned(), tail.to_string()]);
    }
    args.push(container.to_owned());
    args
}

/// Parse `80/tcp -> 0.0.0.0:8080` lines.
pub fn parse_port_mappings(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (container, host) = line.split_once(" -> ")?;
            let host = host.trim();
            let port = host.rsplit_once(':').map_or(host, |(_, p)| p);
            Some((container.trim().to_owned(), port.to_owned()))
        })
        .collect()
}

pub fn parse_log_output(output: &str) -> Vec<String> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.lines().map(str::to_owned).collect()
}

/// `repository:tag` lines, skipping dangling `<none>:<none>` images.
pub fn parse_image_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != "<none>:<none>")
        .map(str::to_owned)
        .collect()
}

/// An untagged reference matches its `:latest` listing.
pub fn image_listed(listed: &HashSet<String>, image: &str) -> bool {
    if listed.contains(image) {
        return true;
    }
    let name = image.rsplit('/').next().unwrap_or(image);
    !name.contains(':') && !image.contains('@') && listed.contains(&format!("{image}:latest"))
}
