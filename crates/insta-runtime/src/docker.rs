use crate::backend::{
    compose_spec, exec_args, log_args, parse_image_list, parse_log_output, parse_port_mappings,
    ComposeRequest, ContainerRuntime, RuntimeSettings,
};
use crate::probe::{docker_common_paths, probe_docker, Platform, RuntimeStatus};
use crate::process::{find_binary, run_captured, run_checked, run_interactive, ProcessSpec};
use crate::pull::PullDialect;
use crate::status::{parse_inspect_line, parse_status_table, ContainerStatus, ContainerStatusRecord};
use crate::RuntimeError;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{debug, info};

const COMPOSE_PREFIX: &[&str] = &["--log-level", "error", "compose"];

/// Docker CLI backend.
pub struct DockerRuntime {
    settings: RuntimeSettings,
    platform: Platform,
    binary: OnceLock<Option<PathBuf>>,
}

impl DockerRuntime {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            settings,
            platform: Platform::current(),
            binary: OnceLock::new(),
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    fn binary(&self) -> Option<&PathBuf> {
        self.binary
            .get_or_init(|| {
                find_binary(
                    "docker",
                    self.settings.docker_path.as_deref(),
                    docker_common_paths(self.platform),
                )
            })
            .as_ref()
    }

    fn program(&self) -> PathBuf {
        self.binary().cloned().unwrap_or_else(|| PathBuf::from("docker"))
    }

    fn command(&self) -> ProcessSpec {
        ProcessSpec::new(self.program())
    }

    fn run(&self, spec: &ProcessSpec, context: &str) -> Result<String, RuntimeError> {
        Ok(run_checked(spec, self.settings.command_timeout, context)?.stdout)
    }

    fn ensure_network(&self) {
        let spec = self
            .command()
            .args(["network", "create", "--driver", "bridge"])
            .arg(&self.settings.network_name);
        // Already existing is the common case.
        if let Ok(out) = run_captured(&spec, self.settings.command_timeout) {
            if out.success() {
                debug!("created network {}", self.settings.network_name);
            }
        }
    }
}

impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    fn project_name(&self) -> &str {
        &self.settings.project_name
    }

    fn probe(&self) -> RuntimeStatus {
        probe_docker(
            self.binary().map(PathBuf::as_path),
            self.platform,
            self.settings.probe_timeout,
        )
    }

    fn compose_up(&self, request: &ComposeRequest) -> Result<(), RuntimeError> {
        self.ensure_network();
        let mut action = vec!["up", "-d"];
        if request.quiet_pull {
            action.push("--quiet-pull");
        }
        let spec = compose_spec(
            &self.program(),
            COMPOSE_PREFIX,
            &self.settings.project_name,
            request,
            &action,
        );
        info!("starting services: {}", request.services.join(", "));
        self.run(&spec, "failed to start services").map(drop)
    }

    fn compose_down(&self, request: &ComposeRequest) -> Result<(), RuntimeError> {
        let program = self.program();
        let project = &self.settings.project_name;
        let stop = compose_spec(&program, COMPOSE_PREFIX, project, request, &["stop"]);
        self.run(&stop, "failed to stop services")?;
        let rm = compose_spec(&program, COMPOSE_PREFIX, project, request, &["rm", "-f"]);
        self.run(&rm, "failed to remove containers")?;
        info!("stopped services: {}", request.services.join(", "));
        Ok(())
    }

    fn exec(&self, container: &str, command: &str, interactive: bool) -> Result<String, RuntimeError> {
        let spec = self.command().args(exec_args(container, command, interactive));
        if interactive {
            let status = run_interactive(&spec)?;
            if !status.success() {
                return Err(RuntimeError::OperationFailed {
                    context: format!("exec in {container}"),
                    output: format!("exited with {status}"),
                });
            }
            return Ok(String::new());
        }
        let output = run_checked(&spec, self.settings.command_timeout, &format!("exec in {container}"))?;
        Ok(output.stdout)
    }

    fn port_mappings(&self, container: &str) -> Result<BTreeMap<String, String>, RuntimeError> {
        let spec = self.command().args(["port", container]);
        let stdout = self.run(&spec, &format!("failed to get ports for {container}"))?;
        Ok(parse_port_mappings(&stdout))
    }

    fn container_exists(&self, container: &str) -> bool {
        let spec = self
            .command()
            .args(["ps", "-a", "--format", "{{.Names}}", "--filter"])
            .arg(format!("name=^{container}$"));
        run_captured(&spec, self.settings.status_timeout).is_ok_and(|out| {
            out.success() && out.stdout.lines().any(|l| l.trim() == container)
        })
    }

    fn logs(&self, container: &str, tail: usize) -> Result<Vec<String>, RuntimeError> {
        let spec = self.command().args(log_args(container, tail, false));
        let output = run_checked(
            &spec,
            self.settings.command_timeout,
            &format!("failed to get logs for {container}"),
        )?;
        let mut lines = parse_log_output(&output.stdout);
        lines.extend(parse_log_output(&output.stderr));
        Ok(lines)
    }

    fn log_stream_spec(&self, container: &str) -> ProcessSpec {
        self.command().args(log_args(container, 0, true))
    }

    fn pull_spec(&self, image: &str) -> ProcessSpec {
        self.command().args(["pull", image])
    }

    fn pull_dialect(&self) -> PullDialect {
        PullDialect::Docker
    }

    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let spec = self.command().args(["image", "inspect", image]);
        Ok(run_captured(&spec, self.settings.command_timeout)?.success())
    }

    fn list_images(&self) -> Result<Vec<String>, RuntimeError> {
        let spec = self
            .command()
            .args(["images", "--format", "{{.Repository}}:{{.Tag}}"]);
        Ok(parse_image_list(&self.run(&spec, "failed to list images")?))
    }

    fn container_status(&self, container: &str) -> ContainerStatus {
        let spec = self.command().args([
            "inspect",
            "--format",
            "{{.State.Status}} {{.State.ExitCode}}",
            container,
        ]);
        match run_captured(&spec, self.settings.status_timeout) {
            Ok(out) if out.success() => parse_inspect_line(&out.stdout),
            Ok(out) if out.combined().contains("No such") => ContainerStatus::NotFound,
            Ok(out) => {
                debug!("inspect {container} failed: {}", out.combined());
                ContainerStatus::Unknown
            }
            Err(e) => {
                debug!("inspect {container} failed: {e}");
                ContainerStatus::Unknown
            }
        }
    }

    fn all_container_statuses(&self) -> Result<Vec<ContainerStatusRecord>, RuntimeError> {
        let spec = self
            .command()
            .args(["ps", "-a", "--filter"])
            .arg(format!(
                "label=com.docker.compose.project={}",
                self.settings.project_name
            ))
            .args(["--format", "{{.Names}},{{.State}},{{.Status}}"]);
        let output = run_checked(
            &spec,
            self.settings.status_timeout,
            "failed to list containers",
        )?;
        Ok(parse_status_table(&output.stdout))
    }
}
