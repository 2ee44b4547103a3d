use crate::backend::{
    compose_spec, exec_args, log_args, parse_image_list, parse_log_output, parse_port_mappings,
    ComposeRequest, ContainerRuntime, RuntimeSettings,
};
use crate::probe::{podman_common_paths, probe_podman, Platform, RuntimeStatus};
use crate::process::{find_binary, run_captured, run_checked, run_interactive, ProcessSpec};
use crate::pull::PullDialect;
use crate::status::{parse_status_table, state_from_text, ContainerStatus, ContainerStatusRecord};
use crate::RuntimeError;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Podman CLI backend. Compose commands go through `podman compose`, which
/// delegates to whichever compose provider is installed.
pub struct PodmanRuntime {
    settings: RuntimeSettings,
    platform: Platform,
    binary: OnceLock<Option<PathBuf>>,
}

impl PodmanRuntime {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            settings,
            platform: Platform::current(),
            binary: OnceLock::new(),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    fn binary(&self) -> Option<&PathBuf> {
        self.binary
            .get_or_init(|| {
                find_binary(
                    "podman",
                    self.settings.podman_path.as_deref(),
                    podman_common_paths(self.platform),
                )
            })
            .as_ref()
    }

    pub(crate) fn program(&self) -> PathBuf {
        self.binary().cloned().unwrap_or_else(|| PathBuf::from("podman"))
    }

    fn command(&self) -> ProcessSpec {
        ProcessSpec::new(self.program())
    }

    fn compose(&self, request: &ComposeRequest, action: &[&str]) -> ProcessSpec {
        compose_spec(
            &self.program(),
            &["compose"],
            &self.settings.project_name,
            request,
            action,
        )
        .env("COMPOSE_PROVIDER", "podman")
    }

    fn run(&self, spec: &ProcessSpec, context: &str) -> Result<String, RuntimeError> {
        Ok(run_checked(spec, self.settings.command_timeout, context)?.stdout)
    }

    /// Reject documents podman's compose provider cannot read before any
    /// container is touched.
    fn validate(&self, request: &ComposeRequest) -> Result<(), RuntimeError> {
        let validation = ComposeRequest {
            services: Vec::new(),
            ..request.clone()
        };
        let spec = compose_spec(
            &self.program(),
            &["--log-level", "error", "compose"],
            &self.settings.project_name,
            &validation,
            &["config", "--quiet"],
        );
        self.run(&spec, "compose file validation failed").map(drop)
    }

    fn ensure_network(&self) {
        let spec = self
            .command()
            .args(["network", "create", "--driver", "bridge"])
            .arg(&self.settings.network_name);
        if let Ok(out) = run_captured(&spec, self.settings.command_timeout) {
            if out.success() {
                debug!("created network {}", self.settings.network_name);
            }
        }
    }
}

impl ContainerRuntime for PodmanRuntime {
    fn name(&self) -> &str {
        "podman"
    }

    fn project_name(&self) -> &str {
        &self.settings.project_name
    }

    fn probe(&self) -> RuntimeStatus {
        probe_podman(
            self.binary().map(PathBuf::as_path),
            self.platform,
            self.settings.probe_timeout,
        )
    }

    fn compose_up(&self, request: &ComposeRequest) -> Result<(), RuntimeError> {
        self.validate(request)?;
        self.ensure_network();
        let mut action = vec!["up", "-d"];
        if request.quiet_pull {
            action.push("--quiet-pull");
        }
        info!("starting services: {}", request.services.join(", "));
        self.run(&self.compose(request, &action), "failed to start services")
            .map(drop)
    }

    fn compose_down(&self, request: &ComposeRequest) -> Result<(), RuntimeError> {
        self.run(&self.compose(request, &["stop"]), "failed to stop services")?;
        self.run(&self.compose(request, &["rm", "-f"]), "failed to remove containers")?;
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
        PullDialect::Podman
    }

    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let spec = self.command().args(["image", "exists", image]);
        Ok(run_captured(&spec, self.settings.command_timeout)?.success())
    }

    fn list_images(&self) -> Result<Vec<String>, RuntimeError> {
        let spec = self
            .command()
            .args(["images", "--format", "{{.Repository}}:{{.Tag}}"]);
        Ok(parse_image_list(&self.run(&spec, "failed to list images")?))
    }

    /// Podman has no missing-container error worth matching on, so a filtered
    /// listing decides existence: no row means `NotFound`.
    fn container_status(&self, container: &str) -> ContainerStatus {
        let spec = self
            .command()
            .args(["ps", "-a", "--format", "{{.Names}}\t{{.Status}}", "--filter"])
            .arg(format!("name=^{container}$"));
        let out = match run_captured(&spec, self.settings.status_timeout) {
            Ok(out) if out.success() => out,
            Ok(out) => {
                debug!("ps {container} failed: {}", out.combined());
                return ContainerStatus::Unknown;
            }
            Err(e) => {
                debug!("ps {container} failed: {e}");
                return ContainerStatus::Unknown;
            }
        };
        out.stdout
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .find(|(name, _)| name.trim() == container)
            .map_or(ContainerStatus::NotFound, |(_, text)| {
                ContainerStatus::normalize(state_from_text(text), text, None)
            })
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

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn runtime(dir: &Path, body: &str) -> PodmanRuntime {
        let path = dir.join("podman");
        let log = dir.join("calls");
        std::fs::write(
            &path,
            format!("#!/bin/sh\necho \"$*\" >> '{}'\n{body}\n", log.display()),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        PodmanRuntime::new(RuntimeSettings {
            podman_path: Some(path),
            ..RuntimeSettings::default()
        })
    }

    fn calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls"))
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn compose_up_validates_then_creates_network() {
        let dir = tempfile::tempdir().unwrap();
        let podman = runtime(dir.path(), "exit 0");
        let request = ComposeRequest::new(
            vec![dir.path().join("docker-compose.yaml")],
            vec!["postgres".to_owned(), "redis".to_owned()],
        );
        podman.compose_up(&request).unwrap();
        let calls = calls(dir.path());
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("--log-level error compose --project-name insta"));
        assert!(calls[0].ends_with("config --quiet"));
        assert_eq!(calls[1], "network create --driver bridge insta-network");
        assert!(calls[2].starts_with("compose --project-name insta -f "));
        assert!(calls[2].ends_with("up -d postgres redis"));
    }

    #[test]
    fn invalid_compose_aborts_before_up() {
        let dir = tempfile::tempdir().unwrap();
        let podman = runtime(
            dir.path(),
            r#"case "$*" in *config*) echo "yaml: line 3: bad indent" >&2; exit 1 ;; esac"#,
        );
        let request = ComposeRequest::new(vec![dir.path().join("c.yaml")], vec!["x".to_owned()]);
        let err = podman.compose_up(&request).unwrap_err();
        assert!(err.to_string().contains("validation failed"), "{err}");
        assert_eq!(calls(dir.path()).len(), 1);
    }

    #[test]
    fn single_status_from_filtered_listing() {
        let dir = tempfile::tempdir().unwrap();
        let podman = runtime(
            dir.path(),
            r#"case "$6" in
  name=^pg\$) printf 'pg\tUp 3 minutes (healthy)\n' ;;
  name=^done\$) printf 'done\tExited (0) 2 minutes ago\n' ;;
esac"#,
        );
        assert_eq!(podman.container_status("pg"), ContainerStatus::RunningHealthy);
        assert_eq!(podman.container_status("done"), ContainerStatus::Completed);
        assert_eq!(podman.container_status("ghost"), ContainerStatus::NotFound);
    }

    #[test]
    fn image_exists_uses_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let podman = runtime(dir.path(), r#"[ "$3" = redis:7 ]"#);
        assert!(podman.image_exists("redis:7").unwrap());
        assert!(!podman.image_exists("redis:6").unwrap());
        assert_eq!(podman.pull_dialect(), PullDialect::Podman);
    }

    #[test]
    fn stalled_status_query_gives_up_at_status_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let stalled = runtime(dir.path(), "exec sleep 5");
        let podman = PodmanRuntime::new(RuntimeSettings {
            status_timeout: std::time::Duration::from_millis(300),
            ..stalled.settings().clone()
        });
        let started = std::time::Instant::now();
        assert_eq!(podman.container_status("pg"), ContainerStatus::Unknown);
        assert!(matches!(
            podman.all_container_statuses(),
            Err(RuntimeError::Timeout { .. })
        ));
        assert!(started.elapsed() < std::time::Duration::from_secs(4));
    }
}
