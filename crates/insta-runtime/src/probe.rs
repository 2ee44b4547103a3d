use crate::process::{run_captured, search_path, ProcessSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    MacOs,
    Linux,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MacOs => "macos",
            Self::Linux => "linux",
            Self::Windows => "windows",
            Self::Other => "other",
        })
    }
}

/// Stage of the availability probe, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStage {
    Binary,
    Machine,
    Daemon,
    Compose,
}

/// A command that may bring a stopped runtime up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl StartupCommand {
    fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
        }
    }

    pub fn to_spec(&self) -> ProcessSpec {
        ProcessSpec::new(&self.program).args(self.args.iter().cloned())
    }
}

impl fmt::Display for StartupCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Result of probing one container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub name: String,
    pub installed: bool,
    pub running: bool,
    pub compose_available: bool,
    pub available: bool,
    pub version: Option<String>,
    pub binary: Option<PathBuf>,
    /// First stage that failed, if any.
    pub failed_stage: Option<ProbeStage>,
    pub error: Option<String>,
    pub can_auto_start: bool,
    pub installation_guide: String,
    pub startup_command: Option<StartupCommand>,
    pub requires_machine: bool,
    pub machine_status: Option<String>,
}

impl RuntimeStatus {
    fn new(name: &str, installation_guide: String) -> Self {
        Self {
            name: name.to_owned(),
            installed: false,
            running: false,
            compose_available: false,
            available: false,
            version: None,
            binary: None,
            failed_stage: None,
            error: None,
            can_auto_start: false,
            installation_guide,
            startup_command: None,
            requires_machine: false,
            machine_status: None,
        }
    }

    fn fail(mut self, stage: ProbeStage, error: &str) -> Self {
        debug!("{} probe failed at {stage:?}: {error}", self.name);
        self.failed_stage = Some(stage);
        self.error = Some(error.to_owned());
        self
    }

    /// A fully working runtime, used by in-memory backends.
    pub fn ready(name: &str, version: &str) -> Self {
        Self {
            installed: true,
            running: true,
            compose_available: true,
            available: true,
            version: Some(version.to_owned()),
            ..Self::new(name, String::new())
        }
    }

    /// Human remediation text for a failed probe.
    pub fn remediation(&self) -> Option<String> {
        match self.failed_stage? {
            ProbeStage::Binary => Some(self.installation_guide.clone()),
            ProbeStage::Machine | ProbeStage::Daemon => Some(match &self.startup_command {
                Some(cmd) => format!("start it with: {cmd}"),
                None => format!("start the {} service", self.name),
            }),
            ProbeStage::Compose => Some(format!(
                "install the compose plugin for {}",
                self.name
            )),
        }
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.available {
            return write!(
                f,
                "  - {}: ready (version {})",
                self.name,
                self.version.as_deref().unwrap_or("unknown")
            );
        }
        write!(
            f,
            "  - {}: {}",
            self.name,
            self.error.as_deref().unwrap_or("unavailable")
        )?;
        if let Some(hint) = self.remediation() {
            write!(f, " ({hint})")?;
        }
        Ok(())
    }
}

/// Aggregate view over every runtime probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRuntimeStatus {
    pub has_any_runtime: bool,
    pub preferred_runtime: Option<String>,
    pub available_runtimes: Vec<String>,
    pub runtime_statuses: Vec<RuntimeStatus>,
    pub recommended_action: String,
    pub can_proceed: bool,
    pub platform: Platform,
}

impl SystemRuntimeStatus {
    /// Statuses are in preference order; the first available runtime is
    /// preferred.
    pub fn from_statuses(statuses: Vec<RuntimeStatus>, platform: Platform) -> Self {
        let available_runtimes: Vec<String> = statuses
            .iter()
            .filter(|s| s.available)
            .map(|s| s.name.clone())
            .collect();
        let preferred_runtime = available_runtimes.first().cloned();
        let recommended_action = match &preferred_runtime {
            Some(name) => format!("Ready to use {name}"),
            None => recommended_action(&statuses, platform),
        };
        Self {
            has_any_runtime: preferred_runtime.is_some(),
            can_proceed: preferred_runtime.is_some(),
            preferred_runtime,
            available_runtimes,
            runtime_statuses: statuses,
            recommended_action,
            platform,
        }
    }
}

fn recommended_action(statuses: &[RuntimeStatus], platform: Platform) -> String {
    if let Some(s) = statuses
        .iter()
        .find(|s| s.installed && !s.running && s.can_auto_start)
    {
        return format!("Start {} service", s.name);
    }
    if let Some(s) = statuses.iter().find(|s| s.installed) {
        return format!("Configure {}", s.name);
    }
    match platform {
        Platform::MacOs => "Install Docker Desktop (recommended) or Podman",
        Platform::Linux => "Install Docker Engine or Podman",
        Platform::Windows => "Install Docker Desktop",
        Platform::Other => "Install Docker or Podman",
    }
    .to_owned()
}

pub fn docker_common_paths(platform: Platform) -> &'static [&'static str] {
    match platform {
        Platform::MacOs => &[
            "/usr/local/bin/docker",
            "/opt/homebrew/bin/docker",
            "/Applications/Docker.app/Contents/Resources/bin/docker",
        ],
        Platform::Linux => &[
            "/usr/bin/docker",
            "/usr/local/bin/docker",
            "/opt/docker/bin/docker",
            "/snap/bin/docker",
            "/var/lib/flatpak/exports/bin/docker",
        ],
        Platform::Windows => &[
            "C:\\Program Files\\Docker\\Docker\\resources\\bin\\docker.exe",
            "C:\\ProgramData\\chocolatey\\bin\\docker.exe",
            "C:\\tools\\docker\\docker.exe",
        ],
        Platform::Other => &[],
    }
}

pub fn podman_common_paths(platform: Platform) -> &'static [&'static str] {
    match platform {
        Platform::MacOs => &["/usr/local/bin/podman", "/opt/homebrew/bin/podman"],
        Platform::Linux => &[
            "/usr/bin/podman",
            "/usr/local/bin/podman",
            "/opt/podman/bin/podman",
            "/snap/bin/podman",
            "/var/lib/flatpak/exports/bin/podman",
        ],
        Platform::Windows => &[
            "C:\\Program Files\\RedHat\\Podman\\podman.exe",
            "C:\\ProgramData\\chocolatey\\bin\\podman.exe",
            "C:\\tools\\podman\\podman.exe",
        ],
        Platform::Other => &[],
    }
}

fn docker_installation_guide(platform: Platform) -> String {
    match platform {
        Platform::MacOs => "Install Docker Desktop from https://docs.docker.com/desktop/install/mac-install/ or use Homebrew: brew install --cask docker",
        Platform::Linux => "Install Docker Engine from https://docs.docker.com/engine/install/ or use your package manager",
        Platform::Windows => "Install Docker Desktop from https://docs.docker.com/desktop/install/windows-install/",
        Platform::Other => "Visit https://docs.docker.com/get-docker/ for installation instructions",
    }
    .to_owned()
}

fn podman_installation_guide(platform: Platform) -> String {
    match platform {
        Platform::MacOs => "Install Podman using Homebrew: brew install podman, then run 'podman machine init' and 'podman machine start'",
        Platform::Linux => "Install Podman from https://podman.io/getting-started/installation or use your package manager",
        Platform::Windows => "Install Podman from https://github.com/containers/podman/blob/main/docs/tutorials/podman-for-windows.md",
        Platform::Other => "Visit https://podman.io/getting-started/installation for installation instructions",
    }
    .to_owned()
}

fn docker_startup_command(platform: Platform) -> Option<StartupCommand> {
    match platform {
        Platform::MacOs => Some(StartupCommand::new("open", &["-a", "Docker"])),
        Platform::Linux => Some(StartupCommand::new("sudo", &["systemctl", "start", "docker"])),
        Platform::Windows => Some(StartupCommand::new(
            "powershell",
            &["-Command", "Start-Process", "'Docker Desktop'"],
        )),
        Platform::Other => None,
    }
}

fn podman_startup_command(platform: Platform, podman: &Path) -> Option<StartupCommand> {
    match platform {
        Platform::MacOs => Some(StartupCommand::new(
            podman.display().to_string(),
            &["machine", "start"],
        )),
        Platform::Linux => Some(StartupCommand::new("sudo", &["systemctl", "start", "podman"])),
        Platform::Windows | Platform::Other => None,
    }
}

fn succeeds(spec: &ProcessSpec, timeout: Duration) -> bool {
    run_captured(spec, timeout).is_ok_and(|out| out.success())
}

fn stdout_of(spec: &ProcessSpec, timeout: Duration) -> Option<String> {
    run_captured(spec, timeout)
        .ok()
        .filter(|out| out.success())
        .map(|out| out.stdout.trim().to_owned())
        .filter(|s| !s.is_empty())
}

/// Staged Docker probe: binary, daemon (`info`), server version, compose plugin.
pub fn probe_docker(binary: Option<&Path>, platform: Platform, timeout: Duration) -> RuntimeStatus {
    let mut status = RuntimeStatus::new("docker", docker_installation_guide(platform));
    let Some(docker) = binary else {
        return status.fail(ProbeStage::Binary, "Docker not installed");
    };
    status.installed = true;
    status.binary = Some(docker.to_path_buf());

    if !succeeds(&ProcessSpec::new(docker).arg("info"), timeout) {
        status.startup_command = docker_startup_command(platform);
        status.can_auto_start = status.startup_command.is_some();
        return status.fail(ProbeStage::Daemon, "Docker daemon not running");
    }
    status.running = true;

    status.version = stdout_of(
        &ProcessSpec::new(docker).args(["version", "--format", "{{.Server.Version}}"]),
        timeout,
    );

    if !succeeds(&ProcessSpec::new(docker).args(["compose", "version"]), timeout) {
        return status.fail(ProbeStage::Compose, "Docker Compose plugin not available");
    }
    status.compose_available = true;
    status.available = true;
    status
}

/// Staged Podman probe: binary, version, (macOS) a running machine, `info`,
/// then the compose plugin or a standalone `podman-compose`.
pub fn probe_podman(binary: Option<&Path>, platform: Platform, timeout: Duration) -> RuntimeStatus {
    let mut status = RuntimeStatus::new("podman", podman_installation_guide(platform));
    status.requires_machine = platform == Platform::MacOs;
    let Some(podman) = binary else {
        return status.fail(ProbeStage::Binary, "Podman not installed");
    };
    status.installed = true;
    status.binary = Some(podman.to_path_buf());

    status.version = stdout_of(
        &ProcessSpec::new(podman).args(["version", "--format", "{{.Version}}"]),
        timeout,
    );

    if status.requires_machine {
        let listing = run_captured(
            &ProcessSpec::new(podman).args(["machine", "list", "--format", "{{.Name}} {{.Running}}"]),
            timeout,
        );
        status.can_auto_start = true;
        status.startup_command = podman_startup_command(platform, podman);
        match listing {
            Ok(out) if out.success() => {
                if !has_running_machine(&out.stdout) {
                    status.machine_status = Some("stopped".to_owned());
                    return status.fail(ProbeStage::Machine, "Podman machine not running");
                }
                status.machine_status = Some("running".to_owned());
                status.can_auto_start = false;
                status.startup_command = None;
            }
            _ => {
                status.machine_status = Some("unknown".to_owned());
                return status.fail(ProbeStage::Machine, "Failed to check Podman machine status");
            }
        }
    }

    if !succeeds(&ProcessSpec::new(podman).arg("info"), timeout) {
        if !status.requires_machine {
            status.startup_command = podman_startup_command(platform, podman);
            status.can_auto_start = platform == Platform::Linux;
        }
        return status.fail(ProbeStage::Daemon, "Podman not accessible");
    }
    status.running = true;

    let plugin = succeeds(&ProcessSpec::new(podman).args(["compose", "version"]), timeout);
    if !plugin && search_path("podman-compose").is_none() {
        return status.fail(
            ProbeStage::Compose,
            "Neither podman compose plugin nor podman-compose found",
        );
    }
    status.compose_available = true;
    status.available = true;
    status
}

fn has_running_machine(listing: &str) -> bool {
    listing.lines().any(|line| {
        let mut fields = line.split_whitespace();
        fields.next().is_some() && fields.next() == Some("true")
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// A fake runtime binary: a shell script answering per subcommand.
    fn fake_binary(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn docker_missing_binary() {
        let status = probe_docker(None, Platform::Linux, TIMEOUT);
        assert!(!status.installed);
        assert_eq!(status.failed_stage, Some(ProbeStage::Binary));
        assert!(status.remediation().unwrap().contains("docs.docker.com"));
    }

    #[test]
    fn docker_daemon_down_offers_startup() {
        let dir = tempfile::tempdir().unwrap();
        let docker = fake_binary(dir.path(), "docker", "exit 1");
        let status = probe_docker(Some(&docker), Platform::Linux, TIMEOUT);
        assert!(status.installed);
        assert!(!status.running);
        assert_eq!(status.failed_stage, Some(ProbeStage::Daemon));
        assert!(status.can_auto_start);
        assert_eq!(
            status.startup_command.as_ref().unwrap().to_string(),
            "sudo systemctl start docker"
        );

        let mac = probe_docker(Some(&docker), Platform::MacOs, TIMEOUT);
        assert_eq!(mac.startup_command.unwrap().to_string(), "open -a Docker");
    }

    #[test]
    fn docker_without_compose() {
        let dir = tempfile::tempdir().unwrap();
        let docker = fake_binary(
            dir.path(),
            "docker",
            r#"case "$1" in
  info) exit 0 ;;
  version) echo 27.1.1 ;;
  *) exit 1 ;;
esac"#,
        );
        let status = probe_docker(Some(&docker), Platform::Linux, TIMEOUT);
        assert!(status.running);
        assert_eq!(status.version.as_deref(), Some("27.1.1"));
        assert_eq!(status.failed_stage, Some(ProbeStage::Compose));
        assert!(!status.available);
    }

    #[test]
    fn docker_fully_available() {
        let dir = tempfile::tempdir().unwrap();
        let docker = fake_binary(dir.path(), "docker", r#"[ "$1" = version ] && echo 27.1.1; exit 0"#);
        let status = probe_docker(Some(&docker), Platform::Linux, TIMEOUT);
        assert!(status.available);
        assert!(status.compose_available);
        assert_eq!(status.failed_stage, None);
        assert!(status.to_string().contains("ready (version 27.1.1)"));
    }

    #[test]
    fn podman_machine_stopped_on_macos() {
        let dir = tempfile::tempdir().unwrap();
        let podman = fake_binary(
            dir.path(),
            "podman",
            r#"case "$1" in
  machine) echo "podman-machine-default false" ;;
  version) echo 5.1.0 ;;
  *) exit 0 ;;
esac"#,
        );
        let status = probe_podman(Some(&podman), Platform::MacOs, TIMEOUT);
        assert!(status.requires_machine);
        assert_eq!(status.failed_stage, Some(ProbeStage::Machine));
        assert_eq!(status.machine_status.as_deref(), Some("stopped"));
        assert!(status.can_auto_start);
        assert!(status
            .startup_command
            .unwrap()
            .to_string()
            .ends_with("machine start"));
    }

    #[test]
    fn podman_machine_running_then_available() {
        let dir = tempfile::tempdir().unwrap();
        let podman = fake_binary(
            dir.path(),
            "podman",
            r#"case "$1" in
  machine) echo "podman-machine-default true" ;;
  version) echo 5.1.0 ;;
  *) exit 0 ;;
esac"#,
        );
        let status = probe_podman(Some(&podman), Platform::MacOs, TIMEOUT);
        assert!(status.available, "{status:?}");
        assert_eq!(status.machine_status.as_deref(), Some("running"));
        assert_eq!(status.version.as_deref(), Some("5.1.0"));
    }

    #[test]
    fn podman_info_failure_on_linux() {
        let dir = tempfile::tempdir().unwrap();
        let podman = fake_binary(dir.path(), "podman", r#"[ "$1" = info ] && exit 1; exit 0"#);
        let status = probe_podman(Some(&podman), Platform::Linux, TIMEOUT);
        assert_eq!(status.failed_stage, Some(ProbeStage::Daemon));
        assert!(status.can_auto_start);
        assert_eq!(
            status.startup_command.unwrap().to_string(),
            "sudo systemctl start podman"
        );
    }

    #[test]
    fn system_status_prefers_first_available() {
        let docker = probe_docker(None, Platform::Linux, TIMEOUT);
        let podman = RuntimeStatus::ready("podman", "5.1.0");
        let system = SystemRuntimeStatus::from_statuses(vec![docker, podman], Platform::Linux);
        assert!(system.can_proceed);
        assert_eq!(system.preferred_runtime.as_deref(), Some("podman"));
        assert_eq!(system.available_runtimes, vec!["podman"]);
        assert_eq!(system.recommended_action, "Ready to use podman");
    }

    #[test]
    fn system_status_recommends_install_or_start() {
        let none = SystemRuntimeStatus::from_statuses(
            vec![
                probe_docker(None, Platform::MacOs, TIMEOUT),
                probe_podman(None, Platform::MacOs, TIMEOUT),
            ],
            Platform::MacOs,
        );
        assert!(!none.can_proceed);
        assert_eq!(none.recommended_action, "Install Docker Desktop (recommended) or Podman");

        let dir = tempfile::tempdir().unwrap();
        let docker = fake_binary(dir.path(), "docker", "exit 1");
        let stopped = SystemRuntimeStatus::from_statuses(
            vec![probe_docker(Some(&docker), Platform::Linux, TIMEOUT)],
            Platform::Linux,
        );
        assert_eq!(stopped.recommended_action, "Start docker service");
    }
}
