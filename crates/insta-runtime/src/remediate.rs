use crate::backend::ContainerRuntime;
use crate::probe::{ProbeStage, StartupCommand};
use crate::process::run_captured;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Result of trying to bring a stopped runtime up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub requires_manual_action: bool,
}

impl StartupOutcome {
    fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            requires_manual_action: false,
        }
    }

    fn failed(message: impl Into<String>, error: impl Into<String>, manual: bool) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
            requires_manual_action: manual,
        }
    }
}

/// Run the runtime's platform startup command, then wait up to `ready_wait`
/// for its probe to pass.
///
/// A podman machine that refuses to start is initialized once and started
/// again. Nothing is attempted when the probe offers no automatic startup.
pub fn attempt_start(
    runtime: &dyn ContainerRuntime,
    command_timeout: Duration,
    ready_wait: Duration,
) -> StartupOutcome {
    let status = runtime.probe();
    let name = runtime.name();
    if status.available {
        return StartupOutcome::succeeded(format!("{name} is already running"));
    }
    if !status.installed {
        return StartupOutcome::failed(
            format!("{name} is not installed"),
            status.installation_guide.clone(),
            true,
        );
    }
    let command = match (&status.startup_command, status.can_auto_start) {
        (Some(command), true) => command.clone(),
        _ => {
            return StartupOutcome::failed(
                format!("{name} cannot be started automatically"),
                status
                    .remediation()
                    .unwrap_or_else(|| format!("start {name} manually")),
                true,
            );
        }
    };

    info!("starting {name}: {command}");
    if let Err(error) = run_startup(&command, command_timeout) {
        let recovered = status.requires_machine
            && status.failed_stage == Some(ProbeStage::Machine)
            && init_machine(&command, command_timeout)
            && run_startup(&command, command_timeout).is_ok();
        if !recovered {
            warn!("failed to start {name}: {error}");
            return StartupOutcome::failed(
                format!("failed to start {name}"),
                error,
                status.remediation().is_some(),
            );
        }
    }

    if wait_until_ready(runtime, ready_wait, Duration::from_secs(1)) {
        StartupOutcome::succeeded(format!("{name} started successfully"))
    } else {
        StartupOutcome::failed(
            format!("{name} was started but is not ready yet"),
            format!("{name} did not become available within {}s", ready_wait.as_secs()),
            false,
        )
    }
}

/// Re-probe every `interval` until the runtime is available or `max_wait`
/// has passed.
pub fn wait_until_ready(runtime: &dyn ContainerRuntime, max_wait: Duration, interval: Duration) -> bool {
    let deadline = Instant::now() + max_wait;
    loop {
        if runtime.probe().available {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}

fn run_startup(command: &StartupCommand, timeout: Duration) -> Result<(), String> {
    match run_captured(&command.to_spec(), timeout) {
        Ok(out) if out.success() => Ok(()),
        Ok(out) => Err(out.combined()),
        Err(e) => Err(e.to_string()),
    }
}

/// `<podman> machine init`, for hosts that never created a machine.
fn init_machine(start: &StartupCommand, timeout: Duration) -> bool {
    let init = StartupCommand {
        program: start.program.clone(),
        args: vec!["machine".to_owned(), "init".to_owned()],
    };
    info!("initializing podman machine: {init}");
    run_startup(&init, timeout).is_ok()
}
