use super::{EXIT_FAILURE, EXIT_SUCCESS};
use insta_core::InstaConfig;
use insta_runtime::{
    attempt_start, ContainerRuntime, DockerRuntime, PodmanRuntime, Provider, SystemRuntimeStatus,
};
use std::sync::Arc;
use std::time::Duration;

const READY_WAIT: Duration = Duration::from_secs(60);

pub fn run(config: &InstaConfig, fix: bool, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_compose(config, &mut checks, &mut all_pass);

    let settings = config.runtime_settings();
    let runtimes: Vec<Arc<dyn ContainerRuntime>> = vec![
        Arc::new(DockerRuntime::new(settings.clone())),
        Arc::new(PodmanRuntime::new(settings)),
    ];
    let provider = Provider::new(runtimes.clone());
    let mut system = provider.system_status();
    check_runtimes(config, &system, &mut checks);

    if !system.can_proceed && fix {
        if let Some(runtime) = startable(config, &system, &runtimes) {
            let outcome = attempt_start(
                runtime.as_ref(),
                Duration::from_secs(config.command_timeout_secs),
                READY_WAIT,
            );
            if outcome.success {
                checks.push(Check::pass("runtime_start", &outcome.message));
            } else {
                let detail = outcome.error.as_deref().unwrap_or("unknown error");
                checks.push(Check::fail(
                    "runtime_start",
                    &format!("{}: {detail}", outcome.message),
                ));
            }
            system = provider.system_status();
        } else {
            checks.push(Check::info(
                "runtime_start",
                "No runtime can be started automatically",
            ));
        }
    }

    if system.can_proceed {
        checks.push(Check::pass("runtime_ready", &system.recommended_action));
    } else {
        all_pass = false;
        checks.push(Check::fail("runtime_ready", &system.recommended_action));
    }

    print_results(&checks, &system, all_pass, json_output)
}

fn check_compose(config: &InstaConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let docs = config.compose_documents(true);
    if !docs.base().is_file() {
        *all_pass = false;
        checks.push(Check::fail(
            "compose_document",
            &format!("Compose document missing: {}", docs.base().display()),
        ));
        return;
    }
    match docs.load() {
        Ok(graph) => checks.push(Check::pass(
            "compose_document",
            &format!(
                "Compose documents parsed ({} services, {} file(s))",
                graph.len(),
                docs.existing().len()
            ),
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("compose_document", &e.to_string()));
        }
    }
}

fn check_runtimes(config: &InstaConfig, system: &SystemRuntimeStatus, checks: &mut Vec<Check>) {
    for status in &system.runtime_statuses {
        let name = format!("runtime_{}", status.name);
        if status.available {
            checks.push(Check::pass(
                &name,
                &format!(
                    "{} {} ready",
                    status.name,
                    status.version.as_deref().unwrap_or("(unknown version)")
                ),
            ));
            continue;
        }
        let mut message = format!(
            "{}: {}",
            status.name,
            status.error.as_deref().unwrap_or("unavailable")
        );
        if let Some(hint) = status.remediation() {
            message = format!("{message} ({hint})");
        }
        // Only the runtime the user asked for is a hard requirement.
        if config.preferred_runtime.as_deref() == Some(status.name.as_str()) {
            checks.push(Check::fail(&name, &message));
        } else {
            checks.push(Check::warn(&name, &message));
        }
    }
}

/// The preferred runtime if it can be auto-started, else the first that can.
fn startable<'a>(
    config: &InstaConfig,
    system: &SystemRuntimeStatus,
    runtimes: &'a [Arc<dyn ContainerRuntime>],
) -> Option<&'a Arc<dyn ContainerRuntime>> {
    let can_start = |name: &str| {
        system
            .runtime_statuses
            .iter()
            .any(|s| s.name == name && s.installed && s.can_auto_start)
    };
    match config.preferred_runtime.as_deref() {
        Some(preferred) => runtimes
            .iter()
            .find(|r| r.name() == preferred && can_start(r.name())),
        None => runtimes.iter().find(|r| can_start(r.name())),
    }
}

fn print_results(
    checks: &[Check],
    system: &SystemRuntimeStatus,
    all_pass: bool,
    json_output: bool,
) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "platform": system.platform,
            "system": system,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("insta doctor ({})\n", system.platform);
        for check in checks {
            let icon = match check.status.as_str() {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: String,
    status: String,
    message: String,
}

impl Check {
    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &str, message: &str) -> Self {
        Self::new(name, "info", message)
    }

    fn new(name: &str, status: &str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: status.to_owned(),
            message: message.to_owned(),
        }
    }
}
