use super::{json_pretty, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use insta_core::InfraManager;

/// Stop one service, or everything when `service` is `None`.
pub fn run(manager: &InfraManager, service: Option<&str>, json: bool) -> Result<u8, String> {
    let label = service.unwrap_or("all services");
    let pb = if json {
        indicatif::ProgressBar::hidden()
    } else {
        spinner(&format!("stopping {label}…"))
    };
    let result = match service {
        Some(name) => manager.stop_service(name),
        None => manager.stop_all(),
    };
    let stopped = result.map_err(|e| {
        spin_fail(&pb, &format!("failed to stop {label}"));
        e.to_string()
    })?;
    spin_ok(&pb, &format!("stopped {label}"));

    if json {
        println!("{}", json_pretty(&serde_json::json!({ "stopped": stopped }))?);
    } else if stopped.len() > 1 {
        println!("stopped: {}", stopped.join(", "));
    }
    Ok(EXIT_SUCCESS)
}
