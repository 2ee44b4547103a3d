use super::{colorize_status, json_pretty, pull::pull_image, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use insta_core::InfraManager;
use tokio::runtime::Runtime;

pub fn run(
    manager: &InfraManager,
    rt: &Runtime,
    service: &str,
    persist: bool,
    pull: bool,
    json: bool,
) -> Result<u8, String> {
    if pull {
        for image in manager.missing_images(service).map_err(|e| e.to_string())? {
            pull_image(manager, rt, &image, json)?;
        }
    }

    let pb = if json {
        indicatif::ProgressBar::hidden()
    } else {
        spinner(&format!("starting {service}…"))
    };
    manager.start_service(service, persist).map_err(|e| {
        spin_fail(&pb, &format!("failed to start {service}"));
        e.to_string()
    })?;
    spin_ok(&pb, &format!("started {service}"));

    let status = manager.service_status(service);
    if json {
        let payload = serde_json::json!({
            "service": service,
            "persist": persist,
            "status": status,
            "dependencies": manager.dependencies(service).map_err(|e| e.to_string())?,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("{service}: {}", colorize_status(status));
    }
    Ok(EXIT_SUCCESS)
}
