use super::{colorize_status, json_pretty, EXIT_SUCCESS};
use insta_core::InfraManager;

pub fn run(manager: &InfraManager, service: Option<&str>, json: bool) -> Result<u8, String> {
    if let Some(name) = service {
        if !manager.services().map_err(|e| e.to_string())?.iter().any(|s| s == name) {
            return Err(format!("unknown service: {name}"));
        }
        let status = manager.service_status(name);
        if json {
            let payload = serde_json::json!({
                "service": name,
                "status": status,
                "raw_status": manager.raw_service_status(name),
            });
            println!("{}", json_pretty(&payload)?);
        } else {
            println!("{status}");
        }
        return Ok(EXIT_SUCCESS);
    }

    let statuses = manager.all_statuses().map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&statuses)?);
    } else if statuses.is_empty() {
        println!("no services defined");
    } else {
        println!("{:<20} {:<28} {:<18} DETAIL", "SERVICE", "CONTAINER", "STATUS");
        for s in &statuses {
            println!(
                "{:<20} {:<28} {:<18} {}",
                s.service,
                s.container,
                colorize_status(s.status),
                s.detail.as_deref().unwrap_or("")
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
