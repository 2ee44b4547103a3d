use super::{json_pretty, EXIT_SUCCESS};
use insta_core::InfraManager;

pub fn run(
    manager: &InfraManager,
    service: &str,
    command: &str,
    interactive: bool,
    json: bool,
) -> Result<u8, String> {
    let output = manager
        .exec(service, command, interactive)
        .map_err(|e| e.to_string())?;
    if json {
        let payload = serde_json::json!({ "service": service, "command": command, "output": output });
        println!("{}", json_pretty(&payload)?);
    } else if !output.is_empty() {
        print!("{output}");
    }
    Ok(EXIT_SUCCESS)
}

/// Run the registry's client command for `service` interactively.
pub fn connect(manager: &InfraManager, service: &str) -> Result<u8, String> {
    let command = manager
        .connection_command(service)
        .ok_or_else(|| format!("no connection command known for {service}"))?;
    manager
        .exec(service, &command, true)
        .map_err(|e| e.to_string())?;
    Ok(EXIT_SUCCESS)
}
