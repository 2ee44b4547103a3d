use super::{json_pretty, EXIT_SUCCESS};
use insta_core::InfraManager;

pub fn run(manager: &InfraManager, service: &str, json: bool) -> Result<u8, String> {
    let ports = manager.port_mappings(service).map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&ports)?);
    } else if ports.is_empty() {
        println!("{service} publishes no ports");
    } else {
        for (container_port, host_port) in &ports {
            println!("{container_port:<12} -> localhost:{host_port}");
        }
    }
    Ok(EXIT_SUCCESS)
}
