use super::{json_pretty, EXIT_SUCCESS};
use insta_core::InfraManager;

pub fn dependencies(manager: &InfraManager, service: &str, json: bool) -> Result<u8, String> {
    let deps = manager.dependencies(service).map_err(|e| e.to_string())?;
    print_list(service, "dependencies", &deps, json)
}

pub fn dependents(manager: &InfraManager, service: &str, json: bool) -> Result<u8, String> {
    let deps = manager.dependents(service).map_err(|e| e.to_string())?;
    print_list(service, "dependents", &deps, json)
}

pub fn graph(manager: &InfraManager, json: bool) -> Result<u8, String> {
    let edges = manager.dependency_edges().map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&edges)?);
    } else if edges.is_empty() {
        println!("no dependencies");
    } else {
        for edge in &edges {
            println!("{} -> {} ({})", edge.source, edge.target, edge.condition);
        }
    }
    Ok(EXIT_SUCCESS)
}

fn print_list(service: &str, label: &str, items: &[String], json: bool) -> Result<u8, String> {
    if json {
        let payload = serde_json::json!({ "service": service, label: items });
        println!("{}", json_pretty(&payload)?);
    } else if items.is_empty() {
        println!("{service} has no {label}");
    } else {
        for item in items {
            println!("{item}");
        }
    }
    Ok(EXIT_SUCCESS)
}
