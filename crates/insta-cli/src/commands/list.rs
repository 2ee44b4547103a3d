use super::{json_pretty, EXIT_SUCCESS};
use insta_core::InfraManager;

pub fn run(manager: &InfraManager, json: bool) -> Result<u8, String> {
    let graph = manager.graph().map_err(|e| e.to_string())?;
    let entries: Vec<_> = manager
        .services()
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(|name| {
            let service_type = manager
                .registry()
                .get(&name)
                .map(|d| d.service_type.clone())
                .filter(|t| !t.is_empty());
            let in_compose = graph.contains(&name);
            serde_json::json!({
                "type": service_type,
                "image": graph.image_of(&name),
                "container": in_compose.then(|| graph.container_identity(&name)),
                "in_compose": in_compose,
                "service": name,
            })
        })
        .collect();

    if json {
        println!("{}", json_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("no services defined");
    } else {
        println!("{:<20} {:<12} IMAGE", "SERVICE", "TYPE");
        for entry in &entries {
            println!(
                "{:<20} {:<12} {}",
                entry["service"].as_str().unwrap_or(""),
                entry["type"].as_str().unwrap_or("-"),
                entry["image"].as_str().unwrap_or("(not in compose)"),
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
