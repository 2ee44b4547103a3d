use super::{json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use insta_core::InfraManager;

/// Report each image `service` needs and whether it is present.
pub fn run(manager: &InfraManager, service: &str, json: bool) -> Result<u8, String> {
    let images = manager.images_for(service).map_err(|e| e.to_string())?;
    let mut rows = Vec::with_capacity(images.len());
    for (owner, image) in images {
        let present = manager.image_exists(&image).map_err(|e| e.to_string())?;
        rows.push((owner, image, present));
    }
    let all_present = rows.iter().all(|(_, _, present)| *present);

    if json {
        let payload: Vec<_> = rows
            .iter()
            .map(|(owner, image, present)| {
                serde_json::json!({ "service": owner, "image": image, "present": present })
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else {
        for (owner, image, present) in &rows {
            let mark = if *present { "✓" } else { "✗" };
            println!("  {mark} {image} ({owner})");
        }
        if !all_present {
            println!("\nrun `insta pull {service}` to fetch missing images");
        }
    }
    Ok(if all_present { EXIT_SUCCESS } else { EXIT_FAILURE })
}
