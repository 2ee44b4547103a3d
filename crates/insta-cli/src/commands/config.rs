use super::{json_pretty, EXIT_SUCCESS};
use insta_core::{default_config_path, InstaConfig};

pub fn run(config: &InstaConfig, json: bool) -> Result<u8, String> {
    if json {
        println!("{}", json_pretty(config)?);
        return Ok(EXIT_SUCCESS);
    }
    if let Some(path) = default_config_path() {
        let origin = if path.is_file() { "" } else { " (not present, using defaults)" };
        println!("# {}{origin}", path.display());
    }
    let rendered =
        toml::to_string_pretty(config).map_err(|e| format!("failed to render config: {e}"))?;
    print!("{rendered}");
    Ok(EXIT_SUCCESS)
}
