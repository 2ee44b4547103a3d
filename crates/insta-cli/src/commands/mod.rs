pub mod completions;
pub mod config;
pub mod deps;
pub mod doctor;
pub mod exec;
pub mod images;
pub mod list;
pub mod logs;
pub mod ports;
pub mod pull;
pub mod status;
pub mod stop;
pub mod up;

use indicatif::{ProgressBar, ProgressStyle};
use insta_runtime::ContainerStatus;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_RUNTIME_UNAVAILABLE: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn message_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(message_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(message_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: ContainerStatus) -> String {
    use console::Style;
    let text = status.as_str();
    match status {
        ContainerStatus::Running | ContainerStatus::RunningHealthy => {
            Style::new().green().apply_to(text).to_string()
        }
        ContainerStatus::RunningUnhealthy | ContainerStatus::Error => {
            Style::new().red().bold().apply_to(text).to_string()
        }
        ContainerStatus::Starting | ContainerStatus::Restarting => {
            Style::new().yellow().apply_to(text).to_string()
        }
        ContainerStatus::Paused => Style::new().blue().apply_to(text).to_string(),
        ContainerStatus::Stopped | ContainerStatus::Completed | ContainerStatus::NotFound => {
            Style::new().dim().apply_to(text).to_string()
        }
        ContainerStatus::Unknown => text.to_owned(),
    }
}

/// Exit code for an error message produced by a command.
pub fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("config error:")
        || msg.starts_with("compose error:")
        || msg.starts_with("invalid service registry")
    {
        EXIT_CONFIG_ERROR
    } else if msg.contains("container runtime unavailable") {
        EXIT_RUNTIME_UNAVAILABLE
    } else {
        EXIT_FAILURE
    }
}
