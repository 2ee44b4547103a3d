use super::{json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use indicatif::{ProgressBar, ProgressStyle};
use insta_core::{wait_until, InfraManager};
use insta_runtime::{EventSink, PullPhase, StreamEvent};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Runtime;

/// `target` is a service name (pull its missing images) or an image reference.
pub fn run(manager: &InfraManager, rt: &Runtime, target: &str, json: bool) -> Result<u8, String> {
    let images = if manager.services().map_err(|e| e.to_string())?.iter().any(|s| s == target) {
        let missing = manager.missing_images(target).map_err(|e| e.to_string())?;
        if missing.is_empty() && !json {
            println!("all images for {target} are present");
        }
        missing
    } else {
        vec![target.to_owned()]
    };

    let mut failed = Vec::new();
    for image in &images {
        if let Err(e) = pull_image(manager, rt, image, json) {
            eprintln!("error: {e}");
            failed.push(image.clone());
        }
    }
    Ok(if failed.is_empty() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}

fn progress_bar(image: &str) -> Result<ProgressBar, String> {
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
        .map_err(|e| format!("invalid progress template: {e}"))?
        .progress_chars("=> ");
    let pb = ProgressBar::new(100).with_style(style);
    pb.set_prefix(image.to_owned());
    Ok(pb)
}

/// Pull one image, rendering progress as a bar or as JSON lines.
pub fn pull_image(manager: &InfraManager, rt: &Runtime, image: &str, json: bool) -> Result<(), String> {
    let pb = if json {
        ProgressBar::hidden()
    } else {
        progress_bar(image)?
    };

    let outcome: Arc<Mutex<Option<Result<(), String>>>> = Arc::new(Mutex::new(None));
    let sink: Arc<dyn EventSink> = {
        let pb = pb.clone();
        let outcome = Arc::clone(&outcome);
        Arc::new(move |event: StreamEvent| {
            if json {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
            }
            let StreamEvent::Pull(progress) = event else {
                return;
            };
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            pb.set_position(progress.percentage.round() as u64);
            if let Some(layer) = &progress.current_layer {
                pb.set_message(layer.clone());
            }
            let done = match progress.phase {
                PullPhase::Complete => Some(Ok(())),
                PullPhase::Error => Some(Err(progress
                    .error
                    .unwrap_or_else(|| "pull failed".to_owned()))),
                PullPhase::Starting | PullPhase::Downloading => None,
            };
            if let Some(done) = done {
                *outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(done);
            }
        })
    };

    let handle = manager
        .start_image_pull(image, sink)
        .map_err(|e| e.to_string())?;
    if wait_until(Duration::from_millis(100), || handle.is_finished()) {
        manager.stop_image_pull(image);
    }
    rt.block_on(handle.wait());

    let result = outcome
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .unwrap_or_else(|| Err(format!("pull of {image} was interrupted")));
    match &result {
        Ok(()) => pb.finish_with_message("done"),
        Err(_) => pb.abandon_with_message("failed"),
    }
    if json {
        let summary = serde_json::json!({
            "image": image,
            "pulled": result.is_ok(),
            "error": result.as_ref().err(),
        });
        println!("{}", json_pretty(&summary)?);
    }
    result.map_err(|e| format!("failed to pull {image}: {e}"))
}
