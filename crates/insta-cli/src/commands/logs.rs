use super::{json_pretty, EXIT_SUCCESS};
use insta_core::{wait_until, InfraManager};
use insta_runtime::{EventSink, OutputStream, StreamEvent};
use std::sync::Arc;
use std::time::Duration;

pub fn run(
    manager: &InfraManager,
    service: &str,
    tail: Option<usize>,
    follow: bool,
    json: bool,
) -> Result<u8, String> {
    if !follow {
        let lines = manager.logs(service, tail).map_err(|e| e.to_string())?;
        if json {
            println!("{}", json_pretty(&lines)?);
        } else {
            for line in &lines {
                println!("{line}");
            }
        }
        return Ok(EXIT_SUCCESS);
    }

    let sink: Arc<dyn EventSink> = Arc::new(move |event: StreamEvent| {
        if json {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
            return;
        }
        match event {
            StreamEvent::Log(log) => match log.stream {
                OutputStream::Stdout => println!("{}", log.line),
                OutputStream::Stderr => eprintln!("{}", log.line),
            },
            StreamEvent::Closed { exit_code, .. } => {
                if let Some(code) = exit_code.filter(|c| *c != 0) {
                    eprintln!("log stream ended with exit code {code}");
                }
            }
            StreamEvent::Pull(_) => {}
        }
    });
    let handle = manager
        .start_log_stream(service, sink)
        .map_err(|e| e.to_string())?;
    if wait_until(Duration::from_millis(100), || handle.is_finished()) {
        manager.stop_log_stream(service);
    }
    Ok(EXIT_SUCCESS)
}
