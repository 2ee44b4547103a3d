use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPhase {
    Starting,
    Downloading,
    Complete,
    Error,
}

impl PullPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// One progress report of an image pull.
///
/// `percentage` never decreases within a single pull stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullProgressEvent {
    pub image: String,
    pub phase: PullPhase,
    pub percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_layer: Option<String>,
    pub total_layers: usize,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PullProgressEvent {
    pub fn new(image: impl Into<String>, phase: PullPhase, percentage: f64) -> Self {
        Self {
            image: image.into(),
            phase,
            percentage,
            current_layer: None,
            total_layers: 0,
            downloaded_bytes: 0,
            total_bytes: 0,
            speed: None,
            eta: None,
            error: None,
        }
    }

    pub fn complete(image: impl Into<String>) -> Self {
        Self::new(image, PullPhase::Complete, 100.0)
    }

    pub fn failed(image: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(image, PullPhase::Error, 0.0)
        }
    }
}

/// Which backend's textual pull output to expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullDialect {
    Docker,
    Podman,
}

/// Line-pattern parser for pull output. Unrecognized lines yield nothing.
///
/// Keeps per-layer state for Docker, whose overall progress is the mean of
/// its layers' progress.
#[derive(Debug, Clone)]
pub struct PullParser {
    dialect: PullDialect,
    image: String,
    layers: BTreeMap<String, f64>,
}

impl PullParser {
    pub fn new(dialect: PullDialect, image: impl Into<String>) -> Self {
        Self {
            dialect,
            image: image.into(),
            layers: BTreeMap::new(),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn parse_line(&mut self, line: &str) -> Option<PullProgressEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match self.dialect {
            PullDialect::Docker => self.parse_docker(line),
            PullDialect::Podman => self.parse_podman(line),
        }
    }

    // "v3.3.0: Pulling from ankane/blazer"
    // "6e771e15690e: Already exists"
    // "9521bbc382b8: Downloading [=>   ]  1.2MB/30MB"
    // "9521bbc382b8: Pull complete"
    // "Status: Downloaded newer image for ankane/blazer:v3.3.0"
    fn parse_docker(&mut self, line: &str) -> Option<PullProgressEvent> {
        if line.contains("Status: Downloaded newer image") || line.contains("Status: Image is up to date") {
            return Some(PullProgressEvent::complete(&self.image));
        }
        if line.contains("Pulling from") {
            return Some(PullProgressEvent::new(&self.image, PullPhase::Starting, 0.0));
        }

        let (label, layer_progress) = if line.contains("Already exists") {
            ("Layer exists", 100.0)
        } else if line.contains("Pull complete") {
            ("Layer complete", 100.0)
        } else if line.contains("Pulling fs layer") || line.contains("Downloading") {
            ("Downloading layer", 50.0)
        } else {
            return None;
        };

        let layer = line.split(':').next().unwrap_or_default().trim().to_owned();
        self.layers.insert(layer.clone(), layer_progress);
        let mean = self.layers.values().sum::<f64>() / self.layers.len() as f64;

        let mut event = PullProgressEvent::new(&self.image, PullPhase::Downloading, mean);
        event.current_layer = Some(format!("{label} {layer}"));
        event.total_layers = self.layers.len();
        if let Some((done, total)) = byte_counters(line) {
            event.downloaded_bytes = done;
            event.total_bytes = total;
        }
        Some(event)
    }

    // "Trying to pull docker.io/library/redis:alpine..."
    // "Getting image source signatures"
    // "Copying blob 8bc3a26b84da done"
    // "Writing manifest to image destination"
    // "Storing signatures"
    fn parse_podman(&mut self, line: &str) -> Option<PullProgressEvent> {
        let (phase, percentage) = if line.contains("Trying to pull") {
            (PullPhase::Starting, 0.0)
        } else if line.contains("Getting image source signatures") {
            (PullPhase::Downloading, 10.0)
        } else if line.contains("Copying blob") && line.contains("done") {
            (PullPhase::Downloading, 70.0)
        } else if line.contains("Writing manifest") {
            (PullPhase::Downloading, 90.0)
        } else if line.contains("Storing signatures") {
            (PullPhase::Complete, 100.0)
        } else {
            return None;
        };
        let mut event = PullProgressEvent::new(&self.image, phase, percentage);
        if let Some(blob) = line.strip_prefix("Copying blob ") {
            event.current_layer = blob.split_whitespace().next().map(str::to_owned);
        }
        Some(event)
    }
}

/// `1.2MB/30.5MB` style counters at the end of a Docker progress line.
fn byte_counters(line: &str) -> Option<(u64, u64)> {
    let token = line.split_whitespace().last()?;
    let (done, total) = token.split_once('/')?;
    Some((parse_size(done)?, parse_size(total)?))
}

fn parse_size(text: &str) -> Option<u64> {
    let split = text.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    let scale = match unit {
        "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        _ => return None,
    };
    Some((value * scale) as u64)
}
