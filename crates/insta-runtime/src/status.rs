use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical, backend-independent container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerStatus {
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "running-healthy")]
    RunningHealthy,
    #[serde(rename = "running-unhealthy")]
    RunningUnhealthy,
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "restarting")]
    Restarting,
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "not_found")]
    NotFound,
    #[serde(rename = "unknown")]
    Unknown,
}

impl ContainerStatus {
    pub const ALL: [Self; 11] = [
        Self::Running,
        Self::RunningHealthy,
        Self::RunningUnhealthy,
        Self::Starting,
        Self::Restarting,
        Self::Stopped,
        Self::Completed,
        Self::Error,
        Self::Paused,
        Self::NotFound,
        Self::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::RunningHealthy => "running-healthy",
            Self::RunningUnhealthy => "running-unhealthy",
            Self::Starting => "starting",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Paused => "paused",
            Self::NotFound => "not_found",
            Self::Unknown => "unknown",
        }
    }

    /// Map raw backend signals to a canonical status.
    ///
    /// Total over every input: unrecognized states and exited containers
    /// without a readable exit code become `Unknown`. When `exit_code` is not
    /// supplied it is read from an `Exited (N) ...` status text.
    pub fn normalize(state: &str, status_text: &str, exit_code: Option<i32>) -> Self {
        let state = state.trim().to_ascii_lowercase();
        let text = status_text.to_ascii_lowercase();
        match state.as_str() {
            "running" => {
                if text.contains("(unhealthy)") {
                    Self::RunningUnhealthy
                } else if text.contains("(healthy)") {
                    Self::RunningHealthy
                } else if text.contains("health: starting") {
                    Self::Starting
                } else {
                    Self::Running
                }
            }
            "exited" => match exit_code.or_else(|| exit_code_from_text(status_text)) {
                Some(0) => Self::Completed,
                Some(_) => Self::Error,
                None => Self::Unknown,
            },
            "created" => Self::Stopped,
            "restarting" => Self::Restarting,
            "paused" => Self::Paused,
            "dead" => Self::Error,
            _ => Self::Unknown,
        }
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            Self::Running | Self::RunningHealthy | Self::RunningUnhealthy
        )
    }

    /// Running, or on its way there.
    pub fn is_active(self) -> bool {
        self.is_running() || matches!(self, Self::Starting | Self::Restarting)
    }

    /// Finished for good: stopped, exited, or never created.
    pub fn is_inactive(self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Completed | Self::Error | Self::NotFound
        )
    }

    /// Treat a container that never existed the same as a cleanly stopped one.
    #[must_use]
    pub fn collapse_not_found(self) -> Self {
        match self {
            Self::NotFound => Self::Stopped,
            other => other,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown container status '{s}'"))
    }
}

/// Canonical status of one container identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatusRecord {
    pub container: String,
    pub status: ContainerStatus,
    /// Backend's human-readable status text, when it said anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ContainerStatusRecord {
    pub fn new(container: impl Into<String>, status: ContainerStatus) -> Self {
        Self {
            container: container.into(),
            status,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        self.detail = (!detail.trim().is_empty()).then_some(detail);
        self
    }
}

/// Exit code from status text such as `Exited (137) 2 minutes ago`.
pub fn exit_code_from_text(text: &str) -> Option<i32> {
    let lower = text.to_ascii_lowercase();
    let start = lower.find("exited (")? + "exited (".len();
    let rest = &text[start..];
    let end = rest.find(')')?;
    rest[..end].trim().parse().ok()
}

/// Raw state token inferred from a status column alone (`Up 5 minutes`,
/// `Exited (0) ...`, `Created`), for listings that carry no state column.
pub fn state_from_text(text: &str) -> &'static str {
    let lower = text.trim().to_ascii_lowercase();
    if lower.starts_with("up") {
        if lower.contains("paused") {
            "paused"
        } else {
            "running"
        }
    } else if lower.starts_with("exited") {
        "exited"
    } else if lower.starts_with("created") {
        "created"
    } else if lower.starts_with("restarting") {
        "restarting"
    } else if lower.starts_with("paused") {
        "paused"
    } else if lower.starts_with("dead") {
        "dead"
    } else {
        ""
    }
}

/// Parse `name,state,status` lines from a bulk `ps` listing.
/// Malformed lines are skipped.
pub fn parse_status_table(output: &str) -> Vec<ContainerStatusRecord> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(3, ',');
            let name = parts.next()?.trim();
            let state = parts.next()?.trim();
            let text = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            Some(
                ContainerStatusRecord::new(name, ContainerStatus::normalize(state, text, None))
                    .with_detail(text),
            )
        })
        .collect()
}

/// Parse `<state> <exit code>` as printed by an inspect template.
pub fn parse_inspect_line(output: &str) -> ContainerStatus {
    let mut parts = output.split_whitespace();
    let state = parts.next().unwrap_or_default();
    let exit_code = parts.next().and_then(|c| c.parse().ok());
    ContainerStatus::normalize(state, "", exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_with_health_annotations() {
        assert_eq!(
            ContainerStatus::normalize("running", "Up 2 minutes (healthy)", None),
            ContainerStatus::RunningHealthy
        );
        assert_eq!(
            ContainerStatus::normalize("running", "Up 2 minutes (unhealthy)", None),
            ContainerStatus::RunningUnhealthy
        );
        assert_eq!(
            ContainerStatus::normalize("running", "Up 3 seconds (health: starting)", None),
            ContainerStatus::Starting
        );
        assert_eq!(
            ContainerStatus::normalize("running", "Up About an hour", None),
            ContainerStatus::Running
        );
        assert_eq!(
            ContainerStatus::normalize("Running", "", None),
            ContainerStatus::Running
        );
    }

    #[test]
    fn exited_uses_exit_code() {
        assert_eq!(
            ContainerStatus::normalize("exited", "", Some(0)),
            ContainerStatus::Completed
        );
        assert_eq!(
            ContainerStatus::normalize("exited", "", Some(1)),
            ContainerStatus::Error
        );
        assert_eq!(
            ContainerStatus::normalize("exited", "Exited (0) About an hour ago", None),
            ContainerStatus::Completed
        );
        assert_eq!(
            ContainerStatus::normalize("exited", "Exited (137) 5 seconds ago", None),
            ContainerStatus::Error
        );
        assert_eq!(
            ContainerStatus::normalize("exited", "", None),
            ContainerStatus::Unknown
        );
    }

    #[test]
    fn remaining_table_rows() {
        let cases = [
            ("created", ContainerStatus::Stopped),
            ("restarting", ContainerStatus::Restarting),
            ("paused", ContainerStatus::Paused),
            ("dead", ContainerStatus::Error),
            ("removing", ContainerStatus::Unknown),
            ("", ContainerStatus::Unknown),
            ("???", ContainerStatus::Unknown),
        ];
        for (state, expected) in cases {
            assert_eq!(ContainerStatus::normalize(state, "", None), expected, "{state}");
            assert_eq!(ContainerStatus::normalize(state, "", Some(7)), expected, "{state}");
        }
    }

    #[test]
    fn tokens_round_trip_through_serde_and_from_str() {
        for status in ContainerStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<ContainerStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ContainerStatus>().is_err());
    }

    #[test]
    fn not_found_collapses_to_stopped() {
        assert_eq!(
            ContainerStatus::NotFound.collapse_not_found(),
            ContainerStatus::Stopped
        );
        assert_eq!(
            ContainerStatus::Error.collapse_not_found(),
            ContainerStatus::Error
        );
    }

    #[test]
    fn parses_bulk_listing() {
        let output = "postgres-data,exited,Exited (0) About an hour ago\n\
                      postgres,running,Up About an hour (healthy)\n\
                      jaeger,running,Up About an hour (health: starting)\n\
                      redis,running,Up About an hour\n\
                      garbage line\n\
                      \n";
        let records = parse_status_table(output);
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].status, ContainerStatus::Completed);
        assert_eq!(records[1].status, ContainerStatus::RunningHealthy);
        assert_eq!(records[1].detail.as_deref(), Some("Up About an hour (healthy)"));
        assert_eq!(records[2].status, ContainerStatus::Starting);
        assert_eq!(records[3].container, "redis");
        assert_eq!(records[3].status, ContainerStatus::Running);
    }

    #[test]
    fn parses_inspect_output() {
        assert_eq!(parse_inspect_line("running 0\n"), ContainerStatus::Running);
        assert_eq!(parse_inspect_line("exited 0"), ContainerStatus::Completed);
        assert_eq!(parse_inspect_line("exited 2"), ContainerStatus::Error);
        assert_eq!(parse_inspect_line(""), ContainerStatus::Unknown);
    }

    #[test]
    fn state_inferred_from_status_column() {
        assert_eq!(state_from_text("Up 5 minutes (healthy)"), "running");
        assert_eq!(state_from_text("Up 5 minutes (Paused)"), "paused");
        assert_eq!(state_from_text("Exited (1) 3 hours ago"), "exited");
        assert_eq!(state_from_text("Created"), "created");
        assert_eq!(state_from_text("Removal In Progress"), "");
    }
}
