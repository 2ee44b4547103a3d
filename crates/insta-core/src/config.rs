use crate::CoreError;
use insta_runtime::RuntimeSettings;
use insta_schema::ComposeDocuments;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const SUPPORTED_RUNTIMES: &[&str] = &["docker", "podman"];

/// User configuration, read from `~/.config/insta/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstaConfig {
    /// Directory holding the compose documents.
    pub work_dir: PathBuf,
    pub project_name: String,
    pub network_name: String,
    pub preferred_runtime: Option<String>,
    pub status_ttl_secs: u64,
    pub command_timeout_secs: u64,
    /// Deadline for each container status query.
    pub status_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub log_tail_lines: usize,
    pub stream_buffer: usize,
    pub docker_path: Option<PathBuf>,
    pub podman_path: Option<PathBuf>,
    /// Service catalog (`[[service]]` tables). Empty registry when unset.
    pub registry_path: Option<PathBuf>,
}

impl Default for InstaConfig {
    fn default() -> Self {
        Self {
            work_dir: home_dir().map_or_else(|| PathBuf::from(".insta"), |h| h.join(".insta")),
            project_name: "insta".to_owned(),
            network_name: "insta-network".to_owned(),
            preferred_runtime: None,
            status_ttl_secs: 5,
            command_timeout_secs: 300,
            status_timeout_secs: 10,
            probe_timeout_secs: 15,
            log_tail_lines: 100,
            stream_buffer: 256,
            docker_path: None,
            podman_path: None,
            registry_path: None,
        }
    }
}

impl InstaConfig {
    /// Defaults, overlaid by the config file when present, then by the
    /// `INSTA_*` environment variables.
    pub fn load_default() -> Result<Self, CoreError> {
        let config = match default_config_path() {
            Some(path) if path.is_file() => Self::load(&path)?,
            _ => Self::default(),
        };
        let config = config.with_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        debug!("loading config from {}", path.display());
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(input: &str) -> Result<Self, CoreError> {
        let mut config: Self =
            toml::from_str(input).map_err(|e| CoreError::Config(format!("invalid config: {e}")))?;
        config.work_dir = expand_tilde(&config.work_dir);
        config.registry_path = config.registry_path.as_deref().map(expand_tilde);
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Config(format!("failed to create {}: {e}", parent.display())))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CoreError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| CoreError::Config(format!("failed to write {}: {e}", path.display())))
    }

    /// Apply `INSTA_RUNTIME`, `INSTA_DOCKER_PATH`, `INSTA_PODMAN_PATH` and
    /// `INSTA_WORK_DIR` from `lookup`. Empty values are ignored.
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(runtime) = get("INSTA_RUNTIME") {
            self.preferred_runtime = Some(runtime.trim().to_ascii_lowercase());
        }
        if let Some(path) = get("INSTA_DOCKER_PATH") {
            self.docker_path = Some(PathBuf::from(path));
        }
        if let Some(path) = get("INSTA_PODMAN_PATH") {
            self.podman_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = get("INSTA_WORK_DIR") {
            self.work_dir = expand_tilde(Path::new(&dir));
        }
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !(1..=9).contains(&self.status_ttl_secs) {
            return Err(CoreError::Config(format!(
                "status_ttl_secs must be between 1 and 9, got {}",
                self.status_ttl_secs
            )));
        }
        if self.command_timeout_secs == 0
            || self.status_timeout_secs == 0
            || self.probe_timeout_secs == 0
        {
            return Err(CoreError::Config("timeouts must be at least one second".to_owned()));
        }
        if self.project_name.trim().is_empty() {
            return Err(CoreError::Config("project_name must not be empty".to_owned()));
        }
        if let Some(runtime) = &self.preferred_runtime {
            if !SUPPORTED_RUNTIMES.contains(&runtime.as_str()) {
                return Err(CoreError::Config(format!(
                    "unsupported runtime '{runtime}' (supported: {})",
                    SUPPORTED_RUNTIMES.join(", ")
                )));
            }
        }
        Ok(())
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            project_name: self.project_name.clone(),
            network_name: self.network_name.clone(),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            status_timeout: Duration::from_secs(self.status_timeout_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            docker_path: self.docker_path.clone(),
            podman_path: self.podman_path.clone(),
        }
    }

    /// Compose documents in the work directory, with the persistence overlay
    /// when `persist` is set.
    pub fn compose_documents(&self, persist: bool) -> ComposeDocuments {
        ComposeDocuments::in_work_dir(&self.work_dir, persist)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".config/insta/config.toml"))
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = InstaConfig::default();
        config.validate().unwrap();
        assert_eq!(config.status_ttl(), Duration::from_secs(5));
        let settings = config.runtime_settings();
        assert_eq!(settings.project_name, "insta");
        assert_eq!(settings.network_name, "insta-network");
        assert_eq!(settings.command_timeout, Duration::from_secs(300));
        assert_eq!(settings.status_timeout, Duration::from_secs(10));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = InstaConfig::from_toml_str(
            r#"
work_dir = "/srv/insta"
preferred_runtime = "podman"
status_ttl_secs = 3
"#,
        )
        .unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/srv/insta"));
        assert_eq!(config.preferred_runtime.as_deref(), Some("podman"));
        assert_eq!(config.status_ttl_secs, 3);
        assert_eq!(config.log_tail_lines, 100);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(InstaConfig::from_toml_str("status_ttl_secs = 0").is_err());
        assert!(InstaConfig::from_toml_str("status_ttl_secs = 30").is_err());
        assert!(InstaConfig::from_toml_str("preferred_runtime = \"containerd\"").is_err());
        assert!(InstaConfig::from_toml_str("no_such_key = 1").is_err());
        assert!(InstaConfig::from_toml_str("command_timeout_secs = 0").is_err());
        assert!(InstaConfig::from_toml_str("status_timeout_secs = 0").is_err());
        let config = InstaConfig::from_toml_str("status_timeout_secs = 3").unwrap();
        assert_eq!(config.runtime_settings().status_timeout, Duration::from_secs(3));
    }

    #[test]
    fn environment_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("INSTA_RUNTIME", "Docker"),
            ("INSTA_DOCKER_PATH", "/opt/bin/docker"),
            ("INSTA_PODMAN_PATH", ""),
            ("INSTA_WORK_DIR", "/tmp/insta-work"),
        ]);
        let config = InstaConfig::default().with_env(|k| env.get(k).map(|v| (*v).to_owned()));
        assert_eq!(config.preferred_runtime.as_deref(), Some("docker"));
        assert_eq!(config.docker_path, Some(PathBuf::from("/opt/bin/docker")));
        assert_eq!(config.podman_path, None);
        assert_eq!(config.work_dir, PathBuf::from("/tmp/insta-work"));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let config = InstaConfig {
            work_dir: dir.path().to_path_buf(),
            podman_path: Some(PathBuf::from("/usr/bin/podman")),
            ..InstaConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(InstaConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn compose_documents_in_work_dir() {
        let config = InstaConfig {
            work_dir: PathBuf::from("/w"),
            ..InstaConfig::default()
        };
        assert_eq!(config.compose_documents(false).paths().len(), 1);
        let persist = config.compose_documents(true);
        assert_eq!(persist.paths()[1], PathBuf::from("/w/docker-compose-persist.yaml"));
    }
}
