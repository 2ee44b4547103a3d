use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortType {
    WebUi,
    Api,
    Database,
    Admin,
    Metrics,
    Messaging,
    #[default]
    Other,
}

/// A port a service is known to expose inside its container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub internal_port: u16,
    #[serde(rename = "type", default)]
    pub port_type: PortType,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub requires_auth: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub service_type: String,
    #[serde(default)]
    pub connection_cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_password: Option<String>,
    #[serde(default)]
    pub requires_password: bool,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "service")]
    services: Vec<ServiceDefinition>,
}

/// Read-only table of known service definitions, keyed by logical name.
///
/// Built once and handed to constructors; it is never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRegistry {
    services: BTreeMap<String, ServiceDefinition>,
}

impl ServiceRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_definitions(
        definitions: impl IntoIterator<Item = ServiceDefinition>,
    ) -> Result<Self, SchemaError> {
        let mut services = BTreeMap::new();
        for def in definitions {
            if def.name.trim().is_empty() {
                return Err(SchemaError::Registry("service name must not be empty".to_owned()));
            }
            if services.contains_key(&def.name) {
                return Err(SchemaError::Registry(format!(
                    "duplicate service '{}'",
                    def.name
                )));
            }
            services.insert(def.name.clone(), def);
        }
        Ok(Self { services })
    }

    /// Parse a TOML registry made of `[[service]]` tables.
    pub fn from_toml_str(input: &str) -> Result<Self, SchemaError> {
        let file: RegistryFile =
            toml::from_str(input).map_err(|e| SchemaError::Registry(e.to_string()))?;
        Self::from_definitions(file.services)
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path).map_err(|e| SchemaError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceDefinition> {
        self.services.values()
    }
}
