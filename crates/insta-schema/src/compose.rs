use crate::SchemaError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Condition attached to a `depends_on` edge.
///
/// Only recorded on the edge; it never gates dependency traversal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyCondition {
    #[default]
    Started,
    Healthy,
}

impl DependencyCondition {
    /// Map a compose condition token (`service_healthy`, `service_started`, ...).
    /// Anything that is not a health condition is treated as `started`.
    pub fn from_compose(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "service_healthy" | "healthy" => Self::Healthy,
            _ => Self::Started,
        }
    }
}

impl fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => f.write_str("started"),
            Self::Healthy => f.write_str("healthy"),
        }
    }
}

/// One `depends_on` entry of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub service: String,
    pub condition: DependencyCondition,
}

impl Dependency {
    pub fn new(service: impl Into<String>, condition: DependencyCondition) -> Self {
        Self {
            service: service.into(),
            condition,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub test: Vec<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub retries: Option<u32>,
    pub start_period: Option<String>,
    pub disable: bool,
}

/// A compose field that may be written as a scalar, a sequence, or a mapping.
///
/// The shape is inspected once while decoding; callers immediately convert it
/// with [`FlexField::into_list`], [`FlexField::into_map`] or
/// [`FlexField::into_args`] and never look at the shape again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlexField {
    Scalar(String),
    List(Vec<String>),
    Map(Vec<(String, Option<String>)>),
}

impl FlexField {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Self::List(Vec::new()),
            Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                Self::Scalar(scalar_text(&value).unwrap_or_default())
            }
            Value::Sequence(items) => Self::List(items.iter().filter_map(item_text).collect()),
            Value::Mapping(map) => Self::Map(
                map.iter()
                    .filter_map(|(k, v)| Some((scalar_text(k)?, scalar_text(v))))
                    .collect(),
            ),
            Value::Tagged(tagged) => Self::from_value(tagged.value),
        }
    }

    /// Ordered list form. Mapping entries render as `KEY=value`, or `KEY` when
    /// the value is empty or not a scalar.
    pub fn into_list(self) -> Vec<String> {
        match self {
            Self::Scalar(s) if s.trim().is_empty() => Vec::new(),
            Self::Scalar(s) => vec![s],
            Self::List(items) => items,
            Self::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| match v {
                    Some(v) => format!("{k}={v}"),
                    None => k,
                })
                .collect(),
        }
    }

    /// String-keyed map form. List entries are split on the first `=`.
    pub fn into_map(self) -> BTreeMap<String, String> {
        match self {
            Self::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| (k, v.unwrap_or_default()))
                .collect(),
            other => other
                .into_list()
                .into_iter()
                .map(|entry| match entry.split_once('=') {
                    Some((k, v)) => (k.trim().to_owned(), v.to_owned()),
                    None => (entry.trim().to_owned(), String::new()),
                })
                .collect(),
        }
    }

    /// Argument vector form used for `command` and `entrypoint`.
    pub fn into_args(self) -> Vec<String> {
        match self {
            Self::Scalar(line) => split_shell_words(&line),
            other => other.into_list(),
        }
    }
}

impl<'de> Deserialize<'de> for FlexField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_value)
    }
}

/// `depends_on` as written: a plain list of names, or a map with conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DependsOnField {
    List(Vec<String>),
    Map(Vec<(String, DependencyCondition)>),
}

impl DependsOnField {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(Self::List(Vec::new())),
            Value::String(name) => Ok(Self::List(vec![name])),
            Value::Sequence(items) => Ok(Self::List(items.iter().filter_map(scalar_text).collect())),
            Value::Mapping(map) => Ok(Self::Map(
                map.iter()
                    .filter_map(|(k, v)| Some((scalar_text(k)?, condition_of(v))))
                    .collect(),
            )),
            Value::Tagged(tagged) => Self::from_value(tagged.value),
            Value::Bool(_) | Value::Number(_) => {
                Err("depends_on must be a list or a map of service names".to_owned())
            }
        }
    }

    fn into_dependencies(self) -> Vec<Dependency> {
        let pairs: Vec<(String, DependencyCondition)> = match self {
            Self::List(names) => names
                .into_iter()
                .map(|n| (n, DependencyCondition::Started))
                .collect(),
            Self::Map(entries) => entries,
        };
        let mut out: Vec<Dependency> = Vec::with_capacity(pairs.len());
        for (name, condition) in pairs {
            let name = name.trim().to_owned();
            if name.is_empty() {
                continue;
            }
            match out.iter_mut().find(|d| d.service == name) {
                Some(existing) => existing.condition = condition,
                None => out.push(Dependency::new(name, condition)),
            }
        }
        out
    }
}

impl<'de> Deserialize<'de> for DependsOnField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

fn condition_of(value: &Value) -> DependencyCondition {
    match value {
        Value::Mapping(map) => map
            .get("condition")
            .and_then(scalar_text)
            .map_or(DependencyCondition::Started, |c| {
                DependencyCondition::from_compose(&c)
            }),
        Value::String(raw) => DependencyCondition::from_compose(raw),
        _ => DependencyCondition::Started,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawHealthCheck {
    test: Option<FlexField>,
    #[serde(deserialize_with = "scalar_opt")]
    interval: Option<String>,
    #[serde(deserialize_with = "scalar_opt")]
    timeout: Option<String>,
    retries: Option<u32>,
    #[serde(deserialize_with = "scalar_opt")]
    start_period: Option<String>,
    disable: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawService {
    #[serde(deserialize_with = "scalar_opt")]
    container_name: Option<String>,
    #[serde(deserialize_with = "scalar_opt")]
    image: Option<String>,
    depends_on: Option<DependsOnField>,
    ports: Option<FlexField>,
    environment: Option<FlexField>,
    volumes: Option<FlexField>,
    networks: Option<FlexField>,
    env_file: Option<FlexField>,
    cap_add: Option<FlexField>,
    labels: Option<FlexField>,
    healthcheck: Option<RawHealthCheck>,
    #[serde(deserialize_with = "scalar_opt")]
    restart: Option<String>,
    #[serde(deserialize_with = "scalar_opt")]
    hostname: Option<String>,
    #[serde(deserialize_with = "scalar_opt")]
    user: Option<String>,
    command: Option<FlexField>,
    entrypoint: Option<FlexField>,
}

/// Normalized declaration of one logical service.
///
/// Every flexible field has already been converted to its canonical form:
/// ordered string lists, string-keyed maps, or argument vectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeServiceSpec {
    pub name: String,
    pub container_name: Option<String>,
    pub image: Option<String>,
    pub depends_on: Vec<Dependency>,
    pub ports: Vec<String>,
    pub environment: Vec<String>,
    pub volumes: Vec<String>,
    pub networks: Vec<String>,
    pub env_file: Vec<String>,
    pub cap_add: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub healthcheck: Option<HealthCheck>,
    pub restart: Option<String>,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
}

impl ComposeServiceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The address a backend uses for this service's container: the explicit
    /// `container_name`, otherwise the service name.
    pub fn container_identity(&self) -> &str {
        self.container_name.as_deref().unwrap_or(&self.name)
    }

    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.depends_on.iter().map(|d| d.service.as_str())
    }

    pub fn has_healthcheck(&self) -> bool {
        self.healthcheck.as_ref().is_some_and(|h| !h.disable)
    }

    fn from_raw(name: &str, raw: RawService) -> Self {
        let list = |field: Option<FlexField>| field.map(FlexField::into_list).unwrap_or_default();
        Self {
            name: name.to_owned(),
            container_name: raw.container_name,
            image: raw.image,
            depends_on: raw
                .depends_on
                .map(DependsOnField::into_dependencies)
                .unwrap_or_default(),
            ports: list(raw.ports),
            environment: list(raw.environment),
            volumes: list(raw.volumes),
            networks: list(raw.networks),
            env_file: list(raw.env_file),
            cap_add: list(raw.cap_add),
            labels: raw.labels.map(FlexField::into_map).unwrap_or_default(),
            healthcheck: raw.healthcheck.map(|h| HealthCheck {
                test: h.test.map(FlexField::into_list).unwrap_or_default(),
                interval: h.interval,
                timeout: h.timeout,
                retries: h.retries,
                start_period: h.start_period,
                disable: h.disable,
            }),
            restart: raw.restart,
            hostname: raw.hostname,
            user: raw.user,
            command: raw.command.map(FlexField::into_args),
            entrypoint: raw.entrypoint.map(FlexField::into_args),
        }
    }
}

/// Parse one compose document (YAML, or the JSON a backend prints for
/// `compose config --format json`) into its services, in document order.
///
/// `origin` names the document in error messages.
pub fn parse_compose_str(input: &str, origin: &str) -> Result<Vec<ComposeServiceSpec>, SchemaError> {
    let parse_err = |message: String| SchemaError::Parse {
        origin: origin.to_owned(),
        message,
    };

    let document: Value = serde_yaml::from_str(input).map_err(|e| parse_err(e.to_string()))?;
    let services = match document {
        Value::Null => return Ok(Vec::new()),
        Value::Mapping(mut root) => match root.remove("services") {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Mapping(services)) => services,
            Some(_) => return Err(parse_err("'services' must be a mapping".to_owned())),
        },
        _ => return Err(parse_err("document root must be a mapping".to_owned())),
    };

    let mut out = Vec::with_capacity(services.len());
    for (key, body) in services {
        let name = scalar_text(&key)
            .ok_or_else(|| parse_err("service names must be strings".to_owned()))?;
        let raw: RawService = match body {
            Value::Null => RawService::default(),
            body => serde_yaml::from_value(body)
                .map_err(|e| parse_err(format!("service '{name}': {e}")))?,
        };
        out.push(ComposeServiceSpec::from_raw(&name, raw));
    }
    Ok(out)
}

fn scalar_opt<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(scalar_text)
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty()))
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Tagged(tagged) => scalar_text(&tagged.value),
        Value::Null | Value::Sequence(_) | Value::Mapping(_) => None,
    }
}

fn item_text(value: &Value) -> Option<String> {
    match value {
        Value::Mapping(map) => long_syntax_text(map),
        other => scalar_text(other),
    }
}

/// Render a long-syntax port or volume entry (`{published, target, protocol}`
/// or `{source, target}`) in its short form.
fn long_syntax_text(map: &Mapping) -> Option<String> {
    let field = |key: &str| map.get(key).and_then(scalar_text);
    let target = field("target")?;
    let mut text = match field("published").or_else(|| field("source")) {
        Some(head) => format!("{head}:{target}"),
        None => target,
    };
    if let Some(protocol) = field("protocol") {
        text.push('/');
        text.push_str(&protocol);
    }
    Some(text)
}

/// POSIX-style word splitting for string-form `command` and `entrypoint`.
/// Inside double quotes a backslash only escapes `"`, `\`, `$` and `` ` ``.
/// An unterminated quote runs to the end of the line.
fn split_shell_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some('"') if c == '\\' => match chars.next() {
                Some(next @ ('"' | '\\' | '$' | '`')) => current.push(next),
                Some(next) => {
                    current.push(c);
                    current.push(next);
                }
                None => current.push(c),
            },
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                '\\' => {
                    current.push(chars.next().unwrap_or(c));
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(input: &str) -> ComposeServiceSpec {
        let mut services = parse_compose_str(input, "test.yaml").unwrap();
        assert_eq!(services.len(), 1);
        services.remove(0)
    }

    #[test]
    fn depends_on_list_defaults_to_started() {
        let svc = single(
            r"
services:
  airflow:
    depends_on: [postgres, redis]
",
        );
        assert_eq!(
            svc.depends_on,
            vec![
                Dependency::new("postgres", DependencyCondition::Started),
                Dependency::new("redis", DependencyCondition::Started),
            ]
        );
    }

    #[test]
    fn depends_on_map_keeps_conditions_in_document_order() {
        let svc = single(
            r"
services:
  grafana:
    depends_on:
      postgres:
        condition: service_healthy
      loki:
        condition: service_started
      init:
        condition: service_completed_successfully
",
        );
        let names: Vec<&str> = svc.dependency_names().collect();
        assert_eq!(names, vec!["postgres", "loki", "init"]);
        assert_eq!(svc.depends_on[0].condition, DependencyCondition::Healthy);
        assert_eq!(svc.depends_on[1].condition, DependencyCondition::Started);
        assert_eq!(svc.depends_on[2].condition, DependencyCondition::Started);
    }

    #[test]
    fn environment_accepts_every_shape() {
        let as_map = single(
            r"
services:
  db:
    environment:
      POSTGRES_USER: postgres
      PGPORT: 5432
      EMPTY:
",
        );
        assert_eq!(
            as_map.environment,
            vec!["POSTGRES_USER=postgres", "PGPORT=5432", "EMPTY"]
        );

        let as_list = single(
            r"
services:
  db:
    environment:
      - POSTGRES_USER=postgres
",
        );
        assert_eq!(as_list.environment, vec!["POSTGRES_USER=postgres"]);

        let as_scalar = single(
            r"
services:
  db:
    environment: POSTGRES_USER=postgres
",
        );
        assert_eq!(as_scalar.environment, vec!["POSTGRES_USER=postgres"]);
    }

    #[test]
    fn long_syntax_ports_render_short_form() {
        let svc = single(
            r#"
services:
  web:
    ports:
      - "8080:80"
      - target: 443
        published: 8443
        protocol: tcp
    volumes:
      - type: bind
        source: ./data
        target: /data
"#,
        );
        assert_eq!(svc.ports, vec!["8080:80", "8443:443/tcp"]);
        assert_eq!(svc.volumes, vec!["./data:/data"]);
    }

    #[test]
    fn command_and_entrypoint_normalize_to_args() {
        let svc = single(
            r#"
services:
  app:
    command: bash -c "echo 'hello world'"
    entrypoint: ["/docker-entrypoint.sh", "--verbose"]
"#,
        );
        assert_eq!(
            svc.command.unwrap(),
            vec!["bash", "-c", "echo 'hello world'"]
        );
        assert_eq!(
            svc.entrypoint.unwrap(),
            vec!["/docker-entrypoint.sh", "--verbose"]
        );
    }

    #[test]
    fn healthcheck_test_accepts_scalar_and_list() {
        let svc = single(
            r#"
services:
  db:
    healthcheck:
      test: ["CMD-SHELL", "pg_isready -U postgres"]
      interval: 10s
      retries: 5
"#,
        );
        let hc = svc.healthcheck.unwrap();
        assert_eq!(hc.test, vec!["CMD-SHELL", "pg_isready -U postgres"]);
        assert_eq!(hc.interval.as_deref(), Some("10s"));
        assert_eq!(hc.retries, Some(5));

        let svc = single(
            r"
services:
  db:
    healthcheck:
      test: curl -f http://localhost
",
        );
        assert_eq!(svc.healthcheck.unwrap().test, vec!["curl -f http://localhost"]);
    }

    #[test]
    fn container_identity_defaults_to_service_name() {
        let services = parse_compose_str(
            r"
services:
  postgres:
    container_name: postgres-main
  redis: {}
  bare:
",
            "test.yaml",
        )
        .unwrap();
        assert_eq!(services[0].container_identity(), "postgres-main");
        assert_eq!(services[1].container_identity(), "redis");
        assert_eq!(services[2].container_identity(), "bare");
    }

    #[test]
    fn json_config_dump_decodes_through_same_path() {
        let services = parse_compose_str(
            r#"{"name":"insta","services":{"grafana":{"container_name":"grafana","depends_on":{"postgres":{"condition":"service_started","required":true}},"image":"grafana/grafana:11.0.0"}}}"#,
            "compose config",
        )
        .unwrap();
        assert_eq!(services[0].image.as_deref(), Some("grafana/grafana:11.0.0"));
        assert_eq!(services[0].depends_on[0].service, "postgres");
    }

    #[test]
    fn empty_document_has_no_services() {
        assert!(parse_compose_str("", "empty.yaml").unwrap().is_empty());
        assert!(parse_compose_str("services:\n", "empty.yaml")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn malformed_documents_are_parse_errors() {
        let err = parse_compose_str("services: [a, b]", "bad.yaml").unwrap_err();
        assert!(matches!(err, SchemaError::Parse { .. }));
        assert!(err.to_string().contains("bad.yaml"));

        let err = parse_compose_str("services:\n  a:\n    depends_on: 3\n", "bad.yaml")
            .unwrap_err();
        assert!(err.to_string().contains("service 'a'"));

        assert!(parse_compose_str("services: {a: [", "bad.yaml").is_err());
    }

    #[test]
    fn shell_words_respect_quotes() {
        assert_eq!(
            split_shell_words(r#"sh -c 'a b' "c \"d\"" e\ f"#),
            vec!["sh", "-c", "a b", r#"c "d""#, "e f"]
        );
        assert!(split_shell_words("   ").is_empty());
    }

    #[test]
    fn shell_words_escape_rules() {
        // Only special characters lose their backslash inside double quotes.
        assert_eq!(
            split_shell_words(r#"echo "a\b \$HOME \n""#),
            vec!["echo", r"a\b $HOME \n"]
        );
        // Single quotes are fully literal.
        assert_eq!(split_shell_words(r"printf '%s\n'"), vec!["printf", r"%s\n"]);
        // Empty quotes still make a word.
        assert_eq!(split_shell_words(r#"run "" ''"#), vec!["run", "", ""]);
        assert_eq!(split_shell_words("a\tb  c\td"), vec!["a", "b", "c", "d"]);
        assert_eq!(split_shell_words(r"trailing\"), vec![r"trailing\"]);
    }

    #[test]
    fn shell_words_unterminated_quote_runs_to_end() {
        assert_eq!(
            split_shell_words(r#"sh -c "echo hi"#),
            vec!["sh", "-c", "echo hi"]
        );
        assert_eq!(split_shell_words("cat 'a b"), vec!["cat", "a b"]);
    }
}
