use crate::compose::{parse_compose_str, ComposeServiceSpec};
use crate::merge::merge_service;
use crate::SchemaError;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use tracing::debug;

pub const BASE_DOCUMENT: &str = "docker-compose.yaml";
pub const PERSIST_DOCUMENT: &str = "docker-compose-persist.yaml";

/// Ordered list of compose documents: a required base followed by optional
/// overlays. Later documents merge on top of earlier ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComposeDocuments {
    paths: Vec<PathBuf>,
}

impl ComposeDocuments {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            paths: vec![base.into()],
        }
    }

    #[must_use]
    pub fn with_overlay(mut self, overlay: impl Into<PathBuf>) -> Self {
        self.paths.push(overlay.into());
        self
    }

    /// The standard layout inside a work directory; the persistence overlay
    /// is only layered on when `persist` is set.
    pub fn in_work_dir(work_dir: &Path, persist: bool) -> Self {
        let docs = Self::new(work_dir.join(BASE_DOCUMENT));
        if persist {
            docs.with_overlay(work_dir.join(PERSIST_DOCUMENT))
        } else {
            docs
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn base(&self) -> &Path {
        &self.paths[0]
    }

    /// Documents present on disk, in order. Missing overlays are skipped.
    pub fn existing(&self) -> Vec<PathBuf> {
        self.paths.iter().filter(|p| p.is_file()).cloned().collect()
    }

    /// Parse and merge every document.
    pub fn load(&self) -> Result<ComposeGraph, SchemaError> {
        let mut graph = ComposeGraph::default();
        for (idx, path) in self.paths.iter().enumerate() {
            if !path.is_file() {
                if idx == 0 {
                    return Err(SchemaError::MissingDocument(path.clone()));
                }
                debug!("skipping missing overlay {}", path.display());
                continue;
            }
            let content = fs::read_to_string(path).map_err(|e| SchemaError::Io {
                path: path.clone(),
                source: e,
            })?;
            let services = parse_compose_str(&content, &path.display().to_string())?;
            debug!("parsed {} services from {}", services.len(), path.display());
            graph.extend(services);
        }
        Ok(graph)
    }

    fn stamps(&self) -> Vec<Option<SystemTime>> {
        self.paths
            .iter()
            .map(|p| fs::metadata(p).and_then(|m| m.modified()).ok())
            .collect()
    }
}

/// Unified map from logical service name to its merged service definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeGraph {
    services: BTreeMap<String, ComposeServiceSpec>,
}

impl ComposeGraph {
    pub fn from_services(services: impl IntoIterator<Item = ComposeServiceSpec>) -> Self {
        let mut graph = Self::default();
        graph.extend(services);
        graph
    }

    /// Insert services, merging any name that is already present.
    pub fn extend(&mut self, services: impl IntoIterator<Item = ComposeServiceSpec>) {
        for spec in services {
            let merged = match self.services.remove(&spec.name) {
                Some(existing) => merge_service(existing, spec),
                None => spec,
            };
            self.services.insert(merged.name.clone(), merged);
        }
    }

    pub fn get(&self, name: &str) -> Option<&ComposeServiceSpec> {
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

    pub fn iter(&self) -> impl Iterator<Item = &ComposeServiceSpec> {
        self.services.values()
    }

    /// Sorted service names.
    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Container identity for a logical name; names absent from the graph
    /// are their own identity.
    pub fn container_identity<'a>(&'a self, name: &'a str) -> &'a str {
        self.services
            .get(name)
            .map_or(name, ComposeServiceSpec::container_identity)
    }

    pub fn image_of(&self, name: &str) -> Option<&str> {
        self.services.get(name).and_then(|s| s.image.as_deref())
    }

    /// `(service, image)` pairs for the given names; names without an image
    /// or absent from the graph are skipped.
    pub fn images_of<'a, I, S>(&'a self, names: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .filter_map(|n| {
                let name = n.as_ref();
                self.image_of(name)
                    .map(|image| (name.to_owned(), image.to_owned()))
            })
            .collect()
    }
}

/// When a cached graph is considered stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Re-parse whenever a document's modification time changes.
    #[default]
    OnModification,
    /// Keep the parsed graph until [`ConfigCache::refresh`] is called.
    Manual,
}

struct Loaded {
    graph: Arc<ComposeGraph>,
    stamps: Vec<Option<SystemTime>>,
}

/// Parsed graphs keyed by the ordered document list.
///
/// Parsing happens outside the lock; the result is committed under a brief
/// write lock, so readers only ever see a complete graph.
pub struct ConfigCache {
    policy: RefreshPolicy,
    entries: RwLock<HashMap<ComposeDocuments, Loaded>>,
}

impl ConfigCache {
    pub fn new(policy: RefreshPolicy) -> Self {
        Self {
            policy,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    pub fn graph(&self, documents: &ComposeDocuments) -> Result<Arc<ComposeGraph>, SchemaError> {
        let stamps = match self.policy {
            RefreshPolicy::OnModification => Some(documents.stamps()),
            RefreshPolicy::Manual => None,
        };
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(loaded) = entries.get(documents) {
                let fresh = stamps.as_ref().is_none_or(|s| *s == loaded.stamps);
                if fresh {
                    return Ok(Arc::clone(&loaded.graph));
                }
            }
        }

        let stamps = stamps.unwrap_or_else(|| documents.stamps());
        let graph = Arc::new(documents.load()?);
        debug!(
            "compose graph loaded: {} services from {} documents",
            graph.len(),
            documents.paths().len()
        );
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            documents.clone(),
            Loaded {
                graph: Arc::clone(&graph),
                stamps,
            },
        );
        Ok(graph)
    }

    /// Drop every cached graph so the next read re-parses.
    pub fn refresh(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new(RefreshPolicy::default())
    }
}
