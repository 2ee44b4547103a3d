use crate::config::InstaConfig;
use crate::overlay::{PendingTransitions, Transition};
use crate::status_cache::{StatusCache, StatusSnapshot};
use crate::CoreError;
use insta_runtime::{
    ComposeRequest, ContainerRuntime, ContainerStatus, EventSink, LineDecoder, PullParser,
    RuntimeError, StreamHandle, StreamKind, StreamManager,
};
use insta_schema::{
    ComposeGraph, ConfigCache, DependencyEdge, DependencyResolver, RefreshPolicy, ServiceRegistry,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Status of one compose service as shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: String,
    pub container: String,
    pub status: ContainerStatus,
    /// Backend status text, or `not_found` for a container that was never
    /// created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Facade over one container runtime and the compose documents in the
/// configured work directory.
///
/// Mutations (`start_service`, `stop_service`, `stop_all`) block on the
/// backend. Status reads never fail: they combine the bulk status cache with
/// pending transitions and degrade to `unknown` when the backend misbehaves.
pub struct InfraManager {
    config: InstaConfig,
    runtime: Arc<dyn ContainerRuntime>,
    registry: ServiceRegistry,
    compose: ConfigCache,
    statuses: StatusCache,
    pending: PendingTransitions,
    streams: StreamManager,
}

impl InfraManager {
    /// `handle` runs the log and pull stream tasks.
    pub fn new(
        config: InstaConfig,
        runtime: Arc<dyn ContainerRuntime>,
        registry: ServiceRegistry,
        handle: Handle,
    ) -> Self {
        let statuses = StatusCache::new(config.status_ttl());
        let streams = StreamManager::new(handle, config.stream_buffer);
        Self {
            config,
            runtime,
            registry,
            compose: ConfigCache::new(RefreshPolicy::OnModification),
            statuses,
            pending: PendingTransitions::new(),
            streams,
        }
    }

    /// Long-lived processes that reload documents only on `refresh_config`
    /// use [`RefreshPolicy::Manual`].
    #[must_use]
    pub fn with_refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.compose = ConfigCache::new(policy);
        self
    }

    pub fn config(&self) -> &InstaConfig {
        &self.config
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Merged graph of the base document and, when present, the persistence
    /// overlay.
    pub fn graph(&self) -> Result<Arc<ComposeGraph>, CoreError> {
        Ok(self.compose.graph(&self.config.compose_documents(true))?)
    }

    /// Every service known to the compose documents or the registry, sorted.
    pub fn services(&self) -> Result<Vec<String>, CoreError> {
        let graph = self.graph()?;
        let mut names: BTreeSet<String> = graph.service_names().into_iter().collect();
        names.extend(self.registry.names().map(str::to_owned));
        Ok(names.into_iter().collect())
    }

    fn check_known(&self, graph: &ComposeGraph, name: &str) -> Result<(), CoreError> {
        let known = self.registry.contains(name)
            || graph.contains(name)
            || graph.iter().any(|s| s.container_identity() == name);
        if known {
            Ok(())
        } else {
            Err(CoreError::UnknownService(name.to_owned()))
        }
    }

    /// Bring up `name`; compose starts its dependencies. With `persist`, the
    /// persistence overlay's volumes are mounted too.
    pub fn start_service(&self, name: &str, persist: bool) -> Result<(), CoreError> {
        let graph = self.graph()?;
        self.check_known(&graph, name)?;
        let own = graph.container_identity(name).to_owned();
        let snapshot = self.statuses.peek();
        let marked: Vec<String> = DependencyResolver::new(&graph)
            .resolve(name, true)
            .into_iter()
            .filter(|c| *c == own || !observed_active(snapshot.as_ref(), c))
            .collect();
        for container in &marked {
            self.pending.mark(container, Transition::Starting);
        }
        self.statuses.invalidate();

        info!("starting {name}");
        let request = ComposeRequest::new(
            self.config.compose_documents(persist).existing(),
            vec![name.to_owned()],
        );
        let result = self.runtime.compose_up(&request);
        self.statuses.invalidate();
        if let Err(e) = result {
            warn!("failed to start {name}: {e}");
            for container in &marked {
                self.pending.clear(container);
            }
            return Err(e.into());
        }
        let landed = self.statuses.epoch();
        for container in &marked {
            self.pending.land(container, Transition::Starting, landed);
        }
        Ok(())
    }

    /// Stop `name` plus those of its transitive dependencies that no other
    /// running service still needs. Returns the services stopped.
    pub fn stop_service(&self, name: &str) -> Result<Vec<String>, CoreError> {
        let graph = self.graph()?;
        self.check_known(&graph, name)?;
        let resolver = DependencyResolver::new(&graph);
        let deps = resolver.resolve_services(name, false);
        let snapshot = self.snapshot().ok();
        let active = |service: &str| {
            observed_active(snapshot.as_ref(), graph.container_identity(service))
                || self.pending.get(graph.container_identity(service)) == Some(Transition::Starting)
        };

        let mut needed = HashSet::new();
        for other in graph.service_names() {
            if other != name && !deps.contains(&other) && active(&other) {
                needed.extend(resolver.resolve_services(&other, false));
            }
        }

        let mut targets = vec![name.to_owned()];
        targets.extend(
            deps.into_iter()
                .filter(|d| graph.contains(d) && !needed.contains(d) && active(d)),
        );
        self.stop_services(&graph, targets)
    }

    /// Stop every service in the compose documents.
    pub fn stop_all(&self) -> Result<Vec<String>, CoreError> {
        let graph = self.graph()?;
        let services = graph.service_names();
        if services.is_empty() {
            return Ok(services);
        }
        self.stop_services(&graph, services)
    }

    fn stop_services(&self, graph: &ComposeGraph, services: Vec<String>) -> Result<Vec<String>, CoreError> {
        let containers: Vec<String> = services
            .iter()
            .map(|s| graph.container_identity(s).to_owned())
            .collect();
        for container in &containers {
            self.pending.mark(container, Transition::Stopping);
        }
        self.statuses.invalidate();

        info!("stopping {}", services.join(", "));
        let request = ComposeRequest::new(self.config.compose_documents(true).existing(), services);
        let result = self.runtime.compose_down(&request);
        self.statuses.invalidate();
        if let Err(e) = result {
            warn!("failed to stop services: {e}");
            for container in &containers {
                self.pending.clear(container);
            }
            return Err(e.into());
        }
        let landed = self.statuses.epoch();
        for container in &containers {
            self.pending.land(container, Transition::Stopping, landed);
        }
        Ok(request.services)
    }

    fn snapshot(&self) -> Result<StatusSnapshot, RuntimeError> {
        self.statuses
            .get_or_refresh(|| self.runtime.all_container_statuses())
    }

    /// Best-effort graph for status paths, which must not fail.
    fn status_graph(&self) -> Arc<ComposeGraph> {
        self.graph().unwrap_or_else(|e| {
            debug!("status lookup without compose graph: {e}");
            Arc::new(ComposeGraph::default())
        })
    }

    fn observe(
        &self,
        graph: &ComposeGraph,
        service: &str,
        snapshot: Option<&StatusSnapshot>,
        observed_at: u64,
    ) -> ServiceStatus {
        let identity = graph.container_identity(service).to_owned();
        let project = self.runtime.project_name();
        let (container, observed, detail) = match snapshot {
            Some(snapshot) => {
                let candidates = [
                    identity.clone(),
                    format!("{project}_{service}_1"),
                    format!("{project}-{service}-1"),
                ];
                match candidates.iter().find_map(|c| snapshot.get(c)) {
                    Some(record) => (record.container.clone(), record.status, record.detail.clone()),
                    None => (identity.clone(), ContainerStatus::NotFound, None),
                }
            }
            None => {
                let status = self.runtime.container_status(&identity);
                (identity.clone(), status, None)
            }
        };
        ServiceStatus {
            service: service.to_owned(),
            container,
            status: self.pending.resolve(&identity, observed, observed_at),
            detail,
        }
    }

    fn snapshot_or_fallback(&self) -> Option<StatusSnapshot> {
        match self.snapshot() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                debug!("bulk status query failed, falling back to single queries: {e}");
                None
            }
        }
    }

    /// Canonical status with `not_found` reported as `stopped`.
    pub fn service_status(&self, name: &str) -> ContainerStatus {
        self.raw_service_status(name).collapse_not_found()
    }

    /// Canonical status, keeping `not_found` for containers that were never
    /// created.
    pub fn raw_service_status(&self, name: &str) -> ContainerStatus {
        let graph = self.status_graph();
        let observed_at = self.statuses.epoch();
        let snapshot = self.snapshot_or_fallback();
        self.observe(&graph, name, snapshot.as_ref(), observed_at).status
    }

    /// Status of every compose service from a single bulk query. `not_found`
    /// is reported as `stopped` with `not_found` as detail.
    pub fn all_statuses(&self) -> Result<Vec<ServiceStatus>, CoreError> {
        let graph = self.graph()?;
        let observed_at = self.statuses.epoch();
        let snapshot = self.snapshot_or_fallback();
        Ok(graph
            .service_names()
            .iter()
            .map(|service| {
                let mut status = self.observe(&graph, service, snapshot.as_ref(), observed_at);
                if status.status == ContainerStatus::NotFound {
                    status.status = ContainerStatus::Stopped;
                    status.detail = Some(ContainerStatus::NotFound.to_string());
                }
                status
            })
            .collect())
    }

    /// Drop cached statuses and poll the backend now.
    pub fn refresh_statuses(&self) -> Result<(), CoreError> {
        self.statuses.invalidate();
        self.snapshot()?;
        Ok(())
    }

    /// Re-read the compose documents on next use.
    pub fn refresh_config(&self) {
        self.compose.refresh();
        self.statuses.invalidate();
    }

    /// Transitive dependencies of `name` as container identities.
    pub fn dependencies(&self, name: &str) -> Result<Vec<String>, CoreError> {
        let graph = self.graph()?;
        self.check_known(&graph, name)?;
        Ok(DependencyResolver::new(&graph).resolve(name, false))
    }

    /// Services that depend on `name` directly, as container identities.
    pub fn dependents(&self, name: &str) -> Result<Vec<String>, CoreError> {
        let graph = self.graph()?;
        self.check_known(&graph, name)?;
        Ok(DependencyResolver::new(&graph).dependents(name))
    }

    pub fn dependency_edges(&self) -> Result<Vec<DependencyEdge>, CoreError> {
        let graph = self.graph()?;
        Ok(DependencyResolver::new(&graph).edges())
    }

    pub fn container_name(&self, name: &str) -> Result<String, CoreError> {
        let graph = self.graph()?;
        self.check_known(&graph, name)?;
        Ok(self.runtime.container_name(&graph, name))
    }

    pub fn port_mappings(&self, name: &str) -> Result<BTreeMap<String, String>, CoreError> {
        let container = self.container_name(name)?;
        Ok(self.runtime.port_mappings(&container)?)
    }

    pub fn exec(&self, name: &str, command: &str, interactive: bool) -> Result<String, CoreError> {
        let container = self.container_name(name)?;
        info!("exec in {container}: {command}");
        Ok(self.runtime.exec(&container, command, interactive)?)
    }

    /// The registry's connection command for `name`, if it declares one.
    pub fn connection_command(&self, name: &str) -> Option<String> {
        self.registry
            .get(name)
            .map(|d| d.connection_cmd.trim().to_owned())
            .filter(|c| !c.is_empty())
    }

    /// Last `tail` log lines, or the configured default.
    pub fn logs(&self, name: &str, tail: Option<usize>) -> Result<Vec<String>, CoreError> {
        let container = self.container_name(name)?;
        Ok(self
            .runtime
            .logs(&container, tail.unwrap_or(self.config.log_tail_lines))?)
    }

    /// Follow the logs of `name`. At most one log stream per service.
    pub fn start_log_stream(&self, name: &str, sink: Arc<dyn EventSink>) -> Result<StreamHandle, CoreError> {
        let container = self.container_name(name)?;
        let spec = self.runtime.log_stream_spec(&container);
        Ok(self.streams.start(
            StreamKind::Logs,
            name,
            &spec,
            LineDecoder::Logs { container },
            sink,
        )?)
    }

    pub fn stop_log_stream(&self, name: &str) -> bool {
        self.streams.stop(StreamKind::Logs, name)
    }

    /// Pull `image`, reporting progress to `sink`. At most one pull per image.
    pub fn start_image_pull(&self, image: &str, sink: Arc<dyn EventSink>) -> Result<StreamHandle, CoreError> {
        let spec = self.runtime.pull_spec(image);
        let decoder = LineDecoder::Pull(PullParser::new(self.runtime.pull_dialect(), image));
        Ok(self.streams.start(StreamKind::Pull, image, &spec, decoder, sink)?)
    }

    pub fn stop_image_pull(&self, image: &str) -> bool {
        self.streams.stop(StreamKind::Pull, image)
    }

    pub fn stop_streams(&self) {
        self.streams.stop_all();
    }

    pub fn active_streams(&self) -> usize {
        self.streams.active_count()
    }

    pub fn image_exists(&self, image: &str) -> Result<bool, CoreError> {
        Ok(self.runtime.image_exists(image)?)
    }

    /// `(service, image)` for `name` and its dependencies.
    pub fn images_for(&self, name: &str) -> Result<Vec<(String, String)>, CoreError> {
        let graph = self.graph()?;
        self.check_known(&graph, name)?;
        let services = DependencyResolver::new(&graph).resolve_services(name, true);
        Ok(graph.images_of(&services))
    }

    /// Images `name` and its dependencies need that are not present locally.
    pub fn missing_images(&self, name: &str) -> Result<Vec<String>, CoreError> {
        let mut images: Vec<String> = self
            .images_for(name)?
            .into_iter()
            .map(|(_, image)| image)
            .collect();
        images.sort();
        images.dedup();
        let present = self.runtime.images_exist(&images)?;
        Ok(images
            .into_iter()
            .filter(|image| !present.get(image).copied().unwrap_or(false))
            .collect())
    }
}

fn observed_active(snapshot: Option<&StatusSnapshot>, container: &str) -> bool {
    snapshot
        .and_then(|s| s.get(container))
        .is_some_and(|r| r.status.is_active())
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta_runtime::MockRuntime;
    use std::path::Path;

    const COMPOSE: &str = r"
services:
  postgres:
    container_name: postgres
    image: postgres:16
  grafana:
    image: grafana/grafana:11.0.0
    depends_on:
      postgres:
        condition: service_started
";

    fn manager(dir: &Path, mock: Arc<MockRuntime>, rt: &tokio::runtime::Runtime) -> InfraManager {
        std::fs::write(dir.join("docker-compose.yaml"), COMPOSE).unwrap();
        let config = InstaConfig {
            work_dir: dir.to_path_buf(),
            ..InstaConfig::default()
        };
        InfraManager::new(config, mock, ServiceRegistry::empty(), rt.handle().clone())
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn unknown_service_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime();
        let mgr = manager(dir.path(), Arc::new(MockRuntime::new()), &rt);
        assert!(matches!(
            mgr.start_service("nope", false),
            Err(CoreError::UnknownService(_))
        ));
        assert!(matches!(mgr.dependencies("nope"), Err(CoreError::UnknownService(_))));
    }

    #[test]
    fn services_include_registry_entries() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime();
        std::fs::write(dir.path().join("docker-compose.yaml"), COMPOSE).unwrap();
        let registry = ServiceRegistry::from_toml_str(
            r#"
[[service]]
name = "mysql"
type = "database"
connection_cmd = "mysql -u root"
"#,
        )
        .unwrap();
        let config = InstaConfig {
            work_dir: dir.path().to_path_buf(),
            ..InstaConfig::default()
        };
        let mgr = InfraManager::new(
            config,
            Arc::new(MockRuntime::new()),
            registry,
            rt.handle().clone(),
        );
        assert_eq!(mgr.services().unwrap(), vec!["grafana", "mysql", "postgres"]);
        assert_eq!(mgr.connection_command("mysql").as_deref(), Some("mysql -u root"));
        assert_eq!(mgr.connection_command("postgres"), None);
    }

    #[test]
    fn status_collapses_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime();
        let mgr = manager(dir.path(), Arc::new(MockRuntime::new()), &rt);
        assert_eq!(mgr.service_status("postgres"), ContainerStatus::Stopped);
        assert_eq!(mgr.raw_service_status("postgres"), ContainerStatus::NotFound);
        let all = mgr.all_statuses().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|s| s.status == ContainerStatus::Stopped));
        assert!(all.iter().all(|s| s.detail.as_deref() == Some("not_found")));
    }

    #[test]
    fn bulk_failure_falls_back_to_single_queries() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime();
        let mock = Arc::new(MockRuntime::new());
        mock.add_container("postgres", ContainerStatus::RunningHealthy);
        mock.fail_bulk_queries(true);
        let mgr = manager(dir.path(), Arc::clone(&mock), &rt);
        assert_eq!(mgr.service_status("postgres"), ContainerStatus::RunningHealthy);
        assert_eq!(mock.single_calls(), 1);
        assert!(mgr.refresh_statuses().is_err());
    }

    #[test]
    fn compose_project_names_are_matched() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime();
        let mock = Arc::new(MockRuntime::new());
        mock.add_container("insta-grafana-1", ContainerStatus::Running);
        let mgr = manager(dir.path(), Arc::clone(&mock), &rt);
        assert_eq!(mgr.service_status("grafana"), ContainerStatus::Running);
        assert_eq!(mgr.container_name("grafana").unwrap(), "insta-grafana-1");
    }

    #[test]
    fn failed_start_clears_pending() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime();
        let mock = Arc::new(MockRuntime::new());
        let mgr = manager(dir.path(), Arc::clone(&mock), &rt);
        mgr.service_status("postgres");
        mock.set_available(false);
        assert!(matches!(
            mgr.start_service("postgres", false),
            Err(CoreError::Runtime(RuntimeError::Unavailable(_)))
        ));
        mock.set_available(true);
        assert_eq!(mgr.service_status("postgres"), ContainerStatus::Stopped);
    }

    #[test]
    fn dependency_queries() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime();
        let mgr = manager(dir.path(), Arc::new(MockRuntime::new()), &rt);
        assert_eq!(mgr.dependencies("grafana").unwrap(), vec!["postgres"]);
        assert_eq!(mgr.dependents("postgres").unwrap(), vec!["grafana"]);
        let edges = mgr.dependency_edges().unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].source, "grafana");
        assert_eq!(
            mgr.images_for("grafana").unwrap(),
            vec![
                ("grafana".to_owned(), "grafana/grafana:11.0.0".to_owned()),
                ("postgres".to_owned(), "postgres:16".to_owned()),
            ]
        );
    }

    #[test]
    fn missing_images_lists_absent_ones() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime();
        let mock = Arc::new(MockRuntime::new());
        mock.add_image("postgres:16");
        let mgr = manager(dir.path(), Arc::clone(&mock), &rt);
        assert_eq!(mgr.missing_images("grafana").unwrap(), vec!["grafana/grafana:11.0.0"]);
        assert!(mgr.image_exists("postgres:16").unwrap());
    }

    #[test]
    fn exec_ports_and_logs_use_container_name() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime();
        let mock = Arc::new(MockRuntime::new());
        mock.add_container("postgres", ContainerStatus::Running);
        mock.set_ports("postgres", &[("5432/tcp", "5432")]);
        mock.set_logs("postgres", &["ready", "accepting connections"]);
        let mgr = manager(dir.path(), Arc::clone(&mock), &rt);
        assert_eq!(mgr.port_mappings("postgres").unwrap()["5432/tcp"], "5432");
        assert_eq!(mgr.logs("postgres", Some(1)).unwrap(), vec!["accepting connections"]);
        mgr.exec("postgres", "psql -U postgres", false).unwrap();
        assert_eq!(mock.execs()[0].1, "psql -U postgres");
    }
}
