use crate::backend::{image_listed, ComposeRequest, ContainerRuntime};
use crate::probe::{ProbeStage, RuntimeStatus, StartupCommand};
use crate::process::ProcessSpec;
use crate::pull::PullDialect;
use crate::status::{ContainerStatus, ContainerStatusRecord};
use crate::RuntimeError;
use insta_schema::{parse_compose_str, ComposeGraph};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    containers: BTreeMap<String, ContainerStatus>,
    images: HashSet<String>,
    ports: HashMap<String, BTreeMap<String, String>>,
    logs: HashMap<String, Vec<String>>,
    log_scripts: HashMap<String, String>,
    pull_scripts: HashMap<String, String>,
    requests: Vec<ComposeRequest>,
    execs: Vec<(String, String)>,
    status_delay: Duration,
    compose_delay: Duration,
    started_status: Option<ContainerStatus>,
}

/// In-memory backend for tests and dry runs.
///
/// Containers live in a map; compose up marks every requested service's
/// container as running, compose down removes them. Streams run real
/// `sh -c` scripts so the streaming pipeline is exercised end to end.
pub struct MockRuntime {
    name: String,
    state: Mutex<MockState>,
    installed: AtomicBool,
    available: AtomicBool,
    recover_after: AtomicUsize,
    fail_bulk: AtomicBool,
    podman_dialect: AtomicBool,
    bulk_calls: AtomicUsize,
    single_calls: AtomicUsize,
    up_calls: AtomicUsize,
    down_calls: AtomicUsize,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::named("mock")
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: Mutex::new(MockState::default()),
            installed: AtomicBool::new(true),
            available: AtomicBool::new(true),
            recover_after: AtomicUsize::new(0),
            fail_bulk: AtomicBool::new(false),
            podman_dialect: AtomicBool::new(true),
            bulk_calls: AtomicUsize::new(0),
            single_calls: AtomicUsize::new(0),
            up_calls: AtomicUsize::new(0),
            down_calls: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_installed(&self, installed: bool) {
        self.installed.store(installed, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Unavailable now, available once `probes` more probes have run.
    pub fn recover_after(&self, probes: usize) {
        self.set_available(false);
        self.recover_after.store(probes, Ordering::SeqCst);
    }

    pub fn fail_bulk_queries(&self, fail: bool) {
        self.fail_bulk.store(fail, Ordering::SeqCst);
    }

    pub fn set_pull_dialect(&self, dialect: PullDialect) {
        self.podman_dialect
            .store(dialect == PullDialect::Podman, Ordering::SeqCst);
    }

    /// Sleep inside every status query, to widen concurrency windows.
    pub fn set_status_delay(&self, delay: Duration) {
        self.state().status_delay = delay;
    }

    /// Sleep inside compose up and down before the containers change.
    pub fn set_compose_delay(&self, delay: Duration) {
        self.state().compose_delay = delay;
    }

    /// Status containers take after compose up. Defaults to running.
    pub fn set_started_status(&self, status: ContainerStatus) {
        self.state().started_status = Some(status);
    }

    pub fn add_container(&self, container: &str, status: ContainerStatus) {
        self.state().containers.insert(container.to_owned(), status);
    }

    pub fn set_status(&self, container: &str, status: ContainerStatus) {
        self.add_container(container, status);
    }

    pub fn remove_container(&self, container: &str) {
        self.state().containers.remove(container);
    }

    pub fn add_image(&self, image: &str) {
        self.state().images.insert(image.to_owned());
    }

    pub fn set_ports(&self, container: &str, ports: &[(&str, &str)]) {
        self.state().ports.insert(
            container.to_owned(),
            ports
                .iter()
                .map(|(c, h)| ((*c).to_owned(), (*h).to_owned()))
                .collect(),
        );
    }

    pub fn set_logs(&self, container: &str, lines: &[&str]) {
        self.state().logs.insert(
            container.to_owned(),
            lines.iter().map(|l| (*l).to_owned()).collect(),
        );
    }

    /// Shell script run for `logs --follow` of `container`.
    pub fn set_log_script(&self, container: &str, script: &str) {
        self.state()
            .log_scripts
            .insert(container.to_owned(), script.to_owned());
    }

    /// Shell script run for a pull of `image`.
    pub fn set_pull_script(&self, image: &str, script: &str) {
        self.state()
            .pull_scripts
            .insert(image.to_owned(), script.to_owned());
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    pub fn compose_up_calls(&self) -> usize {
        self.up_calls.load(Ordering::SeqCst)
    }

    pub fn compose_down_calls(&self) -> usize {
        self.down_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ComposeRequest> {
        self.state().requests.clone()
    }

    pub fn execs(&self) -> Vec<(String, String)> {
        self.state().execs.clone()
    }

    fn delay(&self) {
        let delay = self.state().status_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    fn compose_delay(&self) {
        let delay = self.state().compose_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    fn check_available(&self) -> Result<(), RuntimeError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable(format!("{} is not running", self.name)))
        }
    }

    /// Container identities of the requested services, read from the
    /// request's documents when they parse.
    fn identities(request: &ComposeRequest) -> Vec<String> {
        let mut graph = ComposeGraph::default();
        for file in &request.files {
            if let Ok(content) = std::fs::read_to_string(file) {
                if let Ok(services) = parse_compose_str(&content, &file.display().to_string()) {
                    graph.extend(services);
                }
            }
        }
        request
            .services
            .iter()
            .map(|s| graph.container_identity(s).to_owned())
            .collect()
    }

    fn script(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh").arg("-c").arg(script)
    }
}

impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn project_name(&self) -> &str {
        "insta"
    }

    fn probe(&self) -> RuntimeStatus {
        let remaining = self.recover_after.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining == 1 {
                self.set_available(true);
            }
            self.recover_after.store(remaining - 1, Ordering::SeqCst);
        }

        let mut status = RuntimeStatus::ready(&self.name, "0.0.0-mock");
        status.installation_guide = format!("install {}", self.name);
        if !self.installed.load(Ordering::SeqCst) {
            status.installed = false;
            status.running = false;
            status.compose_available = false;
            status.available = false;
            status.version = None;
            status.failed_stage = Some(ProbeStage::Binary);
            status.error = Some(format!("{} not installed", self.name));
        } else if !self.available.load(Ordering::SeqCst) {
            status.running = false;
            status.compose_available = false;
            status.available = false;
            status.failed_stage = Some(ProbeStage::Daemon);
            status.error = Some(format!("{} daemon not running", self.name));
            status.can_auto_start = true;
            status.startup_command = Some(StartupCommand {
                program: "sh".to_owned(),
                args: vec!["-c".to_owned(), "true".to_owned()],
            });
        }
        status
    }

    fn compose_up(&self, request: &ComposeRequest) -> Result<(), RuntimeError> {
        self.up_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.compose_delay();
        let identities = Self::identities(request);
        let mut state = self.state();
        let started = state.started_status.unwrap_or(ContainerStatus::Running);
        for identity in identities {
            state.containers.insert(identity, started);
        }
        state.requests.push(request.clone());
        Ok(())
    }

    fn compose_down(&self, request: &ComposeRequest) -> Result<(), RuntimeError> {
        self.down_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.compose_delay();
        let identities = Self::identities(request);
        let mut state = self.state();
        for identity in identities {
            state.containers.remove(&identity);
        }
        state.requests.push(request.clone());
        Ok(())
    }

    fn exec(&self, container: &str, command: &str, _interactive: bool) -> Result<String, RuntimeError> {
        self.check_available()?;
        let mut state = self.state();
        if !state.containers.get(container).is_some_and(|s| s.is_running()) {
            return Err(RuntimeError::OperationFailed {
                context: format!("exec in {container}"),
                output: format!("container {container} is not running"),
            });
        }
        state.execs.push((container.to_owned(), command.to_owned()));
        Ok(String::new())
    }

    fn port_mappings(&self, container: &str) -> Result<BTreeMap<String, String>, RuntimeError> {
        self.check_available()?;
        Ok(self.state().ports.get(container).cloned().unwrap_or_default())
    }

    fn container_exists(&self, container: &str) -> bool {
        self.state().containers.contains_key(container)
    }

    fn logs(&self, container: &str, tail: usize) -> Result<Vec<String>, RuntimeError> {
        self.check_available()?;
        let state = self.state();
        let lines = state.logs.get(container).cloned().unwrap_or_default();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines.into_iter().skip(skip).collect())
    }

    fn log_stream_spec(&self, container: &str) -> ProcessSpec {
        let state = self.state();
        let script = state.log_scripts.get(container).cloned().unwrap_or_else(|| {
            state
                .logs
                .get(container)
                .map(|lines| {
                    lines
                        .iter()
                        .map(|l| format!("echo '{}'", l.replace('\'', "")))
                        .collect::<Vec<_>>()
                        .join("; ")
                })
                .unwrap_or_else(|| "true".to_owned())
        });
        Self::script(&script)
    }

    fn pull_spec(&self, image: &str) -> ProcessSpec {
        let script = self.state().pull_scripts.get(image).cloned().unwrap_or_else(|| {
            format!(
                "echo 'Trying to pull {image}...'; echo 'Getting image source signatures'; \
                 echo 'Copying blob 0000mock done'; echo 'Writing manifest to image destination'; \
                 echo 'Storing signatures'"
            )
        });
        Self::script(&script)
    }

    fn pull_dialect(&self) -> PullDialect {
        if self.podman_dialect.load(Ordering::SeqCst) {
            PullDialect::Podman
        } else {
            PullDialect::Docker
        }
    }

    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        self.check_available()?;
        Ok(image_listed(&self.state().images, image))
    }

    fn list_images(&self) -> Result<Vec<String>, RuntimeError> {
        self.check_available()?;
        let mut images: Vec<String> = self.state().images.iter().cloned().collect();
        images.sort();
        Ok(images)
    }

    fn container_status(&self, container: &str) -> ContainerStatus {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        self.delay();
        if self.check_available().is_err() {
            return ContainerStatus::Unknown;
        }
        self.state()
            .containers
            .get(container)
            .copied()
            .unwrap_or(ContainerStatus::NotFound)
    }

    fn all_container_statuses(&self) -> Result<Vec<ContainerStatusRecord>, RuntimeError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        self.delay();
        self.check_available()?;
        if self.fail_bulk.load(Ordering::SeqCst) {
            return Err(RuntimeError::OperationFailed {
                context: "failed to list containers".to_owned(),
                output: "mock bulk query failure".to_owned(),
            });
        }
        Ok(self
            .state()
            .containers
            .iter()
            .map(|(name, status)| ContainerStatusRecord::new(name.clone(), *status))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn compose_up_and_down_track_containers() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("docker-compose.yaml");
        std::fs::write(
            &file,
            "services:\n  postgres:\n    container_name: pg-main\n  redis: {}\n",
        )
        .unwrap();
        let mock = MockRuntime::new();
        let request = ComposeRequest::new(vec![file], vec!["postgres".to_owned(), "redis".to_owned()]);
        mock.compose_up(&request).unwrap();
        assert_eq!(mock.container_status("pg-main"), ContainerStatus::Running);
        assert_eq!(mock.container_status("redis"), ContainerStatus::Running);
        assert_eq!(mock.all_container_statuses().unwrap().len(), 2);

        mock.compose_down(&request).unwrap();
        assert_eq!(mock.container_status("pg-main"), ContainerStatus::NotFound);
        assert_eq!(mock.compose_up_calls(), 1);
        assert_eq!(mock.compose_down_calls(), 1);
        assert_eq!(mock.single_calls(), 3);
        assert_eq!(mock.bulk_calls(), 1);
        assert_eq!(mock.requests().len(), 2);
    }

    #[test]
    fn unreadable_documents_fall_back_to_service_names() {
        let mock = MockRuntime::new();
        mock.set_started_status(ContainerStatus::Starting);
        let request = ComposeRequest::new(vec![PathBuf::from("/nonexistent/c.yaml")], vec!["kafka".to_owned()]);
        mock.compose_up(&request).unwrap();
        assert_eq!(mock.container_status("kafka"), ContainerStatus::Starting);
    }

    #[test]
    fn unavailable_mock_degrades() {
        let mock = MockRuntime::new();
        mock.add_container("redis", ContainerStatus::Running);
        mock.set_available(false);
        assert_eq!(mock.container_status("redis"), ContainerStatus::Unknown);
        assert!(matches!(mock.all_container_statuses(), Err(RuntimeError::Unavailable(_))));
        let status = mock.probe();
        assert_eq!(status.failed_stage, Some(ProbeStage::Daemon));
        assert!(status.can_auto_start);
    }

    #[test]
    fn recovers_after_probes() {
        let mock = MockRuntime::new();
        mock.recover_after(2);
        assert!(!mock.probe().available);
        assert!(mock.probe().available);
        assert!(mock.probe().available);
    }

    #[test]
    fn logs_tail_and_exec() {
        let mock = MockRuntime::new();
        mock.set_logs("pg", &["a", "b", "c"]);
        assert_eq!(mock.logs("pg", 2).unwrap(), vec!["b", "c"]);
        assert!(mock.logs("other", 5).unwrap().is_empty());

        assert!(mock.exec("pg", "psql", false).is_err());
        mock.add_container("pg", ContainerStatus::RunningHealthy);
        mock.exec("pg", "psql", false).unwrap();
        assert_eq!(mock.execs(), vec![("pg".to_owned(), "psql".to_owned())]);
    }

    #[test]
    fn images() {
        let mock = MockRuntime::new();
        mock.add_image("redis:latest");
        assert!(mock.image_exists("redis").unwrap());
        assert!(!mock.image_exists("postgres:16").unwrap());
        let found = mock.images_exist(&["redis:latest".to_owned()]).unwrap();
        assert!(found["redis:latest"]);
    }
}
