use insta_core::{CoreError, InfraManager, InstaConfig};
use insta_runtime::{
    ContainerStatus, EventSink, MockRuntime, PullPhase, RuntimeError, StreamEvent, StreamKind,
};
use insta_schema::ServiceRegistry;
use std::path::Path;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

const STACK: &str = r"
services:
  postgres:
    image: postgres:16
  grafana:
    image: grafana/grafana:11.0.0
    depends_on:
      - postgres
  keycloak:
    image: quay.io/keycloak/keycloak:25.0
    container_name: insta-keycloak
    depends_on:
      postgres:
        condition: service_healthy
  redis:
    image: redis:7
";

fn tokio_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn setup(dir: &Path, mock: &Arc<MockRuntime>, rt: &tokio::runtime::Runtime) -> Arc<InfraManager> {
    std::fs::write(dir.join("docker-compose.yaml"), STACK).unwrap();
    let config = InstaConfig {
        work_dir: dir.to_path_buf(),
        ..InstaConfig::default()
    };
    let runtime: Arc<MockRuntime> = Arc::clone(mock);
    Arc::new(InfraManager::new(
        config,
        runtime,
        ServiceRegistry::empty(),
        rt.handle().clone(),
    ))
}

fn collector() -> (Arc<Mutex<Vec<StreamEvent>>>, Arc<dyn EventSink>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let sink: Arc<dyn EventSink> = Arc::new(move |event: StreamEvent| {
        sink_events.lock().unwrap().push(event);
    });
    (events, sink)
}

#[test]
fn concurrent_status_readers_share_one_bulk_query() {
    let dir = tempfile::tempdir().unwrap();
    let rt = tokio_runtime();
    let mock = Arc::new(MockRuntime::new());
    mock.add_container("postgres", ContainerStatus::RunningHealthy);
    mock.add_container("insta-keycloak", ContainerStatus::Starting);
    mock.set_status_delay(Duration::from_millis(100));
    let mgr = setup(dir.path(), &mock, &rt);

    let barrier = Arc::new(Barrier::new(8));
    let readers: Vec<_> = (0..8)
        .map(|i| {
            let mgr = Arc::clone(&mgr);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                if i % 2 == 0 {
                    mgr.service_status("postgres")
                } else {
                    let all = mgr.all_statuses().unwrap();
                    all.iter().find(|s| s.service == "postgres").unwrap().status
                }
            })
        })
        .collect();
    for reader in readers {
        assert_eq!(reader.join().unwrap(), ContainerStatus::RunningHealthy);
    }
    assert_eq!(mock.bulk_calls(), 1);
    assert_eq!(mock.single_calls(), 0);

    let all = mgr.all_statuses().unwrap();
    let keycloak = all.iter().find(|s| s.service == "keycloak").unwrap();
    assert_eq!(keycloak.container, "insta-keycloak");
    assert_eq!(keycloak.status, ContainerStatus::Starting);
    let redis = all.iter().find(|s| s.service == "redis").unwrap();
    assert_eq!(redis.status, ContainerStatus::Stopped);
    assert_eq!(redis.detail.as_deref(), Some("not_found"));
    assert_eq!(mock.bulk_calls(), 1);
}

#[test]
fn start_reports_starting_until_backend_catches_up() {
    let dir = tempfile::tempdir().unwrap();
    let rt = tokio_runtime();
    let mock = Arc::new(MockRuntime::new());
    mock.set_compose_delay(Duration::from_millis(400));
    let mgr = setup(dir.path(), &mock, &rt);
    assert_eq!(mgr.raw_service_status("grafana"), ContainerStatus::NotFound);

    let starter = {
        let mgr = Arc::clone(&mgr);
        thread::spawn(move || mgr.start_service("grafana", false))
    };
    thread::sleep(Duration::from_millis(100));
    assert_eq!(mgr.service_status("grafana"), ContainerStatus::Starting);
    assert_eq!(mgr.service_status("postgres"), ContainerStatus::Starting);
    assert_eq!(mgr.service_status("redis"), ContainerStatus::Stopped);

    starter.join().unwrap().unwrap();
    assert_eq!(mgr.service_status("grafana"), ContainerStatus::Running);

    let request = &mock.requests()[0];
    assert_eq!(request.services, vec!["grafana"]);
    assert_eq!(request.files, vec![dir.path().join("docker-compose.yaml")]);
}

#[test]
fn restart_of_exited_services_reports_starting_while_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let rt = tokio_runtime();
    let mock = Arc::new(MockRuntime::new());
    mock.add_container("postgres", ContainerStatus::Error);
    mock.add_container("redis", ContainerStatus::Completed);
    mock.set_compose_delay(Duration::from_millis(500));
    let mgr = setup(dir.path(), &mock, &rt);
    assert_eq!(mgr.service_status("postgres"), ContainerStatus::Error);

    let starter = {
        let mgr = Arc::clone(&mgr);
        thread::spawn(move || mgr.start_service("postgres", false))
    };
    thread::sleep(Duration::from_millis(100));
    assert_eq!(mgr.service_status("postgres"), ContainerStatus::Starting);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(mgr.service_status("postgres"), ContainerStatus::Starting);
    starter.join().unwrap().unwrap();
    assert_eq!(mgr.service_status("postgres"), ContainerStatus::Running);

    // A container that fails again after the restart is reported as failed.
    mock.set_started_status(ContainerStatus::Completed);
    let starter = {
        let mgr = Arc::clone(&mgr);
        thread::spawn(move || mgr.start_service("redis", false))
    };
    thread::sleep(Duration::from_millis(100));
    assert_eq!(mgr.service_status("redis"), ContainerStatus::Starting);
    starter.join().unwrap().unwrap();
    assert_eq!(mgr.service_status("redis"), ContainerStatus::Completed);
    assert_eq!(mgr.service_status("redis"), ContainerStatus::Completed);
}

#[test]
fn persist_start_includes_overlay_document() {
    let dir = tempfile::tempdir().unwrap();
    let rt = tokio_runtime();
    let mock = Arc::new(MockRuntime::new());
    let mgr = setup(dir.path(), &mock, &rt);
    std::fs::write(
        dir.path().join("docker-compose-persist.yaml"),
        "services:\n  postgres:\n    volumes:\n      - pgdata:/var/lib/postgresql/data\n",
    )
    .unwrap();

    mgr.start_service("postgres", true).unwrap();
    assert_eq!(mock.requests()[0].files.len(), 2);
    mgr.start_service("redis", false).unwrap();
    assert_eq!(mock.requests()[1].files.len(), 1);
}

#[test]
fn stop_keeps_dependencies_still_in_use() {
    let dir = tempfile::tempdir().unwrap();
    let rt = tokio_runtime();
    let mock = Arc::new(MockRuntime::new());
    mock.add_container("postgres", ContainerStatus::RunningHealthy);
    mock.add_container("grafana", ContainerStatus::Running);
    mock.add_container("insta-keycloak", ContainerStatus::Running);
    let mgr = setup(dir.path(), &mock, &rt);

    let stopped = mgr.stop_service("grafana").unwrap();
    assert_eq!(stopped, vec!["grafana"]);
    assert_eq!(mgr.service_status("grafana"), ContainerStatus::Stopped);
    assert_eq!(mgr.service_status("postgres"), ContainerStatus::RunningHealthy);

    let stopped = mgr.stop_service("keycloak").unwrap();
    assert_eq!(stopped, vec!["keycloak", "postgres"]);
    assert_eq!(mgr.service_status("postgres"), ContainerStatus::Stopped);
    assert_eq!(mock.compose_down_calls(), 2);
}

#[test]
fn stop_all_brings_everything_down() {
    let dir = tempfile::tempdir().unwrap();
    let rt = tokio_runtime();
    let mock = Arc::new(MockRuntime::new());
    mock.add_container("postgres", ContainerStatus::Running);
    mock.add_container("redis", ContainerStatus::Running);
    let mgr = setup(dir.path(), &mock, &rt);

    let stopped = mgr.stop_all().unwrap();
    assert_eq!(stopped.len(), 4);
    assert!(mgr
        .all_statuses()
        .unwrap()
        .iter()
        .all(|s| s.status == ContainerStatus::Stopped));
}

#[test]
fn dependency_graph_queries() {
    let dir = tempfile::tempdir().unwrap();
    let rt = tokio_runtime();
    let mgr = setup(dir.path(), &Arc::new(MockRuntime::new()), &rt);

    assert_eq!(mgr.dependencies("keycloak").unwrap(), vec!["postgres"]);
    assert_eq!(mgr.dependencies("insta-keycloak").unwrap(), vec!["postgres"]);
    assert_eq!(
        mgr.dependents("postgres").unwrap(),
        vec!["grafana", "insta-keycloak"]
    );
    assert!(mgr.dependents("redis").unwrap().is_empty());
    assert_eq!(mgr.dependency_edges().unwrap().len(), 2);
    assert_eq!(
        mgr.services().unwrap(),
        vec!["grafana", "keycloak", "postgres", "redis"]
    );
    assert!(matches!(
        mgr.dependents("mongodb"),
        Err(CoreError::UnknownService(name)) if name == "mongodb"
    ));
}

#[test]
fn edited_compose_file_is_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let rt = tokio_runtime();
    let mgr = setup(dir.path(), &Arc::new(MockRuntime::new()), &rt);
    assert_eq!(mgr.services().unwrap().len(), 4);

    std::fs::write(
        dir.path().join("docker-compose.yaml"),
        "services:\n  mongodb:\n    image: mongo:7\n",
    )
    .unwrap();
    mgr.refresh_config();
    assert_eq!(mgr.services().unwrap(), vec!["mongodb"]);
}

#[test]
fn one_log_stream_per_service() {
    let dir = tempfile::tempdir().unwrap();
    let rt = tokio_runtime();
    let mock = Arc::new(MockRuntime::new());
    mock.add_container("postgres", ContainerStatus::Running);
    mock.set_log_script("postgres", "while true; do echo tick; sleep 0.05; done");
    let mgr = setup(dir.path(), &mock, &rt);

    let (events, sink) = collector();
    let _first = mgr.start_log_stream("postgres", Arc::clone(&sink)).unwrap();
    let second = mgr.start_log_stream("postgres", Arc::clone(&sink));
    assert!(matches!(
        second,
        Err(CoreError::Runtime(RuntimeError::Conflict {
            kind: StreamKind::Logs,
            ..
        }))
    ));
    assert_eq!(mgr.active_streams(), 1);

    thread::sleep(Duration::from_millis(300));
    assert!(mgr.stop_log_stream("postgres"));
    assert!(!mgr.stop_log_stream("postgres"));
    {
        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::Log(line) if line.container == "postgres" && line.line == "tick"
        )));
    }

    let _again = mgr.start_log_stream("postgres", sink).unwrap();
    mgr.stop_streams();
    assert_eq!(mgr.active_streams(), 0);
}

#[test]
fn image_pull_reports_progress_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let rt = tokio_runtime();
    let mock = Arc::new(MockRuntime::new());
    let mgr = setup(dir.path(), &mock, &rt);
    assert_eq!(
        mgr.missing_images("grafana").unwrap(),
        vec!["grafana/grafana:11.0.0", "postgres:16"]
    );

    let (events, sink) = collector();
    let handle = mgr.start_image_pull("postgres:16", sink).unwrap();
    rt.block_on(handle.wait());

    let events = events.lock().unwrap().clone();
    let pulls: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Pull(p) => Some(p.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(pulls.first().map(|p| p.phase), Some(PullPhase::Starting));
    assert_eq!(pulls.last().map(|p| p.phase), Some(PullPhase::Complete));
    assert!(pulls.windows(2).all(|w| w[0].percentage <= w[1].percentage));
    assert!(pulls.iter().all(|p| p.image == "postgres:16"));
    assert!(!mgr.stop_image_pull("postgres:16"));
}

#[test]
fn unavailable_runtime_degrades_status_to_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let rt = tokio_runtime();
    let mock = Arc::new(MockRuntime::new());
    mock.set_available(false);
    let mgr = setup(dir.path(), &mock, &rt);

    assert_eq!(mgr.service_status("postgres"), ContainerStatus::Unknown);
    let all = mgr.all_statuses().unwrap();
    assert!(all.iter().all(|s| s.status == ContainerStatus::Unknown));
    assert!(mgr.refresh_statuses().is_err());
}

#[test]
fn service_status_serializes_with_wire_names() {
    let dir = tempfile::tempdir().unwrap();
    let rt = tokio_runtime();
    let mock = Arc::new(MockRuntime::new());
    mock.add_container("redis", ContainerStatus::RunningUnhealthy);
    let mgr = setup(dir.path(), &mock, &rt);

    let all = mgr.all_statuses().unwrap();
    let redis = all.iter().find(|s| s.service == "redis").unwrap();
    let json = serde_json::to_value(redis).unwrap();
    assert_eq!(json["status"], "running-unhealthy");
    assert_eq!(json["container"], "redis");
    assert!(json.get("detail").is_none());
}
