//! HTTP flows across executions, builds and registry settings.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use toolsmith::build::{BuildCoordinator, BuildPool, LocalBuilder, RegistryPublisher};
use toolsmith::config::{ClusterConfig, ClusterType};
use toolsmith::db::ToolStore;
use toolsmith::orchestrator::{ApiState, ExecutionCoordinator, ToolsmithApi};
use toolsmith::testing::{FakeCluster, FakeCommandRunner, test_db};
use toolsmith::tools::{ToolDefinition, ToolResolver};

struct App {
    router: Router,
    cluster: Arc<FakeCluster>,
    runner: Arc<FakeCommandRunner>,
    pool: BuildPool,
    _db_dir: tempfile::TempDir,
    _context_dir: tempfile::TempDir,
}

async fn app() -> App {
    let (db, db_dir) = test_db().await;
    db.save_tool(&ToolDefinition::new(
        "network",
        "port scan",
        "def main(target, ports='1-1024'):\n    return {'target': target}\n",
    ))
    .await
    .unwrap();

    let cluster = Arc::new(FakeCluster::new());
    let runner = Arc::new(FakeCommandRunner::new());
    let publisher = Arc::new(RegistryPublisher::new(
        runner.clone(),
        ClusterType::Minikube,
        "us-east-1",
    ));
    let backend = Arc::new(LocalBuilder::new(runner.clone(), publisher.clone(), db.clone()));
    let pool = BuildPool::start(backend, db.clone(), 2, 8);

    let resolver = Arc::new(ToolResolver::new(db.clone(), "localhost:5000"));
    let cluster_config = ClusterConfig {
        job_timeout: Duration::from_millis(500),
        pod_wait: Duration::from_millis(50),
        pod_wait_async: Duration::from_millis(100),
        poll_interval: Duration::from_millis(5),
        ..ClusterConfig::default()
    };
    let executions = Arc::new(ExecutionCoordinator::new(
        cluster.clone(),
        db.clone(),
        resolver.clone(),
        cluster_config,
    ));
    let builds = Arc::new(BuildCoordinator::new(db.clone(), resolver, pool.queue()));
    let context_dir = tempfile::tempdir().unwrap();

    let state = ApiState {
        executions,
        builds,
        store: db,
        publisher,
        context_dir: context_dir.path().to_path_buf(),
        log_poll_interval: Duration::from_millis(5),
    };
    App {
        router: ToolsmithApi::router(state),
        cluster,
        runner,
        pool,
        _db_dir: db_dir,
        _context_dir: context_dir,
    }
}

async fn call(router: &Router, req: Request<Body>) -> (StatusCode, String) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn streamed_execution_is_recorded() {
    let app = app().await;
    app.cluster
        .script_growing_log(&["Scanning 10.0.0.5\n", "--- RESULT ---\n{\"target\": \"10.0.0.5\"}\n"], "Succeeded");

    let (status, body) = call(
        &app.router,
        post(
            "/api/executions/execute/stream",
            json!({"tool_id": "network/port_scan", "arguments": {"target": "10.0.0.5"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events: Vec<Value> = body
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let id = events[0]["id"].as_str().unwrap().to_string();
    let streamed: String = events
        .iter()
        .filter(|e| e["type"] == "stderr")
        .map(|e| e["data"].as_str().unwrap())
        .collect();
    assert!(streamed.starts_with("Scanning 10.0.0.5\n"));
    assert_eq!(events.last().unwrap()["code"], 0);

    let (status, body) = call(&app.router, get(&format!("/api/executions/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    let record: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(record["status"], "success");
    assert_eq!(record["target"], "10.0.0.5");
    assert_eq!(record["result"], json!({"target": "10.0.0.5"}));

    let (_, body) = call(&app.router, get("/api/executions?limit=10")).await;
    let list: Vec<Value> = serde_json::from_str(&body).unwrap();
    assert_eq!(list.len(), 1);

    let (_, body) = call(&app.router, get("/api/executions/stats")).await;
    let stats: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(stats["total"], 1);

    assert_eq!(app.cluster.deleted_jobs().len(), 1);
    app.pool.shutdown().await;
}

#[tokio::test]
async fn build_started_over_http_can_be_followed_to_success() {
    let app = app().await;
    app.runner
        .script("docker build", 0, "Successfully built 0f3a\n", "");

    let (status, body) = call(
        &app.router,
        post(
            "/api/settings/registry/build",
            json!({
                "category": "network",
                "tool_name": "port scan",
                "docker_config": {"apt_packages": ["nmap"]}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let started: Value = serde_json::from_str(&body).unwrap();
    let job_id = started["job_id"].as_str().unwrap().to_string();

    let (status, sse) = call(
        &app.router,
        get(&format!("/api/settings/registry/build/{}/logs", job_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(sse.contains("data: Successfully built 0f3a\n"));
    assert!(sse.contains("event: success\ndata: SUCCESS\n"));
    assert!(sse.trim_end().ends_with("event: close\ndata: closed"));

    let (_, body) = call(
        &app.router,
        get(&format!("/api/settings/registry/build/{}/status", job_id)),
    )
    .await;
    let job: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(job["status"], "SUCCESS");
    assert_eq!(
        job["image_tag"],
        "localhost:5000/security-platform-tool-port-scan:latest"
    );

    app.pool.shutdown().await;
}

#[tokio::test]
async fn saved_registry_drives_connection_tests() {
    let app = app().await;
    let (status, body) = call(
        &app.router,
        post(
            "/api/settings/registry",
            json!({"type": "ecr", "namespace": "tools", "use_local_fallback": false}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let saved: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(saved["type"], "ecr");
    assert_eq!(saved["password"], Value::Null);

    let (_, body) = call(
        &app.router,
        post("/api/settings/registry/test", json!({"config": {"type": "ecr"}})),
    )
    .await;
    let result: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(result["status"], "failed");
    assert_eq!(app.runner.call_count(), 0);

    app.pool.shutdown().await;
}
