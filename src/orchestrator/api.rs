//! HTTP API for tool executions, image builds and registry settings.
//!
//! Everything sits under `/api` except `/health`. Execution streams are
//! NDJSON; build logs are tailed over SSE.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::build::remote::context_path;
use crate::build::{
    BuildCoordinator, RegistryConfig, RegistryConfigView, RegistryPublisher, RegistryTestResult,
};
use crate::db::{BuildJobStore, Database, RegistryConfigStore};
use crate::history::{BuildJobRecord, BuildStatus, ExecutionRecord, ExecutionStats};
use crate::orchestrator::job_manager::{ExecutionCoordinator, SyncRunResponse, ToolRef};
use crate::tools::{DockerConfig, tool_id};

/// Default page size for execution listings.
const DEFAULT_LIST_LIMIT: i64 = 50;

/// Shared state for the API.
#[derive(Clone)]
pub struct ApiState {
    pub executions: Arc<ExecutionCoordinator>,
    pub builds: Arc<BuildCoordinator>,
    pub store: Arc<dyn Database>,
    pub publisher: Arc<RegistryPublisher>,
    /// Where prepared build context tarballs live.
    pub context_dir: PathBuf,
    /// Poll cadence of the build log tail.
    pub log_poll_interval: Duration,
}

pub struct ToolsmithApi;

impl ToolsmithApi {
    pub fn router(state: ApiState) -> Router {
        Router::new()
            .route("/api/executions", get(list_executions))
            .route("/api/executions/stats", get(execution_stats))
            .route("/api/executions/{id}", get(get_execution))
            .route("/api/executions/execute", post(execute_sync))
            .route("/api/executions/execute/stream", post(execute_stream))
            .route("/api/executions/execute/stop/{id}", post(stop_execution))
            .route("/api/executions/execute/{id}/logs", get(execution_logs))
            .route("/api/builds/context/{build_id}", get(build_context))
            .route("/api/settings/registry", get(get_registry).post(save_registry))
            .route("/api/settings/registry/test", post(test_registry))
            .route("/api/settings/registry/build", post(start_build))
            .route("/api/settings/registry/build/{id}/status", get(build_status))
            .route("/api/settings/registry/build/{id}/logs", get(build_logs))
            .route("/health", get(health_check))
            .with_state(state)
    }

    /// Serve the API until the listener fails or `shutdown` resolves.
    pub async fn start(
        state: ApiState,
        addr: std::net::SocketAddr,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let router = Self::router(state);
        tracing::info!("Toolsmith API listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

// -- Request / response bodies --

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    tool_id: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default = "empty_object")]
    arguments: serde_json::Value,
    /// Execution id to start under, or re-attach to.
    #[serde(default)]
    job_id: Option<Uuid>,
}

impl ExecuteRequest {
    fn tool(&self) -> Result<ToolRef, StatusCode> {
        self.tool_id
            .as_deref()
            .or(self.path.as_deref())
            .filter(|id| !id.trim().is_empty())
            .map(|id| ToolRef::Identifier(id.to_string()))
            .ok_or(StatusCode::BAD_REQUEST)
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

#[derive(Debug, Serialize)]
struct StatusMessage {
    status: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    logs: String,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StartBuildRequest {
    category: String,
    tool_name: String,
    #[serde(default)]
    docker_config: DockerConfig,
}

#[derive(Debug, Serialize)]
struct BuildStarted {
    status: &'static str,
    job_id: Uuid,
}

#[derive(Debug, Serialize)]
struct BuildStatusResponse {
    job_id: Uuid,
    tool_id: String,
    status: BuildStatus,
    logs: String,
    image_tag: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<BuildJobRecord> for BuildStatusResponse {
    fn from(job: BuildJobRecord) -> Self {
        Self {
            job_id: job.id,
            tool_id: job.tool_id,
            status: job.status,
            logs: job.logs,
            image_tag: job.image_tag,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegistryTestRequest {
    config: RegistryConfig,
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> StatusCode {
    tracing::error!(error = %e, "{}", context);
    StatusCode::INTERNAL_SERVER_ERROR
}

// -- Handlers --

async fn health_check() -> &'static str {
    "ok"
}

async fn execute_sync(
    State(state): State<ApiState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<SyncRunResponse>, StatusCode> {
    let tool = req.tool()?;
    Ok(Json(state.executions.run_sync(tool, req.arguments).await))
}

async fn execute_stream(
    State(state): State<ApiState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Response, StatusCode> {
    let tool = req.tool()?;
    let events = state
        .executions
        .execute_stream(tool, req.arguments, req.job_id);
    let body = Body::from_stream(events.map(|event| Ok::<_, Infallible>(event.to_ndjson())));
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response())
}

async fn stop_execution(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusMessage>, StatusCode> {
    state
        .executions
        .stop(id)
        .await
        .map_err(|e| internal_error("Failed to stop execution", e))?;
    Ok(Json(StatusMessage {
        status: "success",
        message: "Execution stopped".to_string(),
    }))
}

async fn execution_logs(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LogsResponse>, StatusCode> {
    let logs = state
        .executions
        .live_logs(id)
        .await
        .map_err(|e| internal_error("Failed to read execution logs", e))?;
    Ok(Json(LogsResponse { logs }))
}

async fn list_executions(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<ExecutionRecord>>, StatusCode> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 1000);
    state
        .executions
        .list_executions(limit)
        .await
        .map(Json)
        .map_err(|e| internal_error("Failed to list executions", e))
}

async fn get_execution(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutionRecord>, StatusCode> {
    state
        .executions
        .get_execution(id)
        .await
        .map_err(|e| internal_error("Failed to load execution", e))?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn execution_stats(
    State(state): State<ApiState>,
) -> Result<Json<ExecutionStats>, StatusCode> {
    state
        .executions
        .stats()
        .await
        .map(Json)
        .map_err(|e| internal_error("Failed to compute execution stats", e))
}

/// Serve a prepared context tarball to the in-cluster init container.
///
/// The file is left in place; the build backend removes it when the build
/// is over.
async fn build_context(
    State(state): State<ApiState>,
    Path(build_id): Path<Uuid>,
) -> Result<Response, StatusCode> {
    let path = context_path(&state.context_dir, build_id);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(build_id = %build_id, "Build context not found");
            return Err(StatusCode::NOT_FOUND);
        }
        Err(e) => return Err(internal_error("Failed to open build context", e)),
    };
    tracing::info!(build_id = %build_id, "Serving build context");

    let disposition = format!("attachment; filename=\"context-{}.tar.gz\"", build_id);
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

async fn get_registry(State(state): State<ApiState>) -> Result<Json<RegistryConfigView>, StatusCode> {
    let config = state
        .store
        .get_registry_config()
        .await
        .map_err(|e| internal_error("Failed to get registry config", e))?
        .unwrap_or_default();
    Ok(Json(config.masked()))
}

async fn save_registry(
    State(state): State<ApiState>,
    Json(config): Json<RegistryConfig>,
) -> Result<Json<RegistryConfigView>, StatusCode> {
    state
        .store
        .save_registry_config(&config)
        .await
        .map_err(|e| internal_error("Failed to save registry config", e))?;
    tracing::info!(registry_type = %config.registry_type, "Registry configuration saved");
    Ok(Json(config.masked()))
}

async fn test_registry(
    State(state): State<ApiState>,
    Json(req): Json<RegistryTestRequest>,
) -> Json<RegistryTestResult> {
    Json(state.publisher.test_connection(&req.config).await)
}

async fn start_build(
    State(state): State<ApiState>,
    Json(req): Json<StartBuildRequest>,
) -> Result<Json<BuildStarted>, StatusCode> {
    let id = tool_id(&req.category, &req.tool_name);
    let job_id = state
        .builds
        .trigger_build(&id, req.docker_config)
        .await
        .map_err(|e| internal_error("Failed to start build", e))?;
    Ok(Json(BuildStarted {
        status: "started",
        job_id,
    }))
}

async fn build_status(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BuildStatusResponse>, StatusCode> {
    state
        .builds
        .build_status(id)
        .await
        .map_err(|e| internal_error("Failed to load build", e))?
        .map(|job| Json(job.into()))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn build_logs(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let tail = LogTail {
        store: state.store.clone(),
        build_id: id,
        sent: 0,
        polled: false,
        done: false,
        interval: state.log_poll_interval,
    };
    let events = futures::stream::unfold(tail, LogTail::next_batch)
        .flat_map(futures::stream::iter)
        .map(Ok);
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Cursor over a build's persisted log.
struct LogTail {
    store: Arc<dyn Database>,
    build_id: Uuid,
    /// Bytes of the log already sent.
    sent: usize,
    polled: bool,
    done: bool,
    interval: Duration,
}

impl LogTail {
    /// Events for one poll: a `data` event per new log line, then the
    /// terminal status and `close` once the build is finished.
    async fn next_batch(mut self) -> Option<(Vec<Event>, Self)> {
        if self.done {
            return None;
        }
        if self.polled {
            tokio::time::sleep(self.interval).await;
        }
        self.polled = true;

        let job = match self.store.get_build_job(self.build_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.done = true;
                let event = Event::default()
                    .event("error")
                    .data(format!("Job {} not found", self.build_id));
                return Some((vec![event], self));
            }
            Err(e) => {
                self.done = true;
                let event = Event::default().event("error").data(e.to_string());
                return Some((vec![event], self));
            }
        };

        let mut events = Vec::new();
        if let Some(new) = job.logs.get(self.sent..).filter(|s| !s.is_empty()) {
            events.extend(
                new.lines()
                    .map(|line| Event::default().data(line.replace('\r', ""))),
            );
            self.sent = job.logs.len();
        }
        if job.status.is_terminal() {
            let status = job.status.as_str();
            events.push(Event::default().event(status.to_lowercase()).data(status));
            events.push(Event::default().event("close").data("closed"));
            self.done = true;
        }
        Some((events, self))
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;
    use crate::build::{BuildQueue, BuildRequest};
    use crate::config::{ClusterConfig, ClusterType};
    use crate::testing::{FakeCluster, FakeCommandRunner, test_db};
    use crate::db::ToolStore;
    use crate::tools::{ToolDefinition, ToolResolver};

    struct Harness {
        state: ApiState,
        cluster: Arc<FakeCluster>,
        runner: Arc<FakeCommandRunner>,
        _queue_rx: mpsc::Receiver<BuildRequest>,
        _db_dir: tempfile::TempDir,
        context_dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let (db, db_dir) = test_db().await;
        db.save_tool(&ToolDefinition::new(
            "recon",
            "nmap",
            "def main(target):\n    return {'open': [22]}\n",
        ))
        .await
        .unwrap();

        let cluster = Arc::new(FakeCluster::new());
        let runner = Arc::new(FakeCommandRunner::new());
        let resolver = Arc::new(ToolResolver::new(db.clone(), "localhost:5000"));
        let config = ClusterConfig {
            job_timeout: Duration::from_millis(200),
            pod_wait: Duration::from_millis(50),
            pod_wait_async: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
            ..ClusterConfig::default()
        };
        let executions = Arc::new(ExecutionCoordinator::new(
            cluster.clone(),
            db.clone(),
            resolver.clone(),
            config,
        ));
        let (queue, queue_rx) = BuildQueue::channel(8);
        let builds = Arc::new(BuildCoordinator::new(db.clone(), resolver, queue));
        let publisher = Arc::new(RegistryPublisher::new(
            runner.clone(),
            ClusterType::Minikube,
            "us-east-1",
        ));
        let context_dir = tempfile::tempdir().unwrap();

        Harness {
            state: ApiState {
                executions,
                builds,
                store: db,
                publisher,
                context_dir: context_dir.path().to_path_buf(),
                log_poll_interval: Duration::from_millis(5),
            },
            cluster,
            runner,
            _queue_rx: queue_rx,
            _db_dir: db_dir,
            context_dir,
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        serde_json::from_str(&body_text(resp).await).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let h = harness().await;
        let resp = ToolsmithApi::router(h.state).oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "ok");
    }

    #[tokio::test]
    async fn execute_requires_a_tool() {
        let h = harness().await;
        let resp = ToolsmithApi::router(h.state)
            .oneshot(post_json("/api/executions/execute", json!({"arguments": {}})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sync_execute_returns_result() {
        let h = harness().await;
        h.cluster.script_success("--- RESULT ---\n{\"open\": [22]}\n");
        let resp = ToolsmithApi::router(h.state)
            .oneshot(post_json(
                "/api/executions/execute",
                json!({"tool_id": "recon/nmap", "arguments": {"target": "10.0.0.1"}}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["exit_code"], 0);
        assert_eq!(body["status"], "success");
        assert_eq!(body["result"], json!({"open": [22]}));
    }

    #[tokio::test]
    async fn stream_execute_is_ndjson() {
        let h = harness().await;
        h.cluster.script_success("scanning\n--- RESULT ---\nhost up\n");
        let resp = ToolsmithApi::router(h.state)
            .oneshot(post_json(
                "/api/executions/execute/stream",
                json!({"path": "recon/nmap.py"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "application/x-ndjson");
        assert_eq!(resp.headers()["x-accel-buffering"], "no");

        let text = body_text(resp).await;
        let events: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events[0]["type"], "start");
        assert!(events.iter().any(|e| e["type"] == "stdout" && e["data"] == "host up"));
        assert_eq!(events.last().unwrap(), &json!({"type": "exit", "code": 0}));
    }

    #[tokio::test]
    async fn unknown_execution_is_404() {
        let h = harness().await;
        let resp = ToolsmithApi::router(h.state)
            .oneshot(get(&format!("/api/executions/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stop_reports_success() {
        let h = harness().await;
        let id = Uuid::new_v4();
        let resp = ToolsmithApi::router(h.state)
            .oneshot(post_json(
                &format!("/api/executions/execute/stop/{}", id),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "success");
        assert_eq!(h.cluster.deleted_jobs(), vec![format!("exec-{}", id)]);
    }

    #[tokio::test]
    async fn context_is_served_without_deleting_it() {
        let h = harness().await;
        let id = Uuid::new_v4();
        let router = ToolsmithApi::router(h.state.clone());

        let resp = router
            .clone()
            .oneshot(get(&format!("/api/builds/context/{}", id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let path = context_path(h.context_dir.path(), id);
        std::fs::write(&path, b"tarball-bytes").unwrap();
        let resp = router
            .oneshot(get(&format!("/api/builds/context/{}", id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "application/gzip");
        assert_eq!(body_text(resp).await, "tarball-bytes");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn build_start_and_status() {
        let h = harness().await;
        let router = ToolsmithApi::router(h.state.clone());

        let resp = router
            .clone()
            .oneshot(post_json(
                "/api/settings/registry/build",
                json!({
                    "category": "recon",
                    "tool_name": "Port Scan",
                    "docker_config": {"apt_packages": ["nmap"]}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "started");
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let resp = router
            .clone()
            .oneshot(get(&format!("/api/settings/registry/build/{}/status", job_id)))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["tool_id"], "recon/port_scan");
        assert_eq!(body["status"], "PENDING");

        let resp = router
            .oneshot(get(&format!(
                "/api/settings/registry/build/{}/status",
                Uuid::new_v4()
            )))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn build_log_tail_ends_with_status() {
        let h = harness().await;
        let job = BuildJobRecord::pending("recon/nmap");
        h.state.store.create_build_job(&job).await.unwrap();
        h.state
            .store
            .update_build_status(job.id, BuildStatus::Running, None)
            .await
            .unwrap();
        h.state
            .store
            .append_build_log(job.id, "step one\nstep two\n")
            .await
            .unwrap();
        h.state
            .store
            .update_build_status(job.id, BuildStatus::Success, Some("img:latest"))
            .await
            .unwrap();

        let resp = ToolsmithApi::router(h.state)
            .oneshot(get(&format!("/api/settings/registry/build/{}/logs", job.id)))
            .await
            .unwrap();
        assert_eq!(resp.headers()["content-type"], "text/event-stream");
        let text = body_text(resp).await;
        let one = text.find("data: step one\n\n").unwrap();
        let two = text.find("data: step two\n\n").unwrap();
        let success = text.find("event: success\ndata: SUCCESS\n\n").unwrap();
        let close = text.find("event: close\n").unwrap();
        assert!(one < two && two < success && success < close);
    }

    #[tokio::test]
    async fn build_log_tail_for_unknown_job_errors() {
        let h = harness().await;
        let resp = ToolsmithApi::router(h.state)
            .oneshot(get(&format!(
                "/api/settings/registry/build/{}/logs",
                Uuid::new_v4()
            )))
            .await
            .unwrap();
        assert!(body_text(resp).await.starts_with("event: error\n"));
    }

    #[tokio::test]
    async fn registry_settings_mask_the_password() {
        let h = harness().await;
        let router = ToolsmithApi::router(h.state);

        let body = body_json(router.clone().oneshot(get("/api/settings/registry")).await.unwrap()).await;
        assert_eq!(body["type"], "local");
        assert_eq!(body["use_local_fallback"], true);

        let resp = router
            .clone()
            .oneshot(post_json(
                "/api/settings/registry",
                json!({"type": "dockerhub", "username": "acme", "password": "s3cret"}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["password"], "***");

        let body = body_json(router.oneshot(get("/api/settings/registry")).await.unwrap()).await;
        assert_eq!(body["type"], "dockerhub");
        assert_eq!(body["username"], "acme");
        assert_eq!(body["password"], "***");
    }

    #[tokio::test]
    async fn registry_test_checks_local_docker() {
        let h = harness().await;
        let resp = ToolsmithApi::router(h.state)
            .oneshot(post_json(
                "/api/settings/registry/test",
                json!({"config": {"type": "local"}}),
            ))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(h.runner.commands(), vec!["docker info"]);
    }
}
