//! Execution lifecycle for tool runs on the cluster.
//!
//! Every run is one cluster Job labelled with its execution id. The
//! coordinator submits it, watches it to completion, extracts the result
//! and persists the outcome. Two entry points:
//!
//! - [`ExecutionCoordinator::run_sync`] polls the Job and returns one response.
//! - [`ExecutionCoordinator::execute_stream`] tails the pod log and emits
//!   NDJSON-ready [`ExecutionEvent`]s from a background task.
//!
//! Cancellation is deleting the Job. A watch loop that finds its pod gone
//! treats that as the end of the run, never as an error.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::db::ExecutionStore;
use crate::error::{DatabaseError, Error, ResolutionError};
use crate::history::{ExecutionRecord, ExecutionStats, ExecutionStatus};
use crate::orchestrator::cluster::{self, ClusterApi};
use crate::orchestrator::job_spec::{
    execution_selector, job_pods_selector, parse_result, result_text, tool_job,
};
use crate::tools::{ResolvedTool, ToolDefinition, ToolResolver};

/// Log note appended when a user stops a run.
pub const STOPPED_NOTE: &str = "\n[Stopped by user]";

/// Capacity of the per-run event channel.
const EVENT_BUFFER: usize = 64;

/// What to run: a stored tool, or an unsaved definition (test runs).
#[derive(Debug, Clone)]
pub enum ToolRef {
    Identifier(String),
    Inline(ToolDefinition),
}

impl ToolRef {
    fn describe(&self) -> &str {
        match self {
            Self::Identifier(id) => id,
            Self::Inline(def) => &def.name,
        }
    }
}

/// One line of the streaming execution protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutionEvent {
    Start { id: Uuid },
    /// Incremental log chunk.
    Stderr { data: String },
    /// Extracted result text.
    Stdout { data: String },
    Exit { code: i32 },
}

impl ExecutionEvent {
    /// Serialize as one NDJSON line, newline included.
    pub fn to_ndjson(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }
}

/// Response of a synchronous run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunResponse {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    /// 0 success, 1 job failure, -1 timeout or internal error.
    pub exit_code: i32,
    pub output: String,
    pub result: Option<serde_json::Value>,
}

impl SyncRunResponse {
    fn failed(execution_id: Uuid, exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            execution_id,
            status: ExecutionStatus::Failed,
            exit_code,
            output: output.into(),
            result: None,
        }
    }
}

/// How a run is being watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Sync,
    Stream,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

/// In-memory handle to a run this process is watching.
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub execution_id: Uuid,
    pub job_name: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
}

/// Submits tool jobs, watches them and records their outcome.
pub struct ExecutionCoordinator {
    cluster: Arc<dyn ClusterApi>,
    store: Arc<dyn ExecutionStore>,
    resolver: Arc<ToolResolver>,
    config: ClusterConfig,
    pub(crate) active: Arc<RwLock<HashMap<Uuid, ActiveRun>>>,
}

impl ExecutionCoordinator {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        store: Arc<dyn ExecutionStore>,
        resolver: Arc<ToolResolver>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            cluster,
            store,
            resolver,
            config,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn resolve(&self, tool: &ToolRef) -> Result<ResolvedTool, ResolutionError> {
        match tool {
            ToolRef::Identifier(id) => self.resolver.resolve(id).await,
            ToolRef::Inline(def) => self.resolver.resolve_definition(def.clone()),
        }
    }

    async fn track(&self, execution_id: Uuid, job_name: &str, mode: RunMode) {
        self.active.write().await.insert(
            execution_id,
            ActiveRun {
                execution_id,
                job_name: job_name.to_string(),
                mode,
                started_at: Utc::now(),
            },
        );
    }

    async fn untrack(&self, execution_id: Uuid) {
        self.active.write().await.remove(&execution_id);
    }

    /// Runs this process is currently watching.
    pub async fn active_runs(&self) -> Vec<ActiveRun> {
        self.active.read().await.values().cloned().collect()
    }

    async fn delete_job_best_effort(&self, execution_id: Uuid, job_name: &str) {
        if let Err(e) = self.cluster.delete_job(job_name).await {
            tracing::warn!(execution_id = %execution_id, job_name, error = %e, "Failed to delete tool job");
        }
    }

    async fn finish(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        logs: &str,
        result: Option<&serde_json::Value>,
    ) {
        match self
            .store
            .finish_execution(execution_id, status, logs, result, Utc::now())
            .await
        {
            Ok(true) => tracing::info!(execution_id = %execution_id, status = %status, "Execution finished"),
            Ok(false) => tracing::debug!(execution_id = %execution_id, "Execution already terminal"),
            Err(e) => tracing::warn!(execution_id = %execution_id, error = %e, "Failed to persist execution outcome"),
        }
    }

    // ==================== Synchronous ====================

    /// Run a tool to completion, polling its Job up to the configured ceiling.
    pub async fn run_sync(&self, tool: ToolRef, arguments: serde_json::Value) -> SyncRunResponse {
        let execution_id = Uuid::new_v4();
        let resolved = match self.resolve(&tool).await {
            Ok(r) => r,
            Err(e) => {
                tracing::info!(tool = tool.describe(), error = %e, "Tool resolution failed");
                return SyncRunResponse::failed(execution_id, -1, e.to_string());
            }
        };

        let record = ExecutionRecord::started(
            execution_id,
            resolved.definition.name.clone(),
            resolved.definition.legacy_path(),
            arguments.clone(),
        );
        if let Err(e) = self.store.create_execution(&record).await {
            return SyncRunResponse::failed(execution_id, -1, e.to_string());
        }

        let job = tool_job(&resolved, execution_id, &arguments, self.config.job_ttl_secs);
        let job_name = job.metadata.name.clone().unwrap_or_default();
        self.track(execution_id, &job_name, RunMode::Sync).await;

        let response = match self.run_sync_inner(execution_id, &job, &job_name).await {
            Ok(response) => response,
            Err(e) => {
                let output = e.to_string();
                self.finish(execution_id, ExecutionStatus::Failed, &output, None)
                    .await;
                SyncRunResponse::failed(execution_id, -1, output)
            }
        };
        self.untrack(execution_id).await;
        response
    }

    async fn run_sync_inner(
        &self,
        execution_id: Uuid,
        job: &k8s_openapi::api::batch::v1::Job,
        job_name: &str,
    ) -> Result<SyncRunResponse, Error> {
        self.cluster.create_job(job).await?;
        tracing::info!(execution_id = %execution_id, job_name, "Submitted tool job");

        let deadline = Instant::now() + self.config.job_timeout;
        while Instant::now() < deadline {
            let job = match self.cluster.get_job(job_name).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    if let Some(response) = self.ended_elsewhere(execution_id).await {
                        tracing::info!(execution_id = %execution_id, job_name, status = %response.status, "Job gone, run already ended");
                        return Ok(response);
                    }
                    tracing::debug!(execution_id = %execution_id, job_name, "Job not visible yet");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
                Err(e) => {
                    tracing::debug!(execution_id = %execution_id, job_name, error = %e, "Job poll failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            if cluster::job_succeeded(&job) > 0 {
                let Some(logs) = self.fetch_job_logs(job_name).await else {
                    let output = "Pod not found";
                    self.finish(execution_id, ExecutionStatus::Failed, output, None)
                        .await;
                    self.delete_job_best_effort(execution_id, job_name).await;
                    return Ok(SyncRunResponse::failed(execution_id, -1, output));
                };
                self.delete_job_best_effort(execution_id, job_name).await;
                let result = result_text(&logs, true).map(parse_result);
                self.finish(execution_id, ExecutionStatus::Success, &logs, result.as_ref())
                    .await;
                return Ok(SyncRunResponse {
                    execution_id,
                    status: ExecutionStatus::Success,
                    exit_code: 0,
                    output: logs,
                    result,
                });
            }

            if cluster::job_failed(&job) > 0 {
                let logs = self
                    .fetch_job_logs(job_name)
                    .await
                    .unwrap_or_else(|| "Job failed".to_string());
                self.delete_job_best_effort(execution_id, job_name).await;
                self.finish(execution_id, ExecutionStatus::Failed, &logs, None)
                    .await;
                return Ok(SyncRunResponse::failed(execution_id, 1, logs));
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        tracing::warn!(execution_id = %execution_id, job_name, timeout = ?self.config.job_timeout, "Tool job timed out");
        self.finish(execution_id, ExecutionStatus::Failed, "Timeout", None)
            .await;
        self.delete_job_best_effort(execution_id, job_name).await;
        Ok(SyncRunResponse::failed(execution_id, -1, "Timeout"))
    }

    /// The stored outcome of a run that was ended outside this poll loop,
    /// such as by [`Self::stop`].
    async fn ended_elsewhere(&self, execution_id: Uuid) -> Option<SyncRunResponse> {
        let record = match self.store.get_execution(execution_id).await {
            Ok(record) => record?,
            Err(e) => {
                tracing::warn!(execution_id = %execution_id, error = %e, "Failed to read execution");
                return None;
            }
        };
        if !record.status.is_terminal() {
            return None;
        }
        Some(SyncRunResponse {
            execution_id,
            status: record.status,
            exit_code: if record.status == ExecutionStatus::Success { 0 } else { -1 },
            output: record.logs,
            result: record.result,
        })
    }

    /// Full log of a job's first pod, waiting briefly for the pod to show up.
    async fn fetch_job_logs(&self, job_name: &str) -> Option<String> {
        let pod = self.wait_for_pod(job_name, self.config.pod_wait).await?;
        match self.cluster.pod_logs(&pod, None).await {
            Ok(logs) => Some(logs),
            Err(e) => {
                tracing::warn!(job_name, pod, error = %e, "Failed to read pod log");
                None
            }
        }
    }

    /// Poll for the first pod of a job until `wait` elapses.
    async fn wait_for_pod(&self, job_name: &str, wait: std::time::Duration) -> Option<String> {
        let selector = job_pods_selector(job_name);
        let deadline = Instant::now() + wait;
        loop {
            match self.cluster.list_pods(&selector).await {
                Ok(pods) => {
                    if let Some(name) = pods.iter().find_map(|p| cluster::pod_name(p)) {
                        return Some(name.to_string());
                    }
                }
                Err(e) => tracing::debug!(job_name, error = %e, "Pod lookup failed"),
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    // ==================== Streaming ====================

    /// Start (or re-attach to) a run and stream its events.
    ///
    /// Cluster calls run on a spawned task that feeds the returned stream,
    /// so a slow API server never stalls the caller's response body. A run
    /// keeps going and is persisted even if the caller stops reading.
    pub fn execute_stream(
        self: &Arc<Self>,
        tool: ToolRef,
        arguments: serde_json::Value,
        execution_id: Option<Uuid>,
    ) -> ReceiverStream<ExecutionEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.stream_run(tx, tool, arguments, execution_id).await;
        });
        ReceiverStream::new(rx)
    }

    async fn stream_run(
        &self,
        tx: mpsc::Sender<ExecutionEvent>,
        tool: ToolRef,
        arguments: serde_json::Value,
        execution_id: Option<Uuid>,
    ) {
        let resolved = match self.resolve(&tool).await {
            Ok(r) => r,
            Err(e) => {
                emit(&tx, ExecutionEvent::Stderr {
                    data: format!("Resolution Error: {}", e),
                })
                .await;
                emit(&tx, ExecutionEvent::Exit { code: 1 }).await;
                return;
            }
        };

        let execution_id = execution_id.unwrap_or_else(Uuid::new_v4);
        tracing::info!(execution_id = %execution_id, tool = tool.describe(), "Starting execution stream");
        emit(&tx, ExecutionEvent::Start { id: execution_id }).await;

        if let Err(e) = self
            .stream_run_inner(&tx, &resolved, execution_id, arguments)
            .await
        {
            let message = e.to_string();
            tracing::warn!(execution_id = %execution_id, error = %message, "Execution stream failed");
            emit(&tx, ExecutionEvent::Stderr {
                data: format!("Error: {}", message),
            })
            .await;
            emit(&tx, ExecutionEvent::Exit { code: 1 }).await;
            self.finish(execution_id, ExecutionStatus::Failed, &message, None)
                .await;
        }
        self.untrack(execution_id).await;
    }

    async fn stream_run_inner(
        &self,
        tx: &mpsc::Sender<ExecutionEvent>,
        resolved: &ResolvedTool,
        execution_id: Uuid,
        arguments: serde_json::Value,
    ) -> Result<(), Error> {
        let existing = self
            .cluster
            .list_jobs(&execution_selector(execution_id))
            .await?;

        let job_name = match existing.iter().find_map(|j| cluster::job_name(j)) {
            Some(name) => {
                tracing::info!(execution_id = %execution_id, job_name = name, "Re-attaching to existing execution");
                name.to_string()
            }
            None => {
                if let Some(record) = self.store.get_execution(execution_id).await? {
                    let message = if record.status.is_terminal() {
                        format!("Execution {} already finished ({})", execution_id, record.status)
                    } else {
                        format!("Job for execution {} no longer exists", execution_id)
                    };
                    tracing::info!(execution_id = %execution_id, status = %record.status, "Nothing to re-attach to");
                    emit(tx, ExecutionEvent::Stderr {
                        data: message.clone(),
                    })
                    .await;
                    emit(tx, ExecutionEvent::Exit { code: 1 }).await;
                    self.finish(execution_id, ExecutionStatus::Failed, &message, None)
                        .await;
                    return Ok(());
                }
                let record = ExecutionRecord::started(
                    execution_id,
                    resolved.definition.name.clone(),
                    resolved.definition.legacy_path(),
                    arguments.clone(),
                );
                self.store.create_execution(&record).await?;
                let job = tool_job(resolved, execution_id, &arguments, self.config.job_ttl_secs);
                let name = job.metadata.name.clone().unwrap_or_default();
                self.cluster.create_job(&job).await?;
                tracing::info!(execution_id = %execution_id, job_name = %name, "Submitted tool job");
                name
            }
        };
        self.track(execution_id, &job_name, RunMode::Stream).await;

        let Some(pod) = self
            .wait_for_pod(&job_name, self.config.pod_wait_async)
            .await
        else {
            let message = "Timeout waiting for pod";
            emit(tx, ExecutionEvent::Stderr {
                data: message.to_string(),
            })
            .await;
            emit(tx, ExecutionEvent::Exit { code: 1 }).await;
            self.finish(execution_id, ExecutionStatus::Failed, message, None)
                .await;
            self.delete_job_best_effort(execution_id, &job_name).await;
            return Ok(());
        };

        let (logs, succeeded) = self.tail_pod(tx, execution_id, &pod).await;

        let code = if succeeded { 0 } else { 1 };
        let text = result_text(&logs, succeeded);
        if let Some(text) = text {
            emit(tx, ExecutionEvent::Stdout {
                data: text.to_string(),
            })
            .await;
        }
        emit(tx, ExecutionEvent::Exit { code }).await;

        let status = if succeeded {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        let result = text.map(parse_result);
        self.finish(execution_id, status, &logs, result.as_ref())
            .await;
        self.delete_job_best_effort(execution_id, &job_name).await;
        Ok(())
    }

    /// Emit the pod's log as it grows until the pod finishes or disappears.
    ///
    /// Returns the full log seen and whether the pod succeeded. The emitted
    /// chunks concatenate to exactly the returned log.
    async fn tail_pod(
        &self,
        tx: &mpsc::Sender<ExecutionEvent>,
        execution_id: Uuid,
        pod: &str,
    ) -> (String, bool) {
        let mut seen = String::new();
        loop {
            let current = match self.cluster.get_pod(pod).await {
                Ok(Some(p)) => p,
                Ok(None) => {
                    tracing::info!(execution_id = %execution_id, pod, "Pod gone, ending stream");
                    return (seen, false);
                }
                Err(e) => {
                    tracing::info!(execution_id = %execution_id, pod, error = %e, "Pod unreadable, ending stream");
                    return (seen, false);
                }
            };

            match self.cluster.pod_logs(pod, None).await {
                Ok(full) => {
                    if full.len() > seen.len() && full.starts_with(seen.as_str()) {
                        let chunk = full[seen.len()..].to_string();
                        emit(tx, ExecutionEvent::Stderr { data: chunk }).await;
                        seen = full;
                    }
                }
                Err(e) => {
                    tracing::warn!(execution_id = %execution_id, pod, error = %e, "Failed to read pod log");
                }
            }

            if cluster::pod_finished(&current) {
                return (seen, cluster::pod_phase(&current) == Some("Succeeded"));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    // ==================== Stop / logs / queries ====================

    /// Delete a run's job(s) and mark it stopped.
    ///
    /// Returns whether the record moved to `stopped`.
    pub async fn stop(&self, execution_id: Uuid) -> Result<bool, DatabaseError> {
        match self
            .cluster
            .list_jobs(&execution_selector(execution_id))
            .await
        {
            Ok(jobs) if !jobs.is_empty() => {
                for name in jobs.iter().filter_map(|j| cluster::job_name(j)) {
                    self.delete_job_best_effort(execution_id, name).await;
                }
            }
            Ok(_) => {
                let fallback = format!("exec-{}", execution_id);
                self.delete_job_best_effort(execution_id, &fallback).await;
            }
            Err(e) => {
                tracing::warn!(execution_id = %execution_id, error = %e, "Failed to look up jobs to stop");
            }
        }

        let stopped = self.store.stop_execution(execution_id, STOPPED_NOTE).await?;
        tracing::info!(execution_id = %execution_id, stopped, "Stop requested");
        Ok(stopped)
    }

    /// Logs for a run: live from the pod while running, else persisted.
    pub async fn live_logs(&self, execution_id: Uuid) -> Result<String, DatabaseError> {
        let Some(record) = self.store.get_execution(execution_id).await? else {
            return Ok("Execution not found.".to_string());
        };

        if record.status == ExecutionStatus::Running {
            match self.live_pod_logs(execution_id).await {
                Ok(Some(logs)) => return Ok(logs),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(execution_id = %execution_id, error = %e, "Error fetching live logs")
                }
            }
        }

        if record.logs.is_empty() {
            Ok("Logs unavailable.".to_string())
        } else {
            Ok(record.logs)
        }
    }

    async fn live_pod_logs(&self, execution_id: Uuid) -> Result<Option<String>, Error> {
        let known = self
            .active
            .read()
            .await
            .get(&execution_id)
            .map(|run| run.job_name.clone());
        let job_name = match known {
            Some(name) => name,
            None => {
                let jobs = self
                    .cluster
                    .list_jobs(&execution_selector(execution_id))
                    .await?;
                match jobs.iter().find_map(|j| cluster::job_name(j)) {
                    Some(name) => name.to_string(),
                    None => return Ok(None),
                }
            }
        };

        let pods = self.cluster.list_pods(&job_pods_selector(&job_name)).await?;
        let Some(pod) = pods.iter().find_map(|p| cluster::pod_name(p)) else {
            return Ok(None);
        };
        Ok(Some(self.cluster.pod_logs(pod, None).await?))
    }

    pub async fn list_executions(&self, limit: i64) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        self.store.list_executions(limit).await
    }

    pub async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, DatabaseError> {
        self.store.get_execution(execution_id).await
    }

    pub async fn stats(&self) -> Result<ExecutionStats, DatabaseError> {
        self.store.execution_stats().await
    }
}

/// Send an event, ignoring a caller that has gone away.
async fn emit(tx: &mpsc::Sender<ExecutionEvent>, event: ExecutionEvent) {
    if tx.send(event).await.is_err() {
        tracing::debug!("Execution stream receiver dropped");
    }
}
