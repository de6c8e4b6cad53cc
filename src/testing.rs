//! Test doubles for the engine's external seams.
//!
//! Provides:
//! - [`test_db`]: a libSQL database in a temporary directory
//! - [`FakeCluster`]: an in-memory [`ClusterApi`] with scripted pod outcomes
//! - [`FakeCommandRunner`]: a [`CommandRunner`] that records invocations and
//!   replays scripted exit codes and output

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::{Job, JobSpec, JobStatus};
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStatus,
    Pod, PodSpec, PodStatus, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::build::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::db::Database;
use crate::error::{ClusterError, CommandError};
use crate::orchestrator::cluster::{ClusterApi, LogLines};
use crate::orchestrator::job_spec::{EXECUTION_ID_LABEL, TOOL_APP_LABEL};

/// Create a libSQL-backed test database in a temporary directory.
///
/// The database file is deleted when the returned guard is dropped.
#[cfg(feature = "libsql")]
pub async fn test_db() -> (Arc<dyn Database>, tempfile::TempDir) {
    use crate::db::libsql::LibSqlBackend;

    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("test.db");
    let backend = LibSqlBackend::new_local(&path)
        .await
        .expect("failed to create test LibSqlBackend");
    backend
        .run_migrations()
        .await
        .expect("failed to run migrations");
    (Arc::new(backend) as Arc<dyn Database>, dir)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ==================== FakeCluster ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Running,
    Succeeded,
    Failed,
}

impl Outcome {
    fn phase(self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }
}

struct ClusterState {
    jobs: BTreeMap<String, Job>,
    created: Vec<String>,
    deleted: Vec<String>,
    outcome: Outcome,
    /// Log chunks; a growing log serves one more chunk per read.
    chunks: Vec<String>,
    served: usize,
    growing: bool,
    pods_hidden: bool,
    init_exit: Option<i32>,
    follow_lines: Option<Vec<String>>,
    follow_open: bool,
    report_job_status: bool,
}

impl ClusterState {
    /// Outcome as currently visible. A growing log keeps the pod running
    /// until every chunk has been served.
    fn visible_outcome(&self) -> Outcome {
        if self.growing && self.served < self.chunks.len() {
            Outcome::Running
        } else {
            self.outcome
        }
    }

    fn full_log(&self) -> String {
        self.chunks.concat()
    }

    fn job_for_pod(&self, pod: &str) -> Option<&Job> {
        let job_name = pod.strip_suffix("-pod")?;
        self.jobs.get(job_name)
    }
}

/// In-memory cluster.
///
/// Every job that exists gets one synthesized pod named `<job>-pod`,
/// carrying the job template's labels plus `job-name`. All pods share the
/// scripted outcome and log.
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    call_count: AtomicU32,
    should_fail: AtomicBool,
    list_pods_failures: AtomicU32,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState {
                jobs: BTreeMap::new(),
                created: Vec::new(),
                deleted: Vec::new(),
                outcome: Outcome::Running,
                chunks: Vec::new(),
                served: 0,
                growing: false,
                pods_hidden: false,
                init_exit: None,
                follow_lines: None,
                follow_open: false,
                report_job_status: true,
            }),
            call_count: AtomicU32::new(0),
            should_fail: AtomicBool::new(false),
            list_pods_failures: AtomicU32::new(0),
        }
    }

    fn script(&self, outcome: Outcome, logs: &str) {
        let mut state = lock(&self.state);
        state.outcome = outcome;
        state.chunks = vec![logs.to_string()];
        state.served = 0;
        state.growing = false;
    }

    /// Pods succeed with `logs`.
    pub fn script_success(&self, logs: &str) {
        self.script(Outcome::Succeeded, logs);
    }

    /// Pods fail with `logs`.
    pub fn script_failure(&self, logs: &str) {
        self.script(Outcome::Failed, logs);
    }

    /// Pods never finish.
    pub fn script_running(&self, logs: &str) {
        self.script(Outcome::Running, logs);
    }

    /// The pod log grows by one chunk per read; the pod reaches `phase`
    /// ("Succeeded" or "Failed") once all chunks were served.
    pub fn script_growing_log(&self, chunks: &[&str], phase: &str) {
        let mut state = lock(&self.state);
        state.outcome = if phase == "Succeeded" {
            Outcome::Succeeded
        } else {
            Outcome::Failed
        };
        state.chunks = chunks.iter().map(|c| c.to_string()).collect();
        state.served = 0;
        state.growing = true;
    }

    /// Seed a job as if an earlier process had submitted it.
    pub fn insert_execution_job(&self, execution_id: Uuid, name: &str) {
        let job = Job {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([
                    ("app".to_string(), TOOL_APP_LABEL.to_string()),
                    (EXECUTION_ID_LABEL.to_string(), execution_id.to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "executor".to_string(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        lock(&self.state).jobs.insert(name.to_string(), job);
    }

    /// Hide every pod, as if scheduling never happened.
    pub fn set_pods_hidden(&self, hidden: bool) {
        lock(&self.state).pods_hidden = hidden;
    }

    /// Make job submission fail.
    pub fn set_failing(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Make the next `count` pod listings fail with an API error.
    pub fn fail_list_pods(&self, count: u32) {
        self.list_pods_failures.store(count, Ordering::Relaxed);
    }

    /// Exit code reported by every init container (0 when unset).
    pub fn set_init_exit(&self, code: Option<i32>) {
        lock(&self.state).init_exit = code;
    }

    /// Lines served by `follow_pod_logs`, instead of the scripted log.
    pub fn set_follow_lines(&self, lines: &[&str]) {
        lock(&self.state).follow_lines = Some(lines.iter().map(|l| l.to_string()).collect());
    }

    /// Keep followed log streams open after their lines, as if the
    /// container were still writing.
    pub fn keep_follow_open(&self) {
        lock(&self.state).follow_open = true;
    }

    /// Report jobs without any status, as if the counters were never set.
    pub fn hide_job_status(&self) {
        lock(&self.state).report_job_status = false;
    }

    /// Names of jobs created through the API, in order.
    pub fn created_jobs(&self) -> Vec<String> {
        lock(&self.state).created.clone()
    }

    /// Names passed to `delete_job`, in order.
    pub fn deleted_jobs(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    /// Total API calls made.
    pub fn calls(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    fn tick(&self) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
    }

    fn job_view(state: &ClusterState, job: &Job) -> Job {
        let mut job = job.clone();
        if state.report_job_status {
            job.status = Some(match state.visible_outcome() {
                Outcome::Running => JobStatus {
                    active: Some(1),
                    ..Default::default()
                },
                Outcome::Succeeded => JobStatus {
                    succeeded: Some(1),
                    ..Default::default()
                },
                Outcome::Failed => JobStatus {
                    failed: Some(1),
                    ..Default::default()
                },
            });
        }
        job
    }

    fn pod_view(state: &ClusterState, job_name: &str, job: &Job) -> Pod {
        let template = job.spec.as_ref().map(|s| &s.template);
        let mut labels = template
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        labels.insert("job-name".to_string(), job_name.to_string());
        let spec = template.and_then(|t| t.spec.clone()).unwrap_or_default();

        let outcome = state.visible_outcome();
        let main_state = match outcome {
            Outcome::Running => ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            },
            done => ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: if done == Outcome::Succeeded { 0 } else { 1 },
                    ..Default::default()
                }),
                ..Default::default()
            },
        };
        let init_state = ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: state.init_exit.unwrap_or(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let statuses = |containers: &[Container], st: &ContainerState| -> Vec<ContainerStatus> {
            containers
                .iter()
                .map(|c| ContainerStatus {
                    name: c.name.clone(),
                    state: Some(st.clone()),
                    ..Default::default()
                })
                .collect()
        };

        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-pod", job_name)),
                labels: Some(labels),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(outcome.phase().to_string()),
                container_statuses: Some(statuses(&spec.containers, &main_state)),
                init_container_statuses: spec
                    .init_containers
                    .as_deref()
                    .map(|inits| statuses(inits, &init_state)),
                ..Default::default()
            }),
            spec: Some(spec),
        }
    }
}

/// Whether `labels` satisfy an equality selector such as `a=b,c=d`.
fn selector_matches(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector
        .split(',')
        .filter(|term| !term.trim().is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels
                .and_then(|l| l.get(key.trim()))
                .is_some_and(|v| v == value.trim()),
            None => false,
        })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create_job(&self, job: &Job) -> Result<Job, ClusterError> {
        self.tick();
        let name = job.metadata.name.clone().unwrap_or_default();
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(ClusterError::JobSubmission {
                job_name: name,
                reason: "admission webhook denied the request".to_string(),
            });
        }
        let mut state = lock(&self.state);
        state.jobs.insert(name.clone(), job.clone());
        state.created.push(name);
        Ok(job.clone())
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>, ClusterError> {
        self.tick();
        let state = lock(&self.state);
        Ok(state.jobs.get(name).map(|job| Self::job_view(&state, job)))
    }

    async fn list_jobs(&self, selector: &str) -> Result<Vec<Job>, ClusterError> {
        self.tick();
        let state = lock(&self.state);
        Ok(state
            .jobs
            .values()
            .filter(|job| selector_matches(selector, job.metadata.labels.as_ref()))
            .map(|job| Self::job_view(&state, job))
            .collect())
    }

    async fn delete_job(&self, name: &str) -> Result<(), ClusterError> {
        self.tick();
        let mut state = lock(&self.state);
        state.jobs.remove(name);
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        self.tick();
        let failing = self
            .list_pods_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ClusterError::Api("etcdserver: request timed out".to_string()));
        }
        let state = lock(&self.state);
        if state.pods_hidden {
            return Ok(Vec::new());
        }
        Ok(state
            .jobs
            .iter()
            .map(|(name, job)| Self::pod_view(&state, name, job))
            .filter(|pod| selector_matches(selector, pod.metadata.labels.as_ref()))
            .collect())
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ClusterError> {
        self.tick();
        let state = lock(&self.state);
        if state.pods_hidden {
            return Ok(None);
        }
        let Some(job) = state.job_for_pod(name) else {
            return Ok(None);
        };
        let job_name = name.trim_end_matches("-pod");
        Ok(Some(Self::pod_view(&state, job_name, job)))
    }

    async fn pod_logs(&self, pod: &str, _container: Option<&str>) -> Result<String, ClusterError> {
        self.tick();
        let mut state = lock(&self.state);
        if state.job_for_pod(pod).is_none() {
            return Err(ClusterError::NotFound {
                kind: "pod".to_string(),
                name: pod.to_string(),
            });
        }
        if !state.growing {
            return Ok(state.full_log());
        }
        state.served = (state.served + 1).min(state.chunks.len());
        Ok(state.chunks[..state.served].concat())
    }

    async fn follow_pod_logs(&self, pod: &str, _container: &str) -> Result<LogLines, ClusterError> {
        self.tick();
        let state = lock(&self.state);
        if state.job_for_pod(pod).is_none() {
            return Err(ClusterError::NotFound {
                kind: "pod".to_string(),
                name: pod.to_string(),
            });
        }
        let lines: Vec<String> = match &state.follow_lines {
            Some(lines) => lines.clone(),
            None => state.full_log().lines().map(str::to_string).collect(),
        };
        let served = futures::stream::iter(lines.into_iter().map(Ok));
        if state.follow_open {
            Ok(served.chain(futures::stream::pending()).boxed())
        } else {
            Ok(served.boxed())
        }
    }
}

// ==================== FakeCommandRunner ====================

/// Scripted [`CommandRunner`].
///
/// Responses are keyed by `"program arg0"` first, then `"program"`.
/// Unscripted commands succeed with empty output.
#[derive(Default)]
pub struct FakeCommandRunner {
    scripts: Mutex<HashMap<String, CommandOutput>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make commands matching `key` exit with `code` and print `stdout`/`stderr`.
    pub fn script(&self, key: &str, code: i32, stdout: &str, stderr: &str) {
        lock(&self.scripts).insert(
            key.to_string(),
            CommandOutput {
                exit_code: code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        );
    }

    /// Every command run so far.
    pub fn calls(&self) -> Vec<CommandSpec> {
        lock(&self.calls).clone()
    }

    /// Display strings of every command run so far.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.calls).iter().map(CommandSpec::display).collect()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    fn respond(&self, spec: &CommandSpec) -> CommandOutput {
        lock(&self.calls).push(spec.clone());
        let scripts = lock(&self.scripts);
        spec.args
            .first()
            .and_then(|arg| scripts.get(&format!("{} {}", spec.program, arg)))
            .or_else(|| scripts.get(&spec.program))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        Ok(self.respond(spec))
    }

    async fn stream(
        &self,
        spec: &CommandSpec,
        lines: mpsc::Sender<String>,
    ) -> Result<i32, CommandError> {
        let out = self.respond(spec);
        for line in out.stdout.lines().chain(out.stderr.lines()) {
            if lines.send(line.to_string()).await.is_err() {
                break;
            }
        }
        Ok(out.exit_code)
    }
}
