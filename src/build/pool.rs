//! Bounded worker pool that runs queued image builds.
//!
//! ```text
//!   BuildQueue::submit ──► mpsc (bounded) ──► worker 1..N
//!                                               │
//!                               tool busy? ─yes─► park behind it
//!                                               │ no
//!                                     BuildBackend::build (own task,
//!                                     child cancellation token)
//!                                               │
//!                                     next parked build of the tool
//! ```
//!
//! A worker never waits on another build: a request whose tool already has
//! a build in flight is parked, and the worker that finishes that build
//! runs the parked ones in submission order.
//!
//! A build that panics only takes its own task down; the worker sees the
//! `JoinError` and marks the row FAILED.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::build::backend::{BuildBackend, BuildRequest};
use crate::build::log::BuildLog;
use crate::db::BuildJobStore;
use crate::error::BuildError;
use crate::history::BuildStatus;

/// Sending half of the build queue.
#[derive(Clone)]
pub struct BuildQueue {
    tx: mpsc::Sender<BuildRequest>,
}

impl BuildQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BuildRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a build. Waits for room when the queue is full.
    pub async fn submit(&self, request: BuildRequest) -> Result<(), BuildError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| BuildError::QueueClosed)
    }
}

/// Per-tool ordering: a tool with a build in flight holds a slot, and
/// later builds of that tool wait in the slot's queue.
#[derive(Default)]
struct ToolSlots {
    busy: std::sync::Mutex<HashMap<String, VecDeque<BuildRequest>>>,
}

impl ToolSlots {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<BuildRequest>>> {
        self.busy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the tool's slot, or park the request behind the build holding it.
    fn acquire(&self, request: BuildRequest) -> Option<BuildRequest> {
        match self.lock().entry(request.tool_id.clone()) {
            Entry::Occupied(mut parked) => {
                parked.get_mut().push_back(request);
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::new());
                Some(request)
            }
        }
    }

    /// Hand the slot to the tool's next parked build, or free it.
    fn release(&self, tool_id: &str) -> Option<BuildRequest> {
        let mut busy = self.lock();
        let next = busy.get_mut(tool_id).and_then(VecDeque::pop_front);
        if next.is_none() {
            busy.remove(tool_id);
        }
        next
    }

    /// Every parked build, in no particular order.
    fn drain(&self) -> Vec<BuildRequest> {
        self.lock().drain().flat_map(|(_, parked)| parked).collect()
    }
}

struct Shared {
    backend: Arc<dyn BuildBackend>,
    store: Arc<dyn BuildJobStore>,
    rx: Mutex<mpsc::Receiver<BuildRequest>>,
    slots: ToolSlots,
    cancel: CancellationToken,
}

pub struct BuildPool {
    queue: BuildQueue,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl BuildPool {
    /// Spawn `workers` workers pulling from a queue of `capacity` requests.
    pub fn start(
        backend: Arc<dyn BuildBackend>,
        store: Arc<dyn BuildJobStore>,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let (queue, rx) = BuildQueue::channel(capacity);
        let shared = Arc::new(Shared {
            backend,
            store,
            rx: Mutex::new(rx),
            slots: ToolSlots::default(),
            cancel: CancellationToken::new(),
        });
        let count = workers.max(1);
        let workers = (0..count)
            .map(|n| tokio::spawn(worker(n, shared.clone())))
            .collect();
        tracing::info!(backend = shared.backend.name(), workers = count, "Build pool started");
        Self {
            queue,
            shared,
            workers,
        }
    }

    pub fn queue(&self) -> BuildQueue {
        self.queue.clone()
    }

    /// Cancel in-flight builds, stop the workers, and fail whatever is
    /// still queued.
    pub async fn shutdown(self) {
        self.shared.cancel.cancel();
        for handle in self.workers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Build worker exited abnormally");
            }
        }

        let mut rx = self.shared.rx.lock().await;
        rx.close();
        let mut abandoned = self.shared.slots.drain();
        while let Ok(request) = rx.try_recv() {
            abandoned.push(request);
        }
        for request in abandoned {
            let log = BuildLog::new(self.shared.store.clone(), request.build_id);
            log.line("Build cancelled: server shutting down").await;
            finish(&self.shared.store, request.build_id, BuildStatus::Failed, None).await;
        }
        tracing::info!("Build pool stopped");
    }
}

async fn worker(n: usize, shared: Arc<Shared>) {
    tracing::debug!(worker = n, "Build worker started");
    loop {
        let next = {
            let mut rx = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => break,
                rx = shared.rx.lock() => rx,
            };
            let request = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => None,
                request = rx.recv() => request,
            };
            let Some(request) = request else {
                break;
            };
            // Acquire while still holding the receiver so slots follow queue order.
            shared.slots.acquire(request)
        };
        let Some(mut current) = next else {
            tracing::debug!(worker = n, "Build parked behind a running build of the same tool");
            continue;
        };

        loop {
            let tool_id = current.tool_id.clone();
            run_isolated(&shared, current).await;
            if shared.cancel.is_cancelled() {
                break;
            }
            match shared.slots.release(&tool_id) {
                Some(parked) => current = parked,
                None => break,
            }
        }
    }
    tracing::debug!(worker = n, "Build worker stopped");
}

/// Run one build on its own task so a panic only fails that build.
async fn run_isolated(shared: &Shared, request: BuildRequest) {
    let build_id = request.build_id;
    let handle = tokio::spawn(run_build(
        shared.backend.clone(),
        shared.store.clone(),
        request,
        shared.cancel.child_token(),
    ));
    if let Err(e) = handle.await {
        tracing::error!(build_id = %build_id, error = %e, "Build task crashed");
        let log = BuildLog::new(shared.store.clone(), build_id);
        log.line(format!("Build crashed: {}", e)).await;
        finish(&shared.store, build_id, BuildStatus::Failed, None).await;
    }
}

/// Drive one build through RUNNING to a terminal status.
///
/// The closing log line is written before the terminal status, since the
/// store stops accepting log appends once a row is terminal.
async fn run_build(
    backend: Arc<dyn BuildBackend>,
    store: Arc<dyn BuildJobStore>,
    request: BuildRequest,
    cancel: CancellationToken,
) {
    let build_id = request.build_id;
    match store
        .update_build_status(build_id, BuildStatus::Running, None)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(build_id = %build_id, "Build is no longer pending, skipping");
            return;
        }
        Err(e) => {
            tracing::warn!(build_id = %build_id, error = %e, "Failed to mark build running");
            return;
        }
    }

    let log = BuildLog::new(store.clone(), build_id);
    log.line(format!(
        "Starting build for {} (Job {})",
        request.tool_id, build_id
    ))
    .await;
    tracing::info!(build_id = %build_id, tool_id = %request.tool_id, backend = backend.name(), "Build started");

    match backend.build(&request, &log, &cancel).await {
        Ok(image) => {
            log.line("Build & Push Successful!").await;
            finish(&store, build_id, BuildStatus::Success, Some(&image)).await;
            tracing::info!(build_id = %build_id, image = %image, "Build succeeded");
        }
        Err(BuildError::Cancelled { .. }) => {
            log.line("Build cancelled").await;
            finish(&store, build_id, BuildStatus::Failed, None).await;
            tracing::info!(build_id = %build_id, "Build cancelled");
        }
        Err(e) => {
            log.line(format!("Build failed: {}", e)).await;
            finish(&store, build_id, BuildStatus::Failed, None).await;
            tracing::warn!(build_id = %build_id, error = %e, "Build failed");
        }
    }
}

async fn finish(
    store: &Arc<dyn BuildJobStore>,
    build_id: Uuid,
    status: BuildStatus,
    image: Option<&str>,
) {
    match store.update_build_status(build_id, status, image).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(build_id = %build_id, status = %status, "Build status transition rejected")
        }
        Err(e) => {
            tracing::warn!(build_id = %build_id, status = %status, error = %e, "Failed to record build status")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::db::Database;
    use crate::history::BuildJobRecord;
    use crate::testing::test_db;
    use crate::tools::DockerConfig;

    #[derive(Default)]
    struct ScriptedBackend {
        events: std::sync::Mutex<Vec<String>>,
        delay: Duration,
    }

    impl ScriptedBackend {
        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BuildBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn build(
            &self,
            request: &BuildRequest,
            log: &BuildLog,
            cancel: &CancellationToken,
        ) -> Result<String, BuildError> {
            let marker = request.image_tag.clone();
            self.events.lock().unwrap().push(format!("start {}", marker));
            log.line("working").await;
            match marker.as_str() {
                "panic" => panic!("backend blew up"),
                "fail" => {
                    return Err(BuildError::BuildExecution {
                        build_id: request.build_id,
                        reason: "exit code 2".into(),
                    });
                }
                "hang" => {
                    cancel.cancelled().await;
                    return Err(BuildError::Cancelled {
                        build_id: request.build_id,
                    });
                }
                _ => {}
            }
            tokio::time::sleep(self.delay).await;
            self.events.lock().unwrap().push(format!("end {}", marker));
            Ok(format!("registry/{}:latest", marker))
        }
    }

    async fn enqueue(db: &Arc<dyn Database>, pool: &BuildPool, tool_id: &str, tag: &str) -> Uuid {
        let record = BuildJobRecord::pending(tool_id);
        db.create_build_job(&record).await.unwrap();
        pool.queue()
            .submit(BuildRequest {
                build_id: record.id,
                tool_id: tool_id.into(),
                docker: DockerConfig::default(),
                image_tag: tag.into(),
            })
            .await
            .unwrap();
        record.id
    }

    async fn wait_terminal(db: &Arc<dyn Database>, id: Uuid) -> BuildJobRecord {
        for _ in 0..200 {
            let job = db.get_build_job(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("build {} never finished", id);
    }

    fn start(backend: Arc<ScriptedBackend>, db: &Arc<dyn Database>, workers: usize) -> BuildPool {
        BuildPool::start(backend, db.clone(), workers, 16)
    }

    #[tokio::test]
    async fn successful_build_records_image() {
        let (db, _dir) = test_db().await;
        let pool = start(Arc::new(ScriptedBackend::default()), &db, 2);

        let id = enqueue(&db, &pool, "recon/nmap", "nmap").await;
        let job = wait_terminal(&db, id).await;
        assert_eq!(job.status, BuildStatus::Success);
        assert_eq!(job.image_tag.as_deref(), Some("registry/nmap:latest"));
        assert!(job.logs.starts_with(&format!("Starting build for recon/nmap (Job {})\n", id)));
        assert!(job.logs.ends_with("working\nBuild & Push Successful!\n"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn failed_build_logs_reason() {
        let (db, _dir) = test_db().await;
        let pool = start(Arc::new(ScriptedBackend::default()), &db, 1);

        let id = enqueue(&db, &pool, "recon/nmap", "fail").await;
        let job = wait_terminal(&db, id).await;
        assert_eq!(job.status, BuildStatus::Failed);
        assert!(job.logs.contains("Build failed: "));
        assert!(job.logs.contains("exit code 2"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_build_is_isolated() {
        let (db, _dir) = test_db().await;
        let pool = start(Arc::new(ScriptedBackend::default()), &db, 1);

        let crashed = enqueue(&db, &pool, "web/broken", "panic").await;
        let healthy = enqueue(&db, &pool, "web/fine", "fine").await;

        let job = wait_terminal(&db, crashed).await;
        assert_eq!(job.status, BuildStatus::Failed);
        assert!(job.logs.contains("Build crashed"));
        assert_eq!(wait_terminal(&db, healthy).await.status, BuildStatus::Success);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn builds_for_one_tool_run_in_submission_order() {
        let (db, _dir) = test_db().await;
        let backend = Arc::new(ScriptedBackend::slow(Duration::from_millis(30)));
        let pool = start(backend.clone(), &db, 3);

        let first = enqueue(&db, &pool, "recon/nmap", "one").await;
        let second = enqueue(&db, &pool, "recon/nmap", "two").await;
        wait_terminal(&db, first).await;
        wait_terminal(&db, second).await;

        assert_eq!(
            backend.events(),
            vec!["start one", "end one", "start two", "end two"]
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn busy_tool_does_not_hold_back_other_tools() {
        let (db, _dir) = test_db().await;
        let backend = Arc::new(ScriptedBackend::slow(Duration::from_millis(100)));
        let pool = start(backend.clone(), &db, 2);

        let a1 = enqueue(&db, &pool, "recon/nmap", "a1").await;
        let a2 = enqueue(&db, &pool, "recon/nmap", "a2").await;
        let a3 = enqueue(&db, &pool, "recon/nmap", "a3").await;
        let other = enqueue(&db, &pool, "web/other", "other").await;
        for id in [a1, a2, a3, other] {
            assert_eq!(wait_terminal(&db, id).await.status, BuildStatus::Success);
        }

        let events = backend.events();
        let at = |e: &str| events.iter().position(|x| x == e).unwrap();
        assert!(at("start other") < at("end a1"));
        assert!(at("end a1") < at("start a2"));
        assert!(at("end a2") < at("start a3"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_fails_builds_parked_behind_a_running_one() {
        let (db, _dir) = test_db().await;
        let backend = Arc::new(ScriptedBackend::default());
        let pool = start(backend.clone(), &db, 2);

        let running = enqueue(&db, &pool, "recon/nmap", "hang").await;
        let parked = enqueue(&db, &pool, "recon/nmap", "two").await;
        for _ in 0..200 {
            if !backend.events().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown().await;

        assert_eq!(
            db.get_build_job(running).await.unwrap().unwrap().status,
            BuildStatus::Failed
        );
        let job = db.get_build_job(parked).await.unwrap().unwrap();
        assert_eq!(job.status, BuildStatus::Failed);
        assert!(job.logs.contains("Build cancelled: server shutting down"));
        assert_eq!(backend.events(), vec!["start hang"]);
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_builds() {
        let (db, _dir) = test_db().await;
        let backend = Arc::new(ScriptedBackend::default());
        let pool = start(backend.clone(), &db, 1);

        let id = enqueue(&db, &pool, "recon/nmap", "hang").await;
        for _ in 0..200 {
            if !backend.events().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let queue = pool.queue();
        pool.shutdown().await;

        let job = db.get_build_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, BuildStatus::Failed);
        assert!(job.logs.contains("Build cancelled"));
        assert!(matches!(
            queue
                .submit(BuildRequest {
                    build_id: Uuid::new_v4(),
                    tool_id: "recon/nmap".into(),
                    docker: DockerConfig::default(),
                    image_tag: "late".into(),
                })
                .await,
            Err(BuildError::QueueClosed)
        ));
    }
}
