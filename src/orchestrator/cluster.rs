//! Namespaced access to cluster Jobs and Pods.
//!
//! `ClusterApi` is the seam between the coordinators and the API server.
//! `KubeCluster` is the only implementation that talks to a real cluster;
//! tests use `testing::FakeCluster`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};

use crate::error::ClusterError;

/// A stream of log lines from a followed container.
pub type LogLines = BoxStream<'static, Result<String, ClusterError>>;

/// Job and Pod operations scoped to one namespace.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<Job, ClusterError>;

    async fn get_job(&self, name: &str) -> Result<Option<Job>, ClusterError>;

    /// List jobs matching a label selector such as `execution-id=<id>`.
    async fn list_jobs(&self, selector: &str) -> Result<Vec<Job>, ClusterError>;

    /// Delete a job and its pods (foreground propagation). A job that is
    /// already gone counts as deleted.
    async fn delete_job(&self, name: &str) -> Result<(), ClusterError>;

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError>;

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ClusterError>;

    /// Full log of a pod, optionally for one container.
    async fn pod_logs(&self, pod: &str, container: Option<&str>) -> Result<String, ClusterError>;

    /// Follow a container's log until it terminates.
    async fn follow_pod_logs(&self, pod: &str, container: &str) -> Result<LogLines, ClusterError>;
}

/// `ClusterApi` backed by the `kube` client.
pub struct KubeCluster {
    client: kube::Client,
    namespace: String,
}

impl KubeCluster {
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connect using in-cluster service account credentials when present,
    /// else the local kubeconfig.
    pub async fn connect(namespace: impl Into<String>) -> Result<Self, ClusterError> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| ClusterError::Connection(e.to_string()))?;
        Ok(Self::new(client, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn map_kube_err(kind: &str, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        other => ClusterError::Api(other.to_string()),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_job(&self, job: &Job) -> Result<Job, ClusterError> {
        let name = job.metadata.name.clone().unwrap_or_default();
        self.jobs()
            .create(&PostParams::default(), job)
            .await
            .map_err(|e| ClusterError::JobSubmission {
                job_name: name,
                reason: e.to_string(),
            })
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>, ClusterError> {
        self.jobs()
            .get_opt(name)
            .await
            .map_err(|e| map_kube_err("job", name, e))
    }

    async fn list_jobs(&self, selector: &str) -> Result<Vec<Job>, ClusterError> {
        let list = self
            .jobs()
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        Ok(list.items)
    }

    async fn delete_job(&self, name: &str) -> Result<(), ClusterError> {
        match self.jobs().delete(name, &DeleteParams::foreground()).await {
            Ok(_) => Ok(()),
            Err(e) => match map_kube_err("job", name, e) {
                ClusterError::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let list = self
            .pods()
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        Ok(list.items)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ClusterError> {
        self.pods()
            .get_opt(name)
            .await
            .map_err(|e| map_kube_err("pod", name, e))
    }

    async fn pod_logs(&self, pod: &str, container: Option<&str>) -> Result<String, ClusterError> {
        let params = LogParams {
            container: container.map(str::to_string),
            ..Default::default()
        };
        self.pods()
            .logs(pod, &params)
            .await
            .map_err(|e| map_kube_err("pod", pod, e))
    }

    async fn follow_pod_logs(&self, pod: &str, container: &str) -> Result<LogLines, ClusterError> {
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            ..Default::default()
        };
        let reader = self
            .pods()
            .log_stream(pod, &params)
            .await
            .map_err(|e| map_kube_err("pod", pod, e))?;
        Ok(reader
            .lines()
            .map_err(|e| ClusterError::Api(e.to_string()))
            .boxed())
    }
}

// ==================== Pod/Job status helpers ====================

/// Lifecycle phase reported on a pod's status.
pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// Whether the pod has stopped for good.
pub fn pod_finished(pod: &Pod) -> bool {
    matches!(pod_phase(pod), Some("Succeeded" | "Failed"))
}

pub fn pod_name(pod: &Pod) -> Option<&str> {
    pod.metadata.name.as_deref()
}

pub fn job_name(job: &Job) -> Option<&str> {
    job.metadata.name.as_deref()
}

/// Count of pods that completed successfully for this job.
pub fn job_succeeded(job: &Job) -> i32 {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .unwrap_or(0)
}

pub fn job_failed(job: &Job) -> i32 {
    job.status.as_ref().and_then(|s| s.failed).unwrap_or(0)
}

/// Exit code of an init container that terminated, if it has.
pub fn init_container_exit(pod: &Pod, container: &str) -> Option<i32> {
    pod.status
        .as_ref()?
        .init_container_statuses
        .as_ref()?
        .iter()
        .find(|s| s.name == container)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
}

/// Whether a container has started (running or already terminated).
pub fn container_started(pod: &Pod, container: &str) -> bool {
    let Some(status) = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|all| all.iter().find(|s| s.name == container))
    else {
        return false;
    };
    status
        .state
        .as_ref()
        .is_some_and(|state| state.running.is_some() || state.terminated.is_some())
}
