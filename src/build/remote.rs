//! In-cluster image builds with kaniko.
//!
//! The Dockerfile is packaged into a `.tar.gz` under the context directory
//! and served by `GET /api/builds/context/{build_id}`. A build Job fetches
//! it in an init container, then kaniko builds against the shared volume
//! and pushes to the computed destination.
//!
//! ```text
//!   prepare context ──► create Job ──► wait for pod ──► follow kaniko log
//!        │                                 │                  │
//!   <dir>/<id>.tar.gz              init container failed?   grace period
//!        │                                 │                  │
//!        └──────── always unlinked ◄───────┴──── SuccessPolicy verdict
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::build::backend::{BuildBackend, BuildRequest};
use crate::build::dockerfile;
use crate::build::log::BuildLog;
use crate::build::publisher::construct_remote_tag;
use crate::build::registry::{RegistryConfig, RegistryType};
use crate::build::success::SuccessPolicy;
use crate::config::BuildConfig;
use crate::db::RegistryConfigStore;
use crate::error::{BuildError, ClusterError};
use crate::orchestrator::cluster::{
    ClusterApi, container_started, init_container_exit, job_succeeded, pod_name,
};
use crate::orchestrator::job_spec::job_pods_selector;
use crate::tools::naming::build_job_name;

pub const CONTEXT_INIT_CONTAINER: &str = "context-init";
pub const KANIKO_CONTAINER: &str = "kaniko";
/// `job-type` label value on build jobs.
pub const BUILD_JOB_TYPE: &str = "kaniko-build";
pub const BUILD_ID_LABEL: &str = "build-id";

const WORKSPACE_VOLUME: &str = "workspace-vol";
const WORKSPACE_MOUNT: &str = "/workspace";
const LOG_PREFIX: &str = "[Kaniko] ";

/// Where the context tarball for a build lives.
pub fn context_path(context_dir: &Path, build_id: Uuid) -> PathBuf {
    context_dir.join(format!("{}.tar.gz", build_id))
}

/// URL the init container downloads the context from.
pub fn context_url(backend_url: &str, build_id: Uuid) -> String {
    format!(
        "{}/api/builds/context/{}",
        backend_url.trim_end_matches('/'),
        build_id
    )
}

/// Write a gzipped tar holding `Dockerfile` at its root. Returns the size.
pub fn package_context(dockerfile: &str, dest: &Path) -> std::io::Result<u64> {
    use flate2::Compression;
    use flate2::write::GzEncoder;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(dest)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut archive = tar::Builder::new(encoder);

    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    archive.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;

    let mut file = archive.into_inner()?.finish()?;
    file.flush()?;
    Ok(std::fs::metadata(dest)?.len())
}

/// Where kaniko pushes the image.
///
/// Local registries push to the push host, which may differ from the host
/// cluster nodes pull from. Hosted registries use the publisher's tag rule.
pub fn build_destination(image_tag: &str, registry: &RegistryConfig, config: &BuildConfig) -> String {
    match registry.registry_type {
        RegistryType::Local => {
            if config.push_registry != config.registry && image_tag.contains(&config.registry) {
                image_tag.replacen(&config.registry, &config.push_registry, 1)
            } else {
                image_tag.to_string()
            }
        }
        _ => construct_remote_tag(image_tag, registry),
    }
}

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("valid ANSI regex")
});

pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(line, "")
}

/// The build Job: an init container that fetches and unpacks the context
/// into a shared empty-dir, then kaniko.
pub fn kaniko_job(
    build_id: Uuid,
    destination: &str,
    context_url: &str,
    config: &BuildConfig,
    ttl_secs: i32,
) -> Job {
    let name = build_job_name(&build_id.to_string());
    let mounts = vec![VolumeMount {
        name: WORKSPACE_VOLUME.to_string(),
        mount_path: WORKSPACE_MOUNT.to_string(),
        ..Default::default()
    }];

    let init = Container {
        name: CONTEXT_INIT_CONTAINER.to_string(),
        image: Some(config.context_init_image.clone()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "wget -q -O /tmp/context.tar.gz '{}' && tar -xzf /tmp/context.tar.gz -C {}",
                context_url, WORKSPACE_MOUNT
            ),
        ]),
        volume_mounts: Some(mounts.clone()),
        ..Default::default()
    };

    let kaniko = Container {
        name: KANIKO_CONTAINER.to_string(),
        image: Some(config.kaniko_image.clone()),
        args: Some(vec![
            "--dockerfile=Dockerfile".to_string(),
            format!("--context=dir://{}", WORKSPACE_MOUNT),
            format!("--destination={}", destination),
            "--force".to_string(),
            "--insecure".to_string(),
            "--skip-tls-verify".to_string(),
        ]),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let labels = BTreeMap::from([
        ("job-type".to_string(), BUILD_JOB_TYPE.to_string()),
        (BUILD_ID_LABEL.to_string(), build_id.to_string()),
    ]);

    Job {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(ttl_secs),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    init_containers: Some(vec![init]),
                    containers: vec![kaniko],
                    volumes: Some(vec![Volume {
                        name: WORKSPACE_VOLUME.to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub struct RemoteBuilder {
    cluster: Arc<dyn ClusterApi>,
    registries: Arc<dyn RegistryConfigStore>,
    config: BuildConfig,
    job_ttl_secs: i32,
    policy: SuccessPolicy,
}

impl RemoteBuilder {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        registries: Arc<dyn RegistryConfigStore>,
        config: BuildConfig,
        job_ttl_secs: i32,
    ) -> Self {
        Self {
            cluster,
            registries,
            config,
            job_ttl_secs,
            policy: SuccessPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SuccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn prepare_context(&self, request: &BuildRequest, dest: &Path) -> Result<(), BuildError> {
        let content = dockerfile::render(&request.docker).ok_or_else(|| {
            BuildError::Context("configuration uses a pre-existing image; nothing to build".into())
        })?;
        let dest = dest.to_path_buf();
        let size = tokio::task::spawn_blocking(move || package_context(&content, &dest))
            .await
            .map_err(|e| BuildError::Context(e.to_string()))??;
        tracing::info!(build_id = %request.build_id, size_bytes = size, "Context tarball created");
        Ok(())
    }

    async fn run(
        &self,
        request: &BuildRequest,
        log: &BuildLog,
        cancel: &CancellationToken,
        tarball: &Path,
    ) -> Result<String, BuildError> {
        log.line("Preparing build context...").await;
        self.prepare_context(request, tarball).await?;

        let registry = self
            .registries
            .get_registry_config()
            .await?
            .unwrap_or_default();
        let destination = build_destination(&request.image_tag, &registry, &self.config);
        if destination != request.image_tag && registry.registry_type == RegistryType::Local {
            log.line(format!("Adjusted destination for internal push: {}", destination))
                .await;
        }
        log.line(format!(
            "Destination: {} ({})",
            registry.registry_type, destination
        ))
        .await;

        let url = context_url(&self.config.backend_url, request.build_id);
        let job = kaniko_job(
            request.build_id,
            &destination,
            &url,
            &self.config,
            self.job_ttl_secs,
        );
        let job_name = job.metadata.name.clone().unwrap_or_default();

        log.line(format!("Launching Kaniko Job: {}", job_name)).await;
        tracing::info!(build_id = %request.build_id, job_name = %job_name, "Launching build job");
        self.cluster.create_job(&job).await?;

        let monitored = self
            .monitor(request, log, cancel, &job_name, &destination)
            .await;
        if matches!(monitored, Err(BuildError::Cancelled { .. })) {
            if let Err(e) = self.cluster.delete_job(&job_name).await {
                tracing::warn!(build_id = %request.build_id, job_name = %job_name, error = %e, "Failed to delete cancelled build job");
            }
        }
        monitored
    }

    /// Wait for the build pod, returning its name once kaniko has started.
    async fn wait_for_builder(
        &self,
        request: &BuildRequest,
        log: &BuildLog,
        cancel: &CancellationToken,
        job_name: &str,
    ) -> Result<String, BuildError> {
        log.line("Waiting for builder pod to initialize...").await;
        let deadline = tokio::time::Instant::now() + self.config.pod_wait;
        let selector = job_pods_selector(job_name);

        loop {
            let pods = match self.cluster.list_pods(&selector).await {
                Ok(pods) => pods,
                Err(e) => {
                    tracing::warn!(build_id = %request.build_id, job_name, error = %e, "Failed to list builder pods, retrying");
                    Vec::new()
                }
            };
            if let Some(pod) = pods.first() {
                let name = pod_name(pod).unwrap_or_default().to_string();

                if let Some(code) =
                    init_container_exit(pod, CONTEXT_INIT_CONTAINER).filter(|c| *c != 0)
                {
                    let init_logs = self
                        .cluster
                        .pod_logs(&name, Some(CONTEXT_INIT_CONTAINER))
                        .await
                        .unwrap_or_else(|_| "Could not fetch init logs.".to_string());
                    log.line(format!(
                        "Init Container Failed: exit code {}\nLogs:\n{}",
                        code, init_logs
                    ))
                    .await;
                    return Err(BuildError::InitStepFailure {
                        build_id: request.build_id,
                        exit_code: code,
                    });
                }

                if container_started(pod, KANIKO_CONTAINER) {
                    return Ok(name);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                log.line("Timeout waiting for builder pod.").await;
                return Err(ClusterError::PodTimeout {
                    job_name: job_name.to_string(),
                    waited: self.config.pod_wait,
                }
                .into());
            }
            tracing::debug!(build_id = %request.build_id, job_name, "Builder pod not ready yet");

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(BuildError::Cancelled { build_id: request.build_id });
                }
                _ = tokio::time::sleep(self.config.pod_poll_interval) => {}
            }
        }
    }

    async fn monitor(
        &self,
        request: &BuildRequest,
        log: &BuildLog,
        cancel: &CancellationToken,
        job_name: &str,
        destination: &str,
    ) -> Result<String, BuildError> {
        let pod = self.wait_for_builder(request, log, cancel, job_name).await?;

        log.line(format!("Streaming logs from {}...", pod)).await;
        match self.cluster.follow_pod_logs(&pod, KANIKO_CONTAINER).await {
            Ok(mut lines) => loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(BuildError::Cancelled { build_id: request.build_id });
                    }
                    next = lines.next() => match next {
                        Some(Ok(line)) => {
                            log.line(format!("{}{}", LOG_PREFIX, strip_ansi(&line))).await;
                        }
                        // The pod going away ends the watch like EOF.
                        Some(Err(e)) if e.is_not_found() => break,
                        Some(Err(e)) => {
                            log.line(format!("Error monitoring logs: {}", e)).await;
                            break;
                        }
                        None => break,
                    },
                }
            },
            Err(e) => log.line(format!("Error monitoring logs: {}", e)).await,
        }

        tokio::time::sleep(self.config.completion_grace).await;

        let succeeded = match self.cluster.get_job(job_name).await {
            Ok(job) => job.as_ref().map(job_succeeded),
            Err(e) => {
                tracing::warn!(build_id = %request.build_id, job_name, error = %e, "Could not read build job status");
                None
            }
        };
        let verdict = self.policy.evaluate(succeeded, &log.contents().await);
        tracing::info!(build_id = %request.build_id, job_name, verdict = ?verdict, "Build job finished");

        if verdict.is_success() {
            Ok(destination.to_string())
        } else {
            Err(BuildError::BuildExecution {
                build_id: request.build_id,
                reason: "kaniko did not report a successful push".to_string(),
            })
        }
    }
}

#[async_trait]
impl BuildBackend for RemoteBuilder {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn build(
        &self,
        request: &BuildRequest,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<String, BuildError> {
        let tarball = context_path(&self.config.context_dir, request.build_id);
        let result = self.run(request, log, cancel, &tarball).await;

        match tokio::fs::remove_file(&tarball).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(build_id = %request.build_id, path = %tarball.display(), error = %e, "Failed to remove context tarball");
            }
        }
        result
    }
}
