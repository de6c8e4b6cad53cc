//! Decides when a tool needs an image build and dispatches it.

use std::sync::Arc;

use uuid::Uuid;

use crate::build::backend::BuildRequest;
use crate::build::dockerfile::has_build_keys;
use crate::build::pool::BuildQueue;
use crate::db::BuildJobStore;
use crate::error::{BuildError, DatabaseError};
use crate::history::{BuildJobRecord, BuildStatus};
use crate::tools::naming::is_generated_tag;
use crate::tools::{DockerConfig, DockerMode, ToolDefinition, ToolResolver};

/// Whether a tool's docker config calls for a build.
pub fn should_build(config: Option<&DockerConfig>) -> bool {
    let Some(config) = config else {
        return false;
    };
    matches!(config.docker_mode, Some(DockerMode::Build | DockerMode::Custom))
        || has_build_keys(config)
        || config.image.as_deref().is_some_and(is_generated_tag)
}

/// The parts of a docker config that change what gets built.
#[derive(Debug, PartialEq, Eq)]
struct BuildFingerprint<'a> {
    mode: DockerMode,
    external_image: Option<&'a str>,
    base_image: Option<&'a str>,
    apt_packages: Vec<&'a str>,
    pip_packages: Vec<&'a str>,
    run_commands: Option<&'a [String]>,
    dockerfile: Option<&'a str>,
    final_base: Option<&'a str>,
    final_run_commands: Option<&'a [String]>,
    copy_from_builder: Vec<(&'a str, &'a str)>,
}

impl<'a> BuildFingerprint<'a> {
    fn of(config: Option<&'a DockerConfig>) -> Option<Self> {
        let config = config?;
        let sorted = |list: &'a Option<Vec<String>>| {
            let mut out: Vec<&str> = list.iter().flatten().map(String::as_str).collect();
            out.sort_unstable();
            out
        };
        Some(Self {
            mode: config.effective_mode(),
            external_image: config.external_image(),
            base_image: config.base_image.as_deref(),
            apt_packages: sorted(&config.apt_packages),
            pip_packages: sorted(&config.pip_packages),
            run_commands: config.run_commands.as_deref(),
            dockerfile: config.dockerfile.as_deref(),
            final_base: config.final_base.as_deref(),
            final_run_commands: config.final_run_commands.as_deref(),
            copy_from_builder: config
                .copy_from_builder
                .iter()
                .flatten()
                .map(|c| (c.src(), c.dest()))
                .collect(),
        })
    }
}

/// Whether the build-affecting parts of a docker config differ.
///
/// Package lists compare as sets; resource limits are not considered.
pub fn config_changed(new: Option<&DockerConfig>, old: Option<&DockerConfig>) -> bool {
    BuildFingerprint::of(new) != BuildFingerprint::of(old)
}

/// Build dispatch and status for tools.
pub struct BuildCoordinator {
    store: Arc<dyn BuildJobStore>,
    resolver: Arc<ToolResolver>,
    queue: BuildQueue,
}

impl BuildCoordinator {
    pub fn new(store: Arc<dyn BuildJobStore>, resolver: Arc<ToolResolver>, queue: BuildQueue) -> Self {
        Self {
            store,
            resolver,
            queue,
        }
    }

    /// Start a build for a newly created tool if its config needs one.
    pub async fn on_tool_created(&self, tool: &ToolDefinition) -> Result<Option<Uuid>, BuildError> {
        let docker = docker_config(tool)?;
        if !should_build(docker.as_ref()) {
            tracing::debug!(tool_id = %tool.id, "No build needed for new tool");
            return Ok(None);
        }
        let docker = docker.unwrap_or_default();
        self.dispatch(&tool.id, docker).await.map(Some)
    }

    /// Start a build for an edited tool when its script or build config
    /// changed. Metadata-only edits never rebuild.
    pub async fn on_tool_updated(
        &self,
        new: &ToolDefinition,
        old: &ToolDefinition,
    ) -> Result<Option<Uuid>, BuildError> {
        let new_docker = docker_config(new)?;
        // An unparseable old config counts as different.
        let old_docker = docker_config(old).ok().flatten();
        let script_changed = new.script != old.script;
        let docker_changed = config_changed(new_docker.as_ref(), old_docker.as_ref());

        if !(script_changed || docker_changed) {
            tracing::info!(tool_id = %new.id, "Skipping build: only metadata changed");
            return Ok(None);
        }
        if !should_build(new_docker.as_ref()) {
            tracing::debug!(tool_id = %new.id, script_changed, docker_changed, "Config does not call for a build");
            return Ok(None);
        }
        tracing::info!(tool_id = %new.id, script_changed, docker_changed, "Rebuilding tool image");
        self.dispatch(&new.id, new_docker.unwrap_or_default()).await.map(Some)
    }

    /// Build a tool with an explicit docker config.
    pub async fn trigger_build(&self, tool_id: &str, docker: DockerConfig) -> Result<Uuid, BuildError> {
        self.dispatch(tool_id, docker).await
    }

    pub async fn build_status(&self, build_id: Uuid) -> Result<Option<BuildJobRecord>, DatabaseError> {
        self.store.get_build_job(build_id).await
    }

    /// Record a PENDING build and queue it for a worker.
    async fn dispatch(&self, tool_id: &str, docker: DockerConfig) -> Result<Uuid, BuildError> {
        let record = BuildJobRecord::pending(tool_id);
        self.store.create_build_job(&record).await?;

        let image_tag = match docker.external_image() {
            Some(image) => image.to_string(),
            None => self.resolver.authoritative_tag(tool_id),
        };
        let request = BuildRequest {
            build_id: record.id,
            tool_id: tool_id.to_string(),
            docker,
            image_tag,
        };

        if let Err(e) = self.queue.submit(request).await {
            self.store
                .append_build_log(record.id, &format!("Failed to queue build: {}\n", e))
                .await?;
            self.store
                .update_build_status(record.id, BuildStatus::Failed, None)
                .await?;
            return Err(e);
        }
        tracing::info!(build_id = %record.id, tool_id, "Build queued");
        Ok(record.id)
    }
}

fn docker_config(tool: &ToolDefinition) -> Result<Option<DockerConfig>, BuildError> {
    Ok(tool.parse_config()?.docker)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::db::Database;
    use crate::testing::test_db;

    fn docker(yaml: &str) -> DockerConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn build_decision() {
        assert!(!should_build(None));
        assert!(!should_build(Some(&DockerConfig::default())));
        assert!(should_build(Some(&docker("docker_mode: build\n"))));
        assert!(should_build(Some(&docker("pip_packages: [requests]\n"))));
        assert!(should_build(Some(&docker(
            "image: localhost:5000/security-platform-tool-nmap:latest\n"
        ))));
        assert!(!should_build(Some(&docker("image: instrumentisto/nmap\n"))));
        assert!(!should_build(Some(&docker(
            "image: instrumentisto/nmap\ndocker_mode: preexisting\n"
        ))));
    }

    #[test]
    fn package_order_and_generated_image_do_not_count_as_changes() {
        let a = docker("apt_packages: [nmap, curl]\nimage: r/security-platform-tool-x:latest\n");
        let b = docker("apt_packages: [curl, nmap]\n");
        assert!(!config_changed(Some(&a), Some(&b)));
        assert!(!config_changed(Some(&b), Some(&a)));
    }

    #[test]
    fn build_affecting_edits_are_changes() {
        let old = docker("base_image: python:3.11-slim\npip_packages: [flask]\n");
        assert!(config_changed(
            Some(&docker("base_image: python:3.12-slim\npip_packages: [flask]\n")),
            Some(&old)
        ));
        assert!(config_changed(
            Some(&docker("base_image: python:3.11-slim\npip_packages: [flask, gunicorn]\n")),
            Some(&old)
        ));
        assert!(config_changed(Some(&old), None));
        assert!(config_changed(
            Some(&docker("image: nmap:7\n")),
            Some(&docker("image: nmap:6\n"))
        ));
    }

    type Harness = (
        BuildCoordinator,
        mpsc::Receiver<BuildRequest>,
        Arc<dyn Database>,
        tempfile::TempDir,
    );

    async fn coordinator() -> Harness {
        let (db, dir) = test_db().await;
        let (queue, rx) = BuildQueue::channel(8);
        let resolver = Arc::new(ToolResolver::new(db.clone(), "localhost:5000"));
        let coordinator = BuildCoordinator::new(db.clone(), resolver, queue);
        (coordinator, rx, db, dir)
    }

    #[tokio::test]
    async fn created_tool_with_packages_is_queued() {
        let (coordinator, mut rx, db, _dir) = coordinator().await;
        let tool = ToolDefinition::new("recon", "nmap scan", "def main(target): pass")
            .with_configuration("docker:\n  apt_packages: [nmap]\n");

        let build_id = coordinator.on_tool_created(&tool).await.unwrap().unwrap();
        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.build_id, build_id);
        assert_eq!(queued.tool_id, "recon/nmap_scan");
        assert_eq!(
            queued.image_tag,
            "localhost:5000/security-platform-tool-nmap-scan:latest"
        );
        let record = db.get_build_job(build_id).await.unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Pending);
    }

    #[tokio::test]
    async fn metadata_only_update_does_not_rebuild() {
        let (coordinator, mut rx, _db, _dir) = coordinator().await;
        let old = ToolDefinition::new("recon", "nmap scan", "def main(target): pass")
            .with_configuration("docker:\n  apt_packages: [nmap]\nresources:\n  limits:\n    memory: 512Mi\n");
        let mut new = old.clone();
        new.configuration = Some(
            "docker:\n  apt_packages: [nmap]\nresources:\n  limits:\n    memory: 2Gi\n".into(),
        );
        assert_eq!(coordinator.on_tool_updated(&new, &old).await.unwrap(), None);

        new.script = "def main(target):\n    return target\n".into();
        assert!(coordinator.on_tool_updated(&new, &old).await.unwrap().is_some());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let (coordinator, rx, _db, _dir) = coordinator().await;
        drop(rx);

        let err = coordinator
            .trigger_build("recon/nmap", docker("apt_packages: [nmap]\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::QueueClosed));
    }
}
