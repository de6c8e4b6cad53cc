//! Builds with the local container daemon, then publishes.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::build::backend::{BuildBackend, BuildRequest};
use crate::build::dockerfile;
use crate::build::log::BuildLog;
use crate::build::process::{CommandRunner, CommandSpec};
use crate::build::publisher::RegistryPublisher;
use crate::db::RegistryConfigStore;
use crate::error::BuildError;

pub struct LocalBuilder {
    runner: Arc<dyn CommandRunner>,
    publisher: Arc<RegistryPublisher>,
    registries: Arc<dyn RegistryConfigStore>,
}

impl LocalBuilder {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        publisher: Arc<RegistryPublisher>,
        registries: Arc<dyn RegistryConfigStore>,
    ) -> Self {
        Self {
            runner,
            publisher,
            registries,
        }
    }

    async fn build_in(
        &self,
        dir: &Path,
        request: &BuildRequest,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<String, BuildError> {
        let content = dockerfile::render(&request.docker).ok_or_else(|| {
            BuildError::Context("configuration uses a pre-existing image; nothing to build".into())
        })?;
        let dockerfile_path = dir.join("Dockerfile");
        tokio::fs::write(&dockerfile_path, content).await?;

        let spec = CommandSpec::new(
            "docker",
            [
                "build".to_string(),
                "-t".to_string(),
                request.image_tag.clone(),
                "-f".to_string(),
                dockerfile_path.display().to_string(),
                dir.display().to_string(),
            ],
        );
        log.line(format!("$ {}", spec.display())).await;

        let code = stream_into_log(self.runner.as_ref(), &spec, log, cancel, request).await?;
        if code != 0 {
            return Err(BuildError::BuildExecution {
                build_id: request.build_id,
                reason: format!("docker build exited with code {}", code),
            });
        }

        log.line("Build successful. Initiating image push/load sequence...")
            .await;
        let registry = self
            .registries
            .get_registry_config()
            .await?
            .unwrap_or_default();
        let outcome = self
            .publisher
            .publish(&request.image_tag, &registry, log)
            .await?;
        Ok(outcome.image)
    }
}

/// Run `spec`, appending each output line to the build log. Dropping the
/// command future on cancellation kills the child.
async fn stream_into_log(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    log: &BuildLog,
    cancel: &CancellationToken,
    request: &BuildRequest,
) -> Result<i32, BuildError> {
    let (tx, mut rx) = mpsc::channel::<String>(256);
    let run = runner.stream(spec, tx);
    tokio::pin!(run);

    let mut exit = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BuildError::Cancelled { build_id: request.build_id });
            }
            code = &mut run, if exit.is_none() => {
                exit = Some(code?);
            }
            line = rx.recv() => match line {
                Some(line) => log.line(line).await,
                None => break,
            },
        }
    }

    match exit {
        Some(code) => Ok(code),
        None => Ok(run.await?),
    }
}

#[async_trait]
impl BuildBackend for LocalBuilder {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn build(
        &self,
        request: &BuildRequest,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<String, BuildError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("build_{}_", request.build_id))
            .tempdir()?;
        tracing::debug!(build_id = %request.build_id, dir = %dir.path().display(), "Prepared build directory");

        let result = self.build_in(dir.path(), request, log, cancel).await;

        let path = dir.path().to_path_buf();
        if let Err(e) = dir.close() {
            tracing::warn!(build_id = %request.build_id, dir = %path.display(), error = %e, "Failed to remove build directory");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::build::registry::RegistryConfig;
    use crate::config::ClusterType;
    use crate::db::{BuildJobStore, Database};
    use crate::history::BuildJobRecord;
    use crate::testing::{FakeCommandRunner, test_db};
    use crate::tools::DockerConfig;

    async fn setup(
        runner: Arc<FakeCommandRunner>,
    ) -> (LocalBuilder, BuildLog, Arc<dyn Database>, tempfile::TempDir) {
        let (db, dir) = test_db().await;
        let job = BuildJobRecord::pending("web/flask_app");
        db.create_build_job(&job).await.unwrap();
        db.save_registry_config(&RegistryConfig::default())
            .await
            .unwrap();
        let publisher = Arc::new(RegistryPublisher::new(
            runner.clone(),
            ClusterType::Minikube,
            "us-east-1",
        ));
        let builder = LocalBuilder::new(runner, publisher, db.clone());
        let store: Arc<dyn BuildJobStore> = db.clone();
        (builder, BuildLog::new(store, job.id), db, dir)
    }

    fn request(build_id: Uuid) -> BuildRequest {
        BuildRequest {
            build_id,
            tool_id: "web/flask_app".into(),
            docker: DockerConfig {
                base_image: Some("python:3.11-slim".into()),
                pip_packages: Some(vec!["flask".into()]),
                ..Default::default()
            },
            image_tag: "localhost:5000/security-platform-tool-flask-app:latest".into(),
        }
    }

    #[tokio::test]
    async fn successful_build_streams_output_and_loads_image() {
        let runner = Arc::new(FakeCommandRunner::new());
        runner.script("docker build", 0, "Step 1/4 : FROM python:3.11-slim\nSuccessfully built abc\n", "");
        let (builder, log, _db, _dir) = setup(runner.clone()).await;

        let image = builder
            .build(&request(log.build_id()), &log, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(image, "localhost:5000/security-platform-tool-flask-app:latest");

        let commands = runner.commands();
        assert!(commands[0].starts_with(
            "docker build -t localhost:5000/security-platform-tool-flask-app:latest -f "
        ));
        assert_eq!(
            commands[1],
            "minikube image load localhost:5000/security-platform-tool-flask-app:latest"
        );

        let logs = log.contents().await;
        assert!(logs.contains("Successfully built abc\n"));
        assert!(logs.contains("Build successful. Initiating image push/load sequence..."));
    }

    #[tokio::test]
    async fn failing_build_skips_publish_and_cleans_up() {
        let runner = Arc::new(FakeCommandRunner::new());
        runner.script("docker build", 1, "E: Unable to locate package\n", "");
        let (builder, log, _db, _dir) = setup(runner.clone()).await;

        let err = builder
            .build(&request(log.build_id()), &log, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::BuildExecution { .. }));
        assert_eq!(runner.commands().len(), 1);

        let build_dir = runner.calls()[0].args.last().cloned().unwrap();
        assert!(!Path::new(&build_dir).exists());
    }

    #[tokio::test]
    async fn preexisting_image_is_not_built() {
        let runner = Arc::new(FakeCommandRunner::new());
        let (builder, log, _db, _dir) = setup(runner.clone()).await;
        let mut req = request(log.build_id());
        req.docker = DockerConfig {
            image: Some("projectdiscovery/nuclei:latest".into()),
            ..Default::default()
        };

        let err = builder
            .build(&req, &log, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Context(_)));
        assert!(runner.commands().is_empty());
    }
}
