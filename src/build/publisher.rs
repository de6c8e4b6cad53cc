//! Moves a locally built image to its final destination.
//!
//! For the `local` registry type the image is loaded straight into the
//! local cluster runtime. Hosted registries get a login, a retag and a
//! push. When login or push fails and the registry config allows it, the
//! publisher falls back to a cluster load, once.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::build::log::BuildLog;
use crate::build::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::build::registry::{RegistryConfig, RegistryType};
use crate::config::ClusterType;
use crate::error::{CommandError, PublishError};

/// Where a published image ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishOutcome {
    pub status: &'static str,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pushed_to: Option<String>,
}

impl PublishOutcome {
    fn loaded(image: &str, cluster: ClusterType) -> Self {
        Self {
            status: "success",
            image: image.to_string(),
            loaded_to: Some(cluster.to_string()),
            pushed_to: None,
        }
    }

    fn pushed(image: &str, registry: RegistryType) -> Self {
        Self {
            status: "success",
            image: image.to_string(),
            loaded_to: None,
            pushed_to: Some(registry.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Success,
    Failed,
}

/// Result of a registry connectivity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryTestResult {
    pub status: TestStatus,
    pub message: String,
}

impl RegistryTestResult {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Success,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Failed,
            message: message.into(),
        }
    }
}

/// Destination tag on a hosted registry for a locally built tag.
///
/// `namespace/image` for Docker Hub, `host/namespace/image` for URL-based
/// registries. Anything else keeps the local tag.
pub fn construct_remote_tag(local_tag: &str, config: &RegistryConfig) -> String {
    let image = local_tag.rsplit('/').next().unwrap_or(local_tag);
    let namespace = config.namespace.as_deref().filter(|n| !n.is_empty());
    let url = config
        .url
        .as_deref()
        .map(|u| u.trim_end_matches('/'))
        .filter(|u| !u.is_empty());

    match (config.registry_type, url) {
        (RegistryType::Dockerhub, _) => match namespace {
            Some(ns) => format!("{}/{}", ns, image),
            None => image.to_string(),
        },
        (RegistryType::Ecr | RegistryType::Gcr, Some(url)) => match namespace {
            Some(ns) => format!("{}/{}/{}", url, ns, image),
            None => format!("{}/{}", url, image),
        },
        _ => local_tag.to_string(),
    }
}

/// The command that loads a local image into a cluster runtime.
pub fn cluster_load_command(cluster: ClusterType, image: &str) -> CommandSpec {
    match cluster {
        ClusterType::Minikube => CommandSpec::new("minikube", ["image", "load", image]),
        ClusterType::Kind => CommandSpec::new("kind", ["load", "docker-image", image]),
        ClusterType::K3d => CommandSpec::new("k3d", ["image", "import", image]),
    }
}

pub struct RegistryPublisher {
    runner: Arc<dyn CommandRunner>,
    cluster_type: ClusterType,
    ecr_region: String,
}

impl RegistryPublisher {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        cluster_type: ClusterType,
        ecr_region: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            cluster_type,
            ecr_region: ecr_region.into(),
        }
    }

    /// Publish `local_tag` according to `registry`.
    pub async fn publish(
        &self,
        local_tag: &str,
        registry: &RegistryConfig,
        log: &BuildLog,
    ) -> Result<PublishOutcome, PublishError> {
        if registry.registry_type == RegistryType::Local {
            log.line(format!("Auto-loading {} into local cluster...", local_tag))
                .await;
            return self.load_into_cluster(local_tag, log).await;
        }

        log.line(format!(
            "Pushing {} to {} registry...",
            local_tag, registry.registry_type
        ))
        .await;

        if let Err(e) = self.login(registry).await {
            tracing::warn!(build_id = %log.build_id(), error = %e, "Registry login failed");
            if registry.use_local_fallback {
                log.line("Registry login failed, falling back to local load")
                    .await;
                return self.load_into_cluster(local_tag, log).await;
            }
            log.line(format!("{}", e)).await;
            return Err(e);
        }

        let target = construct_remote_tag(local_tag, registry);
        match self.tag_and_push(local_tag, &target).await {
            Ok(()) => {
                log.line(format!("Successfully pushed {}", target)).await;
                tracing::info!(build_id = %log.build_id(), image = %target, "Image pushed");
                Ok(PublishOutcome::pushed(&target, registry.registry_type))
            }
            Err(reason) => {
                log.line(format!("Push failed: {}", reason)).await;
                if registry.use_local_fallback {
                    log.line("Push failed, falling back to local load").await;
                    return self.load_into_cluster(local_tag, log).await;
                }
                Err(PublishError::Push {
                    image: target,
                    reason,
                })
            }
        }
    }

    /// Load an image into the configured local cluster runtime.
    pub async fn load_into_cluster(
        &self,
        image: &str,
        log: &BuildLog,
    ) -> Result<PublishOutcome, PublishError> {
        let cluster = self.cluster_type;
        log.line(format!("Loading {} into {}...", image, cluster)).await;

        if let Err(reason) = self.run_checked(&cluster_load_command(cluster, image)).await {
            log.line(format!("Error loading image: {}", reason)).await;
            return Err(PublishError::ClusterLoad {
                image: image.to_string(),
                cluster: cluster.to_string(),
                reason,
            });
        }

        log.line(format!("Successfully loaded into {} cluster", cluster))
            .await;
        tracing::info!(build_id = %log.build_id(), image, cluster = %cluster, "Image loaded into cluster");
        Ok(PublishOutcome::loaded(image, cluster))
    }

    async fn login(&self, registry: &RegistryConfig) -> Result<(), PublishError> {
        self.login_reason(registry)
            .await
            .map_err(|reason| PublishError::Login {
                registry: registry.registry_type.to_string(),
                reason,
            })
    }

    async fn login_reason(&self, registry: &RegistryConfig) -> Result<(), String> {
        match registry.registry_type {
            RegistryType::Dockerhub => {
                let (Some(user), Some(password)) =
                    (registry.username.as_deref(), registry.password())
                else {
                    return Err("username and password are required".to_string());
                };
                let spec = CommandSpec::new("docker", ["login", "-u", user, "--password-stdin"])
                    .with_stdin(password);
                self.run_checked(&spec).await.map(|_| ())
            }
            RegistryType::Ecr => {
                let Some(url) = registry.url.as_deref().filter(|u| !u.is_empty()) else {
                    return Err("registry url is required".to_string());
                };
                let token = self.run_checked(&self.ecr_password_command()).await?;
                let spec = CommandSpec::new(
                    "docker",
                    ["login", "--username", "AWS", "--password-stdin", url],
                )
                .with_stdin(token.stdout.trim());
                self.run_checked(&spec).await.map(|_| ())
            }
            // GCR relies on the docker credential helper.
            RegistryType::Gcr | RegistryType::Local => Ok(()),
        }
    }

    async fn tag_and_push(&self, local_tag: &str, target: &str) -> Result<(), String> {
        if local_tag != target {
            self.run_checked(&CommandSpec::new("docker", ["tag", local_tag, target]))
                .await?;
        }
        self.run_checked(&CommandSpec::new("docker", ["push", target]))
            .await
            .map(|_| ())
    }

    fn ecr_password_command(&self) -> CommandSpec {
        CommandSpec::new(
            "aws",
            ["ecr", "get-login-password", "--region", self.ecr_region.as_str()],
        )
    }

    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.runner.output(spec).await
    }

    /// Run and treat a non-zero exit as an error carrying its output.
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput, String> {
        let out = self.run(spec).await.map_err(|e| e.to_string())?;
        check(out)
    }

    /// Check that the registry described by `registry` is reachable with
    /// its credentials. Never pushes anything.
    pub async fn test_connection(&self, registry: &RegistryConfig) -> RegistryTestResult {
        match registry.registry_type {
            RegistryType::Local => match self.run(&CommandSpec::new("docker", ["info"])).await {
                Ok(out) if out.success() => RegistryTestResult::success(
                    "Docker is available. Local registry mode enabled.",
                ),
                Ok(_) => RegistryTestResult::failed("Docker is not available"),
                Err(e) => RegistryTestResult::failed(format!("Required command not found: {}", e)),
            },
            RegistryType::Dockerhub => {
                let (Some(user), Some(password)) = (registry.username.as_deref(), registry.password())
                else {
                    return RegistryTestResult::failed(
                        "Username and password are required for Docker Hub",
                    );
                };
                let spec = CommandSpec::new("docker", ["login", "-u", user, "--password-stdin"])
                    .with_stdin(password);
                let result = self.run(&spec).await;
                if let Err(e) = self.run(&CommandSpec::new("docker", ["logout"])).await {
                    tracing::warn!(error = %e, "docker logout failed after registry test");
                }
                match result {
                    Ok(out) if out.success() => {
                        RegistryTestResult::success("Successfully authenticated with Docker Hub")
                    }
                    Ok(out) => RegistryTestResult::failed(format!(
                        "Docker Hub authentication failed: {}",
                        out.error_text()
                    )),
                    Err(e) => RegistryTestResult::failed(format!("Registry test failed: {}", e)),
                }
            }
            RegistryType::Ecr => {
                if registry.url.as_deref().is_none_or(str::is_empty) {
                    return RegistryTestResult::failed("Registry URL is required for ECR");
                }
                match self.run(&self.ecr_password_command()).await {
                    Ok(out) if out.success() => {
                        RegistryTestResult::success("AWS ECR credentials are valid")
                    }
                    Ok(out) => RegistryTestResult::failed(format!(
                        "AWS ECR authentication failed: {}",
                        out.error_text()
                    )),
                    Err(e) => RegistryTestResult::failed(format!("Registry test failed: {}", e)),
                }
            }
            RegistryType::Gcr => {
                if registry.url.as_deref().is_none_or(str::is_empty) {
                    return RegistryTestResult::failed("Registry URL is required for GCR");
                }
                RegistryTestResult::success("GCR uses the docker credential helper. Assuming success.")
            }
        }
    }
}

/// Turn a non-zero exit into its error text.
fn check(out: CommandOutput) -> Result<CommandOutput, String> {
    if out.success() {
        Ok(out)
    } else {
        Err(out.error_text())
    }
}
