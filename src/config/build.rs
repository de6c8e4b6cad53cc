use std::path::PathBuf;
use std::time::Duration;

use crate::config::helpers::{
    optional_env, parse_millis_env, parse_optional_env, parse_secs_env, parse_string_env,
};
use crate::error::ConfigError;

/// Which build backend the coordinator dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildBackendKind {
    /// Remote when running inside the cluster, local otherwise.
    #[default]
    Auto,
    Local,
    Remote,
}

impl std::str::FromStr for BuildBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "local" | "docker" => Ok(Self::Local),
            "remote" | "kaniko" => Ok(Self::Remote),
            _ => Err(format!(
                "invalid build backend '{}', expected 'auto', 'local' or 'remote'",
                s
            )),
        }
    }
}

/// Image build and registry configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Registry host that cluster nodes pull from. Prefix of every generated tag.
    pub registry: String,
    /// Registry host the in-cluster builder pushes to.
    pub push_registry: String,
    /// Directory holding prepared context tarballs.
    pub context_dir: PathBuf,
    /// Base URL the in-cluster init container uses to reach this service.
    pub backend_url: String,
    pub kaniko_image: String,
    pub context_init_image: String,
    /// Bounded wait for the build pod to appear.
    pub pod_wait: Duration,
    pub pod_poll_interval: Duration,
    /// Grace period for the Job status to settle after the log watch ends.
    pub completion_grace: Duration,
    /// Number of concurrent build workers.
    pub workers: usize,
    pub backend: BuildBackendKind,
    /// Region passed to the cloud CLI for ECR logins.
    pub ecr_region: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            registry: "localhost:5000".to_string(),
            push_registry: "localhost:5000".to_string(),
            context_dir: PathBuf::from("/tmp/build-contexts"),
            backend_url: "http://localhost:8001".to_string(),
            kaniko_image: "gcr.io/kaniko-project/executor:latest".to_string(),
            context_init_image: "busybox:latest".to_string(),
            pod_wait: Duration::from_secs(120),
            pod_poll_interval: Duration::from_secs(2),
            completion_grace: Duration::from_secs(3),
            workers: 4,
            backend: BuildBackendKind::default(),
            ecr_region: "us-east-1".to_string(),
        }
    }
}

impl BuildConfig {
    pub(crate) fn resolve(api_port: u16) -> Result<Self, ConfigError> {
        let registry = parse_string_env("DOCKER_REGISTRY", "localhost:5000")?;
        let push_registry = parse_string_env("DOCKER_REGISTRY_PUSH", registry.clone())?;

        let backend_url = match optional_env("BACKEND_INTERNAL_URL")? {
            Some(url) => url,
            None => {
                let host = parse_string_env("HOSTNAME", "localhost")?;
                format!("{}:{}", host, api_port)
            }
        };
        let backend_url = if backend_url.contains("://") {
            backend_url
        } else {
            format!("http://{}", backend_url)
        };

        let backend = match optional_env("BUILD_BACKEND")? {
            Some(s) => s.parse().map_err(|e| ConfigError::InvalidValue {
                key: "BUILD_BACKEND".to_string(),
                message: e,
            })?,
            None => BuildBackendKind::default(),
        };

        let workers: usize = parse_optional_env("BUILD_WORKERS", 4)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BUILD_WORKERS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            registry,
            push_registry,
            context_dir: PathBuf::from(parse_string_env(
                "BUILD_CONTEXT_DIR",
                "/tmp/build-contexts",
            )?),
            backend_url: backend_url.trim_end_matches('/').to_string(),
            kaniko_image: parse_string_env(
                "KANIKO_IMAGE",
                "gcr.io/kaniko-project/executor:latest",
            )?,
            context_init_image: parse_string_env("CONTEXT_INIT_IMAGE", "busybox:latest")?,
            pod_wait: parse_secs_env("BUILD_POD_WAIT", 120)?,
            pod_poll_interval: parse_millis_env("BUILD_POD_POLL_MS", 2000)?,
            completion_grace: parse_secs_env("BUILD_COMPLETION_GRACE", 3)?,
            workers,
            backend,
            ecr_region: parse_string_env("ECR_REGION", "us-east-1")?,
        })
    }

    /// Whether builds should run in-cluster, given where this process lives.
    pub fn use_remote(&self, in_cluster: bool) -> bool {
        match self.backend {
            BuildBackendKind::Auto => in_cluster,
            BuildBackendKind::Local => false,
            BuildBackendKind::Remote => true,
        }
    }
}
