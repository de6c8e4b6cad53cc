use std::time::Duration;

use crate::config::helpers::{
    optional_env, parse_bool_env, parse_millis_env, parse_optional_env, parse_secs_env,
    parse_string_env,
};
use crate::error::ConfigError;

/// Local cluster flavour, used to pick the "load image" command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterType {
    #[default]
    Minikube,
    Kind,
    K3d,
}

impl ClusterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minikube => "minikube",
            Self::Kind => "kind",
            Self::K3d => "k3d",
        }
    }
}

impl std::fmt::Display for ClusterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ClusterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minikube" => Ok(Self::Minikube),
            "kind" => Ok(Self::Kind),
            "k3d" | "k3s" => Ok(Self::K3d),
            _ => Err(format!(
                "invalid cluster type '{}', expected 'minikube', 'kind' or 'k3d'",
                s
            )),
        }
    }
}

/// Cluster scheduling configuration for tool executions.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Namespace all jobs are created in.
    pub namespace: String,
    /// Ceiling for synchronous executions.
    pub job_timeout: Duration,
    /// Pod-appear ceiling for synchronous callers that wait on a pod.
    pub pod_wait: Duration,
    /// Pod-appear ceiling for streaming executions.
    pub pod_wait_async: Duration,
    /// Poll cadence for job status and log tailing.
    pub poll_interval: Duration,
    /// `ttlSecondsAfterFinished` stamped on every job.
    pub job_ttl_secs: i32,
    /// Local cluster flavour.
    pub cluster_type: ClusterType,
    /// Whether this process runs inside the cluster.
    pub in_cluster: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "security-platform".to_string(),
            job_timeout: Duration::from_secs(120),
            pod_wait: Duration::from_secs(30),
            pod_wait_async: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            job_ttl_secs: 600,
            cluster_type: ClusterType::default(),
            in_cluster: false,
        }
    }
}

impl ClusterConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let cluster_type = match optional_env("K8S_CLUSTER_TYPE")? {
            Some(s) => s.parse().map_err(|e| ConfigError::InvalidValue {
                key: "K8S_CLUSTER_TYPE".to_string(),
                message: e,
            })?,
            None => ClusterType::default(),
        };

        Ok(Self {
            namespace: parse_string_env("K8S_NAMESPACE", "security-platform")?,
            job_timeout: parse_secs_env("K8S_JOB_TIMEOUT", 120)?,
            pod_wait: parse_secs_env("K8S_POD_WAIT", 30)?,
            pod_wait_async: parse_secs_env("K8S_POD_WAIT_ASYNC", 60)?,
            poll_interval: parse_millis_env("K8S_POLL_INTERVAL_MS", 1000)?,
            job_ttl_secs: parse_optional_env("K8S_JOB_TTL", 600)?,
            cluster_type,
            in_cluster: parse_bool_env(
                "K8S_IN_CLUSTER",
                optional_env("KUBERNETES_SERVICE_HOST")?.is_some(),
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::ENV_MUTEX;

    #[test]
    fn cluster_type_parses_aliases() {
        assert_eq!("Kind".parse::<ClusterType>().unwrap(), ClusterType::Kind);
        assert_eq!("k3s".parse::<ClusterType>().unwrap(), ClusterType::K3d);
        assert!("docker-desktop".parse::<ClusterType>().is_err());
    }

    #[test]
    fn resolve_reads_timeouts() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("K8S_JOB_TIMEOUT", "5");
            std::env::set_var("K8S_CLUSTER_TYPE", "kind");
        }
        let cfg = ClusterConfig::resolve().unwrap();
        assert_eq!(cfg.job_timeout, Duration::from_secs(5));
        assert_eq!(cfg.cluster_type, ClusterType::Kind);
        unsafe {
            std::env::remove_var("K8S_JOB_TIMEOUT");
            std::env::remove_var("K8S_CLUSTER_TYPE");
        }
    }
}
