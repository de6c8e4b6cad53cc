//! Tool image builds.
//!
//! ```text
//!   BuildCoordinator ──► BuildQueue ──► BuildPool workers
//!                                            │
//!                              ┌─────────────┴─────────────┐
//!                         LocalBuilder                RemoteBuilder
//!                   (docker build + publish)   (context tarball + kaniko Job)
//!                              │
//!                      RegistryPublisher
//!                 (push, or load into the cluster)
//! ```
//!
//! Every build is a `build_jobs` row moving PENDING → RUNNING →
//! SUCCESS/FAILED, with its progress appended to the row's log.

pub mod backend;
pub mod coordinator;
pub mod dockerfile;
pub mod local;
pub mod log;
pub mod pool;
pub mod process;
pub mod publisher;
pub mod registry;
pub mod remote;
pub mod success;

use std::sync::Arc;

pub use backend::{BuildBackend, BuildRequest};
pub use coordinator::{BuildCoordinator, config_changed, should_build};
pub use local::LocalBuilder;
pub use log::BuildLog;
pub use pool::{BuildPool, BuildQueue};
pub use process::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use publisher::{PublishOutcome, RegistryPublisher, RegistryTestResult};
pub use registry::{RegistryConfig, RegistryConfigView, RegistryType};
pub use remote::RemoteBuilder;
pub use success::SuccessPolicy;

use crate::config::{BuildConfig, ClusterConfig};
use crate::db::Database;
use crate::orchestrator::cluster::ClusterApi;

/// Pick the backend for this deployment: in-cluster builds when running
/// inside the cluster (or when forced), the local daemon otherwise.
pub fn select_backend(
    build: &BuildConfig,
    cluster: &ClusterConfig,
    api: Arc<dyn ClusterApi>,
    runner: Arc<dyn CommandRunner>,
    publisher: Arc<RegistryPublisher>,
    db: Arc<dyn Database>,
) -> Arc<dyn BuildBackend> {
    if build.use_remote(cluster.in_cluster) {
        Arc::new(RemoteBuilder::new(api, db, build.clone(), cluster.job_ttl_secs))
    } else {
        Arc::new(LocalBuilder::new(runner, publisher, db))
    }
}
