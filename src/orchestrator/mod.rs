//! Cluster orchestration for tool executions, plus the HTTP surface.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   ToolsmithApi                        │
//! │   POST /api/executions/execute[/stream]               │
//! │   POST /api/executions/execute/stop/{id}              │
//! │   GET  /api/executions[/{id}|/stats]                  │
//! │   GET  /api/builds/context/{build_id}                 │
//! │   GET|POST /api/settings/registry[/test|/build/..]    │
//! └───────────────┬──────────────────────┬───────────────┘
//!                 │                      │
//!      ExecutionCoordinator        BuildCoordinator
//!     (one Job per execution)     (see crate::build)
//!                 │
//!            ClusterApi ──► KubeCluster (kube-rs)
//! ```

pub mod api;
pub mod cluster;
pub mod job_manager;
pub mod job_spec;

pub use api::{ApiState, ToolsmithApi};
pub use cluster::{ClusterApi, KubeCluster};
pub use job_manager::{ExecutionCoordinator, ExecutionEvent, SyncRunResponse, ToolRef};
