//! Toolsmith: security tool execution and image build engine.
//!
//! Tools are stored scripts with an optional YAML configuration. Running one
//! schedules a cluster Job in the tool's image; editing one may rebuild that
//! image on a bounded worker pool.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────────┐
//!                    │       ToolsmithApi        │
//!                    └──────┬─────────────┬──────┘
//!                           │             │
//!             ┌─────────────▼───┐   ┌─────▼──────────────┐
//!             │ ExecutionCoord. │   │  BuildCoordinator   │
//!             │  submit / watch │   │ should_build, queue │
//!             └───────┬─────────┘   └─────┬──────────────┘
//!                     │                   │
//!              ┌──────▼──────┐     ┌──────▼──────┐
//!              │ ClusterApi  │◄────│  BuildPool   │
//!              │ (kube Jobs) │     │ local/remote │
//!              └─────────────┘     └──────┬──────┘
//!                                         │
//!                   ┌─────────────────────▼─────────────────┐
//!                   │ Database (postgres | libsql)           │
//!                   │ executions, build_jobs, tools, registry│
//!                   └────────────────────────────────────────┘
//! ```

pub mod build;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod orchestrator;
pub mod testing;
pub mod tools;

pub use config::Config;
pub use error::{Error, Result};
