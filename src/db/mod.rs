//! Database abstraction layer.
//!
//! Provides a backend-agnostic `Database` trait over every persistence
//! operation the engine needs. Two implementations exist behind feature
//! flags:
//!
//! - `postgres` (default): `deadpool-postgres` + `tokio-postgres`
//! - `libsql`: embedded libSQL, used by tests and single-node installs
//!
//! Both backends acquire a connection per logical operation and release it
//! when the operation's scope ends.

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "libsql")]
pub mod libsql;

#[cfg(feature = "libsql")]
pub mod libsql_migrations;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::build::RegistryConfig;
use crate::error::DatabaseError;
use crate::history::{BuildJobRecord, BuildStatus, ExecutionRecord, ExecutionStats, ExecutionStatus};
use crate::tools::ToolDefinition;

/// Create a database backend from configuration, run migrations, and return it.
pub async fn connect_from_config(
    config: &crate::config::DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        #[cfg(feature = "libsql")]
        crate::config::DatabaseBackend::LibSql => {
            let default_path = crate::config::default_libsql_path();
            let db_path = config.libsql_path.as_deref().unwrap_or(&default_path);
            let backend = libsql::LibSqlBackend::new_local(db_path).await?;
            backend.run_migrations().await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "postgres")]
        crate::config::DatabaseBackend::Postgres => {
            let pg = postgres::PgBackend::new(config).await?;
            pg.run_migrations().await?;
            Ok(Arc::new(pg))
        }
        #[allow(unreachable_patterns)]
        other => Err(DatabaseError::Pool(format!(
            "Database backend {:?} is not compiled in. Enable the matching cargo feature.",
            other
        ))),
    }
}

// ==================== Sub-traits ====================
//
// Each sub-trait groups related persistence methods. The `Database`
// supertrait combines them; leaf consumers depend on a single sub-trait.

/// Tool execution records.
///
/// Terminal rows are never rewritten: `finish_execution` and
/// `stop_execution` only touch rows whose status is still `running`, and
/// report whether they did.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError>;
    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, DatabaseError>;
    async fn list_executions(&self, limit: i64) -> Result<Vec<ExecutionRecord>, DatabaseError>;
    /// Move a running execution to `status`, appending `logs`.
    async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        logs: &str,
        result: Option<&serde_json::Value>,
        end_time: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
    /// Mark a running execution `stopped`, appending `note` to its logs.
    async fn stop_execution(&self, id: Uuid, note: &str) -> Result<bool, DatabaseError>;
    async fn execution_stats(&self) -> Result<ExecutionStats, DatabaseError>;
}

/// Image build job records.
#[async_trait]
pub trait BuildJobStore: Send + Sync {
    async fn create_build_job(&self, job: &BuildJobRecord) -> Result<(), DatabaseError>;
    async fn get_build_job(&self, id: Uuid) -> Result<Option<BuildJobRecord>, DatabaseError>;
    /// Append to a non-terminal job's log. No-op once the job is terminal.
    async fn append_build_log(&self, id: Uuid, text: &str) -> Result<(), DatabaseError>;
    /// Apply a status transition if the current status allows it.
    ///
    /// Returns `false` (and changes nothing) when the transition is illegal,
    /// e.g. any write against a SUCCESS/FAILED row.
    async fn update_build_status(
        &self,
        id: Uuid,
        status: BuildStatus,
        image_tag: Option<&str>,
    ) -> Result<bool, DatabaseError>;
}

/// Tool definitions (owned by the CRUD layer; read here).
#[async_trait]
pub trait ToolStore: Send + Sync {
    async fn get_tool(&self, id: &str) -> Result<Option<ToolDefinition>, DatabaseError>;
    async fn save_tool(&self, tool: &ToolDefinition) -> Result<(), DatabaseError>;
}

/// The singleton registry configuration row.
#[async_trait]
pub trait RegistryConfigStore: Send + Sync {
    async fn get_registry_config(&self) -> Result<Option<RegistryConfig>, DatabaseError>;
    /// Replace the active configuration (single-row upsert).
    async fn save_registry_config(&self, config: &RegistryConfig) -> Result<(), DatabaseError>;
}

/// Backend-agnostic database supertrait.
#[async_trait]
pub trait Database:
    ExecutionStore + BuildJobStore + ToolStore + RegistryConfigStore + Send + Sync
{
    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}

/// Primary key of the single registry configuration row.
pub(crate) const REGISTRY_CONFIG_ROW: &str = "active";

/// Build statuses a row may currently hold for `target` to be applied, as
/// a quoted SQL list.
pub(crate) fn build_status_guard(target: BuildStatus) -> Option<String> {
    let allowed = BuildStatus::predecessors(target);
    if allowed.is_empty() {
        return None;
    }
    Some(
        allowed
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_guard_lists_predecessors() {
        assert_eq!(
            build_status_guard(BuildStatus::Failed).as_deref(),
            Some("'PENDING', 'RUNNING'")
        );
        assert_eq!(build_status_guard(BuildStatus::Pending), None);
    }
}
