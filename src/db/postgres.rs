//! PostgreSQL backend for the Database trait.
//!
//! Every method checks a connection out of the deadpool pool for the span
//! of one logical operation; it returns to the pool when dropped.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use secrecy::SecretString;
use tokio_postgres::NoTls;
use uuid::Uuid;

use crate::build::RegistryConfig;
use crate::config::DatabaseConfig;
use crate::db::{
    BuildJobStore, Database, ExecutionStore, REGISTRY_CONFIG_ROW, RegistryConfigStore, ToolStore,
    build_status_guard,
};
use crate::error::DatabaseError;
use crate::history::{
    BuildJobRecord, BuildStatus, ExecutionRecord, ExecutionStats, ExecutionStatus, ToolUsage,
};
use crate::tools::{CallingConvention, ToolDefinition};

const EXECUTION_COLUMNS: &str = "\
    id, tool_name, tool_path, target, status, \
    start_time, end_time, result, logs, arguments";

const BUILD_JOB_COLUMNS: &str = "id, tool_id, status, logs, image_tag, created_at, updated_at";

/// PostgreSQL database backend.
pub struct PgBackend {
    pool: Pool,
}

impl PgBackend {
    /// Create a new PostgreSQL backend from configuration.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Get a connection from the pool.
    pub async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }
}

fn row_to_execution(row: &tokio_postgres::Row) -> Result<ExecutionRecord, DatabaseError> {
    let status: String = row.get("status");
    Ok(ExecutionRecord {
        id: row.get("id"),
        tool_name: row.get("tool_name"),
        tool_path: row.get("tool_path"),
        target: row.get("target"),
        status: status.parse().map_err(DatabaseError::Serialization)?,
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        result: row.get("result"),
        logs: row.get("logs"),
        arguments: row.get("arguments"),
    })
}

fn row_to_build_job(row: &tokio_postgres::Row) -> Result<BuildJobRecord, DatabaseError> {
    let status: String = row.get("status");
    Ok(BuildJobRecord {
        id: row.get("id"),
        tool_id: row.get("tool_id"),
        status: status.parse().map_err(DatabaseError::Serialization)?,
        logs: row.get("logs"),
        image_tag: row.get("image_tag"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// ==================== Database (supertrait) ====================

#[async_trait]
impl Database for PgBackend {
    /// Run database migrations (embedded via refinery).
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        use refinery::embed_migrations;
        embed_migrations!("migrations");

        let mut client = self.pool.get().await?;
        migrations::runner()
            .run_async(&mut **client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }
}

// ==================== ExecutionStore ====================

#[async_trait]
impl ExecutionStore for PgBackend {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO executions (
                id, tool_name, tool_path, target, status,
                start_time, end_time, result, logs, arguments
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
            &[
                &record.id,
                &record.tool_name,
                &record.tool_path,
                &record.target,
                &record.status.as_str(),
                &record.start_time,
                &record.end_time,
                &record.result,
                &record.logs,
                &record.arguments,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM executions WHERE id = $1", EXECUTION_COLUMNS),
                &[&id],
            )
            .await?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn list_executions(&self, limit: i64) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM executions ORDER BY start_time DESC LIMIT $1",
                    EXECUTION_COLUMNS
                ),
                &[&limit],
            )
            .await?;
        rows.iter().map(row_to_execution).collect()
    }

    async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        logs: &str,
        result: Option<&serde_json::Value>,
        end_time: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let changed = conn
            .execute(
                r#"
                UPDATE executions
                SET status = $2, logs = COALESCE(logs, '') || $3, result = $4, end_time = $5
                WHERE id = $1 AND status = 'running'
                "#,
                &[&id, &status.as_str(), &logs, &result, &end_time],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn stop_execution(&self, id: Uuid, note: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let changed = conn
            .execute(
                r#"
                UPDATE executions
                SET status = 'stopped', logs = COALESCE(logs, '') || $2, end_time = NOW()
                WHERE id = $1 AND status = 'running'
                "#,
                &[&id, &note],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn execution_stats(&self) -> Result<ExecutionStats, DatabaseError> {
        let conn = self.conn().await?;

        let mut by_status = BTreeMap::new();
        let mut total = 0;
        for row in conn
            .query(
                "SELECT status, COUNT(*) AS n FROM executions GROUP BY status",
                &[],
            )
            .await?
        {
            let n: i64 = row.get("n");
            total += n;
            by_status.insert(row.get::<_, String>("status"), n);
        }

        let top_tools = conn
            .query(
                r#"
                SELECT tool_name, COUNT(*) AS n FROM executions
                GROUP BY tool_name ORDER BY n DESC, tool_name ASC LIMIT 10
                "#,
                &[],
            )
            .await?
            .iter()
            .map(|row| ToolUsage {
                tool_name: row.get("tool_name"),
                count: row.get("n"),
            })
            .collect();

        Ok(ExecutionStats {
            total,
            by_status,
            top_tools,
        })
    }
}

// ==================== BuildJobStore ====================

#[async_trait]
impl BuildJobStore for PgBackend {
    async fn create_build_job(&self, job: &BuildJobRecord) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO build_jobs (id, tool_id, status, logs, image_tag, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            &[
                &job.id,
                &job.tool_id,
                &job.status.as_str(),
                &job.logs,
                &job.image_tag,
                &job.created_at,
                &job.updated_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_build_job(&self, id: Uuid) -> Result<Option<BuildJobRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM build_jobs WHERE id = $1", BUILD_JOB_COLUMNS),
                &[&id],
            )
            .await?;
        row.as_ref().map(row_to_build_job).transpose()
    }

    async fn append_build_log(&self, id: Uuid, text: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            UPDATE build_jobs
            SET logs = COALESCE(logs, '') || $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('PENDING', 'RUNNING')
            "#,
            &[&id, &text],
        )
        .await?;
        Ok(())
    }

    async fn update_build_status(
        &self,
        id: Uuid,
        status: BuildStatus,
        image_tag: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let Some(guard) = build_status_guard(status) else {
            return Ok(false);
        };
        let conn = self.conn().await?;
        let changed = conn
            .execute(
                &format!(
                    r#"
                    UPDATE build_jobs
                    SET status = $2, image_tag = COALESCE($3, image_tag), updated_at = NOW()
                    WHERE id = $1 AND status IN ({})
                    "#,
                    guard
                ),
                &[&id, &status.as_str(), &image_tag],
            )
            .await?;
        Ok(changed > 0)
    }
}

// ==================== ToolStore ====================

#[async_trait]
impl ToolStore for PgBackend {
    async fn get_tool(&self, id: &str) -> Result<Option<ToolDefinition>, DatabaseError> {
        let conn = self.conn().await?;
        let Some(row) = conn
            .query_opt(
                r#"
                SELECT id, name, category, script, configuration, calling_convention, updated_at
                FROM tools WHERE id = $1
                "#,
                &[&id],
            )
            .await?
        else {
            return Ok(None);
        };

        let calling_convention = row
            .get::<_, Option<String>>("calling_convention")
            .map(|s| s.parse::<CallingConvention>())
            .transpose()
            .map_err(DatabaseError::Serialization)?;

        Ok(Some(ToolDefinition {
            id: row.get("id"),
            name: row.get("name"),
            category: row.get("category"),
            script: row.get("script"),
            configuration: row.get("configuration"),
            calling_convention,
            updated_at: row.get("updated_at"),
        }))
    }

    async fn save_tool(&self, tool: &ToolDefinition) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let convention = tool.calling_convention.map(|c| c.as_str());
        conn.execute(
            r#"
            INSERT INTO tools (id, name, category, script, configuration, calling_convention, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                category = EXCLUDED.category,
                script = EXCLUDED.script,
                configuration = EXCLUDED.configuration,
                calling_convention = EXCLUDED.calling_convention,
                updated_at = EXCLUDED.updated_at
            "#,
            &[
                &tool.id,
                &tool.name,
                &tool.category,
                &tool.script,
                &tool.configuration,
                &convention,
                &tool.updated_at,
            ],
        )
        .await?;
        Ok(())
    }
}

// ==================== RegistryConfigStore ====================

#[async_trait]
impl RegistryConfigStore for PgBackend {
    async fn get_registry_config(&self) -> Result<Option<RegistryConfig>, DatabaseError> {
        let conn = self.conn().await?;
        let Some(row) = conn
            .query_opt(
                r#"
                SELECT registry_type, url, username, password, namespace, use_local_fallback
                FROM registry_config WHERE id = $1
                "#,
                &[&REGISTRY_CONFIG_ROW],
            )
            .await?
        else {
            return Ok(None);
        };

        let registry_type: String = row.get("registry_type");
        Ok(Some(RegistryConfig {
            registry_type: registry_type
                .parse()
                .map_err(DatabaseError::Serialization)?,
            url: row.get("url"),
            username: row.get("username"),
            password: row
                .get::<_, Option<String>>("password")
                .filter(|p| !p.is_empty())
                .map(SecretString::from),
            namespace: row.get("namespace"),
            use_local_fallback: row.get("use_local_fallback"),
        }))
    }

    async fn save_registry_config(&self, config: &RegistryConfig) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO registry_config (
                id, registry_type, url, username, password, namespace, use_local_fallback, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (id) DO UPDATE SET
                registry_type = EXCLUDED.registry_type,
                url = EXCLUDED.url,
                username = EXCLUDED.username,
                password = EXCLUDED.password,
                namespace = EXCLUDED.namespace,
                use_local_fallback = EXCLUDED.use_local_fallback,
                updated_at = NOW()
            "#,
            &[
                &REGISTRY_CONFIG_ROW,
                &config.registry_type.as_str(),
                &config.url,
                &config.username,
                &config.password(),
                &config.namespace,
                &config.use_local_fallback,
            ],
        )
        .await?;
        Ok(())
    }
}
