//! ExecutionStore implementation for LibSqlBackend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params;
use uuid::Uuid;

use super::{
    EXECUTION_COLUMNS, LibSqlBackend, fmt_opt_ts, fmt_ts, get_i64, get_text, opt_text,
    row_to_execution,
};
use crate::db::ExecutionStore;
use crate::error::DatabaseError;
use crate::history::{ExecutionRecord, ExecutionStats, ExecutionStatus, ToolUsage};

#[async_trait]
impl ExecutionStore for LibSqlBackend {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        let result = record.result.as_ref().map(|v| v.to_string());
        conn.execute(
            r#"
            INSERT INTO executions (
                id, tool_name, tool_path, target, status,
                start_time, end_time, result, logs, arguments
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                record.id.to_string(),
                record.tool_name.as_str(),
                record.tool_path.as_str(),
                opt_text(record.target.as_deref()),
                record.status.as_str(),
                fmt_ts(&record.start_time),
                fmt_opt_ts(&record.end_time),
                opt_text(result.as_deref()),
                record.logs.as_str(),
                record.arguments.to_string(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_execution(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_executions(&self, limit: i64) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM executions ORDER BY start_time DESC LIMIT ?1",
                    EXECUTION_COLUMNS
                ),
                params![limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            out.push(row_to_execution(&row)?);
        }
        Ok(out)
    }

    async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        logs: &str,
        result: Option<&serde_json::Value>,
        end_time: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let result = result.map(|v| v.to_string());
        let changed = conn
            .execute(
                r#"
                UPDATE executions
                SET status = ?2, logs = COALESCE(logs, '') || ?3, result = ?4, end_time = ?5
                WHERE id = ?1 AND status = 'running'
                "#,
                params![
                    id.to_string(),
                    status.as_str(),
                    logs,
                    opt_text(result.as_deref()),
                    fmt_ts(&end_time),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(changed > 0)
    }

    async fn stop_execution(&self, id: Uuid, note: &str) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                r#"
                UPDATE executions
                SET status = 'stopped', logs = COALESCE(logs, '') || ?2, end_time = ?3
                WHERE id = ?1 AND status = 'running'
                "#,
                params![id.to_string(), note, fmt_ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(changed > 0)
    }

    async fn execution_stats(&self) -> Result<ExecutionStats, DatabaseError> {
        let conn = self.connect().await?;

        let mut by_status = BTreeMap::new();
        let mut total = 0;
        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM executions GROUP BY status",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            let count = get_i64(&row, 1);
            total += count;
            by_status.insert(get_text(&row, 0), count);
        }

        let mut top_tools = Vec::new();
        let mut rows = conn
            .query(
                r#"
                SELECT tool_name, COUNT(*) AS n FROM executions
                GROUP BY tool_name ORDER BY n DESC, tool_name ASC LIMIT 10
                "#,
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            top_tools.push(ToolUsage {
                tool_name: get_text(&row, 0),
                count: get_i64(&row, 1),
            });
        }

        Ok(ExecutionStats {
            total,
            by_status,
            top_tools,
        })
    }
}
