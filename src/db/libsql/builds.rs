//! BuildJobStore implementation for LibSqlBackend.

use async_trait::async_trait;
use chrono::Utc;
use libsql::params;
use uuid::Uuid;

use super::{BUILD_JOB_COLUMNS, LibSqlBackend, fmt_ts, opt_text, row_to_build_job};
use crate::db::{BuildJobStore, build_status_guard};
use crate::error::DatabaseError;
use crate::history::{BuildJobRecord, BuildStatus};

#[async_trait]
impl BuildJobStore for LibSqlBackend {
    async fn create_build_job(&self, job: &BuildJobRecord) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO build_jobs (id, tool_id, status, logs, image_tag, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                job.id.to_string(),
                job.tool_id.as_str(),
                job.status.as_str(),
                job.logs.as_str(),
                opt_text(job.image_tag.as_deref()),
                fmt_ts(&job.created_at),
                fmt_ts(&job.updated_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn get_build_job(&self, id: Uuid) -> Result<Option<BuildJobRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {} FROM build_jobs WHERE id = ?1", BUILD_JOB_COLUMNS),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_build_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn append_build_log(&self, id: Uuid, text: &str) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            UPDATE build_jobs
            SET logs = COALESCE(logs, '') || ?2, updated_at = ?3
            WHERE id = ?1 AND status IN ('PENDING', 'RUNNING')
            "#,
            params![id.to_string(), text, fmt_ts(&Utc::now())],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
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
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                &format!(
                    r#"
                    UPDATE build_jobs
                    SET status = ?2, image_tag = COALESCE(?3, image_tag), updated_at = ?4
                    WHERE id = ?1 AND status IN ({})
                    "#,
                    guard
                ),
                params![
                    id.to_string(),
                    status.as_str(),
                    opt_text(image_tag),
                    fmt_ts(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(changed > 0)
    }
}
