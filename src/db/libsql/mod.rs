//! libSQL backend for the Database trait.
//!
//! Embedded SQLite-compatible storage. Supports two modes:
//! - Local embedded (file-based, no server needed)
//! - In-memory (for testing)

mod builds;
mod executions;
mod registry;
mod tools;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase};

use crate::db::Database;
use crate::db::libsql_migrations;
use crate::error::DatabaseError;
use crate::history::{BuildJobRecord, ExecutionRecord};

/// Explicit column list for the executions table (matches `row_to_execution`).
pub(crate) const EXECUTION_COLUMNS: &str = "\
    id, tool_name, tool_path, target, status, \
    start_time, end_time, result, logs, arguments";

/// Explicit column list for the build_jobs table (matches `row_to_build_job`).
pub(crate) const BUILD_JOB_COLUMNS: &str =
    "id, tool_id, status, logs, image_tag, created_at, updated_at";

/// libSQL database backend.
pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
}

impl LibSqlBackend {
    /// Create a new local embedded database.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {}", e))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Create a new in-memory database (for testing).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {}", e))
            })?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Create a new connection to the database.
    ///
    /// Sets `PRAGMA busy_timeout = 5000` on every connection so concurrent
    /// writers wait instead of failing with "database is locked".
    pub async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {}", e)))?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy_timeout: {}", e)))?;
        Ok(conn)
    }
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.query("PRAGMA journal_mode=WAL", ())
            .await
            .map_err(|e| DatabaseError::Migration(format!("Failed to enable WAL mode: {}", e)))?;
        conn.execute_batch(libsql_migrations::SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(format!("libSQL migration failed: {}", e)))?;
        Ok(())
    }
}

// ==================== Helper functions ====================

/// Parse a timestamp string from SQLite into DateTime<Utc>.
///
/// Accepts RFC 3339 (our write format) and the naive forms SQLite's
/// `datetime()` produces.
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(format!("unparseable timestamp: {:?}", s))
}

/// Format a DateTime<Utc> for SQLite storage (RFC 3339, millisecond precision).
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub(crate) fn fmt_opt_ts(dt: &Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Extract a text column, returning empty string for NULL.
pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

/// Extract an optional text column. Preserves empty strings as `Some("")`.
pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

/// Convert an `Option<&str>` to a `libsql::Value` (Text or Null).
pub(crate) fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Extract an i64 column, defaulting to 0.
pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or(0)
}

/// Parse an optional JSON value from a text column.
pub(crate) fn get_opt_json(row: &libsql::Row, idx: i32) -> Option<serde_json::Value> {
    row.get::<String>(idx)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}

/// Parse a timestamp column. NULL or garbage yields the Unix epoch so the
/// problem is visible rather than masked by the current time.
pub(crate) fn get_ts(row: &libsql::Row, idx: i32) -> DateTime<Utc> {
    match row.get::<String>(idx) {
        Ok(s) => match parse_timestamp(&s) {
            Ok(dt) => dt,
            Err(e) => {
                tracing::warn!("Timestamp parse failure at column {}: {}", idx, e);
                DateTime::UNIX_EPOCH
            }
        },
        Err(_) => DateTime::UNIX_EPOCH,
    }
}

pub(crate) fn get_opt_ts(row: &libsql::Row, idx: i32) -> Option<DateTime<Utc>> {
    match row.get::<String>(idx) {
        Ok(s) if s.is_empty() => None,
        Ok(s) => match parse_timestamp(&s) {
            Ok(dt) => Some(dt),
            Err(e) => {
                tracing::warn!("Timestamp parse failure at column {}: {}", idx, e);
                None
            }
        },
        Err(_) => None,
    }
}

fn parse_uuid(row: &libsql::Row, idx: i32) -> Result<uuid::Uuid, DatabaseError> {
    let raw = get_text(row, idx);
    raw.parse()
        .map_err(|e| DatabaseError::Serialization(format!("bad uuid {:?}: {}", raw, e)))
}

// ==================== Row conversion helpers ====================

pub(crate) fn row_to_execution(row: &libsql::Row) -> Result<ExecutionRecord, DatabaseError> {
    let status = get_text(row, 4)
        .parse()
        .map_err(DatabaseError::Serialization)?;
    Ok(ExecutionRecord {
        id: parse_uuid(row, 0)?,
        tool_name: get_text(row, 1),
        tool_path: get_text(row, 2),
        target: get_opt_text(row, 3),
        status,
        start_time: get_ts(row, 5),
        end_time: get_opt_ts(row, 6),
        result: get_opt_json(row, 7),
        logs: get_text(row, 8),
        arguments: get_opt_json(row, 9).unwrap_or_else(|| serde_json::json!({})),
    })
}

pub(crate) fn row_to_build_job(row: &libsql::Row) -> Result<BuildJobRecord, DatabaseError> {
    let status = get_text(row, 2)
        .parse()
        .map_err(DatabaseError::Serialization)?;
    Ok(BuildJobRecord {
        id: parse_uuid(row, 0)?,
        tool_id: get_text(row, 1),
        status,
        logs: get_text(row, 3),
        image_tag: get_opt_text(row, 4),
        created_at: get_ts(row, 5),
        updated_at: get_ts(row, 6),
    })
}
