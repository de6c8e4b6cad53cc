//! Schema for the libSQL backend.
//!
//! Mirrors `migrations/V1__initial.sql` in SQLite dialect. Every statement
//! is idempotent so the whole batch runs on each startup.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tools (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    script TEXT NOT NULL DEFAULT '',
    configuration TEXT,
    calling_convention TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    tool_name TEXT NOT NULL,
    tool_path TEXT NOT NULL,
    target TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    start_time TEXT NOT NULL,
    end_time TEXT,
    result TEXT,
    logs TEXT NOT NULL DEFAULT '',
    arguments TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_executions_start_time ON executions(start_time);
CREATE INDEX IF NOT EXISTS idx_executions_tool_name ON executions(tool_name);

CREATE TABLE IF NOT EXISTS build_jobs (
    id TEXT PRIMARY KEY,
    tool_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    logs TEXT NOT NULL DEFAULT '',
    image_tag TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_build_jobs_tool_id ON build_jobs(tool_id);

CREATE TABLE IF NOT EXISTS registry_config (
    id TEXT PRIMARY KEY,
    registry_type TEXT NOT NULL DEFAULT 'local',
    url TEXT,
    username TEXT,
    password TEXT,
    namespace TEXT,
    use_local_fallback INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL
);
"#;
