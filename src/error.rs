//! Error types for toolsmith.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("Pool runtime error: {0}")]
    PoolRuntime(#[from] deadpool_postgres::PoolError),

    #[cfg(feature = "libsql")]
    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Tool lookup and configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("Tool not found: {identifier}")]
    NotFound { identifier: String },

    #[error("Tool {tool_id} has no script code")]
    EmptyScript { tool_id: String },

    #[error("Invalid configuration for tool {tool_id}: {reason}")]
    InvalidConfig { tool_id: String, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors talking to the cluster scheduler.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Cluster rejected job {job_name}: {reason}")]
    JobSubmission { job_name: String, reason: String },

    #[error("Pod for job {job_name} did not appear within {waited:?}")]
    PodTimeout { job_name: String, waited: Duration },

    #[error("Cluster resource not found: {kind} {name}")]
    NotFound { kind: String, name: String },

    #[error("Cluster API error: {0}")]
    Api(String),

    #[error("Failed to connect to cluster: {0}")]
    Connection(String),
}

impl ClusterError {
    /// Whether the error means the addressed resource is gone.
    ///
    /// Job or pod disappearance is how cancellation surfaces inside a
    /// poll loop, so callers treat it as a terminal condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Image build errors.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Context fetch failed for build {build_id} (exit code {exit_code})")]
    InitStepFailure { build_id: Uuid, exit_code: i32 },

    #[error("Build {build_id} failed: {reason}")]
    BuildExecution { build_id: Uuid, reason: String },

    #[error("Failed to package build context: {0}")]
    Context(String),

    #[error("Build {build_id} was cancelled")]
    Cancelled { build_id: Uuid },

    #[error("Build queue is closed")]
    QueueClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Registry publishing errors.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Login to {registry} failed: {reason}")]
    Login { registry: String, reason: String },

    #[error("Push of {image} failed: {reason}")]
    Push { image: String, reason: String },

    #[error("Failed to load {image} into {cluster}: {reason}")]
    ClusterLoad {
        image: String,
        cluster: String,
        reason: String,
    },
}

/// External command errors.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("IO error while running {program}: {reason}")]
    Io { program: String, reason: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
