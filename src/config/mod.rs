//! Configuration for toolsmith.
//!
//! Everything comes from environment variables. A `.env` in the working
//! directory is loaded first via dotenvy, which never overwrites variables
//! that are already set.

mod api;
mod build;
mod cluster;
mod database;
pub(crate) mod helpers;

use crate::error::ConfigError;

pub use self::api::ApiConfig;
pub use self::build::{BuildBackendKind, BuildConfig};
pub use self::cluster::{ClusterConfig, ClusterType};
pub use self::database::{DatabaseBackend, DatabaseConfig, default_libsql_path};

/// Main configuration for the engine.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub cluster: ClusterConfig,
    pub build: BuildConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::build()
    }

    fn build() -> Result<Self, ConfigError> {
        let api = ApiConfig::resolve()?;
        Ok(Self {
            database: DatabaseConfig::resolve()?,
            cluster: ClusterConfig::resolve()?,
            build: BuildConfig::resolve(api.port)?,
            api,
        })
    }
}
