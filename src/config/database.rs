use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Which database backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatabaseBackend {
    /// PostgreSQL via deadpool-postgres (default).
    #[default]
    Postgres,
    /// libSQL embedded database.
    LibSql,
}

impl std::str::FromStr for DatabaseBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "libsql" | "sqlite" => Ok(Self::LibSql),
            _ => Err(format!(
                "invalid database backend '{}', expected 'postgres' or 'libsql'",
                s
            )),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,

    // -- PostgreSQL fields --
    pub url: SecretString,
    pub pool_size: usize,

    // -- libSQL fields --
    /// Path to the local libSQL database file.
    pub libsql_path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let backend: DatabaseBackend = match optional_env("DATABASE_BACKEND")? {
            Some(b) => b.parse().map_err(|e| ConfigError::InvalidValue {
                key: "DATABASE_BACKEND".to_string(),
                message: e,
            })?,
            None => DatabaseBackend::default(),
        };

        // The URL is only required for postgres.
        let url = optional_env("DATABASE_URL")?
            .or_else(|| {
                if backend == DatabaseBackend::LibSql {
                    Some("unused://libsql".to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "DATABASE_URL".to_string(),
                hint: "Set DATABASE_URL or use DATABASE_BACKEND=libsql".to_string(),
            })?;

        let libsql_path = optional_env("LIBSQL_PATH")?.map(PathBuf::from).or_else(|| {
            if backend == DatabaseBackend::LibSql {
                Some(default_libsql_path())
            } else {
                None
            }
        });

        Ok(Self {
            backend,
            url: SecretString::from(url),
            pool_size: parse_optional_env("DATABASE_POOL_SIZE", 10)?,
            libsql_path,
        })
    }

    /// Get the database URL (exposes the secret).
    pub fn url(&self) -> &str {
        self.url.expose_secret()
    }
}

/// Default libSQL database path (~/.toolsmith/toolsmith.db).
pub fn default_libsql_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolsmith")
        .join("toolsmith.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::ENV_MUTEX;

    #[test]
    fn postgres_requires_url() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::remove_var("DATABASE_URL");
            std::env::set_var("DATABASE_BACKEND", "postgres");
        }
        let err = DatabaseConfig::resolve().unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
        unsafe { std::env::remove_var("DATABASE_BACKEND") };
    }

    #[test]
    fn libsql_gets_default_path() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::remove_var("DATABASE_URL");
            std::env::remove_var("LIBSQL_PATH");
            std::env::set_var("DATABASE_BACKEND", "libsql");
        }
        let cfg = DatabaseConfig::resolve().unwrap();
        assert_eq!(cfg.backend, DatabaseBackend::LibSql);
        assert_eq!(cfg.libsql_path, Some(default_libsql_path()));
        unsafe { std::env::remove_var("DATABASE_BACKEND") };
    }
}
