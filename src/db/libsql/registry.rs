//! RegistryConfigStore implementation for LibSqlBackend.

use async_trait::async_trait;
use chrono::Utc;
use libsql::params;
use secrecy::SecretString;

use super::{LibSqlBackend, fmt_ts, get_i64, get_opt_text, get_text, opt_text};
use crate::build::RegistryConfig;
use crate::db::{REGISTRY_CONFIG_ROW, RegistryConfigStore};
use crate::error::DatabaseError;

#[async_trait]
impl RegistryConfigStore for LibSqlBackend {
    async fn get_registry_config(&self) -> Result<Option<RegistryConfig>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT registry_type, url, username, password, namespace, use_local_fallback
                FROM registry_config WHERE id = ?1
                "#,
                params![REGISTRY_CONFIG_ROW],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        else {
            return Ok(None);
        };

        Ok(Some(RegistryConfig {
            registry_type: get_text(&row, 0)
                .parse()
                .map_err(DatabaseError::Serialization)?,
            url: get_opt_text(&row, 1),
            username: get_opt_text(&row, 2),
            password: get_opt_text(&row, 3)
                .filter(|p| !p.is_empty())
                .map(SecretString::from),
            namespace: get_opt_text(&row, 4),
            use_local_fallback: get_i64(&row, 5) != 0,
        }))
    }

    async fn save_registry_config(&self, config: &RegistryConfig) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO registry_config (
                id, registry_type, url, username, password, namespace, use_local_fallback, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (id) DO UPDATE SET
                registry_type = excluded.registry_type,
                url = excluded.url,
                username = excluded.username,
                password = excluded.password,
                namespace = excluded.namespace,
                use_local_fallback = excluded.use_local_fallback,
                updated_at = excluded.updated_at
            "#,
            params![
                REGISTRY_CONFIG_ROW,
                config.registry_type.as_str(),
                opt_text(config.url.as_deref()),
                opt_text(config.username.as_deref()),
                opt_text(config.password()),
                opt_text(config.namespace.as_deref()),
                config.use_local_fallback as i64,
                fmt_ts(&Utc::now()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::RegistryType;
    use crate::testing::test_db;

    #[tokio::test]
    async fn absent_until_saved() {
        let (db, _dir) = test_db().await;
        assert!(db.get_registry_config().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_replaces_the_single_row() {
        let (db, _dir) = test_db().await;
        let first = RegistryConfig {
            registry_type: RegistryType::Dockerhub,
            username: Some("bob".into()),
            password: Some(SecretString::from("hunter2")),
            namespace: Some("bob".into()),
            ..Default::default()
        };
        db.save_registry_config(&first).await.unwrap();

        let second = RegistryConfig {
            registry_type: RegistryType::Ecr,
            url: Some("123.dkr.ecr.us-east-1.amazonaws.com".into()),
            use_local_fallback: false,
            ..Default::default()
        };
        db.save_registry_config(&second).await.unwrap();

        let stored = db.get_registry_config().await.unwrap().unwrap();
        assert_eq!(stored.registry_type, RegistryType::Ecr);
        assert!(stored.password.is_none());
        assert!(stored.username.is_none());
        assert!(!stored.use_local_fallback);
    }
}
