//! ToolStore implementation for LibSqlBackend.

use async_trait::async_trait;
use libsql::params;

use super::{LibSqlBackend, fmt_ts, get_opt_text, get_text, get_ts, opt_text};
use crate::db::ToolStore;
use crate::error::DatabaseError;
use crate::tools::{CallingConvention, ToolDefinition};

#[async_trait]
impl ToolStore for LibSqlBackend {
    async fn get_tool(&self, id: &str) -> Result<Option<ToolDefinition>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT id, name, category, script, configuration, calling_convention, updated_at
                FROM tools WHERE id = ?1
                "#,
                params![id],
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

        let calling_convention = get_opt_text(&row, 5)
            .map(|s| s.parse::<CallingConvention>())
            .transpose()
            .map_err(DatabaseError::Serialization)?;

        Ok(Some(ToolDefinition {
            id: get_text(&row, 0),
            name: get_text(&row, 1),
            category: get_text(&row, 2),
            script: get_text(&row, 3),
            configuration: get_opt_text(&row, 4),
            calling_convention,
            updated_at: get_ts(&row, 6),
        }))
    }

    async fn save_tool(&self, tool: &ToolDefinition) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO tools (id, name, category, script, configuration, calling_convention, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                category = excluded.category,
                script = excluded.script,
                configuration = excluded.configuration,
                calling_convention = excluded.calling_convention,
                updated_at = excluded.updated_at
            "#,
            params![
                tool.id.as_str(),
                tool.name.as_str(),
                tool.category.as_str(),
                tool.script.as_str(),
                opt_text(tool.configuration.as_deref()),
                opt_text(tool.calling_convention.map(|c| c.as_str())),
                fmt_ts(&tool.updated_at),
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
    use crate::testing::test_db;

    #[tokio::test]
    async fn save_is_an_upsert() {
        let (db, _dir) = test_db().await;
        let tool = ToolDefinition::new("recon", "nmap scan", "def main(): pass");
        db.save_tool(&tool).await.unwrap();

        let mut edited = tool.clone();
        edited.script = "def main(args): return args".into();
        edited.calling_convention = Some(CallingConvention::MapArg);
        db.save_tool(&edited).await.unwrap();

        let stored = db.get_tool("recon/nmap_scan").await.unwrap().unwrap();
        assert_eq!(stored.script, edited.script);
        assert_eq!(stored.calling_convention, Some(CallingConvention::MapArg));
        assert!(db.get_tool("recon/other").await.unwrap().is_none());
    }
}
