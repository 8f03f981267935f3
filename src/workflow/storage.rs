/// SQLite persistence layer for workflow definitions
///
/// Definitions are stored as JSON, one row per (id, version), with the lookup
/// fields duplicated into indexed columns.

use crate::workflow::types::WorkflowDefinition;
use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Row,
};
use std::str::FromStr;

/// SQLite-based definition storage
#[derive(Debug, Clone)]
pub struct DefinitionStorage {
    pool: SqlitePool,
}

impl DefinitionStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database behind `url` and ensure the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| anyhow::anyhow!("Invalid database URL '{}': {}", url, e))?
            .create_if_missing(true);
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    anyhow::anyhow!("Failed to create database directory '{}': {}", parent.display(), e)
                })?;
            }
        }

        tracing::info!("🗄️ Opening definition database: {}", url);
        let pool = SqlitePool::connect_with(options).await?;
        let storage = Self::new(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Safe to call multiple times
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_definitions (
                id TEXT NOT NULL,
                version INTEGER NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_workflow_definitions_status
            ON workflow_definitions(status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a definition version or replace the stored copy of it
    pub async fn save(&self, definition: &WorkflowDefinition) -> Result<()> {
        let definition_json = serde_json::to_string(definition)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (id, version, name, status, definition, updated_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id, version) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&definition.id)
        .bind(definition.version as i64)
        .bind(&definition.name)
        .bind(definition.status.as_str())
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        tracing::debug!("💾 Saved definition {} v{}", definition.id, definition.version);
        Ok(())
    }

    /// Everything, for registry initialization
    pub async fn load_all(&self) -> Result<Vec<WorkflowDefinition>> {
        let rows = sqlx::query("SELECT definition FROM workflow_definitions ORDER BY id, version")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(parse_row).collect()
    }
}

fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowDefinition> {
    let definition_json: String = row.get("definition");
    Ok(serde_json::from_str(&definition_json)?)
}
