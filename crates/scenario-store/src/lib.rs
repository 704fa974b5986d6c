//! # sipflow-scenario-store
//!
//! SQLite-backed persistence for scenarios, grouped into projects. The
//! repository owns a connection pool, initializes its schema on open, and
//! implements the engine's [`ScenarioStore`] seam for run-time loading.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use sipflow_engine::store::{ScenarioStore, StoreError, StoredScenario};

/// Project every scenario belongs to unless one is chosen explicitly.
pub const DEFAULT_PROJECT_ID: &str = "default";

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Repository failures.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("scenario not found: {0}")]
    ScenarioNotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Summary row for listing, without the (potentially large) flow document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioSummary {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed scenario repository.
#[derive(Clone)]
pub struct SqliteScenarioRepository {
    pool: SqlitePool,
}

impl SqliteScenarioRepository {
    /// Open (creating if needed) the database at `path` and initialize the
    /// schema, seeding the default project.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await?;

        let repo = Self { pool };
        repo.init_schema().await?;
        info!(path = %path.as_ref().display(), "scenario repository opened");
        Ok(repo)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scenarios (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                flow_data TEXT NOT NULL DEFAULT '{}',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO projects (id, name) VALUES (?, 'Default Project')")
            .bind(DEFAULT_PROJECT_ID)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Create an empty scenario in a project. The flow document starts as
    /// `{}` until the first save.
    pub async fn create(&self, project_id: &str, name: &str) -> Result<StoredScenario> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO scenarios (id, project_id, name, flow_data, created_at, updated_at)
             VALUES (?, ?, ?, '{}', ?, ?)",
        )
        .bind(&id)
        .bind(project_id)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(scenario = %id, project = %project_id, "scenario created");
        Ok(StoredScenario {
            id,
            project_id: project_id.to_string(),
            name: name.to_string(),
            flow_data: "{}".to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Replace a scenario's flow document.
    pub async fn save_flow(&self, id: &str, flow_data: &str) -> Result<()> {
        let result = sqlx::query("UPDATE scenarios SET flow_data = ?, updated_at = ? WHERE id = ?")
            .bind(flow_data)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::ScenarioNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Fetch one scenario in full.
    pub async fn load(&self, id: &str) -> Result<StoredScenario> {
        let row = sqlx::query(
            "SELECT id, project_id, name, flow_data, created_at, updated_at
             FROM scenarios WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::ScenarioNotFound(id.to_string()))?;

        Ok(StoredScenario {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            flow_data: row.try_get("flow_data")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// List a project's scenarios, most recently updated first.
    pub async fn list(&self, project_id: &str) -> Result<Vec<ScenarioSummary>> {
        let rows = sqlx::query(
            "SELECT id, project_id, name, created_at, updated_at
             FROM scenarios WHERE project_id = ?
             ORDER BY updated_at DESC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ScenarioSummary {
                    id: row.try_get("id")?,
                    project_id: row.try_get("project_id")?,
                    name: row.try_get("name")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    /// Rename a scenario.
    pub async fn rename(&self, id: &str, new_name: &str) -> Result<()> {
        let result = sqlx::query("UPDATE scenarios SET name = ?, updated_at = ? WHERE id = ?")
            .bind(new_name)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::ScenarioNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Delete a scenario.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM scenarios WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::ScenarioNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Close the pool. Pending operations complete first.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ScenarioStore for SqliteScenarioRepository {
    async fn load(&self, scenario_id: &str) -> std::result::Result<StoredScenario, StoreError> {
        SqliteScenarioRepository::load(self, scenario_id)
            .await
            .map_err(|err| match err {
                RepositoryError::ScenarioNotFound(id) => StoreError::NotFound(id),
                RepositoryError::Database(db) => StoreError::backend(db),
            })
    }
}
