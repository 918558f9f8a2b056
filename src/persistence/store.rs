//! SQLite-based run history

use crate::core::{ExecutionStatus, RunPhase};
use crate::error::FailureKind;
use crate::persistence::{PersistenceBackend, RunSummary, Workflow};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use uuid::Uuid;

const COLUMNS: &str = "id, pipeline_name, workflow, trigger, status, phase, started_at, completed_at, \
                       image, artifact_digest, failure, error";

/// SQLite run store
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Create a new SQLite store
    pub async fn new(db_path: &str) -> Result<Self> {
        let url = if db_path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", db_path)
        };
        let pool = SqlitePool::connect(&url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Default database location
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docs-pipeline")
            .join("runs.db")
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let db_path = Self::default_path();
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let db_path = db_path
            .to_str()
            .ok_or_else(|| anyhow!("database path is not valid UTF-8: {}", db_path.display()))?;
        Self::new(db_path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                pipeline_name TEXT NOT NULL,
                workflow TEXT NOT NULL,
                trigger TEXT NOT NULL,
                status TEXT NOT NULL,
                phase TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                image TEXT,
                artifact_digest TEXT,
                failure TEXT,
                error TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON runs(pipeline_name);
            CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn from_row(row: &SqliteRow) -> Result<RunSummary> {
        let workflow: String = row.get("workflow");
        Ok(RunSummary {
            run_id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            pipeline_name: row.get("pipeline_name"),
            workflow: Workflow::parse(&workflow).ok_or_else(|| anyhow!("unknown workflow `{}`", workflow))?,
            trigger: row.get("trigger"),
            status: ExecutionStatus::parse(&row.get::<String, _>("status")),
            phase: row
                .get::<Option<String>, _>("phase")
                .and_then(|p| RunPhase::parse(&p)),
            started_at: Self::from_naive(row.get("started_at")),
            completed_at: row
                .get::<Option<NaiveDateTime>, _>("completed_at")
                .map(Self::from_naive),
            image: row.get("image"),
            artifact_digest: row.get("artifact_digest"),
            failure: row
                .get::<Option<String>, _>("failure")
                .and_then(|f| FailureKind::parse(&f)),
            error: row.get("error"),
        })
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for SqliteExecutionStore {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO runs
            (id, pipeline_name, workflow, trigger, status, phase, started_at, completed_at,
             image, artifact_digest, failure, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.pipeline_name)
        .bind(run.workflow.as_str())
        .bind(&run.trigger)
        .bind(run.status.as_str())
        .bind(run.phase.map(|p| p.to_string()))
        .bind(Self::to_naive(run.started_at))
        .bind(run.completed_at.map(Self::to_naive))
        .bind(&run.image)
        .bind(&run.artifact_digest)
        .bind(run.failure.map(|f| f.as_str()))
        .bind(&run.error)
        .execute(&self.pool)
        .await
        .context("Failed to save run")?;

        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?1", COLUMNS))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load run")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_runs(
        &self,
        pipeline_name: Option<&str>,
        workflow: Option<Workflow>,
        limit: usize,
    ) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM runs
            WHERE (?1 IS NULL OR pipeline_name = ?1)
              AND (?2 IS NULL OR workflow = ?2)
            ORDER BY started_at DESC
            LIMIT ?3
            "#,
            COLUMNS
        ))
        .bind(pipeline_name)
        .bind(workflow.map(|w| w.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT pipeline_name
            FROM runs
            ORDER BY pipeline_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pipelines")?;

        Ok(rows.iter().map(|row| row.get("pipeline_name")).collect())
    }
}
