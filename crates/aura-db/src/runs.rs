//! Pipeline run log.
//!
//! A run row is created when the orchestrator starts and closed exactly once.

use crate::database::Database;
use crate::error::{DbError, Result};
use crate::schema::{RunCounts, RunRecord, RunStatus};
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::sync::Arc;
use tracing::info;

/// Terminal values written when a run is closed.
#[derive(Debug, Clone)]
pub struct RunFinalization {
    pub status: RunStatus,
    pub stage: String,
    pub partial: bool,
    pub counts: RunCounts,
    pub metrics: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct RunRepository {
    db: Arc<Database>,
}

impl RunRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Open a run row in `running` status.
    pub async fn start(&self, run_id: &str, started_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO pipeline_runs (id, started_at, status, stage) VALUES (?, ?, ?, 'idle')",
        )
        .bind(run_id)
        .bind(started_at)
        .bind(RunStatus::Running.as_str())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Record the stage an open run has reached.
    pub async fn update_stage(&self, run_id: &str, stage: &str) -> Result<()> {
        sqlx::query("UPDATE pipeline_runs SET stage = ? WHERE id = ? AND status = 'running'")
            .bind(stage)
            .bind(run_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Close a run. A run that is already closed is left untouched and
    /// [`DbError::RunClosed`] is returned.
    pub async fn finalize(&self, run_id: &str, fin: &RunFinalization) -> Result<()> {
        if fin.status == RunStatus::Running {
            return Err(DbError::InvalidValue("a run cannot be finalized as running".to_string()));
        }
        let metrics = fin.metrics.as_ref().map(serde_json::to_string).transpose()?;

        let updated = sqlx::query(
            r#"
            UPDATE pipeline_runs SET
                ended_at = ?, status = ?, stage = ?, partial = ?,
                discovered = ?, fetched = ?, extracted = ?, failed = ?, metrics = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(Utc::now())
        .bind(fin.status.as_str())
        .bind(&fin.stage)
        .bind(fin.partial)
        .bind(fin.counts.discovered as i64)
        .bind(fin.counts.fetched as i64)
        .bind(fin.counts.extracted as i64)
        .bind(fin.counts.failed as i64)
        .bind(metrics)
        .bind(run_id)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            return match self.find(run_id).await? {
                Some(_) => Err(DbError::RunClosed(run_id.to_string())),
                None => Err(DbError::NotFound(format!("run {run_id}"))),
            };
        }

        info!(run_id, status = %fin.status, partial = fin.partial, "Run finalized");
        Ok(())
    }

    pub async fn find(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query(
            "SELECT id, started_at, ended_at, status, stage, partial, discovered, fetched, extracted, failed, metrics \
             FROM pipeline_runs WHERE id = ?",
        )
        .bind(run_id)
        .fetch_optional(self.db.pool())
        .await?;

        let Some(row) = row else { return Ok(None) };
        let status: String = row.try_get("status")?;
        let metrics: Option<String> = row.try_get("metrics")?;
        let count = |col: &str| -> Result<u32> { Ok(row.try_get::<i64, _>(col)?.max(0) as u32) };

        Ok(Some(RunRecord {
            id: row.try_get("id")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            status: status.parse()?,
            stage: row.try_get("stage")?,
            partial: row.try_get("partial")?,
            counts: RunCounts {
                discovered: count("discovered")?,
                fetched: count("fetched")?,
                extracted: count("extracted")?,
                failed: count("failed")?,
            },
            metrics: metrics.as_deref().map(serde_json::from_str).transpose()?,
        }))
    }

    /// Most recently started run.
    pub async fn latest(&self) -> Result<Option<RunRecord>> {
        let id: Option<String> =
            sqlx::query_scalar("SELECT id FROM pipeline_runs ORDER BY started_at DESC LIMIT 1")
                .fetch_optional(self.db.pool())
                .await?;
        match id {
            Some(id) => self.find(&id).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::papers::tests::test_db;

    fn done(counts: RunCounts) -> RunFinalization {
        RunFinalization {
            status: RunStatus::Done,
            stage: "done".to_string(),
            partial: false,
            counts,
            metrics: Some(serde_json::json!({ "terms_new": 4 })),
        }
    }

    #[tokio::test]
    async fn test_start_and_finalize() {
        let (_dir, db) = test_db().await;
        let runs = RunRepository::new(db);

        runs.start("run-1", Utc::now()).await.unwrap();
        runs.update_stage("run-1", "fetching").await.unwrap();
        let open = runs.find("run-1").await.unwrap().unwrap();
        assert_eq!(open.status, RunStatus::Running);
        assert_eq!(open.stage, "fetching");
        assert!(open.ended_at.is_none());

        let counts = RunCounts { discovered: 3, fetched: 2, extracted: 2, failed: 1 };
        runs.finalize("run-1", &done(counts)).await.unwrap();

        let closed = runs.find("run-1").await.unwrap().unwrap();
        assert_eq!(closed.status, RunStatus::Done);
        assert_eq!(closed.counts, counts);
        assert!(closed.ended_at.is_some());
        assert_eq!(closed.metrics.unwrap()["terms_new"], 4);
    }

    #[tokio::test]
    async fn test_closed_run_is_immutable() {
        let (_dir, db) = test_db().await;
        let runs = RunRepository::new(db);
        runs.start("run-2", Utc::now()).await.unwrap();
        runs.finalize("run-2", &done(RunCounts::default())).await.unwrap();

        let mut again = done(RunCounts { discovered: 9, ..Default::default() });
        again.status = RunStatus::Failed;
        assert!(matches!(runs.finalize("run-2", &again).await, Err(DbError::RunClosed(_))));
        runs.update_stage("run-2", "fetching").await.unwrap();

        let stored = runs.find("run-2").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Done);
        assert_eq!(stored.stage, "done");
        assert_eq!(stored.counts.discovered, 0);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let (_dir, db) = test_db().await;
        let runs = RunRepository::new(db);
        assert!(matches!(
            runs.finalize("nope", &done(RunCounts::default())).await,
            Err(DbError::NotFound(_))
        ));
        assert!(runs.latest().await.unwrap().is_none());
    }
}
