//! Paper repository.
//!
//! Insert-or-update by external ID, monotonic status writes and staging-path
//! bookkeeping.

use crate::database::Database;
use crate::error::{DbError, Result};
use crate::schema::{Paper, PaperRecord, PaperStatus};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// SQLite's default host-parameter limit is 999; stay well under it.
const ID_CHUNK: usize = 500;

const PAPER_COLUMNS: &str = "id, external_id, title, abstract, category, authors, published_on, \
     source_url, pdf_url, storage_path, status, failure_reason, run_id, created_at, updated_at";

/// Result of a paper upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaperUpsert {
    pub paper_id: i64,
    pub was_new: bool,
    /// Status stored after the upsert (may be higher than the one requested).
    pub status: PaperStatus,
}

/// Repository for paper operations.
#[derive(Clone)]
pub struct PaperRepository {
    db: Arc<Database>,
}

impl PaperRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a paper, or update the existing row with the same external ID.
    ///
    /// Only provided columns are overwritten. A requested status that ranks
    /// below the stored one is ignored rather than applied.
    pub async fn upsert(
        &self,
        record: &PaperRecord,
        status: PaperStatus,
        run_id: Option<&str>,
    ) -> Result<PaperUpsert> {
        let now = Utc::now();
        let authors = serde_json::to_string(&record.authors)?;
        let mut tx = self.db.pool().begin().await?;

        let existing: Option<(i64, String)> =
            sqlx::query_as("SELECT id, status FROM papers WHERE external_id = ?")
                .bind(&record.external_id)
                .fetch_optional(&mut *tx)
                .await?;

        let upsert = match existing {
            None => {
                let paper_id = sqlx::query(
                    r#"
                    INSERT INTO papers
                        (external_id, title, abstract, category, authors, published_on,
                         source_url, pdf_url, status, run_id, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&record.external_id)
                .bind(&record.title)
                .bind(&record.abstract_text)
                .bind(&record.category)
                .bind(&authors)
                .bind(record.published_on)
                .bind(&record.source_url)
                .bind(&record.pdf_url)
                .bind(status.as_str())
                .bind(run_id)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();

                PaperUpsert { paper_id, was_new: true, status }
            }
            Some((paper_id, stored)) => {
                let stored: PaperStatus = stored.parse()?;
                let next = if stored.can_transition_to(status) { status } else { stored };
                let title = if record.title.trim().is_empty() { None } else { Some(&record.title) };
                let authors = if record.authors.is_empty() { None } else { Some(&authors) };

                sqlx::query(
                    r#"
                    UPDATE papers SET
                        title        = COALESCE(?, title),
                        abstract     = COALESCE(?, abstract),
                        category     = COALESCE(?, category),
                        authors      = COALESCE(?, authors),
                        published_on = COALESCE(?, published_on),
                        source_url   = COALESCE(?, source_url),
                        pdf_url      = COALESCE(?, pdf_url),
                        run_id       = COALESCE(?, run_id),
                        status       = ?,
                        updated_at   = ?
                    WHERE id = ?
                    "#,
                )
                .bind(title)
                .bind(&record.abstract_text)
                .bind(&record.category)
                .bind(authors)
                .bind(record.published_on)
                .bind(&record.source_url)
                .bind(&record.pdf_url)
                .bind(run_id)
                .bind(next.as_str())
                .bind(now)
                .bind(paper_id)
                .execute(&mut *tx)
                .await?;

                PaperUpsert { paper_id, was_new: false, status: next }
            }
        };

        tx.commit().await?;
        debug!(external_id = %record.external_id, paper_id = upsert.paper_id, was_new = upsert.was_new, "Paper upserted");
        Ok(upsert)
    }

    /// Find a paper by row ID.
    pub async fn find_by_id(&self, id: i64) -> Result<Option<Paper>> {
        let row = sqlx::query(&format!("SELECT {PAPER_COLUMNS} FROM papers WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(row_to_paper).transpose()
    }

    /// Find a paper by its catalog identifier.
    pub async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Paper>> {
        let row = sqlx::query(&format!("SELECT {PAPER_COLUMNS} FROM papers WHERE external_id = ?"))
            .bind(external_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(row_to_paper).transpose()
    }

    /// Returns the subset of `external_ids` already stored.
    pub async fn known_external_ids(&self, external_ids: &[String]) -> Result<HashSet<String>> {
        let mut known = HashSet::new();
        for chunk in external_ids.chunks(ID_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT external_id FROM papers WHERE external_id IN (");
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");

            let rows: Vec<String> = qb.build_query_scalar::<String>().fetch_all(self.db.pool()).await?;
            known.extend(rows);
        }
        Ok(known)
    }

    /// Move a paper to `status`, recording `reason` for failures.
    ///
    /// Fails with [`DbError::StatusRegression`] if the stored status ranks
    /// higher or is terminal.
    pub async fn set_status(&self, paper_id: i64, status: PaperStatus, reason: Option<&str>) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        let stored: Option<String> = sqlx::query_scalar("SELECT status FROM papers WHERE id = ?")
            .bind(paper_id)
            .fetch_optional(&mut *tx)
            .await?;
        let stored: PaperStatus = stored
            .ok_or_else(|| DbError::NotFound(format!("paper {paper_id}")))?
            .parse()?;

        if !stored.can_transition_to(status) {
            return Err(DbError::StatusRegression {
                paper_id,
                from: stored.to_string(),
                to: status.to_string(),
            });
        }

        sqlx::query(
            "UPDATE papers SET status = ?, failure_reason = COALESCE(?, failure_reason), updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(Utc::now())
        .bind(paper_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Record where the paper's document was staged.
    pub async fn set_storage_path(&self, paper_id: i64, path: &str) -> Result<()> {
        let updated = sqlx::query("UPDATE papers SET storage_path = ?, updated_at = ? WHERE id = ?")
            .bind(path)
            .bind(Utc::now())
            .bind(paper_id)
            .execute(self.db.pool())
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(DbError::NotFound(format!("paper {paper_id}")));
        }
        Ok(())
    }

    /// Record the staged document and move the paper to `fetched` in one write.
    ///
    /// Neither column changes when the stored status already ranks higher.
    pub async fn mark_fetched(&self, paper_id: i64, path: &str) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        let stored: Option<String> = sqlx::query_scalar("SELECT status FROM papers WHERE id = ?")
            .bind(paper_id)
            .fetch_optional(&mut *tx)
            .await?;
        let stored: PaperStatus = stored
            .ok_or_else(|| DbError::NotFound(format!("paper {paper_id}")))?
            .parse()?;

        if !stored.can_transition_to(PaperStatus::Fetched) {
            return Err(DbError::StatusRegression {
                paper_id,
                from: stored.to_string(),
                to: PaperStatus::Fetched.to_string(),
            });
        }

        sqlx::query("UPDATE papers SET storage_path = ?, status = ?, updated_at = ? WHERE id = ?")
            .bind(path)
            .bind(PaperStatus::Fetched.as_str())
            .bind(Utc::now())
            .bind(paper_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Null `storage_path` on every paper pointing at `path`. Returns rows changed.
    pub async fn clear_storage_path(&self, path: &str) -> Result<u64> {
        let cleared = sqlx::query(
            "UPDATE papers SET storage_path = NULL, updated_at = ? WHERE storage_path = ?",
        )
        .bind(Utc::now())
        .bind(path)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(cleared)
    }

    /// Papers whose staged document has not been swept yet.
    pub async fn with_staged_files(&self) -> Result<Vec<Paper>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAPER_COLUMNS} FROM papers WHERE storage_path IS NOT NULL ORDER BY id"
        ))
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(row_to_paper).collect()
    }

    /// Papers still `discovered` or `fetched`, oldest first.
    pub async fn unfinished(&self) -> Result<Vec<Paper>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAPER_COLUMNS} FROM papers WHERE status IN (?, ?) ORDER BY id"
        ))
        .bind(PaperStatus::Discovered.as_str())
        .bind(PaperStatus::Fetched.as_str())
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(row_to_paper).collect()
    }

    /// Count all papers.
    pub async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM papers")
            .fetch_one(self.db.pool())
            .await?;
        Ok(n.max(0) as u64)
    }

    /// Count papers in a given status.
    pub async fn count_by_status(&self, status: PaperStatus) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM papers WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.db.pool())
            .await?;
        Ok(n.max(0) as u64)
    }
}

fn row_to_paper(row: &SqliteRow) -> Result<Paper> {
    let authors: String = row.try_get("authors")?;
    let status: String = row.try_get("status")?;
    Ok(Paper {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        abstract_text: row.try_get("abstract")?,
        category: row.try_get("category")?,
        authors: serde_json::from_str(&authors)?,
        published_on: row.try_get("published_on")?,
        source_url: row.try_get("source_url")?,
        pdf_url: row.try_get("pdf_url")?,
        storage_path: row.try_get("storage_path")?,
        status: status.parse()?,
        failure_reason: row.try_get("failure_reason")?,
        run_id: row.try_get("run_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    pub(crate) async fn test_db() -> (TempDir, Arc<Database>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("aura.db"), 2).await.unwrap();
        db.initialize().await.unwrap();
        (dir, Arc::new(db))
    }

    pub(crate) fn record(external_id: &str) -> PaperRecord {
        PaperRecord {
            external_id: external_id.to_string(),
            title: format!("Paper {external_id}"),
            abstract_text: Some("We study optimisation.".to_string()),
            category: Some("cs.LG".to_string()),
            authors: vec!["A. Author".to_string(), "B. Author".to_string()],
            published_on: NaiveDate::from_ymd_opt(2024, 1, 15),
            source_url: Some(format!("http://arxiv.org/abs/{external_id}")),
            pdf_url: Some(format!("http://arxiv.org/pdf/{external_id}")),
        }
    }

    #[tokio::test]
    async fn test_insert_then_find() {
        let (_dir, db) = test_db().await;
        let repo = PaperRepository::new(db);

        let up = repo.upsert(&record("2401.00001v1"), PaperStatus::Discovered, Some("run-1")).await.unwrap();
        assert!(up.was_new);

        let paper = repo.find_by_external_id("2401.00001v1").await.unwrap().unwrap();
        assert_eq!(paper.id, up.paper_id);
        assert_eq!(paper.status, PaperStatus::Discovered);
        assert_eq!(paper.authors.len(), 2);
        assert_eq!(paper.published_on, NaiveDate::from_ymd_opt(2024, 1, 15));
        assert_eq!(paper.run_id.as_deref(), Some("run-1"));
        assert!(paper.storage_path.is_none());
    }

    #[tokio::test]
    async fn test_upsert_updates_existing_row() {
        let (_dir, db) = test_db().await;
        let repo = PaperRepository::new(db);

        let first = repo.upsert(&record("2401.00002v1"), PaperStatus::Discovered, None).await.unwrap();
        let mut changed = record("2401.00002v1");
        changed.title = "Revised title".to_string();
        changed.abstract_text = None;
        let second = repo.upsert(&changed, PaperStatus::Fetched, None).await.unwrap();

        assert_eq!(first.paper_id, second.paper_id);
        assert!(!second.was_new);
        let paper = repo.find_by_id(first.paper_id).await.unwrap().unwrap();
        assert_eq!(paper.title, "Revised title");
        assert_eq!(paper.abstract_text.as_deref(), Some("We study optimisation."));
        assert_eq!(paper.status, PaperStatus::Fetched);
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_never_regresses_status() {
        let (_dir, db) = test_db().await;
        let repo = PaperRepository::new(db);

        let up = repo.upsert(&record("2401.00003v1"), PaperStatus::Discovered, None).await.unwrap();
        repo.set_status(up.paper_id, PaperStatus::Extracted, None).await.unwrap();

        let again = repo.upsert(&record("2401.00003v1"), PaperStatus::Discovered, None).await.unwrap();
        assert_eq!(again.status, PaperStatus::Extracted);
    }

    #[tokio::test]
    async fn test_set_status_rejects_regression() {
        let (_dir, db) = test_db().await;
        let repo = PaperRepository::new(db);

        let up = repo.upsert(&record("2401.00004v1"), PaperStatus::Fetched, None).await.unwrap();
        let err = repo.set_status(up.paper_id, PaperStatus::Discovered, None).await.unwrap_err();
        assert!(matches!(err, DbError::StatusRegression { .. }));

        repo.set_status(up.paper_id, PaperStatus::Failed, Some("no text")).await.unwrap();
        let paper = repo.find_by_id(up.paper_id).await.unwrap().unwrap();
        assert_eq!(paper.status, PaperStatus::Failed);
        assert_eq!(paper.failure_reason.as_deref(), Some("no text"));

        assert!(matches!(
            repo.set_status(9999, PaperStatus::Failed, None).await,
            Err(DbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_known_external_ids() {
        let (_dir, db) = test_db().await;
        let repo = PaperRepository::new(db);
        repo.upsert(&record("a"), PaperStatus::Discovered, None).await.unwrap();
        repo.upsert(&record("b"), PaperStatus::Discovered, None).await.unwrap();

        let wanted = vec!["a".to_string(), "c".to_string(), "b".to_string()];
        let known = repo.known_external_ids(&wanted).await.unwrap();
        assert_eq!(known.len(), 2);
        assert!(known.contains("a") && known.contains("b"));
        assert!(repo.known_external_ids(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_storage_path_lifecycle() {
        let (_dir, db) = test_db().await;
        let repo = PaperRepository::new(db);
        let up = repo.upsert(&record("x"), PaperStatus::Discovered, None).await.unwrap();

        repo.set_storage_path(up.paper_id, "/tmp/papers_2024-01-15/x.pdf").await.unwrap();
        assert_eq!(repo.with_staged_files().await.unwrap().len(), 1);

        assert_eq!(repo.clear_storage_path("/tmp/papers_2024-01-15/x.pdf").await.unwrap(), 1);
        assert!(repo.with_staged_files().await.unwrap().is_empty());
        assert_eq!(repo.clear_storage_path("/tmp/papers_2024-01-15/x.pdf").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_fetched_writes_path_and_status_together() {
        let (_dir, db) = test_db().await;
        let repo = PaperRepository::new(db);
        let up = repo.upsert(&record("f"), PaperStatus::Discovered, None).await.unwrap();

        repo.mark_fetched(up.paper_id, "/tmp/papers_2024-01-15/f.pdf").await.unwrap();
        let paper = repo.find_by_id(up.paper_id).await.unwrap().unwrap();
        assert_eq!(paper.status, PaperStatus::Fetched);
        assert_eq!(paper.storage_path.as_deref(), Some("/tmp/papers_2024-01-15/f.pdf"));

        // Re-staging a fetched paper on a later day replaces the path.
        repo.mark_fetched(up.paper_id, "/tmp/papers_2024-01-16/f.pdf").await.unwrap();
        let paper = repo.find_by_id(up.paper_id).await.unwrap().unwrap();
        assert_eq!(paper.storage_path.as_deref(), Some("/tmp/papers_2024-01-16/f.pdf"));

        repo.set_status(up.paper_id, PaperStatus::Failed, Some("no text")).await.unwrap();
        let err = repo.mark_fetched(up.paper_id, "/tmp/papers_2024-01-17/f.pdf").await.unwrap_err();
        assert!(matches!(err, DbError::StatusRegression { .. }));
        let paper = repo.find_by_id(up.paper_id).await.unwrap().unwrap();
        assert_eq!(paper.status, PaperStatus::Failed);
        assert_eq!(paper.storage_path.as_deref(), Some("/tmp/papers_2024-01-16/f.pdf"));

        assert!(matches!(repo.mark_fetched(9999, "/tmp/x.pdf").await, Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unfinished_lists_discovered_and_fetched() {
        let (_dir, db) = test_db().await;
        let repo = PaperRepository::new(db);
        let a = repo.upsert(&record("a"), PaperStatus::Discovered, None).await.unwrap();
        let b = repo.upsert(&record("b"), PaperStatus::Fetched, None).await.unwrap();
        let c = repo.upsert(&record("c"), PaperStatus::Discovered, None).await.unwrap();
        let d = repo.upsert(&record("d"), PaperStatus::Discovered, None).await.unwrap();
        repo.set_status(c.paper_id, PaperStatus::Extracted, None).await.unwrap();
        repo.set_status(d.paper_id, PaperStatus::Failed, Some("HTTP 404")).await.unwrap();

        let ids: Vec<i64> = repo.unfinished().await.unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a.paper_id, b.paper_id]);
    }
}
