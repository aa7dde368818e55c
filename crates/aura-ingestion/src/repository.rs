//! SQLite repository facade for the ingestion pipeline.
//!
//! Handles:
//! - Paper upsert by external ID and status updates
//! - Per-paper atomic term persistence under the configured definition policy
//! - Run log open/stage/close

use aura_db::{
    Database, DefinitionPolicy, Paper, PaperRepository, PaperStatus, PaperUpsert, RunFinalization, RunRepository,
    TermRepository, TermUpsertReport, TermInput,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::error::IngestionError;
use crate::models::PaperMetadata;

#[derive(Clone)]
pub struct IngestionRepository {
    db: Arc<Database>,
    papers: PaperRepository,
    terms: TermRepository,
    runs: RunRepository,
    policy: DefinitionPolicy,
}

impl IngestionRepository {
    pub fn new(db: Arc<Database>, policy: DefinitionPolicy) -> Self {
        Self {
            papers: PaperRepository::new(db.clone()),
            terms: TermRepository::new(db.clone()),
            runs: RunRepository::new(db.clone()),
            db,
            policy,
        }
    }

    /// Get underlying database reference.
    pub fn db(&self) -> Arc<Database> { self.db.clone() }

    pub fn papers(&self) -> &PaperRepository { &self.papers }

    pub fn terms(&self) -> &TermRepository { &self.terms }

    pub fn runs(&self) -> &RunRepository { &self.runs }

    pub fn policy(&self) -> DefinitionPolicy { self.policy }

    // ── Paper operations ─────────────────────────────────────────────────────

    pub async fn upsert_paper(
        &self,
        meta: &PaperMetadata,
        status: PaperStatus,
        run_id: Option<&str>,
    ) -> Result<PaperUpsert, IngestionError> {
        Ok(self.papers.upsert(&meta.to_record(), status, run_id).await?)
    }

    /// External IDs among `ids` that are already stored.
    pub async fn known_external_ids(&self, ids: &[String]) -> Result<HashSet<String>, IngestionError> {
        Ok(self.papers.known_external_ids(ids).await?)
    }

    /// Papers an earlier run left `discovered` or `fetched`.
    pub async fn unfinished_papers(&self) -> Result<Vec<Paper>, IngestionError> {
        Ok(self.papers.unfinished().await?)
    }

    /// Record the staged document and advance the paper to `fetched`.
    pub async fn mark_fetched(&self, paper_id: i64, path: &Path) -> Result<(), IngestionError> {
        Ok(self.papers.mark_fetched(paper_id, &path.display().to_string()).await?)
    }

    pub async fn mark_failed(&self, paper_id: i64, reason: &str) -> Result<(), IngestionError> {
        Ok(self.papers.set_status(paper_id, PaperStatus::Failed, Some(reason)).await?)
    }

    /// Persist a paper's term set and mark it `extracted`, as one unit.
    pub async fn upsert_terms(&self, paper_id: i64, terms: &[TermInput]) -> Result<TermUpsertReport, IngestionError> {
        Ok(self.terms.upsert_terms(paper_id, terms, self.policy).await?)
    }

    /// Forget a deleted staged file. Returns the number of papers updated.
    pub async fn clear_storage_path(&self, path: &Path) -> Result<u64, IngestionError> {
        Ok(self.papers.clear_storage_path(&path.display().to_string()).await?)
    }

    // ── Run log ──────────────────────────────────────────────────────────────

    pub async fn start_run(&self, run_id: &str, started_at: DateTime<Utc>) -> Result<(), IngestionError> {
        Ok(self.runs.start(run_id, started_at).await?)
    }

    pub async fn update_stage(&self, run_id: &str, stage: &str) -> Result<(), IngestionError> {
        Ok(self.runs.update_stage(run_id, stage).await?)
    }

    pub async fn finalize_run(&self, run_id: &str, fin: &RunFinalization) -> Result<(), IngestionError> {
        Ok(self.runs.finalize(run_id, fin).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> (tempfile::TempDir, IngestionRepository) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("aura.db"), 2).await.unwrap();
        db.initialize().await.unwrap();
        (dir, IngestionRepository::new(Arc::new(db), DefinitionPolicy::KeepFirst))
    }

    fn meta(id: &str) -> PaperMetadata {
        PaperMetadata {
            external_id: id.into(),
            title: format!("Paper {id}"),
            categories: vec!["cs.AI".into()],
            pdf_url: Some(format!("https://arxiv.org/pdf/{id}")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_paper_lifecycle() {
        let (_dir, repo) = repo().await;
        let up = repo.upsert_paper(&meta("2401.1v1"), PaperStatus::Discovered, Some("run-1")).await.unwrap();
        assert!(up.was_new);

        repo.mark_fetched(up.paper_id, Path::new("/staging/papers_2024-01-15/2401.1v1.pdf")).await.unwrap();
        let terms = vec![TermInput::new("RAG", "Retrieval-augmented generation.", Some("cs.AI".into()))];
        let report = repo.upsert_terms(up.paper_id, &terms).await.unwrap();
        assert_eq!(report.new_terms, 1);

        let paper = repo.papers().find_by_id(up.paper_id).await.unwrap().unwrap();
        assert_eq!(paper.status, PaperStatus::Extracted);
        assert_eq!(paper.storage_path.as_deref(), Some("/staging/papers_2024-01-15/2401.1v1.pdf"));

        let known = repo.known_external_ids(&["2401.1v1".into(), "2401.2v1".into()]).await.unwrap();
        assert_eq!(known.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_failed_keeps_reason() {
        let (_dir, repo) = repo().await;
        let up = repo.upsert_paper(&meta("2401.3v1"), PaperStatus::Discovered, None).await.unwrap();
        repo.mark_failed(up.paper_id, "HTTP 404").await.unwrap();
        let paper = repo.papers().find_by_id(up.paper_id).await.unwrap().unwrap();
        assert_eq!(paper.status, PaperStatus::Failed);
        assert_eq!(paper.failure_reason.as_deref(), Some("HTTP 404"));
    }
}
