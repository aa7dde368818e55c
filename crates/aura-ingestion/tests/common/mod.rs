//! In-process fakes shared by the pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use aura_common::RetryPolicy;
use aura_db::{Database, DefinitionPolicy};
use aura_ingestion::fetcher::{staged_path, write_staged};
use aura_ingestion::{
    DocumentFetcher, ExtractionEngine, FetchOutcome, IngestionError, IngestionRepository, PaperMetadata,
    PaperSource, Pipeline, PipelineConfig, PromptTemplates, SourceQuery, TextExtractor,
};
use aura_llm::{LlmBackend, LlmError, LlmRequest, LlmResponse};
use chrono::NaiveDate;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub fn run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
}

pub fn paper(id: &str) -> PaperMetadata {
    PaperMetadata {
        external_id: id.to_string(),
        title: format!("Paper {id}"),
        abstract_text: Some(id.to_string()),
        categories: vec!["cs.LG".to_string()],
        authors: vec!["A. Author".to_string()],
        published_on: Some(run_date()),
        source_url: Some(format!("http://arxiv.org/abs/{id}")),
        // Port 9 refuses connections, so a real fetcher never downloads.
        pdf_url: Some(format!("http://127.0.0.1:9/pdf/{id}")),
    }
}

// ── Source ──────────────────────────────────────────────────────────────────

pub struct FakeSource {
    pub papers: Vec<PaperMetadata>,
    pub unavailable: bool,
}

impl FakeSource {
    pub fn new(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self { papers: ids.iter().map(|id| paper(id)).collect(), unavailable: false })
    }

    pub fn down() -> Arc<Self> {
        Arc::new(Self { papers: Vec::new(), unavailable: true })
    }
}

#[async_trait]
impl PaperSource for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    async fn search(&self, _query: &SourceQuery) -> Result<Vec<PaperMetadata>, IngestionError> {
        if self.unavailable {
            return Err(IngestionError::SourceUnavailable("catalog offline".into()));
        }
        Ok(self.papers.clone())
    }
}

// ── Fetcher ─────────────────────────────────────────────────────────────────

/// Stages `body of {id}` as the document, failing for the listed IDs.
pub struct FakeFetcher {
    pub staging_root: PathBuf,
    pub fail: HashSet<String>,
}

impl FakeFetcher {
    pub fn new(staging_root: &Path, fail: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            staging_root: staging_root.to_path_buf(),
            fail: fail.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[async_trait]
impl DocumentFetcher for FakeFetcher {
    async fn fetch(&self, paper: &PaperMetadata, run_date: NaiveDate) -> Result<FetchOutcome, IngestionError> {
        if self.fail.contains(&paper.external_id) {
            return Err(IngestionError::FetchFailed {
                external_id: paper.external_id.clone(),
                reason: "HTTP 404".into(),
            });
        }
        let path = staged_path(&self.staging_root, run_date, &paper.external_id);
        if path.exists() {
            return Ok(FetchOutcome::Skipped(path));
        }
        write_staged(&path, format!("body of {}", paper.external_id).as_bytes()).await?;
        Ok(FetchOutcome::Fetched(path))
    }
}

// ── Extractor ───────────────────────────────────────────────────────────────

/// Treats the staged file as plain text.
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    fn name(&self) -> &'static str {
        "plain"
    }

    async fn extract(&self, path: &Path) -> Result<String, IngestionError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| IngestionError::extraction(e.to_string()))?;
        if text.trim().is_empty() {
            return Err(IngestionError::extraction("no extractable text"));
        }
        Ok(text)
    }
}

// ── Model backend ───────────────────────────────────────────────────────────

pub const KEYWORD_PROMPT: &str = "KW:";
pub const DEFINITION_PROMPT: &str = "DEF:";

/// Decides a reply from the paper ID embedded in the prompt.
pub type Script = dyn Fn(Pass, &str) -> Result<String, LlmError> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Keyword,
    Definition,
}

pub struct ScriptedBackend {
    script: Box<Script>,
    pub calls: AtomicU32,
}

impl ScriptedBackend {
    pub fn new(script: impl Fn(Pass, &str) -> Result<String, LlmError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { script: Box::new(script), calls: AtomicU32::new(0) })
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = &req.messages[0].content;
        let (pass, id) = if let Some(id) = prompt.strip_prefix(KEYWORD_PROMPT) {
            (Pass::Keyword, id.to_string())
        } else {
            let body = prompt.split(DEFINITION_PROMPT).nth(1).unwrap_or_default();
            (Pass::Definition, body.trim_start_matches("body of ").to_string())
        };
        let content = (self.script)(pass, &id)?;
        Ok(LlmResponse { content, model: "scripted".into(), prompt_tokens: 0, completion_tokens: 0 })
    }

    fn model_id(&self) -> &str {
        "scripted"
    }

    fn is_local(&self) -> bool {
        true
    }

    fn max_context_tokens(&self) -> usize {
        65_536
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

pub struct Harness {
    pub dir: TempDir,
    pub repo: IngestionRepository,
    pub staging: PathBuf,
}

pub async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("aura.db"), 4).await.unwrap();
    db.initialize().await.unwrap();
    let repo = IngestionRepository::new(Arc::new(db), DefinitionPolicy::KeepFirst);
    let staging = dir.path().join("staging");
    Harness { dir, repo, staging }
}

pub fn config(concurrency: usize) -> PipelineConfig {
    PipelineConfig {
        topic: "cs.LG".into(),
        max_results: 50,
        lookback_days: 0,
        concurrency,
        failure_ratio_threshold: 0.5,
        abort_min_samples: 2,
        run_timeout: None,
    }
}

pub fn pipeline(
    h: &Harness,
    source: Arc<dyn PaperSource>,
    fetcher: Arc<dyn DocumentFetcher>,
    backend: Arc<dyn LlmBackend>,
    config: PipelineConfig,
) -> Pipeline {
    let prompts = PromptTemplates { keyword: KEYWORD_PROMPT.into(), definition: DEFINITION_PROMPT.into() };
    let engine = ExtractionEngine::new(backend, prompts).with_retry(RetryPolicy::none());
    Pipeline::new(source, fetcher, Arc::new(PlainTextExtractor), Arc::new(engine), h.repo.clone(), config)
}
