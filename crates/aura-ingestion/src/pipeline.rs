//! Daily ingestion pipeline.
//!
//! Orchestrates one run:
//!   1. Discover new papers from the catalog (known external IDs excluded)
//!      and queue papers earlier runs left unfinished
//!   2. Fetch each paper's PDF into the dated staging area
//!   3. Extract text and run the two-pass terminology extraction
//!   4. Persist each paper's terms as one atomic unit
//!   5. Sweep staged files past the retention window
//!
//! Stages 2-4 run their papers through a bounded worker pool. Per-paper
//! failures mark that paper `failed` and the run carries on; a catalog outage
//! or too many inference failures abort the run. A run-wide timeout stops new
//! dispatch and closes the run as `done` with the partial flag set.
//!
//! Progress events are sent on an optional broadcast channel and logged at
//! target `aura::metrics`.

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::IngestionError;
use crate::extraction::ExtractionEngine;
use crate::fetcher::DocumentFetcher;
use crate::models::{ExtractionOutput, PaperMetadata};
use crate::repository::IngestionRepository;
use crate::run::{PipelineRun, RunStage, RunSummary, StageEvent};
use crate::sources::{DateWindow, PaperSource, SourceQuery};
use crate::sweeper::RetentionSweeper;
use crate::text::TextExtractor;
use aura_db::PaperStatus;

// ── Run config ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Catalog topic filter, e.g. `cs.AI`.
    pub topic: String,
    pub max_results: usize,
    /// Days of publications to consider, today included. `0` disables the
    /// date filter.
    pub lookback_days: u32,
    pub concurrency: usize,
    /// Abort once inference failures / attempts exceeds this.
    pub failure_ratio_threshold: f64,
    pub abort_min_samples: u32,
    pub run_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topic: "cs.AI".to_string(),
            max_results: 100,
            lookback_days: 1,
            concurrency: 4,
            failure_ratio_threshold: 0.5,
            abort_min_samples: 2,
            run_timeout: Some(Duration::from_secs(6 * 60 * 60)),
        }
    }
}

/// A paper owned by one worker for the duration of a stage.
#[derive(Debug, Clone)]
struct WorkItem {
    paper_id: i64,
    meta: PaperMetadata,
}

enum ExtractAttempt {
    /// The document yielded no text; the model was never called.
    TextFailed(IngestionError),
    Inferred(Result<ExtractionOutput, IngestionError>),
}

fn before_deadline(deadline: Option<Instant>) -> bool {
    deadline.map_or(true, |d| Instant::now() < d)
}

// ── Pipeline orchestrator ─────────────────────────────────────────────────────

pub struct Pipeline {
    source: Arc<dyn PaperSource>,
    fetcher: Arc<dyn DocumentFetcher>,
    extractor: Arc<dyn TextExtractor>,
    engine: Arc<ExtractionEngine>,
    repo: IngestionRepository,
    sweeper: Option<RetentionSweeper>,
    config: PipelineConfig,
    progress_tx: Option<broadcast::Sender<StageEvent>>,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn PaperSource>,
        fetcher: Arc<dyn DocumentFetcher>,
        extractor: Arc<dyn TextExtractor>,
        engine: Arc<ExtractionEngine>,
        repo: IngestionRepository,
        config: PipelineConfig,
    ) -> Self {
        Self { source, fetcher, extractor, engine, repo, sweeper: None, config, progress_tx: None }
    }

    pub fn with_sweeper(mut self, sweeper: RetentionSweeper) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    pub fn with_progress(mut self, tx: broadcast::Sender<StageEvent>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn repository(&self) -> &IngestionRepository {
        &self.repo
    }

    /// Catalog results for `query` minus every paper already stored, in feed
    /// order, with in-feed duplicates collapsed.
    pub async fn discover_new(&self, query: &SourceQuery) -> Result<Vec<PaperMetadata>, IngestionError> {
        let found = self.source.search(query).await?;
        let mut seen = HashSet::new();
        let found: Vec<PaperMetadata> = found.into_iter().filter(|p| seen.insert(p.external_id.clone())).collect();

        let ids: Vec<String> = found.iter().map(|p| p.external_id.clone()).collect();
        let known = self.repo.known_external_ids(&ids).await?;
        let fresh: Vec<PaperMetadata> = found.into_iter().filter(|p| !known.contains(&p.external_id)).collect();
        debug!(source = self.source.name(), found = ids.len(), known = known.len(), new = fresh.len(), "Discovery filtered");
        Ok(fresh)
    }

    /// Execute one run for `run_date`.
    ///
    /// Abort-class failures close the run as `failed` and are reported in the
    /// returned summary. Only failures to open, advance or close the run log
    /// are returned as errors.
    #[instrument(skip(self), fields(topic = %self.config.topic))]
    pub async fn run(&self, run_date: NaiveDate) -> Result<RunSummary, IngestionError> {
        let mut run = PipelineRun::new(Uuid::new_v4().to_string());
        let deadline = self.config.run_timeout.map(|t| Instant::now() + t);
        self.repo.start_run(&run.id, run.started_at).await?;
        info!(run_id = %run.id, %run_date, "Pipeline run started");

        // ── Discovering ──────────────────────────────────────────────────────
        self.transition(&mut run, RunStage::Discovering, None).await?;
        let query = SourceQuery {
            topic: self.config.topic.clone(),
            max_results: self.config.max_results,
            window: (self.config.lookback_days > 0).then(|| DateWindow::lookback(run_date, self.config.lookback_days)),
        };
        let discovered = match self.discover_new(&query).await {
            Ok(papers) => papers,
            Err(e) => return self.abort(run, e).await,
        };

        let mut items = Vec::with_capacity(discovered.len());
        for meta in discovered {
            match self.repo.upsert_paper(&meta, PaperStatus::Discovered, Some(&run.id)).await {
                Ok(up) => items.push(WorkItem { paper_id: up.paper_id, meta }),
                Err(e) => {
                    warn!(external_id = %meta.external_id, error = %e, "Could not record discovered paper");
                    run.metrics.record_error(&e, Some(&meta.external_id));
                }
            }
        }
        run.counts.discovered = items.len() as u32;
        run.metrics.discovered = run.counts.discovered;
        self.queue_unfinished(&mut run, &mut items).await;

        // ── Fetching ─────────────────────────────────────────────────────────
        self.transition(&mut run, RunStage::Fetching, None).await?;
        let fetched = self.fetch_all(&mut run, items, run_date, deadline).await;

        // ── Extracting ───────────────────────────────────────────────────────
        self.transition(&mut run, RunStage::Extracting, None).await?;
        let (extracted, aborted) = self.extract_all(&mut run, fetched, deadline).await;
        if let Some(err) = aborted {
            // Finished extractions are kept; undispatched papers stay queued.
            self.persist_all(&mut run, extracted).await;
            return self.abort(run, err).await;
        }

        // ── Persisting ───────────────────────────────────────────────────────
        self.transition(&mut run, RunStage::Persisting, None).await?;
        self.persist_all(&mut run, extracted).await;

        // ── Sweeping ─────────────────────────────────────────────────────────
        self.transition(&mut run, RunStage::Sweeping, None).await?;
        if let Some(sweeper) = &self.sweeper {
            match sweeper.sweep().await {
                Ok(report) => {
                    run.metrics.files_swept = report.files_deleted;
                    run.metrics.bytes_freed = report.bytes_freed;
                }
                Err(e) => {
                    warn!(error = %e, "Retention sweep failed");
                    run.metrics.record_error(&e, None);
                }
            }
        }

        let message = run.partial.then(|| "run timeout reached; remaining papers not dispatched".to_string());
        self.transition(&mut run, RunStage::Done, message).await?;
        self.close(run).await
    }

    /// Appends papers an earlier run left `discovered` or `fetched`.
    async fn queue_unfinished(&self, run: &mut PipelineRun, items: &mut Vec<WorkItem>) {
        let stored = match self.repo.unfinished_papers().await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Could not load unfinished papers");
                run.metrics.record_error(&e, None);
                return;
            }
        };
        let queued: HashSet<i64> = items.iter().map(|i| i.paper_id).collect();
        for paper in stored.iter().filter(|p| !queued.contains(&p.id)) {
            items.push(WorkItem { paper_id: paper.id, meta: PaperMetadata::from(paper) });
            run.metrics.resumed += 1;
        }
        if run.metrics.resumed > 0 {
            info!(run_id = %run.id, resumed = run.metrics.resumed, "Queued unfinished papers from earlier runs");
        }
    }

    async fn fetch_all(
        &self,
        run: &mut PipelineRun,
        items: Vec<WorkItem>,
        run_date: NaiveDate,
        deadline: Option<Instant>,
    ) -> Vec<(WorkItem, PathBuf)> {
        let total = items.len();
        let mut results = stream::iter(items)
            .take_while(|_| futures::future::ready(before_deadline(deadline)))
            .map(|item| {
                let fetcher = self.fetcher.clone();
                async move {
                    let outcome = fetcher.fetch(&item.meta, run_date).await;
                    (item, outcome)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1));

        let mut fetched = Vec::new();
        let mut dispatched = 0;
        while let Some((item, outcome)) = results.next().await {
            dispatched += 1;
            let outcome = match outcome {
                Ok(o) => o,
                Err(e) => {
                    self.fail_paper(run, &item, &e).await;
                    continue;
                }
            };
            if let Err(e) = self.repo.mark_fetched(item.paper_id, outcome.path()).await {
                self.fail_paper(run, &item, &e).await;
                continue;
            }
            if outcome.is_skipped() {
                run.metrics.fetch_skipped += 1;
            }
            run.counts.fetched += 1;
            run.metrics.fetched += 1;
            fetched.push((item, outcome.path().to_path_buf()));
        }
        if dispatched < total {
            run.partial = true;
            warn!(run_id = %run.id, dispatched, total, "Run timeout reached during fetching");
        }
        fetched
    }

    /// Returns the successful extractions and, when the inference failure
    /// ratio crossed the threshold, the abort error.
    async fn extract_all(
        &self,
        run: &mut PipelineRun,
        fetched: Vec<(WorkItem, PathBuf)>,
        deadline: Option<Instant>,
    ) -> (Vec<(WorkItem, ExtractionOutput)>, Option<IngestionError>) {
        let total = fetched.len();
        let abort = AtomicBool::new(false);
        let mut abort_err = None;
        let mut results = stream::iter(fetched)
            .take_while(|_| futures::future::ready(!abort.load(Ordering::SeqCst) && before_deadline(deadline)))
            .map(|(item, path)| {
                let extractor = self.extractor.clone();
                let engine = self.engine.clone();
                async move {
                    let attempt = match extractor.extract(&path).await {
                        Err(e) => ExtractAttempt::TextFailed(e),
                        Ok(text) => ExtractAttempt::Inferred(engine.extract(&item.meta, &text).await),
                    };
                    (item, attempt)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1));

        let mut extracted = Vec::new();
        let mut dispatched = 0;
        while let Some((item, attempt)) = results.next().await {
            dispatched += 1;
            let inferred = match attempt {
                ExtractAttempt::TextFailed(e) => {
                    self.fail_paper(run, &item, &e).await;
                    continue;
                }
                ExtractAttempt::Inferred(r) => r,
            };
            run.metrics.text_extracted += 1;
            run.metrics.inference_attempted += 1;
            match inferred {
                Ok(output) => {
                    run.metrics.keywords_total += output.keywords.len() as u32;
                    run.metrics.definitions_total += output.terms.len() as u32;
                    extracted.push((item, output));
                }
                Err(e) => {
                    run.metrics.inference_failures += 1;
                    self.fail_paper(run, &item, &e).await;
                }
            }

            if abort_err.is_none() {
                if let Some(ratio) = run.inference_failure_ratio(self.config.abort_min_samples) {
                    if ratio > self.config.failure_ratio_threshold {
                        abort.store(true, Ordering::SeqCst);
                        warn!(
                            run_id = %run.id,
                            ratio,
                            threshold = self.config.failure_ratio_threshold,
                            "Inference failure ratio exceeded; no further papers will be dispatched"
                        );
                        abort_err = Some(IngestionError::InferenceThresholdExceeded {
                            failures: run.metrics.inference_failures,
                            attempted: run.metrics.inference_attempted,
                            threshold: self.config.failure_ratio_threshold,
                        });
                    }
                }
            }
        }
        if abort_err.is_none() && dispatched < total {
            run.partial = true;
            warn!(run_id = %run.id, dispatched, total, "Run timeout reached during extraction");
        }
        (extracted, abort_err)
    }

    /// Writes run on this task one paper at a time, so no two writes for a
    /// paper can interleave.
    async fn persist_all(&self, run: &mut PipelineRun, extracted: Vec<(WorkItem, ExtractionOutput)>) {
        for (item, output) in extracted {
            match self.repo.upsert_terms(item.paper_id, &output.terms).await {
                Ok(report) => {
                    run.counts.extracted += 1;
                    run.metrics.terms_new += report.new_terms;
                    run.metrics.terms_existing += report.existing_terms;
                    run.metrics.links_added += report.links_added;
                    if output.is_empty() {
                        run.metrics.papers_without_definitions += 1;
                        info!(external_id = %item.meta.external_id, "No definitions extracted");
                    }
                }
                Err(e) => self.fail_paper(run, &item, &e).await,
            }
        }
    }

    async fn fail_paper(&self, run: &mut PipelineRun, item: &WorkItem, err: &IngestionError) {
        warn!(external_id = %item.meta.external_id, stage = %run.stage(), error = %err, "Paper failed");
        run.counts.failed += 1;
        run.metrics.record_error(err, Some(&item.meta.external_id));
        if let Err(e) = self.repo.mark_failed(item.paper_id, &err.to_string()).await {
            warn!(external_id = %item.meta.external_id, error = %e, "Could not mark paper failed");
            run.metrics.record_error(&e, Some(&item.meta.external_id));
        }
    }

    async fn abort(&self, mut run: PipelineRun, err: IngestionError) -> Result<RunSummary, IngestionError> {
        warn!(run_id = %run.id, stage = %run.stage(), error = %err, "Aborting run");
        run.metrics.record_error(&err, None);
        run.abort_reason = Some(err.to_string());
        self.transition(&mut run, RunStage::Failed, Some(err.to_string())).await?;
        self.close(run).await
    }

    async fn close(&self, run: PipelineRun) -> Result<RunSummary, IngestionError> {
        self.repo.finalize_run(&run.id, &run.finalization()).await?;
        let summary = RunSummary::from(&run);
        info!(
            target: "aura::metrics",
            run_id = %summary.run_id,
            status = %summary.status,
            partial = summary.partial,
            discovered = summary.counts.discovered,
            fetched = summary.counts.fetched,
            extracted = summary.counts.extracted,
            failed = summary.counts.failed,
            duration_ms = summary.duration_ms,
            "Run finished\n{}",
            summary.metrics.summary()
        );
        Ok(summary)
    }

    async fn transition(
        &self,
        run: &mut PipelineRun,
        next: RunStage,
        message: Option<String>,
    ) -> Result<(), IngestionError> {
        let from = run.stage();
        let elapsed = run.advance(next)?;
        let elapsed_ms = elapsed.as_millis() as u64;
        info!(
            target: "aura::metrics",
            run_id = %run.id,
            from = %from,
            stage = %next,
            elapsed_ms,
            discovered = run.counts.discovered,
            fetched = run.counts.fetched,
            extracted = run.counts.extracted,
            failed = run.counts.failed,
            "Stage transition"
        );
        if !next.is_terminal() {
            self.repo.update_stage(&run.id, next.as_str()).await?;
        }
        if let Some(tx) = &self.progress_tx {
            // No subscribers is fine.
            let _ = tx.send(StageEvent {
                run_id: run.id.clone(),
                from,
                stage: next,
                elapsed_ms,
                counts: run.counts,
                message,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_sane() {
        let cfg = PipelineConfig::default();
        assert!(cfg.concurrency > 0);
        assert!(cfg.failure_ratio_threshold > 0.0 && cfg.failure_ratio_threshold <= 1.0);
        assert_eq!(cfg.abort_min_samples, 2);
    }
}
