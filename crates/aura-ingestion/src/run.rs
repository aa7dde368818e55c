//! Run-level state: the stage machine, the `PipelineRun` aggregate and the
//! metrics reported when a run closes.

use aura_db::{RunCounts, RunFinalization, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{ErrorCategory, ErrorClass, IngestionError};

/// Errors kept on a run; later ones are only counted.
pub const MAX_ERROR_RECORDS: usize = 50;

// ── Stage machine ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStage {
    Idle,
    Discovering,
    Fetching,
    Extracting,
    Persisting,
    Sweeping,
    Done,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Idle        => "idle",
            RunStage::Discovering => "discovering",
            RunStage::Fetching    => "fetching",
            RunStage::Extracting  => "extracting",
            RunStage::Persisting  => "persisting",
            RunStage::Sweeping    => "sweeping",
            RunStage::Done        => "done",
            RunStage::Failed      => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Done | RunStage::Failed)
    }

    fn successor(&self) -> Option<RunStage> {
        match self {
            RunStage::Idle        => Some(RunStage::Discovering),
            RunStage::Discovering => Some(RunStage::Fetching),
            RunStage::Fetching    => Some(RunStage::Extracting),
            RunStage::Extracting  => Some(RunStage::Persisting),
            RunStage::Persisting  => Some(RunStage::Sweeping),
            RunStage::Sweeping    => Some(RunStage::Done),
            RunStage::Done | RunStage::Failed => None,
        }
    }

    /// Stages advance one step at a time; `failed` is reachable from any
    /// non-terminal stage.
    pub fn can_transition_to(&self, next: RunStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == RunStage::Failed || self.successor() == Some(next)
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side-channel record emitted on every stage transition.
#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub run_id: String,
    pub from: RunStage,
    pub stage: RunStage,
    /// Time spent in `from`.
    pub elapsed_ms: u64,
    pub counts: RunCounts,
    pub message: Option<String>,
}

// ── Metrics ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub message: String,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub discovered: u32,
    /// Papers left unfinished by an earlier run and queued again.
    #[serde(default)]
    pub resumed: u32,
    pub fetched: u32,
    pub fetch_skipped: u32,
    pub text_extracted: u32,
    pub keywords_total: u32,
    pub definitions_total: u32,
    pub papers_without_definitions: u32,
    pub terms_new: u32,
    pub terms_existing: u32,
    pub links_added: u32,
    pub inference_attempted: u32,
    pub inference_failures: u32,
    pub failures_item: u32,
    pub failures_abort: u32,
    pub failures_by_category: BTreeMap<String, u32>,
    /// Milliseconds spent in each stage.
    pub stage_ms: BTreeMap<String, u64>,
    pub errors: Vec<ErrorRecord>,
    pub errors_dropped: u32,
    pub files_swept: u32,
    pub bytes_freed: u64,
}

impl RunMetrics {
    pub fn record_error(&mut self, err: &IngestionError, external_id: Option<&str>) {
        match err.class() {
            ErrorClass::Item  => self.failures_item += 1,
            ErrorClass::Abort => self.failures_abort += 1,
        }
        let category = err.category();
        *self.failures_by_category.entry(category.as_str().to_string()).or_default() += 1;
        if self.errors.len() < MAX_ERROR_RECORDS {
            self.errors.push(ErrorRecord {
                category,
                message: err.to_string(),
                external_id: external_id.map(str::to_string),
            });
        } else {
            self.errors_dropped += 1;
        }
    }

    /// Share of candidate keywords that came back with a definition.
    pub fn definition_yield(&self) -> Option<f64> {
        (self.keywords_total > 0).then(|| f64::from(self.definitions_total) / f64::from(self.keywords_total))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Human-readable end-of-run report.
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("papers: {} discovered, {} resumed, {} fetched ({} already staged), {} text extracted",
                self.discovered, self.resumed, self.fetched, self.fetch_skipped, self.text_extracted),
            format!("terms: {} keywords, {} definitions, {} new, {} existing, {} links",
                self.keywords_total, self.definitions_total, self.terms_new, self.terms_existing, self.links_added),
            format!("inference: {} attempted, {} failed, {} papers without definitions",
                self.inference_attempted, self.inference_failures, self.papers_without_definitions),
        ];
        if let Some(y) = self.definition_yield() {
            lines.push(format!("{:.1}% keyword definition rate", y * 100.0));
        }
        if !self.failures_by_category.is_empty() {
            let by: Vec<String> = self.failures_by_category.iter().map(|(k, v)| format!("{k}={v}")).collect();
            lines.push(format!("failures: {}", by.join(", ")));
        }
        if self.files_swept > 0 {
            lines.push(format!("swept: {} files, {} bytes", self.files_swept, self.bytes_freed));
        }
        lines.join("\n")
    }
}

// ── Run aggregate ────────────────────────────────────────────────────────────

/// One orchestrator invocation. Owned and mutated only by the orchestrator
/// task.
#[derive(Debug)]
pub struct PipelineRun {
    pub id: String,
    pub started_at: DateTime<Utc>,
    stage: RunStage,
    stage_started: Instant,
    pub partial: bool,
    pub counts: RunCounts,
    pub metrics: RunMetrics,
    pub abort_reason: Option<String>,
}

impl PipelineRun {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started_at: Utc::now(),
            stage: RunStage::Idle,
            stage_started: Instant::now(),
            partial: false,
            counts: RunCounts::default(),
            metrics: RunMetrics::default(),
            abort_reason: None,
        }
    }

    pub fn stage(&self) -> RunStage {
        self.stage
    }

    /// Move to `next`, returning the time spent in the previous stage.
    pub fn advance(&mut self, next: RunStage) -> Result<Duration, IngestionError> {
        if !self.stage.can_transition_to(next) {
            return Err(IngestionError::InvalidTransition { from: self.stage, to: next });
        }
        let elapsed = self.stage_started.elapsed();
        *self.metrics.stage_ms.entry(self.stage.as_str().to_string()).or_default() += elapsed.as_millis() as u64;
        self.stage = next;
        self.stage_started = Instant::now();
        Ok(elapsed)
    }

    /// Ratio of failed to attempted inference calls, once enough samples exist.
    pub fn inference_failure_ratio(&self, min_samples: u32) -> Option<f64> {
        let attempted = self.metrics.inference_attempted;
        (attempted >= min_samples.max(1)).then(|| f64::from(self.metrics.inference_failures) / f64::from(attempted))
    }

    pub fn status(&self) -> RunStatus {
        match self.stage {
            RunStage::Done   => RunStatus::Done,
            RunStage::Failed => RunStatus::Failed,
            _                => RunStatus::Running,
        }
    }

    pub fn finalization(&self) -> RunFinalization {
        RunFinalization {
            status: self.status(),
            stage: self.stage.as_str().to_string(),
            partial: self.partial,
            counts: self.counts,
            metrics: Some(self.metrics.to_json()),
        }
    }
}

/// What the orchestrator hands back once a run is closed.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub stage: RunStage,
    pub partial: bool,
    pub counts: RunCounts,
    pub metrics: RunMetrics,
    pub abort_reason: Option<String>,
    pub duration_ms: u64,
}

impl From<&PipelineRun> for RunSummary {
    fn from(run: &PipelineRun) -> Self {
        Self {
            run_id: run.id.clone(),
            status: run.status(),
            stage: run.stage,
            partial: run.partial,
            counts: run.counts,
            metrics: run.metrics.clone(),
            abort_reason: run.abort_reason.clone(),
            duration_ms: (Utc::now() - run.started_at).num_milliseconds().max(0) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: [RunStage; 7] = [
        RunStage::Idle,
        RunStage::Discovering,
        RunStage::Fetching,
        RunStage::Extracting,
        RunStage::Persisting,
        RunStage::Sweeping,
        RunStage::Done,
    ];

    #[test]
    fn test_happy_path_order() {
        let mut run = PipelineRun::new("r");
        for next in &ORDER[1..] {
            run.advance(*next).unwrap();
        }
        assert_eq!(run.status(), RunStatus::Done);
        assert!(run.metrics.stage_ms.contains_key("sweeping"));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut run = PipelineRun::new("r");
        let err = run.advance(RunStage::Extracting).unwrap_err();
        assert!(matches!(err, IngestionError::InvalidTransition { from: RunStage::Idle, to: RunStage::Extracting }));
        assert_eq!(run.stage(), RunStage::Idle);

        run.advance(RunStage::Discovering).unwrap();
        run.advance(RunStage::Failed).unwrap();
        assert!(run.advance(RunStage::Fetching).is_err());
        assert!(run.advance(RunStage::Failed).is_err());
        assert!(!RunStage::Done.can_transition_to(RunStage::Failed));
        assert!(!RunStage::Fetching.can_transition_to(RunStage::Discovering));
    }

    #[test]
    fn test_failure_ratio_needs_samples() {
        let mut run = PipelineRun::new("r");
        run.metrics.inference_attempted = 1;
        run.metrics.inference_failures = 1;
        assert_eq!(run.inference_failure_ratio(2), None);
        run.metrics.inference_attempted = 4;
        run.metrics.inference_failures = 3;
        assert_eq!(run.inference_failure_ratio(2), Some(0.75));
    }

    #[test]
    fn test_error_records_are_capped() {
        let mut m = RunMetrics::default();
        for i in 0..(MAX_ERROR_RECORDS + 3) {
            m.record_error(&IngestionError::extraction(format!("bad {i}")), Some("x"));
        }
        assert_eq!(m.errors.len(), MAX_ERROR_RECORDS);
        assert_eq!(m.errors_dropped, 3);
        assert_eq!(m.failures_item as usize, MAX_ERROR_RECORDS + 3);
        assert_eq!(m.failures_by_category["EXTRACTION_ERROR"] as usize, MAX_ERROR_RECORDS + 3);
    }

    #[test]
    fn test_summary_reports_definition_rate() {
        let m = RunMetrics { keywords_total: 8, definitions_total: 6, ..Default::default() };
        assert!(m.summary().contains("75.0% keyword definition rate"));
        assert_eq!(RunMetrics::default().definition_yield(), None);
    }
}
