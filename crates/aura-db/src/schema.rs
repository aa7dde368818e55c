//! Schema definitions for the SQLite tables.
//!
//! Three related tables (papers, terms, term_paper_links) plus the run log.
//! The query API reads these tables directly, so column names are part of the
//! external contract.

use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DbError;

pub const TABLE_PAPERS: &str = "papers";
pub const TABLE_TERMS: &str = "terms";
pub const TABLE_TERM_PAPER_LINKS: &str = "term_paper_links";
pub const TABLE_PIPELINE_RUNS: &str = "pipeline_runs";

/// DDL applied by [`crate::Database::initialize`], one statement per entry.
pub(crate) const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS papers (
        id              INTEGER PRIMARY KEY,
        external_id     TEXT NOT NULL UNIQUE,
        title           TEXT NOT NULL,
        abstract        TEXT,
        category        TEXT,
        authors         TEXT NOT NULL DEFAULT '[]',
        published_on    TEXT,
        source_url      TEXT,
        pdf_url         TEXT,
        storage_path    TEXT,
        status          TEXT NOT NULL
                        CHECK (status IN ('discovered', 'fetched', 'extracted', 'failed')),
        failure_reason  TEXT,
        run_id          TEXT,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_papers_status ON papers(status)",
    "CREATE INDEX IF NOT EXISTS idx_papers_storage_path ON papers(storage_path)",
    r#"
    CREATE TABLE IF NOT EXISTS terms (
        id              INTEGER PRIMARY KEY,
        surface_form    TEXT NOT NULL UNIQUE,
        display_form    TEXT NOT NULL,
        definition      TEXT NOT NULL,
        category        TEXT,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS term_paper_links (
        term_id     INTEGER NOT NULL REFERENCES terms(id),
        paper_id    INTEGER NOT NULL REFERENCES papers(id),
        created_at  TEXT NOT NULL,
        PRIMARY KEY (term_id, paper_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_term_paper_links_paper ON term_paper_links(paper_id)",
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_runs (
        id          TEXT PRIMARY KEY,
        started_at  TEXT NOT NULL,
        ended_at    TEXT,
        status      TEXT NOT NULL CHECK (status IN ('running', 'done', 'failed')),
        stage       TEXT NOT NULL,
        partial     INTEGER NOT NULL DEFAULT 0,
        discovered  INTEGER NOT NULL DEFAULT 0,
        fetched     INTEGER NOT NULL DEFAULT 0,
        extracted   INTEGER NOT NULL DEFAULT 0,
        failed      INTEGER NOT NULL DEFAULT 0,
        metrics     TEXT
    )
    "#,
];

// =============================================================================
// Paper
// =============================================================================

/// Processing status of a paper.
///
/// Statuses only move forward: `discovered → fetched → extracted`, with
/// `failed` reachable from the first two. A stored status is never replaced
/// by one that ranks lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperStatus {
    Discovered,
    Fetched,
    Extracted,
    Failed,
}

impl PaperStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaperStatus::Discovered => "discovered",
            PaperStatus::Fetched    => "fetched",
            PaperStatus::Extracted  => "extracted",
            PaperStatus::Failed     => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            PaperStatus::Discovered => 0,
            PaperStatus::Fetched    => 1,
            PaperStatus::Extracted  => 2,
            PaperStatus::Failed     => 2,
        }
    }

    /// `extracted` and `failed` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaperStatus::Extracted | PaperStatus::Failed)
    }

    /// Whether a stored status may be replaced by `next`. Re-writing the same
    /// status is allowed (idempotent upserts).
    pub fn can_transition_to(&self, next: PaperStatus) -> bool {
        if *self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for PaperStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaperStatus {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(PaperStatus::Discovered),
            "fetched"    => Ok(PaperStatus::Fetched),
            "extracted"  => Ok(PaperStatus::Extracted),
            "failed"     => Ok(PaperStatus::Failed),
            other        => Err(DbError::InvalidValue(format!("paper status '{other}'"))),
        }
    }
}

/// Metadata supplied when upserting a paper. `None` fields never overwrite
/// stored values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperRecord {
    pub external_id: String,
    pub title: String,
    pub abstract_text: Option<String>,
    pub category: Option<String>,
    pub authors: Vec<String>,
    pub published_on: Option<NaiveDate>,
    pub source_url: Option<String>,
    pub pdf_url: Option<String>,
}

/// Stored paper row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paper {
    pub id: i64,
    pub external_id: String,
    pub title: String,
    pub abstract_text: Option<String>,
    pub category: Option<String>,
    pub authors: Vec<String>,
    pub published_on: Option<NaiveDate>,
    pub source_url: Option<String>,
    pub pdf_url: Option<String>,
    pub storage_path: Option<String>,
    pub status: PaperStatus,
    pub failure_reason: Option<String>,
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Term
// =============================================================================

/// What to do when an extracted term already exists with another definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionPolicy {
    /// Keep the stored definition; the new one is discarded, only provenance is added.
    #[default]
    KeepFirst,
    /// Replace the stored definition and category with the newest extraction.
    Overwrite,
}

/// One extracted (term, definition, category) triple awaiting persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermInput {
    pub term: String,
    pub definition: String,
    pub category: Option<String>,
}

impl TermInput {
    pub fn new(term: impl Into<String>, definition: impl Into<String>, category: Option<String>) -> Self {
        Self { term: term.into(), definition: definition.into(), category }
    }
}

/// Stored term row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    pub id: i64,
    pub surface_form: String,
    pub display_form: String,
    pub definition: String,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Pipeline runs
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Done,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Done    => "done",
            RunStatus::Failed  => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "done"    => Ok(RunStatus::Done),
            "failed"  => Ok(RunStatus::Failed),
            other     => Err(DbError::InvalidValue(format!("run status '{other}'"))),
        }
    }
}

/// Per-stage paper counts recorded on a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub discovered: u32,
    pub fetched: u32,
    pub extracted: u32,
    pub failed: u32,
}

/// Stored run-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub stage: String,
    pub partial: bool,
    pub counts: RunCounts,
    pub metrics: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward_only() {
        use PaperStatus::*;
        assert!(Discovered.can_transition_to(Fetched));
        assert!(Discovered.can_transition_to(Extracted));
        assert!(Discovered.can_transition_to(Failed));
        assert!(Fetched.can_transition_to(Extracted));
        assert!(Fetched.can_transition_to(Failed));
        assert!(!Extracted.can_transition_to(Discovered));
        assert!(!Extracted.can_transition_to(Fetched));
        assert!(!Extracted.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Discovered));
        assert!(!Fetched.can_transition_to(Discovered));
        assert!(Extracted.can_transition_to(Extracted));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for s in [PaperStatus::Discovered, PaperStatus::Fetched, PaperStatus::Extracted, PaperStatus::Failed] {
            assert_eq!(s.as_str().parse::<PaperStatus>().unwrap(), s);
        }
        assert!("parsed".parse::<PaperStatus>().is_err());
    }

    #[test]
    fn test_definition_policy_default_keeps_first() {
        assert_eq!(DefinitionPolicy::default(), DefinitionPolicy::KeepFirst);
    }
}
