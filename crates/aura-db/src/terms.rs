//! Term repository.
//!
//! Terms are unique by normalised surface form. Every write for one paper's
//! term set happens in a single transaction together with the paper's move
//! to `extracted`, so readers see either all of a paper's links or none.

use crate::database::Database;
use crate::error::{DbError, Result};
use crate::schema::{DefinitionPolicy, PaperStatus, Term, TermInput};
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};

const TERM_COLUMNS: &str = "t.id, t.surface_form, t.display_form, t.definition, t.category, t.created_at, t.updated_at";

/// Characters stripped from both ends of a term before comparison.
const EDGE_CHARS: &[char] = &[
    '"', '\'', '`', '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}', '\u{00AB}', '\u{00BB}',
    '.', ',', ';', ':', '!', '?', '*',
];

/// Uniqueness key for a term: lowercase, whitespace collapsed, surrounding
/// quotes and punctuation removed.
pub fn normalise_surface_form(term: &str) -> String {
    let collapsed = collapse_whitespace(term);
    collapsed
        .trim_matches(|c: char| c.is_whitespace() || EDGE_CHARS.contains(&c))
        .to_lowercase()
}

fn display_form(term: &str) -> String {
    collapse_whitespace(term)
        .trim_matches(|c: char| c.is_whitespace() || EDGE_CHARS.contains(&c))
        .to_string()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Outcome of persisting one paper's term set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TermUpsertReport {
    pub new_terms: u32,
    pub existing_terms: u32,
    pub links_added: u32,
}

/// Repository for term and provenance-link operations.
#[derive(Clone)]
pub struct TermRepository {
    db: Arc<Database>,
}

impl TermRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or link every term of a paper and mark the paper `extracted`,
    /// all in one transaction.
    ///
    /// Inputs with an empty term or definition are skipped. Surface forms that
    /// repeat within the batch collapse to their first occurrence.
    #[instrument(skip(self, terms), fields(n = terms.len()))]
    pub async fn upsert_terms(
        &self,
        paper_id: i64,
        terms: &[TermInput],
        policy: DefinitionPolicy,
    ) -> Result<TermUpsertReport> {
        let now = Utc::now();
        let mut report = TermUpsertReport::default();
        let mut tx = self.db.pool().begin().await?;

        let stored: Option<String> = sqlx::query_scalar("SELECT status FROM papers WHERE id = ?")
            .bind(paper_id)
            .fetch_optional(&mut *tx)
            .await?;
        let stored: PaperStatus = stored
            .ok_or_else(|| DbError::NotFound(format!("paper {paper_id}")))?
            .parse()?;
        if !stored.can_transition_to(PaperStatus::Extracted) {
            return Err(DbError::StatusRegression {
                paper_id,
                from: stored.to_string(),
                to: PaperStatus::Extracted.to_string(),
            });
        }

        let mut seen = HashSet::new();
        for input in terms {
            let surface = normalise_surface_form(&input.term);
            let definition = input.definition.trim();
            if surface.is_empty() || definition.is_empty() || !seen.insert(surface.clone()) {
                continue;
            }

            let existing: Option<(i64, String)> =
                sqlx::query_as("SELECT id, definition FROM terms WHERE surface_form = ?")
                    .bind(&surface)
                    .fetch_optional(&mut *tx)
                    .await?;

            let term_id = match existing {
                Some((term_id, current)) => {
                    report.existing_terms += 1;
                    if policy == DefinitionPolicy::Overwrite && current != definition {
                        sqlx::query(
                            "UPDATE terms SET definition = ?, category = COALESCE(?, category), updated_at = ? WHERE id = ?",
                        )
                        .bind(definition)
                        .bind(&input.category)
                        .bind(now)
                        .bind(term_id)
                        .execute(&mut *tx)
                        .await?;
                    }
                    term_id
                }
                None => {
                    report.new_terms += 1;
                    sqlx::query(
                        r#"
                        INSERT INTO terms (surface_form, display_form, definition, category, created_at, updated_at)
                        VALUES (?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&surface)
                    .bind(display_form(&input.term))
                    .bind(definition)
                    .bind(&input.category)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?
                    .last_insert_rowid()
                }
            };

            let linked = sqlx::query(
                "INSERT OR IGNORE INTO term_paper_links (term_id, paper_id, created_at) VALUES (?, ?, ?)",
            )
            .bind(term_id)
            .bind(paper_id)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            report.links_added += linked as u32;
        }

        sqlx::query("UPDATE papers SET status = ?, updated_at = ? WHERE id = ?")
            .bind(PaperStatus::Extracted.as_str())
            .bind(now)
            .bind(paper_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(
            new_terms = report.new_terms,
            existing_terms = report.existing_terms,
            links_added = report.links_added,
            "Terms committed"
        );
        Ok(report)
    }

    /// Look a term up by any spelling that normalises to its surface form.
    pub async fn find_by_surface_form(&self, term: &str) -> Result<Option<Term>> {
        let row = sqlx::query(&format!("SELECT {TERM_COLUMNS} FROM terms t WHERE t.surface_form = ?"))
            .bind(normalise_surface_form(term))
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(row_to_term).transpose()
    }

    /// Terms linked to a paper, in insertion order.
    pub async fn terms_for_paper(&self, paper_id: i64) -> Result<Vec<Term>> {
        let rows = sqlx::query(&format!(
            "SELECT {TERM_COLUMNS} FROM terms t \
             JOIN term_paper_links l ON l.term_id = t.id \
             WHERE l.paper_id = ? ORDER BY t.id"
        ))
        .bind(paper_id)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(row_to_term).collect()
    }

    /// Number of papers a term is linked to.
    pub async fn paper_count(&self, term_id: i64) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM term_paper_links WHERE term_id = ?")
            .bind(term_id)
            .fetch_one(self.db.pool())
            .await?;
        Ok(n.max(0) as u64)
    }

    /// Count all terms.
    pub async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM terms")
            .fetch_one(self.db.pool())
            .await?;
        Ok(n.max(0) as u64)
    }

    /// Count all term–paper links.
    pub async fn link_count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM term_paper_links")
            .fetch_one(self.db.pool())
            .await?;
        Ok(n.max(0) as u64)
    }

    /// Count links recorded for one paper.
    pub async fn link_count_for_paper(&self, paper_id: i64) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM term_paper_links WHERE paper_id = ?")
            .bind(paper_id)
            .fetch_one(self.db.pool())
            .await?;
        Ok(n.max(0) as u64)
    }
}

fn row_to_term(row: &SqliteRow) -> Result<Term> {
    Ok(Term {
        id: row.try_get("id")?,
        surface_form: row.try_get("surface_form")?,
        display_form: row.try_get("display_form")?,
        definition: row.try_get("definition")?,
        category: row.try_get("category")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
