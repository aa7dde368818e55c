//! Data models for the ingestion pipeline.

use aura_db::{Paper, PaperRecord, TermInput};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A paper as reported by the catalog, before anything is stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperMetadata {
    /// Catalog identifier including version, e.g. `2401.12345v1`.
    pub external_id: String,
    pub title: String,
    pub abstract_text: Option<String>,
    /// Primary category first, then cross-lists.
    pub categories: Vec<String>,
    pub authors: Vec<String>,
    pub published_on: Option<NaiveDate>,
    /// Abstract page.
    pub source_url: Option<String>,
    pub pdf_url: Option<String>,
}

impl PaperMetadata {
    pub fn primary_category(&self) -> Option<&str> {
        self.categories.first().map(String::as_str)
    }

    pub fn to_record(&self) -> PaperRecord {
        PaperRecord {
            external_id: self.external_id.clone(),
            title: self.title.clone(),
            abstract_text: self.abstract_text.clone(),
            category: self.primary_category().map(str::to_string),
            authors: self.authors.clone(),
            published_on: self.published_on,
            source_url: self.source_url.clone(),
            pdf_url: self.pdf_url.clone(),
        }
    }
}

/// Rebuilds catalog metadata from a stored row. Only the primary category
/// survives storage.
impl From<&Paper> for PaperMetadata {
    fn from(paper: &Paper) -> Self {
        Self {
            external_id: paper.external_id.clone(),
            title: paper.title.clone(),
            abstract_text: paper.abstract_text.clone(),
            categories: paper.category.iter().cloned().collect(),
            authors: paper.authors.clone(),
            published_on: paper.published_on,
            source_url: paper.source_url.clone(),
            pdf_url: paper.pdf_url.clone(),
        }
    }
}

/// Everything the extraction engine produced for one paper.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionOutput {
    /// Candidates returned by the keyword pass.
    pub keywords: Vec<String>,
    /// Validated (term, definition, category) triples from the definition pass.
    pub terms: Vec<TermInput>,
}

impl ExtractionOutput {
    /// Models occasionally return a keyword list and then define nothing.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_record_uses_primary_category() {
        let meta = PaperMetadata {
            external_id: "2401.00001v1".into(),
            title: "T".into(),
            categories: vec!["cs.CL".into(), "cs.AI".into()],
            ..Default::default()
        };
        let rec = meta.to_record();
        assert_eq!(rec.category.as_deref(), Some("cs.CL"));
        assert_eq!(rec.external_id, "2401.00001v1");
        assert!(PaperMetadata::default().primary_category().is_none());
    }
}
