//! lopdf-based text extraction.
//! Reads the PDF text layer page by page; no layout analysis.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use crate::error::IngestionError;
use crate::text::{finish_text, TextExtractor};

/// Lines shorter than this are page numbers, stray glyphs and the like.
const MIN_LINE_CHARS: usize = 3;
/// Repeated-line detection needs enough pages to tell furniture from content.
const MIN_PAGES_FOR_FURNITURE: usize = 3;

pub struct LopdfExtractor {
    reference_cutoff_ratio: f64,
}

impl LopdfExtractor {
    pub fn new(reference_cutoff_ratio: f64) -> Self {
        Self { reference_cutoff_ratio }
    }
}

#[async_trait]
impl TextExtractor for LopdfExtractor {
    fn name(&self) -> &'static str {
        "lopdf"
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn extract(&self, path: &Path) -> Result<String, IngestionError> {
        let owned: PathBuf = path.to_path_buf();
        let pages = tokio::task::spawn_blocking(move || read_pages(&owned))
            .await
            .map_err(|e| IngestionError::extraction(format!("pdf worker: {e}")))??;
        debug!(pages = pages.len(), "PDF text layer read");
        finish_text(&strip_page_furniture(&pages), self.reference_cutoff_ratio)
    }
}

fn read_pages(path: &Path) -> Result<Vec<String>, IngestionError> {
    use lopdf::Document as PdfDoc;

    let pdf = PdfDoc::load(path).map_err(|e| IngestionError::extraction(format!("unreadable PDF: {e}")))?;
    if pdf.is_encrypted() {
        return Err(IngestionError::extraction("encrypted PDF"));
    }

    let mut pages = Vec::new();
    for page_num in pdf.get_pages().keys() {
        // A single undecodable page should not sink the document.
        match pdf.extract_text(&[*page_num]) {
            Ok(text) => pages.push(text),
            Err(e) => debug!(page = page_num, error = %e, "Skipping page"),
        }
    }
    Ok(pages)
}

/// Drop short lines and running headers/footers, then join pages.
///
/// A line counts as furniture when it appears on at least half the pages of
/// a document with three or more pages.
pub fn strip_page_furniture(pages: &[String]) -> String {
    let kept: Vec<Vec<&str>> = pages
        .iter()
        .map(|p| p.lines().map(str::trim).filter(|l| l.chars().count() >= MIN_LINE_CHARS).collect())
        .collect();

    let mut page_hits: HashMap<&str, usize> = HashMap::new();
    if kept.len() >= MIN_PAGES_FOR_FURNITURE {
        for lines in &kept {
            let mut seen: Vec<&str> = lines.clone();
            seen.sort_unstable();
            seen.dedup();
            for l in seen {
                *page_hits.entry(l).or_default() += 1;
            }
        }
    }
    let is_furniture = |l: &str| page_hits.get(l).is_some_and(|n| n * 2 >= kept.len());

    kept.iter()
        .map(|lines| {
            lines.iter().copied().filter(|l| !is_furniture(l)).collect::<Vec<_>>().join("\n")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::DEFAULT_REFERENCE_CUTOFF_RATIO;

    #[test]
    fn test_strip_short_lines() {
        let pages = vec!["Title of paper\n3\nBody text here".to_string()];
        assert_eq!(strip_page_furniture(&pages), "Title of paper\nBody text here");
    }

    #[test]
    fn test_strip_running_header() {
        let pages: Vec<String> = (1..=4)
            .map(|i| format!("Preprint under review\nContent of page {i}\n{i}"))
            .collect();
        let text = strip_page_furniture(&pages);
        assert!(!text.contains("Preprint under review"));
        assert!(text.contains("Content of page 1"));
        assert!(text.contains("Content of page 4"));
    }

    #[test]
    fn test_two_page_docs_keep_repeats() {
        let pages = vec!["Same line\nOne".to_string(), "Same line\nTwo".to_string()];
        assert_eq!(strip_page_furniture(&pages), "Same line\nOne\nSame line\nTwo");
    }

    #[tokio::test]
    async fn test_non_pdf_is_extraction_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.pdf");
        std::fs::write(&path, b"this is not a pdf").unwrap();
        let err = LopdfExtractor::new(DEFAULT_REFERENCE_CUTOFF_RATIO).extract(&path).await.unwrap_err();
        assert!(matches!(err, IngestionError::ExtractionFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_file_is_extraction_failed() {
        let err = LopdfExtractor::new(0.5).extract(Path::new("/nonexistent/x.pdf")).await.unwrap_err();
        assert!(matches!(err, IngestionError::ExtractionFailed { .. }));
    }
}
