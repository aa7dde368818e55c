//! Text extraction interface and the cleaning shared by every strategy.

use async_trait::async_trait;
use aura_common::SandboxClient;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::docling::DoclingExtractor;
use crate::error::IngestionError;
use crate::pdf_parser::LopdfExtractor;

pub const DEFAULT_REFERENCE_CUTOFF_RATIO: f64 = 0.5;

lazy_static! {
    static ref REFERENCE_HEADING: Regex = Regex::new(
        r"(?i)^\s*(?:#+\s*)?(?:(?:\d+|[ivxlc]+)\.?\s+)?(?:references|bibliography|works\s+cited)\s*:?\s*$"
    ).unwrap();
    static ref MULTI_SPACE: Regex = Regex::new(r" {2,}").unwrap();
    static ref MULTI_NEWLINE: Regex = Regex::new(r"\n{3,}").unwrap();
}

/// Converts a staged document into cleaned plain text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fails with [`IngestionError::ExtractionFailed`] when the document is
    /// unreadable or yields no text.
    async fn extract(&self, path: &Path) -> Result<String, IngestionError>;
}

/// Which extractor the pipeline uses; chosen once per deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStrategy {
    /// In-process lopdf text layer; fast, loses layout.
    #[default]
    Heuristic,
    /// Docling service; slower, keeps structure.
    Structured,
}

impl FromStr for ExtractionStrategy {
    type Err = IngestionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "heuristic" | "lopdf" | "pypdf" => Ok(ExtractionStrategy::Heuristic),
            "structured" | "docling"         => Ok(ExtractionStrategy::Structured),
            other => Err(IngestionError::Config(format!("unknown extraction strategy '{other}'"))),
        }
    }
}

impl fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionStrategy::Heuristic  => f.write_str("heuristic"),
            ExtractionStrategy::Structured => f.write_str("structured"),
        }
    }
}

pub fn build_extractor(
    strategy: ExtractionStrategy,
    client: SandboxClient,
    docling_url: &str,
    reference_cutoff_ratio: f64,
) -> Result<Arc<dyn TextExtractor>, IngestionError> {
    Ok(match strategy {
        ExtractionStrategy::Heuristic => Arc::new(LopdfExtractor::new(reference_cutoff_ratio)),
        ExtractionStrategy::Structured => {
            let mut client = client;
            client
                .allow_url_host(docling_url)
                .map_err(|e| IngestionError::Config(e.to_string()))?;
            Arc::new(DoclingExtractor::new(client, docling_url, reference_cutoff_ratio))
        }
    })
}

/// Normalise raw extracted text.
///
/// Control characters other than `\n` and `\t` are removed, typographic
/// punctuation is mapped to ASCII, words hyphenated across a line break are
/// rejoined, and whitespace is collapsed.
pub fn clean_text(raw: &str) -> String {
    let mut text = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\n' | '\t' => text.push(ch),
            '\u{2018}' | '\u{2019}' => text.push('\''),
            '\u{201C}' | '\u{201D}' => text.push('"'),
            '\u{2013}' | '\u{2014}' | '\u{2212}' => text.push('-'),
            '\u{2026}' => text.push_str("..."),
            '\u{00A0}' => text.push(' '),
            '\u{7F}' | '\u{FFFD}' => {}
            c if (c as u32) < 32 => {}
            c => text.push(c),
        }
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut joined: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim_end();
        if let (Some(stem), Some(next)) = (line.strip_suffix('-'), lines.get(i + 1)) {
            joined.push(format!("{stem}{}", next.trim_start()));
            i += 2;
        } else {
            joined.push(line.to_string());
            i += 1;
        }
    }

    let text = joined.join("\n").replace('\t', " ");
    let text = MULTI_SPACE.replace_all(&text, " ");
    let text = MULTI_NEWLINE.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Drop the reference list: everything from the last references-style heading
/// that starts past `ratio` of the text.
pub fn cut_references(text: &str, ratio: f64) -> &str {
    let min_offset = (text.len() as f64 * ratio.clamp(0.0, 1.0)) as usize;
    let mut cut = None;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if offset >= min_offset && REFERENCE_HEADING.is_match(line.trim_end_matches(['\n', '\r'])) {
            cut = Some(offset);
        }
        offset += line.len();
    }
    match cut {
        Some(at) => text[..at].trim_end(),
        None => text,
    }
}

/// Clean, trim references, and reject documents with nothing left.
pub fn finish_text(raw: &str, reference_cutoff_ratio: f64) -> Result<String, IngestionError> {
    let cleaned = clean_text(raw);
    let body = cut_references(&cleaned, reference_cutoff_ratio);
    if body.trim().is_empty() {
        return Err(IngestionError::extraction("no extractable text"));
    }
    Ok(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text_normalises_punctuation() {
        let raw = "\u{201C}Deep\u{201D} learning\u{2014}it\u{2019}s here\u{2026}\u{00A0}now\u{0007}";
        assert_eq!(clean_text(raw), "\"Deep\" learning-it's here... now");
    }

    #[test]
    fn test_clean_text_joins_hyphenated_words() {
        assert_eq!(clean_text("optimi-\n  sation works"), "optimisation works");
        assert_eq!(clean_text("a -\nb"), "a b");
    }

    #[test]
    fn test_clean_text_collapses_whitespace() {
        let raw = "  one\t\ttwo   three\n\n\n\n\nfour  ";
        assert_eq!(clean_text(raw), "one two three\n\nfour");
    }

    #[test]
    fn test_cut_references_after_ratio() {
        let body = "Intro text about transformers.\n".repeat(10);
        let text = format!("{body}7 References\n[1] Vaswani et al. Attention is all you need.");
        let cut = cut_references(&text, 0.5);
        assert!(!cut.contains("Vaswani"));
        assert!(cut.ends_with("transformers."));
    }

    #[test]
    fn test_cut_references_ignores_early_heading() {
        let text = format!("References\nearly mention\n{}", "Body line.\n".repeat(20));
        assert_eq!(cut_references(&text, 0.5), text);
    }

    #[test]
    fn test_reference_heading_variants() {
        for h in ["References", "REFERENCES", "## References", "Bibliography:", "6. References", "VII. Works Cited"] {
            assert!(REFERENCE_HEADING.is_match(h), "{h}");
        }
        assert!(!REFERENCE_HEADING.is_match("We list references below."));
    }

    #[test]
    fn test_finish_text_rejects_empty() {
        assert!(matches!(finish_text(" \u{0001}\n\n ", 0.5), Err(IngestionError::ExtractionFailed { .. })));
        assert_eq!(finish_text("Hello  world", 0.5).unwrap(), "Hello world");
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("docling".parse::<ExtractionStrategy>().unwrap(), ExtractionStrategy::Structured);
        assert_eq!("pypdf".parse::<ExtractionStrategy>().unwrap(), ExtractionStrategy::Heuristic);
        assert!("ocr".parse::<ExtractionStrategy>().is_err());
    }
}
