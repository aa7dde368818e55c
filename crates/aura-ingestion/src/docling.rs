//! Docling service client for structured PDF extraction.

use async_trait::async_trait;
use aura_common::SandboxClient;
use serde::Deserialize;
use std::path::Path;
use tokio::fs;
use tracing::{debug, instrument};

use crate::error::IngestionError;
use crate::text::{finish_text, TextExtractor};

pub const DOCLING_DEFAULT_URL: &str = "http://localhost:8003";

/// Extracts text by posting the PDF to a Docling service.
pub struct DoclingExtractor {
    client: SandboxClient,
    base_url: String,
    reference_cutoff_ratio: f64,
}

impl DoclingExtractor {
    pub fn new(client: SandboxClient, base_url: &str, reference_cutoff_ratio: f64) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            reference_cutoff_ratio,
        }
    }

    /// Check if the Docling service is reachable.
    pub async fn health_check(&self) -> bool {
        let Ok(req) = self.client.get(&format!("{}/health", self.base_url)) else {
            return false;
        };
        matches!(req.send().await, Ok(resp) if resp.status().is_success())
    }

    async fn parse_pdf(&self, pdf_path: &Path) -> Result<ParsedDocument, IngestionError> {
        let file_bytes = fs::read(pdf_path)
            .await
            .map_err(|e| IngestionError::extraction(format!("read {}: {e}", pdf_path.display())))?;
        let filename = pdf_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document.pdf");

        let part = reqwest::multipart::Part::bytes(file_bytes)
            .file_name(filename.to_string())
            .mime_str("application/pdf")
            .map_err(|e| IngestionError::extraction(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(&format!("{}/parse", self.base_url))
            .map_err(|e| IngestionError::Config(e.to_string()))?
            .multipart(form)
            .send()
            .await
            .map_err(|e| IngestionError::extraction(format!("docling request: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error = resp.text().await.unwrap_or_default();
            return Err(IngestionError::extraction(format!("docling parse failed ({status}): {error}")));
        }

        resp.json()
            .await
            .map_err(|e| IngestionError::extraction(format!("docling response: {e}")))
    }
}

/// Parsed document from Docling. Only the text-bearing fields are read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParsedDocument {
    #[serde(default)]
    pub markdown: Option<String>,
    #[serde(default)]
    pub full_text: String,
    #[serde(default)]
    pub sections: Vec<DoclingSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DoclingSection {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
}

impl ParsedDocument {
    /// Markdown export when present, else the flat text, else the sections.
    pub fn text(&self) -> String {
        if let Some(md) = self.markdown.as_deref().filter(|m| !m.trim().is_empty()) {
            return md.to_string();
        }
        if !self.full_text.trim().is_empty() {
            return self.full_text.clone();
        }
        self.sections
            .iter()
            .map(|s| format!("{}\n{}", s.title, s.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[async_trait]
impl TextExtractor for DoclingExtractor {
    fn name(&self) -> &'static str {
        "docling"
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn extract(&self, path: &Path) -> Result<String, IngestionError> {
        let doc = self.parse_pdf(path).await?;
        let text = doc.text();
        debug!(chars = text.len(), "Docling returned document");
        finish_text(&text, self.reference_cutoff_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_markdown() {
        let doc: ParsedDocument = serde_json::from_str(
            r##"{"markdown": "# Intro\nBody", "full_text": "flat", "sections": []}"##,
        )
        .unwrap();
        assert_eq!(doc.text(), "# Intro\nBody");
    }

    #[test]
    fn test_falls_back_to_sections() {
        let doc: ParsedDocument = serde_json::from_str(
            r#"{"sections": [{"title": "Intro", "text": "A"}, {"title": "Method", "text": "B"}]}"#,
        )
        .unwrap();
        assert_eq!(doc.text(), "Intro\nA\n\nMethod\nB");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_extraction_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();
        let ex = DoclingExtractor::new(SandboxClient::new().unwrap(), "http://127.0.0.1:9/", 0.5);
        assert!(!ex.health_check().await);
        let err = ex.extract(&path).await.unwrap_err();
        assert!(matches!(err, IngestionError::ExtractionFailed { .. }));
    }
}
