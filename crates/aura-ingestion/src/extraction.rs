//! Two-pass terminology extraction: a keyword pass over the abstract, then a
//! definition pass over the full text conditioned on those keywords.

use aura_common::RetryPolicy;
use aura_db::TermInput;
use aura_llm::{LlmBackend, LlmRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

use crate::error::IngestionError;
use crate::models::{ExtractionOutput, PaperMetadata};
use crate::response_parser::{parse_definitions, parse_keywords};

pub const DEFAULT_MAX_INPUT_CHARS: usize = 200_000;
pub const DEFAULT_KEYWORD_CONTEXT_CHARS: usize = 4_000;

pub const DEFAULT_KEYWORD_PROMPT: &str = "For the following paper abstract, extract the technical keywords \
that a newcomer to the field would need defined. Return the keywords in a Python list and nothing else. \
For example: ['retrieval-augmented generation', 'contrastive loss']. Here is the text to analyze: ";

pub const DEFAULT_DEFINITION_PROMPT: &str = "For each keyword above, write a one-sentence definition as the \
term is used in the paper below. Return a Python dictionary mapping each keyword to its definition, using None \
when the paper gives no basis for one. Return only the dictionary. Here is the paper: ";

/// The two fixed prompt templates. Input text is appended verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplates {
    pub keyword: String,
    pub definition: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            keyword: DEFAULT_KEYWORD_PROMPT.to_string(),
            definition: DEFAULT_DEFINITION_PROMPT.to_string(),
        }
    }
}

pub struct ExtractionEngine {
    backend: Arc<dyn LlmBackend>,
    prompts: PromptTemplates,
    definition_model: Option<String>,
    retry: RetryPolicy,
    max_input_chars: usize,
    keyword_context_chars: usize,
}

impl ExtractionEngine {
    pub fn new(backend: Arc<dyn LlmBackend>, prompts: PromptTemplates) -> Self {
        Self {
            backend,
            prompts,
            definition_model: None,
            retry: RetryPolicy::default(),
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            keyword_context_chars: DEFAULT_KEYWORD_CONTEXT_CHARS,
        }
    }

    /// Use a different model for the definition pass.
    pub fn with_definition_model(mut self, model: Option<String>) -> Self {
        self.definition_model = model;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_limits(mut self, max_input_chars: usize, keyword_context_chars: usize) -> Self {
        self.max_input_chars = max_input_chars.max(1);
        self.keyword_context_chars = keyword_context_chars.max(1);
        self
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    /// Keyword prompt: the abstract, or the head of the text when there is none.
    pub fn keyword_prompt(&self, paper: &PaperMetadata, text: &str) -> String {
        let input = match paper.abstract_text.as_deref().map(str::trim) {
            Some(a) if !a.is_empty() => a,
            _ => truncate_chars(text, self.keyword_context_chars),
        };
        format!("{}{}", self.prompts.keyword, input)
    }

    pub fn definition_prompt(&self, candidates: &[String], text: &str) -> String {
        format!(
            "{}: {}{}",
            format_candidates(candidates),
            self.prompts.definition,
            truncate_chars(text, self.max_input_chars)
        )
    }

    /// Run both passes for one paper.
    ///
    /// An unusable model response is an empty result, not an error. Fails
    /// with [`IngestionError::InferenceUnavailable`] when the backend cannot
    /// be reached after retries or rejects the request.
    #[instrument(skip(self, paper, text), fields(external_id = %paper.external_id, model = %self.backend.model_id()))]
    pub async fn extract(&self, paper: &PaperMetadata, text: &str) -> Result<ExtractionOutput, IngestionError> {
        let t0 = Instant::now();
        let raw = self.complete("keyword_pass", LlmRequest::prompt(self.keyword_prompt(paper, text))).await?;
        let keywords = parse_keywords(&raw);
        debug!(keywords = keywords.len(), "Keyword pass complete");
        if keywords.is_empty() {
            info!("No keywords returned; skipping definition pass");
            return Ok(ExtractionOutput::default());
        }

        let req = LlmRequest::prompt(self.definition_prompt(&keywords, text)).with_model(self.definition_model.clone());
        let raw = self.complete("definition_pass", req).await?;
        let category = paper.primary_category().map(str::to_string);
        let terms: Vec<TermInput> = parse_definitions(&raw)
            .into_iter()
            .map(|d| TermInput::new(d.term, d.definition, category.clone()))
            .collect();

        info!(
            keywords = keywords.len(),
            definitions = terms.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Extraction complete"
        );
        Ok(ExtractionOutput { keywords, terms })
    }

    async fn complete(&self, operation: &str, req: LlmRequest) -> Result<String, IngestionError> {
        self.retry
            .run(operation, || self.backend.complete(req.clone()))
            .await
            .map(|resp| resp.content)
            .map_err(|e| IngestionError::InferenceUnavailable(format!("{operation}: {e}")))
    }
}

/// Python-list rendering, matching what the prompts ask the model to return.
fn format_candidates(candidates: &[String]) -> String {
    let items: Vec<String> = candidates.iter().map(|c| format!("'{}'", c.replace('\'', "\\'"))).collect();
    format!("[{}]", items.join(", "))
}

/// At most `max` chars of `s`, cut on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    s.char_indices().nth(max).map_or(s, |(i, _)| &s[..i])
}
