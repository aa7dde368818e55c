//! LLM backend trait and concrete implementations.
//!
//! Backends:
//!   OllamaBackend           local Ollama, `/api/generate` (non-streaming)
//!   OpenAiCompatibleBackend OpenAI or any `/v1/chat/completions` endpoint
//!                             (LMStudio, vLLM, OpenRouter, …)
//!   GeminiBackend           Google Gemini API
//!
//! Every backend issues its requests through a [`SandboxClient`], so the
//! endpoint host must be on the allowlist.

use async_trait::async_trait;
use aura_common::{AuraError, Retryable, SandboxClient};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Request blocked: {0}")]
    Blocked(String),
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
    #[error("API error [{status}]: {message}")]
    ApiError { status: u16, message: String },
    #[error("Invalid backend configuration: {0}")]
    Config(String),
}

impl From<AuraError> for LlmError {
    fn from(e: AuraError) -> Self {
        match e {
            AuraError::Http(e) => LlmError::Http(e),
            AuraError::Serialization(e) => LlmError::Serde(e),
            AuraError::Security(msg) => LlmError::Blocked(msg),
            AuraError::InvalidUrl(msg) | AuraError::Config(msg) => LlmError::Config(msg),
        }
    }
}

impl Retryable for LlmError {
    /// Transport failures, throttling and server-side errors are worth another
    /// attempt; malformed payloads and policy blocks are not.
    fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http(e) => !e.is_decode() && !e.is_builder(),
            LlmError::Unavailable(_) | LlmError::RateLimitExceeded => true,
            LlmError::ApiError { status, .. } => *status >= 500 || *status == 408,
            LlmError::Serde(_) | LlmError::Blocked(_) | LlmError::Config(_) => false,
        }
    }
}

// ── Request / Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,   // "system" | "user" | "assistant"
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl LlmRequest {
    /// Single user-turn request with backend defaults.
    pub fn prompt(text: impl Into<String>) -> Self {
        Self { messages: vec![Message::user(text)], model: None, max_tokens: None, temperature: None }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// All message contents joined, for completion-style endpoints.
    fn flat_prompt(&self) -> String {
        self.messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

// ── Trait ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError>;
    fn model_id(&self) -> &str;
    fn is_local(&self) -> bool;
    fn max_context_tokens(&self) -> usize;
}

// ── Helper: parse OpenAI-style response ──────────────────────────────────────

fn parse_openai_response(json: &serde_json::Value, fallback_model: &str) -> LlmResponse {
    LlmResponse {
        content: json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string(),
        model: json["model"]
            .as_str()
            .unwrap_or(fallback_model)
            .to_string(),
        prompt_tokens:     json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
    }
}

fn parse_ollama_response(json: &serde_json::Value, fallback_model: &str) -> LlmResponse {
    LlmResponse {
        content: json["response"].as_str().unwrap_or("").to_string(),
        model: json["model"].as_str().unwrap_or(fallback_model).to_string(),
        prompt_tokens:     json["prompt_eval_count"].as_u64().unwrap_or(0) as u32,
        completion_tokens: json["eval_count"].as_u64().unwrap_or(0) as u32,
    }
}

async fn check_response_status(resp: reqwest::Response) -> Result<serde_json::Value, LlmError> {
    let status = resp.status().as_u16();
    let text = resp.text().await?;
    if status == 429 {
        return Err(LlmError::RateLimitExceeded);
    }
    if status >= 400 {
        let body: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
        let msg = body["error"]["message"]
            .as_str()
            .or_else(|| body["error"].as_str())
            .or_else(|| body["message"].as_str())
            .map(str::to_string)
            .unwrap_or_else(|| text.chars().take(200).collect());
        return Err(LlmError::ApiError { status, message: msg });
    }
    Ok(serde_json::from_str(&text)?)
}

fn map_send_error(e: reqwest::Error, base_url: &str) -> LlmError {
    if e.is_connect() || e.is_timeout() {
        LlmError::Unavailable(format!("{base_url}: {e}"))
    } else {
        LlmError::Http(e)
    }
}

// ── 1. Ollama (local) ─────────────────────────────────────────────────────────

/// Default context window requested from Ollama; papers are long.
pub const DEFAULT_NUM_CTX: u32 = 65_536;

pub struct OllamaBackend {
    pub base_url: String,
    pub model: String,
    pub num_ctx: u32,
    client: SandboxClient,
}

impl OllamaBackend {
    /// `base_url` may be the server root (`http://localhost:11434`) or the full
    /// `/api/generate` endpoint.
    pub fn new(client: SandboxClient, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        let base_url = base_url
            .trim_end_matches('/')
            .trim_end_matches("/api/generate")
            .to_string();
        Self { base_url, model: model.into(), num_ctx: DEFAULT_NUM_CTX, client }
    }

    pub fn with_num_ctx(mut self, num_ctx: u32) -> Self {
        self.num_ctx = num_ctx;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    #[instrument(skip(self, req), fields(model = %self.model))]
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let model = req.model.as_deref().unwrap_or(&self.model);
        let mut options = serde_json::json!({ "num_ctx": self.num_ctx });
        if let Some(t) = req.temperature {
            options["temperature"] = serde_json::json!(t);
        }
        if let Some(n) = req.max_tokens {
            options["num_predict"] = serde_json::json!(n);
        }
        let body = serde_json::json!({
            "model":   model,
            "prompt":  req.flat_prompt(),
            "stream":  false,
            "options": options,
        });

        let resp = self.client
            .post(&self.endpoint())?
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(e, &self.base_url))?;
        let json = check_response_status(resp).await?;
        let out = parse_ollama_response(&json, model);
        debug!(completion_tokens = out.completion_tokens, "Ollama completion");
        Ok(out)
    }

    fn model_id(&self) -> &str { &self.model }
    fn is_local(&self) -> bool { true }
    fn max_context_tokens(&self) -> usize { self.num_ctx as usize }
}

// ── 2. OpenAI-Compatible (OpenAI, LMStudio, vLLM, OpenRouter, …) ─────────────

pub const OPENAI_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiCompatibleBackend {
    pub base_url: String,
    pub model: String,
    api_key: Option<String>,
    client: SandboxClient,
}

impl OpenAiCompatibleBackend {
    pub fn new(
        client: SandboxClient,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self { base_url: base_url.into(), model: model.into(), api_key, client }
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(k) => req.bearer_auth(k),
            None    => req,
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    #[instrument(skip(self, req), fields(model = %self.model))]
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model":       req.model.as_deref().unwrap_or(&self.model),
            "messages":    req.messages,
            "max_tokens":  req.max_tokens.unwrap_or(4096),
            "temperature": req.temperature.unwrap_or(0.1),
        });
        let resp = self.auth(self.client.post(&url)?)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(e, &self.base_url))?;
        let json = check_response_status(resp).await?;
        Ok(parse_openai_response(&json, &self.model))
    }

    fn model_id(&self) -> &str { &self.model }
    fn is_local(&self) -> bool {
        self.base_url.contains("localhost") || self.base_url.contains("127.0.0.1")
    }
    fn max_context_tokens(&self) -> usize { 128_000 }
}

// ── 3. Google Gemini ──────────────────────────────────────────────────────────

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiBackend {
    pub model: String,
    base_url: String,
    api_key: String,
    client: SandboxClient,
}

impl GeminiBackend {
    pub fn new(client: SandboxClient, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: GEMINI_BASE_URL.to_string(),
            client,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl LlmBackend for GeminiBackend {
    #[instrument(skip(self, req), fields(model = %self.model))]
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let model = req.model.as_deref().unwrap_or(&self.model);
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            model
        );

        // System message → systemInstruction
        let system_text = req.messages.iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.clone());

        let contents: Vec<serde_json::Value> = req.messages.iter()
            .filter(|m| m.role != "system")
            .map(|m| {
                let role = if m.role == "assistant" { "model" } else { "user" };
                serde_json::json!({
                    "role": role,
                    "parts": [{ "text": m.content }]
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": req.max_tokens.unwrap_or(8192),
                "temperature":     req.temperature.unwrap_or(0.1),
            }
        });
        if let Some(sys) = system_text {
            body["systemInstruction"] = serde_json::json!({
                "parts": [{ "text": sys }]
            });
        }

        let resp = self.client
            .post(&url)?
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(e, &self.base_url))?;
        let json = check_response_status(resp).await?;

        let content = json["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts.iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<String>()
            })
            .unwrap_or_default();

        Ok(LlmResponse {
            content,
            model: model.to_string(),
            prompt_tokens:     json["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            completion_tokens: json["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
        })
    }

    fn model_id(&self) -> &str { &self.model }
    fn is_local(&self) -> bool { false }
    fn max_context_tokens(&self) -> usize { 1_000_000 }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
