//! Backend selection: local (Ollama) vs. remote (OpenAI-compatible or Gemini).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use aura_common::SandboxClient;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::{
    GeminiBackend, LlmBackend, LlmError, OllamaBackend, OpenAiCompatibleBackend,
    DEFAULT_NUM_CTX, GEMINI_BASE_URL, OPENAI_BASE_URL,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Remote,
}

impl FromStr for BackendKind {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "ollama" => Ok(BackendKind::Local),
            "remote"           => Ok(BackendKind::Remote),
            other => Err(LlmError::Config(format!("unknown backend '{other}' (expected local or remote)"))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local  => f.write_str("local"),
            BackendKind::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteProvider {
    #[default]
    Gemini,
    OpenAi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaSettings {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    /// Model used for the definition pass; defaults to `model`.
    #[serde(default)]
    pub definition_model: Option<String>,
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            model: default_ollama_model(),
            definition_model: None,
            num_ctx: default_num_ctx(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteSettings {
    #[serde(default)]
    pub provider: RemoteProvider,
    /// Overrides the provider's public endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_remote_model")]
    pub model: String,
    #[serde(default)]
    pub definition_model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_ollama_url() -> String { "http://localhost:11434".to_string() }
fn default_ollama_model() -> String { "gemma3:12b".to_string() }
fn default_num_ctx() -> u32 { DEFAULT_NUM_CTX }
fn default_remote_model() -> String { "gemini-2.0-flash".to_string() }

/// Model override for the definition pass under the selected backend.
pub fn definition_model(kind: BackendKind, ollama: &OllamaSettings, remote: &RemoteSettings) -> Option<String> {
    match kind {
        BackendKind::Local  => ollama.definition_model.clone(),
        BackendKind::Remote => remote.definition_model.clone(),
    }
}

/// Build the configured backend. The endpoint host is added to the client's
/// allowlist.
pub fn build_backend(
    kind: BackendKind,
    ollama: &OllamaSettings,
    remote: &RemoteSettings,
    mut client: SandboxClient,
) -> Result<Arc<dyn LlmBackend>, LlmError> {
    let backend: Arc<dyn LlmBackend> = match kind {
        BackendKind::Local => {
            client.allow_url_host(&ollama.base_url)?;
            Arc::new(
                OllamaBackend::new(client, &ollama.base_url, &ollama.model).with_num_ctx(ollama.num_ctx),
            )
        }
        BackendKind::Remote => {
            let api_key = remote
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| LlmError::Config("remote backend selected but no API key configured".to_string()))?;
            match remote.provider {
                RemoteProvider::Gemini => {
                    let base_url = remote.base_url.clone().unwrap_or_else(|| GEMINI_BASE_URL.to_string());
                    client.allow_url_host(&base_url)?;
                    Arc::new(GeminiBackend::new(client, api_key, &remote.model).with_base_url(base_url))
                }
                RemoteProvider::OpenAi => {
                    let base_url = remote.base_url.clone().unwrap_or_else(|| OPENAI_BASE_URL.to_string());
                    client.allow_url_host(&base_url)?;
                    Arc::new(OpenAiCompatibleBackend::new(client, base_url, &remote.model, Some(api_key)))
                }
            }
        }
    };

    info!(
        backend = %kind,
        model = backend.model_id(),
        is_local = backend.is_local(),
        "LLM backend selected"
    );
    Ok(backend)
}
