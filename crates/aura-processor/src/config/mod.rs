//! Configuration loading for the AURA processor.
//! Reads aura.toml from the path in AURA_CONFIG or the current directory,
//! then applies environment overrides. A missing file means all defaults.

use anyhow::{bail, Context};
use aura_common::RetryPolicy;
use aura_db::DefinitionPolicy;
use aura_ingestion::extraction::{DEFAULT_DEFINITION_PROMPT, DEFAULT_KEYWORD_PROMPT};
use aura_ingestion::{ExtractionStrategy, PipelineConfig, PromptTemplates};
use aura_llm::{BackendKind, OllamaSettings, RemoteSettings};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "aura.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> PathBuf { PathBuf::from("./data/aura.db") }
fn default_max_connections() -> u32 { 4 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path(), max_connections: default_max_connections() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
}

fn default_topic()         -> String { "cs.AI".to_string() }
fn default_max_results()   -> usize  { 100 }
fn default_lookback_days() -> u32    { 1 }

impl Default for SourceConfig {
    fn default() -> Self {
        Self { topic: default_topic(), max_results: default_max_results(), lookback_days: default_lookback_days() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// arXiv asks for at least 3 s between requests.
    #[serde(default = "default_politeness_ms")]
    pub politeness_delay_ms: u64,
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
}

fn default_staging_dir()   -> PathBuf { PathBuf::from("./data/staging") }
fn default_politeness_ms() -> u64     { 3_000 }
fn default_fetch_timeout() -> u64     { 60 }

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            politeness_delay_ms: default_politeness_ms(),
            timeout_secs: default_fetch_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    #[serde(default)]
    pub strategy: ExtractionStrategy,
    #[serde(default = "default_docling_url")]
    pub docling_url: String,
    #[serde(default = "default_cutoff_ratio")]
    pub reference_cutoff_ratio: f64,
    #[serde(default = "default_docling_timeout")]
    pub timeout_secs: u64,
}

fn default_docling_url()     -> String { aura_ingestion::docling::DOCLING_DEFAULT_URL.to_string() }
fn default_cutoff_ratio()    -> f64    { aura_ingestion::text::DEFAULT_REFERENCE_CUTOFF_RATIO }
fn default_docling_timeout() -> u64    { 300 }

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            strategy: ExtractionStrategy::default(),
            docling_url: default_docling_url(),
            reference_cutoff_ratio: default_cutoff_ratio(),
            timeout_secs: default_docling_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub ollama: OllamaSettings,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_keyword_context_chars")]
    pub keyword_context_chars: usize,
    /// Local models can take minutes over a long paper.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_max_input_chars()       -> usize { aura_ingestion::extraction::DEFAULT_MAX_INPUT_CHARS }
fn default_keyword_context_chars() -> usize { aura_ingestion::extraction::DEFAULT_KEYWORD_CONTEXT_CHARS }
fn default_llm_timeout()           -> u64   { 600 }

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            ollama: OllamaSettings::default(),
            remote: RemoteSettings::default(),
            prompts: PromptsConfig::default(),
            max_input_chars: default_max_input_chars(),
            keyword_context_chars: default_keyword_context_chars(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default = "default_keyword_prompt")]
    pub keyword: String,
    #[serde(default = "default_definition_prompt")]
    pub definition: String,
}

fn default_keyword_prompt()    -> String { DEFAULT_KEYWORD_PROMPT.to_string() }
fn default_definition_prompt() -> String { DEFAULT_DEFINITION_PROMPT.to_string() }

impl Default for PromptsConfig {
    fn default() -> Self {
        Self { keyword: default_keyword_prompt(), definition: default_definition_prompt() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts()  -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 1_000 }
fn default_max_delay_ms()  -> u64 { 30_000 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio_threshold: f64,
    #[serde(default = "default_min_samples")]
    pub abort_min_samples: u32,
    /// `0` disables the run timeout.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_concurrency()    -> usize { 4 }
fn default_failure_ratio()  -> f64   { 0.5 }
fn default_min_samples()    -> u32   { 2 }
fn default_run_timeout()    -> u64   { 6 * 60 * 60 }
fn default_retention_days() -> u32   { 7 }

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            failure_ratio_threshold: default_failure_ratio(),
            abort_min_samples: default_min_samples(),
            run_timeout_secs: default_run_timeout(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub definition_policy: DefinitionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Local wall-clock time of the daily run, `HH:MM`.
    #[serde(default = "default_daily_at")]
    pub daily_at: String,
}

fn default_daily_at() -> String { "02:00".to_string() }

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self { daily_at: default_daily_at() }
    }
}

impl ScheduleConfig {
    pub fn time(&self) -> anyhow::Result<NaiveTime> {
        NaiveTime::parse_from_str(self.daily_at.trim(), "%H:%M")
            .with_context(|| format!("schedule.daily_at '{}' is not HH:MM", self.daily_at))
    }
}


impl Config {
    /// Load configuration from aura.toml.
    /// Checks `path`, then the AURA_CONFIG env var, then the current directory.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("AURA_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "No config file found; using defaults");
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment overrides, reading variables through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let set = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = set("OLLAMA_API") {
            self.llm.ollama.base_url = v;
        }
        if let Some(v) = set("OLLAMA_MODEL") {
            self.llm.ollama.model = v;
        }
        if let Some(v) = set("OLLAMA_PROMPT_KEYWORD_1") {
            self.llm.prompts.keyword = v;
        }
        if let Some(v) = set("OLLAMA_PROMPT_DEFINITION_1") {
            self.llm.prompts.definition = v;
        }
        if let Some(v) = set("AURA_LLM_BACKEND") {
            self.llm.backend = v.parse().map_err(|e| anyhow::anyhow!("AURA_LLM_BACKEND: {e}"))?;
        }
        if let Some(v) = set("AURA_REMOTE_API_KEY").or_else(|| set("GEMINI_API_KEY")) {
            self.llm.remote.api_key = Some(v);
        }
        if let Some(v) = set("AURA_DATABASE_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = set("AURA_STAGING_DIR") {
            self.fetch.staging_dir = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let threshold = self.pipeline.failure_ratio_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            bail!("pipeline.failure_ratio_threshold must be in (0, 1], got {threshold}");
        }
        if self.pipeline.concurrency == 0 {
            bail!("pipeline.concurrency must be at least 1");
        }
        if self.pipeline.retention_days == 0 {
            bail!("pipeline.retention_days must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.extract.reference_cutoff_ratio) {
            bail!("extract.reference_cutoff_ratio must be in [0, 1]");
        }
        self.schedule.time()?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn prompt_templates(&self) -> PromptTemplates {
        PromptTemplates {
            keyword: self.llm.prompts.keyword.clone(),
            definition: self.llm.prompts.definition.clone(),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            topic: self.source.topic.clone(),
            max_results: self.source.max_results,
            lookback_days: self.source.lookback_days,
            concurrency: self.pipeline.concurrency,
            failure_ratio_threshold: self.pipeline.failure_ratio_threshold,
            abort_min_samples: self.pipeline.abort_min_samples,
            run_timeout: (self.pipeline.run_timeout_secs > 0)
                .then(|| Duration::from_secs(self.pipeline.run_timeout_secs)),
        }
    }
}
