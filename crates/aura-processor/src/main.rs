//! AURA processor: daily research-terminology ingestion.
//! Runs the pipeline once at startup and then every day at the configured
//! local time. `--once` runs a single pass and exits.

mod config;
mod schedule;

use anyhow::Context;
use aura_common::SandboxClient;
use aura_db::Database;
use aura_ingestion::docling::DoclingExtractor;
use aura_ingestion::{
    build_extractor, ArxivClient, ExtractionEngine, ExtractionStrategy, HttpFetcher, IngestionRepository, Pipeline,
    RetentionSweeper, RunSummary,
};
use aura_llm::{build_backend, definition_model};
use chrono::{Local, NaiveDate};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "aura-processor", version, about = "Daily arXiv terminology ingestion")]
struct Args {
    /// Run a single pass and exit.
    #[arg(long)]
    once: bool,

    /// Path to aura.toml.
    #[arg(long, env = "AURA_CONFIG")]
    config: Option<PathBuf>,

    /// Treat this day as the run date (with --once).
    #[arg(long, requires = "once")]
    date: Option<NaiveDate>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aura=info,info"));
    let json = Path::new("/.dockerenv").exists()
        || std::env::var("AURA_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn build_pipeline(config: &config::Config) -> anyhow::Result<Pipeline> {
    let db = Database::open(&config.database.path, config.database.max_connections)
        .await
        .with_context(|| format!("opening database {}", config.database.path.display()))?;
    db.initialize().await.context("initialising schema")?;
    let repo = IngestionRepository::new(Arc::new(db), config.persistence.definition_policy);

    let retry = config.retry_policy();
    let http = SandboxClient::with_timeout(Duration::from_secs(config.fetch.timeout_secs))?;

    let source = Arc::new(ArxivClient::new(http.clone(), retry.clone()));
    let fetcher = Arc::new(HttpFetcher::new(
        http,
        &config.fetch.staging_dir,
        retry.clone(),
        Duration::from_millis(config.fetch.politeness_delay_ms),
    ));

    let extract_client = SandboxClient::with_timeout(Duration::from_secs(config.extract.timeout_secs))?;
    if config.extract.strategy == ExtractionStrategy::Structured {
        let mut health_client = extract_client.clone();
        health_client.allow_url_host(&config.extract.docling_url)?;
        let docling = DoclingExtractor::new(health_client, &config.extract.docling_url, config.extract.reference_cutoff_ratio);
        if !docling.health_check().await {
            warn!(url = %config.extract.docling_url, "Docling service not reachable; papers will fail extraction until it is");
        }
    }
    let extractor = build_extractor(
        config.extract.strategy,
        extract_client,
        &config.extract.docling_url,
        config.extract.reference_cutoff_ratio,
    )?;

    let llm = &config.llm;
    let backend = build_backend(
        llm.backend,
        &llm.ollama,
        &llm.remote,
        SandboxClient::with_timeout(Duration::from_secs(llm.timeout_secs))?,
    )
    .context("building LLM backend")?;
    let engine = ExtractionEngine::new(backend, config.prompt_templates())
        .with_definition_model(definition_model(llm.backend, &llm.ollama, &llm.remote))
        .with_retry(retry)
        .with_limits(llm.max_input_chars, llm.keyword_context_chars);
    info!(
        backend = %llm.backend,
        model = engine.model_id(),
        extractor = extractor.name(),
        "Extraction stack ready"
    );

    let sweeper = RetentionSweeper::new(&config.fetch.staging_dir, config.pipeline.retention_days, repo.clone());

    Ok(Pipeline::new(source, fetcher, extractor, Arc::new(engine), repo, config.pipeline_config())
        .with_sweeper(sweeper))
}

async fn run_once(pipeline: &Pipeline, run_date: NaiveDate) -> anyhow::Result<RunSummary> {
    let summary = pipeline.run(run_date).await.context("pipeline run")?;
    info!(
        run_id = %summary.run_id,
        status = ?summary.status,
        partial = summary.partial,
        discovered = summary.counts.discovered,
        extracted = summary.counts.extracted,
        failed = summary.counts.failed,
        terms_new = summary.metrics.terms_new,
        duration_ms = summary.duration_ms,
        "Run finished"
    );
    if let Some(reason) = &summary.abort_reason {
        warn!(run_id = %summary.run_id, reason = %reason, "Run aborted");
    }
    Ok(summary)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    let args = Args::parse();

    info!("AURA processor starting up");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = config::Config::load(args.config.as_deref()).context("loading configuration")?;
    let daily_at = config.schedule.time()?;
    info!(
        topic = %config.source.topic,
        backend = %config.llm.backend,
        strategy = %config.extract.strategy,
        daily_at = %config.schedule.daily_at,
        "Configuration loaded"
    );

    let pipeline = build_pipeline(&config).await?;

    if args.once {
        let run_date = args.date.unwrap_or_else(|| Local::now().date_naive());
        let summary = run_once(&pipeline, run_date).await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        pipeline.repository().db().close().await;
        return Ok(());
    }

    // Runs never overlap: the next one is scheduled after the previous ends.
    loop {
        if let Err(e) = run_once(&pipeline, Local::now().date_naive()).await {
            error!(error = %format!("{e:#}"), "Run failed");
        }

        let now = Local::now();
        let next = schedule::next_run_after(&now, daily_at);
        info!(next_run = %next.to_rfc3339(), "Sleeping until next run");

        tokio::select! {
            _ = tokio::time::sleep(schedule::delay_until(&now, &next)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    pipeline.repository().db().close().await;
    Ok(())
}
