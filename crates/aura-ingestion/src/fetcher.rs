//! Document fetcher: downloads each paper's PDF into a dated staging area.
//!
//! Layout: `{staging_dir}/papers_{YYYY-MM-DD}/{external_id}.pdf`, with `/` in
//! old-style arXiv ids replaced by `_`.

use async_trait::async_trait;
use aura_common::{RetryPolicy, SandboxClient};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::error::{AttemptError, IngestionError};
use crate::models::PaperMetadata;

pub const STAGING_PREFIX: &str = "papers_";
const PDF_MAGIC: &[u8] = b"%PDF";

/// Outcome of a successful fetch. `Skipped` is the no-op signal for a document
/// that is already staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched(PathBuf),
    Skipped(PathBuf),
}

impl FetchOutcome {
    pub fn path(&self) -> &Path {
        match self {
            FetchOutcome::Fetched(p) | FetchOutcome::Skipped(p) => p,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, FetchOutcome::Skipped(_))
    }
}

#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, paper: &PaperMetadata, run_date: NaiveDate) -> Result<FetchOutcome, IngestionError>;
}

/// Staging directory for one run date.
pub fn staging_dir_for(staging_root: &Path, run_date: NaiveDate) -> PathBuf {
    staging_root.join(format!("{STAGING_PREFIX}{}", run_date.format("%Y-%m-%d")))
}

/// Where a paper's document is staged for a run date.
pub fn staged_path(staging_root: &Path, run_date: NaiveDate, external_id: &str) -> PathBuf {
    let file = format!("{}.pdf", external_id.replace(['/', '\\'], "_"));
    staging_dir_for(staging_root, run_date).join(file)
}

/// Enforces a minimum interval between request starts across all workers.
pub struct RateGate {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: Mutex::new(None) }
    }

    pub async fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready = prev + self.interval;
            if ready > Instant::now() {
                tokio::time::sleep_until(ready).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Downloads PDFs over HTTP through the sandboxed client.
pub struct HttpFetcher {
    client: SandboxClient,
    staging_root: PathBuf,
    retry: RetryPolicy,
    gate: RateGate,
}

impl HttpFetcher {
    pub fn new(client: SandboxClient, staging_root: impl Into<PathBuf>, retry: RetryPolicy, politeness_delay: Duration) -> Self {
        Self {
            client,
            staging_root: staging_root.into(),
            retry,
            gate: RateGate::new(politeness_delay),
        }
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, AttemptError> {
        self.gate.wait().await;
        let resp = self
            .client
            .get(url)
            .map_err(|e| AttemptError::Permanent(e.to_string()))?
            .send()
            .await
            .map_err(AttemptError::from_reqwest)?;
        if !resp.status().is_success() {
            return Err(AttemptError::from_status(resp.status(), url));
        }
        let bytes = resp.bytes().await.map_err(AttemptError::from_reqwest)?;
        Ok(bytes.to_vec())
    }
}

/// Writes `bytes` next to `path` and renames into place, so an interrupted
/// write never leaves a file that looks staged.
pub async fn write_staged(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = path.with_extension("pdf.part");
    tokio::fs::write(&part, bytes).await?;
    tokio::fs::rename(&part, path).await
}

async fn already_staged(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(m) if m.is_file() && m.len() > 0)
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    #[instrument(skip(self, paper), fields(external_id = %paper.external_id))]
    async fn fetch(&self, paper: &PaperMetadata, run_date: NaiveDate) -> Result<FetchOutcome, IngestionError> {
        let path = staged_path(&self.staging_root, run_date, &paper.external_id);
        if already_staged(&path).await {
            debug!(path = %path.display(), "Document already staged");
            return Ok(FetchOutcome::Skipped(path));
        }

        let failed = |reason: String| IngestionError::FetchFailed {
            external_id: paper.external_id.clone(),
            reason,
        };

        let url = paper.pdf_url.as_deref().ok_or_else(|| failed("no PDF URL".to_string()))?;
        let bytes = self
            .retry
            .run("fetch_pdf", || self.download(url))
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !bytes.starts_with(PDF_MAGIC) {
            return Err(failed(format!("response from {url} is not a PDF")));
        }

        write_staged(&path, &bytes).await.map_err(|e| failed(format!("write {}: {e}", path.display())))?;
        info!(bytes = bytes.len(), path = %path.display(), "Document staged");
        Ok(FetchOutcome::Fetched(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    #[test]
    fn test_staged_path_layout() {
        let p = staged_path(Path::new("/data/staging"), date(), "2401.00001v1");
        assert_eq!(p, PathBuf::from("/data/staging/papers_2024-01-15/2401.00001v1.pdf"));
        let old = staged_path(Path::new("/s"), date(), "math.AG/0601001v1");
        assert_eq!(old.file_name().unwrap(), "math.AG_0601001v1.pdf");
    }

    #[tokio::test]
    async fn test_existing_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new(SandboxClient::new().unwrap(), dir.path(), RetryPolicy::none(), Duration::ZERO);
        let paper = PaperMetadata {
            external_id: "2401.00001v1".into(),
            pdf_url: Some("http://127.0.0.1:9/never-contacted.pdf".into()),
            ..Default::default()
        };
        let path = staged_path(dir.path(), date(), &paper.external_id);
        write_staged(&path, b"%PDF-1.4 test").await.unwrap();

        let outcome = fetcher.fetch(&paper, date()).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Skipped(path.clone()));

        let files: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_fetch_failed() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new(SandboxClient::new().unwrap(), dir.path(), RetryPolicy::none(), Duration::ZERO);
        let paper = PaperMetadata {
            external_id: "x".into(),
            pdf_url: Some("http://127.0.0.1:9/x.pdf".into()),
            ..Default::default()
        };
        let err = fetcher.fetch(&paper, date()).await.unwrap_err();
        assert!(matches!(err, IngestionError::FetchFailed { .. }));
        assert!(!staged_path(dir.path(), date(), "x").exists());
    }

    #[tokio::test]
    async fn test_missing_pdf_url_is_fetch_failed() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new(SandboxClient::new().unwrap(), dir.path(), RetryPolicy::none(), Duration::ZERO);
        let paper = PaperMetadata { external_id: "y".into(), ..Default::default() };
        assert!(matches!(fetcher.fetch(&paper, date()).await, Err(IngestionError::FetchFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_gate_spaces_requests() {
        let gate = RateGate::new(Duration::from_secs(3));
        let t0 = Instant::now();
        gate.wait().await;
        gate.wait().await;
        gate.wait().await;
        assert!(t0.elapsed() >= Duration::from_secs(6));
    }
}
