//! Retention sweeper for the staging area.
//!
//! Deletes staged documents whose modification time is older than the
//! retention window and nulls the matching papers' storage paths. Paper rows
//! and terms are never touched.
//!
//! A document's storage path is cleared before the file is removed, so no
//! paper is left pointing at a deleted file. Per-entry failures are logged,
//! counted in [`SweepReport::errors`] and skipped.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::error::IngestionError;
use crate::fetcher::STAGING_PREFIX;
use crate::repository::IngestionRepository;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub files_deleted: u32,
    pub bytes_freed: u64,
    pub paths_cleared: u64,
    /// Entries left in place because a step failed.
    pub errors: u32,
}

pub struct RetentionSweeper {
    staging_root: PathBuf,
    retention: Duration,
    repo: IngestionRepository,
}

impl RetentionSweeper {
    pub fn new(staging_root: impl Into<PathBuf>, retention_days: u32, repo: IngestionRepository) -> Self {
        Self {
            staging_root: staging_root.into(),
            retention: DAY * retention_days,
            repo,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, IngestionError> {
        self.sweep_at(SystemTime::now()).await
    }

    /// Sweep as if the current time were `now`.
    #[instrument(skip(self), fields(staging = %self.staging_root.display()))]
    pub async fn sweep_at(&self, now: SystemTime) -> Result<SweepReport, IngestionError> {
        let mut report = SweepReport::default();
        let mut dirs = match fs::read_dir(&self.staging_root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No staging directory; nothing to sweep");
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dirs.next_entry().await? {
            let is_staging_dir = entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX)
                && entry.file_type().await?.is_dir();
            if is_staging_dir {
                let dir = entry.path();
                if let Err(e) = self.sweep_dir(&dir, now, &mut report).await {
                    warn!(dir = %dir.display(), error = %e, "Could not sweep staging directory");
                    report.errors += 1;
                }
            }
        }

        info!(
            files_deleted = report.files_deleted,
            bytes_freed = report.bytes_freed,
            paths_cleared = report.paths_cleared,
            errors = report.errors,
            "Retention sweep complete"
        );
        Ok(report)
    }

    async fn sweep_dir(&self, dir: &Path, now: SystemTime, report: &mut SweepReport) -> Result<(), IngestionError> {
        let mut remaining = 0usize;
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata().await?;
            let is_document = name.ends_with(".pdf");
            let is_partial = name.ends_with(".part");
            if !meta.is_file() || !(is_document || is_partial) || !self.expired(&meta, now) {
                remaining += 1;
                continue;
            }

            if is_document {
                match self.repo.clear_storage_path(&path).await {
                    Ok(cleared) => report.paths_cleared += cleared,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Could not clear storage path; keeping file");
                        report.errors += 1;
                        remaining += 1;
                        continue;
                    }
                }
            }
            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Could not delete staged file");
                report.errors += 1;
                remaining += 1;
                continue;
            }
            report.files_deleted += 1;
            report.bytes_freed += meta.len();
            debug!(path = %path.display(), "Deleted expired staged file");
        }

        if remaining == 0 {
            match fs::remove_dir(dir).await {
                Ok(()) => debug!(dir = %dir.display(), "Removed empty staging directory"),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Could not remove staging directory");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    fn expired(&self, meta: &std::fs::Metadata, now: SystemTime) -> bool {
        meta.modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .is_some_and(|age| age > self.retention)
    }
}
