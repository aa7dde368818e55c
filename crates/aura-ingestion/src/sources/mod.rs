//! Paper catalog clients.

pub mod arxiv;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};

use crate::error::IngestionError;
use crate::models::PaperMetadata;

/// Inclusive publication-date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// The `days` days up to and including `today`.
    pub fn lookback(today: NaiveDate, days: u32) -> Self {
        let start = today - Duration::days(i64::from(days.max(1)) - 1);
        Self { start, end: today }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// What to ask the catalog for.
#[derive(Debug, Clone)]
pub struct SourceQuery {
    /// Topic filter, e.g. an arXiv category such as `cs.AI`.
    pub topic: String,
    pub max_results: usize,
    pub window: Option<DateWindow>,
}

/// Common interface for paper catalog clients.
#[async_trait]
pub trait PaperSource: Send + Sync {
    fn name(&self) -> &str;

    /// Newest papers matching the query, newest first.
    ///
    /// Fails with [`IngestionError::SourceUnavailable`] once retries are
    /// exhausted.
    async fn search(&self, query: &SourceQuery) -> Result<Vec<PaperMetadata>, IngestionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookback_window() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let w = DateWindow::lookback(today, 2);
        assert!(w.contains(today));
        assert!(w.contains(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()));
        assert!(!w.contains(NaiveDate::from_ymd_opt(2024, 3, 8).unwrap()));
        assert!(!w.contains(NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()));
        assert_eq!(DateWindow::lookback(today, 0).start, today);
    }
}
