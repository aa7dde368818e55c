//! AURA Database Layer
//!
//! Embedded SQLite storage (write-ahead logging) for papers, extracted terms,
//! term–paper provenance links and the pipeline run log.
//!
//! One writer (the processor) and any number of readers (the query API,
//! dashboards) may use the file at the same time; readers only ever observe
//! committed transactions.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use aura_db::{Database, PaperRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::open("./data/aura.db", 4).await?;
//!     db.initialize().await?;
//!
//!     let papers = PaperRepository::new(Arc::new(db));
//!     println!("{} papers stored", papers.count().await?);
//!     Ok(())
//! }
//! ```

pub mod database;
pub mod error;
pub mod schema;
pub mod papers;
pub mod terms;
pub mod runs;

pub use database::{Database, DatabaseStats};
pub use error::{DbError, Result};
pub use schema::{
    Paper, PaperRecord, PaperStatus, Term, TermInput, RunRecord, RunStatus, RunCounts,
    DefinitionPolicy, TABLE_PAPERS, TABLE_TERMS, TABLE_TERM_PAPER_LINKS, TABLE_PIPELINE_RUNS,
};
pub use papers::{PaperRepository, PaperUpsert};
pub use terms::{TermRepository, TermUpsertReport, normalise_surface_form};
pub use runs::{RunRepository, RunFinalization};
