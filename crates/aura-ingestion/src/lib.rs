//! aura-ingestion: Daily research-terminology ingestion pipeline.
//! - Paper discovery from the arXiv catalog
//! - PDF retrieval into a dated staging area
//! - Text extraction (lopdf or Docling)
//! - Two-pass LLM keyword and definition extraction
//! - Persistence of terms with paper provenance
//! - Retention sweep of staged documents

pub mod error;
pub mod models;
pub mod sources;
pub mod fetcher;
pub mod text;
pub mod pdf_parser;
pub mod docling;
pub mod response_parser;
pub mod extraction;
pub mod repository;
pub mod sweeper;
pub mod run;
pub mod pipeline;

pub use error::{ErrorCategory, ErrorClass, IngestionError};
pub use extraction::{ExtractionEngine, PromptTemplates};
pub use fetcher::{DocumentFetcher, FetchOutcome, HttpFetcher};
pub use models::{ExtractionOutput, PaperMetadata};
pub use pipeline::{Pipeline, PipelineConfig};
pub use repository::IngestionRepository;
pub use run::{PipelineRun, RunMetrics, RunStage, RunSummary, StageEvent};
pub use sources::{arxiv::ArxivClient, DateWindow, PaperSource, SourceQuery};
pub use sweeper::{RetentionSweeper, SweepReport};
pub use text::{build_extractor, ExtractionStrategy, TextExtractor};
