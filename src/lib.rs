// GP System Index - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod cache;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod extractor;
pub mod index;
pub mod month;
pub mod orchestrator;
pub mod records;
pub mod source;

// Re-export commonly used types
pub use cache::{EnrichmentFailure, ReconciliationCache, Resolution};
pub use config::Config;
pub use db::{
    DatasetSummary,
    open_database, setup_database, save_dataset, load_dataset,
    get_dataset_summary, list_months, latest_month, export_dataset_csv,
};
pub use directory::{DirectoryClient, OdsDirectoryClient, commissioner_from_response};
pub use error::{IndexError, LookupFailure, Result};
pub use extractor::{
    ExportSchema, Extraction, RecordExtractor, SkippedRow,
    resolve_primary_system, AGGREGATOR_LABELS,
};
pub use index::{
    QueryIndex, SearchResults, SystemFilter, CommissionerGroup,
    Statistics, SystemShare, SEARCH_RESULT_CAP,
};
pub use month::Month;
pub use orchestrator::{CancelToken, IndexState, Orchestrator, PipelineReport};
pub use records::{CanonicalRecord, Dataset, EnrichedRecord, UNRESOLVED_LABEL};
pub use source::MonthSource;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
