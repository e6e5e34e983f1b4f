// ⚠️ Error taxonomy
// Dataset-level failures abort one month's run; lookup failures stay local to one code.

use serde::Serialize;
use thiserror::Error;

/// Failure of a single directory lookup
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum LookupFailure {
    /// Directory answered that the code does not exist
    #[error("facility code not found in directory")]
    NotFound,

    #[error("directory rate limit exceeded")]
    RateLimited,

    #[error("directory request timed out")]
    Timeout,

    #[error("directory request failed: {0}")]
    Transport(String),

    #[error("malformed directory response: {0}")]
    Malformed(String),
}

impl LookupFailure {
    /// Only a definitive "not found" is safe to persist as absent.
    /// Everything else is retried on the next run.
    pub fn is_confirmed_absent(&self) -> bool {
        matches!(self, LookupFailure::NotFound)
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("failed to download source from {source_location}: {reason}")]
    Download {
        source_location: String,
        reason: String,
    },

    #[error("failed to parse export for {month}: {reason}")]
    Parse { month: String, reason: String },

    #[error("lookup failed for {facility_code}: {failure}")]
    Enrichment {
        facility_code: String,
        failure: LookupFailure,
    },

    #[error("{}", data_not_found_message(.month, .available))]
    DataNotFound {
        month: Option<String>,
        available: Vec<String>,
    },

    #[error("invalid query: {0}")]
    Query(String),

    #[error("pipeline run for {month} was cancelled")]
    Cancelled { month: String },

    #[error("pipeline run for {month} exceeded its time limit")]
    TimedOut { month: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IndexError {
    pub fn parse(month: impl ToString, reason: impl Into<String>) -> Self {
        IndexError::Parse {
            month: month.to_string(),
            reason: reason.into(),
        }
    }

    pub fn download(source_location: impl Into<String>, reason: impl ToString) -> Self {
        IndexError::Download {
            source_location: source_location.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the caller can retry the same run (possibly with another source)
    /// without anything having been corrupted.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IndexError::Download { .. }
                | IndexError::Cancelled { .. }
                | IndexError::TimedOut { .. }
                | IndexError::Enrichment { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, IndexError::DataNotFound { .. })
    }
}

fn data_not_found_message(month: &Option<String>, available: &[String]) -> String {
    let available = if available.is_empty() {
        "none".to_string()
    } else {
        available.join(", ")
    };

    match month {
        Some(month) => format!(
            "no processed dataset for {} (available: {}); run the pipeline for that month first",
            month, available
        ),
        None => "no processed datasets yet; run the pipeline to download and enrich a month first"
            .to_string(),
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
