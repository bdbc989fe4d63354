mod bq_error;
mod parser;

use thiserror::Error;

pub use bq_error::{BigQueryError, SqlPosition};
pub use parser::{classify_bq_error, ErrorContext};

/// Message fragment BigQuery returns when INFORMATION_SCHEMA reads hit a table
/// the caller may not inspect.
pub const PERMISSION_DENIED_MARKER: &str = "Permission bigquery.tables.get denied on table";

/// Message fragment BigQuery returns for missing datasets and tables.
pub const NOT_FOUND_MARKER: &str = "Not found";

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{message}")]
    RemoteJob { message: String },

    #[error("BigQuery job timeout reached {timeout_ms}ms")]
    PollTimeout { timeout_ms: u128 },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid table reference '{0}': expected dataset.table")]
    InvalidTableRef(String),

    #[error("BigQuery error: {0}")]
    BigQuery(#[from] BigQueryError),

    #[error("Object storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("BigQuery client error: {0}")]
    Client(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DriverError {
    /// Text used for marker matching: the remote message when the error carries
    /// one, the rendered error otherwise.
    fn remote_text(&self) -> String {
        match self {
            DriverError::RemoteJob { message } => message.clone(),
            DriverError::BigQuery(bq) => bq
                .remote_message()
                .map(str::to_string)
                .unwrap_or_else(|| bq.to_string()),
            other => other.to_string(),
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            DriverError::PermissionDenied(_) => true,
            _ => self.remote_text().contains(PERMISSION_DENIED_MARKER),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            DriverError::NotFound(_) => true,
            DriverError::BigQuery(bq) if bq.is_not_found() => true,
            _ => self.remote_text().contains(NOT_FOUND_MARKER),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
