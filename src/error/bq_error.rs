use thiserror::Error;

/// A BigQuery API failure sorted into the cases the driver reacts to. Every
/// variant that came back from the service keeps the service's own message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BigQueryError {
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    #[error("Invalid service account credentials: {reason}")]
    Credentials { reason: String },

    #[error("Invalid SQL: {message}{}", position_suffix(.position))]
    InvalidQuery {
        message: String,
        sql_preview: String,
        position: Option<SqlPosition>,
    },

    #[error("Table not found: {project}.{dataset}.{table}")]
    TableNotFound {
        project: String,
        dataset: String,
        table: String,
        message: String,
    },

    #[error("Dataset not found: {project}.{dataset}")]
    DatasetNotFound {
        project: String,
        dataset: String,
        message: String,
    },

    #[error("Access denied to {resource}: {message}")]
    AccessDenied {
        resource: String,
        permission: Option<String>,
        message: String,
    },

    #[error("Quota exceeded: {message}")]
    QuotaExceeded { message: String },

    #[error("Resources exceeded: {message}")]
    ResourcesExceeded { message: String },

    #[error("Connection to BigQuery failed: {reason}")]
    Transport { reason: String },

    #[error("BigQuery error{}: {message}", reason_suffix(.reason))]
    Remote {
        status: Option<u16>,
        reason: Option<String>,
        message: String,
    },
}

/// 1-based line and column BigQuery reports for a syntax error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlPosition {
    pub line: u32,
    pub column: u32,
}

fn position_suffix(position: &Option<SqlPosition>) -> String {
    position
        .map(|p| format!(" at [{}:{}]", p.line, p.column))
        .unwrap_or_default()
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_ref().map(|r| format!(" [{}]", r)).unwrap_or_default()
}

impl BigQueryError {
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            BigQueryError::InvalidQuery { message, .. }
            | BigQueryError::TableNotFound { message, .. }
            | BigQueryError::DatasetNotFound { message, .. }
            | BigQueryError::AccessDenied { message, .. }
            | BigQueryError::QuotaExceeded { message }
            | BigQueryError::ResourcesExceeded { message }
            | BigQueryError::Remote { message, .. } => Some(message),
            BigQueryError::Authentication { .. }
            | BigQueryError::Credentials { .. }
            | BigQueryError::Transport { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            BigQueryError::TableNotFound { .. } | BigQueryError::DatasetNotFound { .. } => true,
            BigQueryError::Remote { status, reason, .. } => {
                *status == Some(404) || reason.as_deref() == Some("notFound")
            }
            _ => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            BigQueryError::Authentication { .. } => "AUTH_FAILED",
            BigQueryError::Credentials { .. } => "INVALID_CREDENTIALS",
            BigQueryError::InvalidQuery { .. } => "INVALID_QUERY",
            BigQueryError::TableNotFound { .. } => "TABLE_NOT_FOUND",
            BigQueryError::DatasetNotFound { .. } => "DATASET_NOT_FOUND",
            BigQueryError::AccessDenied { .. } => "ACCESS_DENIED",
            BigQueryError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            BigQueryError::ResourcesExceeded { .. } => "RESOURCES_EXCEEDED",
            BigQueryError::Transport { .. } => "CONNECTION_FAILED",
            BigQueryError::Remote { .. } => "REMOTE",
        }
    }

    /// Operator-facing hint printed by the CLI under the error.
    pub fn suggestion(&self) -> String {
        match self {
            BigQueryError::Authentication { .. } => {
                "Set CUBEJS_DB_BQ_KEY_FILE or CUBEJS_DB_BQ_CREDENTIALS,\n\
                 or run `gcloud auth application-default login`."
                    .to_string()
            }
            BigQueryError::Credentials { .. } => {
                "CUBEJS_DB_BQ_CREDENTIALS must be base64-encoded service account JSON;\n\
                 CUBEJS_DB_BQ_KEY_FILE must point to a readable key file."
                    .to_string()
            }
            BigQueryError::InvalidQuery { sql_preview, .. } if !sql_preview.is_empty() => {
                format!("Check the statement and its positional parameters:\n{}", sql_preview)
            }
            BigQueryError::InvalidQuery { .. } => {
                "Check the statement and its positional parameters.".to_string()
            }
            BigQueryError::TableNotFound { project, dataset, table, .. } => {
                format!("Run `bq show {}:{}.{}` to confirm the table exists.", project, dataset, table)
            }
            BigQueryError::DatasetNotFound { project, dataset, .. } => format!(
                "Run `bq show {}:{}` and make sure CUBEJS_DB_BQ_LOCATION matches the dataset location.",
                project, dataset
            ),
            BigQueryError::AccessDenied { permission, .. } => format!(
                "Grant {} to the driver's service account (roles/bigquery.dataViewer covers reads).",
                permission.as_deref().unwrap_or("the missing permission")
            ),
            BigQueryError::QuotaExceeded { .. } => {
                "Lower the number of concurrent queries or request a quota increase.".to_string()
            }
            BigQueryError::ResourcesExceeded { .. } => {
                "Filter the query further, or unload it to the export bucket instead of reading rows."
                    .to_string()
            }
            BigQueryError::Transport { .. } => {
                "Check network access to bigquery.googleapis.com and retry.".to_string()
            }
            BigQueryError::Remote { .. } => {
                "See https://status.cloud.google.com/ if the error persists.".to_string()
            }
        }
    }
}
