use gcp_bigquery_client::error::{BQError, ResponseError};
use regex::Regex;

use super::bq_error::{BigQueryError, SqlPosition};

const SQL_PREVIEW_CHARS: usize = 300;

/// What the driver was doing when a BigQuery call failed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ErrorContext {
    pub operation: Option<String>,
    pub sql: Option<String>,
    pub project: Option<String>,
    pub dataset: Option<String>,
    pub table: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_sql(mut self, sql: impl AsRef<str>) -> Self {
        let sql = sql.as_ref();
        let mut preview: String = sql.chars().take(SQL_PREVIEW_CHARS).collect();
        if preview.len() < sql.len() {
            preview.push_str("...");
        }
        self.sql = Some(preview);
        self
    }

    pub fn with_dataset(mut self, project: impl Into<String>, dataset: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self.dataset = Some(dataset.into());
        self
    }

    pub fn with_table(
        self,
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        let mut ctx = self.with_dataset(project, dataset);
        ctx.table = Some(table.into());
        ctx
    }

    fn resource(&self) -> String {
        [&self.project, &self.dataset, &self.table]
            .into_iter()
            .flatten()
            .cloned()
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Sorts a client error into a [`BigQueryError`].
pub fn classify_bq_error(error: BQError, context: ErrorContext) -> BigQueryError {
    match error {
        BQError::ResponseError { error } => classify_response(&error, context),
        BQError::RequestError(e) => BigQueryError::Transport { reason: e.to_string() },
        BQError::NoToken => BigQueryError::Authentication {
            reason: "no access token available".to_string(),
        },
        BQError::YupAuthError(e) => BigQueryError::Authentication { reason: e.to_string() },
        BQError::InvalidApplicationDefaultCredentialsAuthenticator(e) => {
            BigQueryError::Authentication {
                reason: format!("application default credentials: {}", e),
            }
        }
        BQError::InvalidServiceAccountKey(e) | BQError::InvalidServiceAccountAuthenticator(e) => {
            BigQueryError::Credentials { reason: e.to_string() }
        }
        other => BigQueryError::Remote {
            status: None,
            reason: None,
            message: other.to_string(),
        },
    }
}

fn classify_response(response: &ResponseError, context: ErrorContext) -> BigQueryError {
    let status = response.error.code;
    let message = response.error.message.clone();
    let reason = response
        .error
        .errors
        .first()
        .and_then(|e| e.get("reason"))
        .cloned();

    match (status, reason.as_deref()) {
        (404, _) | (_, Some("notFound")) => not_found(message, &context),
        (400, Some("invalidQuery")) => BigQueryError::InvalidQuery {
            position: sql_position(&message),
            sql_preview: context.sql.unwrap_or_default(),
            message,
        },
        (403, Some("accessDenied")) => BigQueryError::AccessDenied {
            resource: context.resource(),
            permission: permission_in(&message),
            message,
        },
        (_, Some("quotaExceeded" | "rateLimitExceeded")) => BigQueryError::QuotaExceeded { message },
        (_, Some("resourcesExceeded" | "responseTooLarge")) => {
            BigQueryError::ResourcesExceeded { message }
        }
        _ => BigQueryError::Remote {
            status: u16::try_from(status).ok(),
            reason,
            message,
        },
    }
}

/// Names parsed from `Not found: Table p:d.t` / `Not found: Dataset p:d`,
/// falling back to the request context.
fn not_found(message: String, context: &ErrorContext) -> BigQueryError {
    if let Some(caps) = capture(r"Table ([^:\s]+):([^.\s]+)\.(\S+)", &message) {
        return BigQueryError::TableNotFound {
            project: caps[0].clone(),
            dataset: caps[1].clone(),
            table: caps[2].clone(),
            message,
        };
    }
    if let Some(caps) = capture(r"Dataset ([^:\s]+):(\S+)", &message) {
        return BigQueryError::DatasetNotFound {
            project: caps[0].clone(),
            dataset: caps[1].clone(),
            message,
        };
    }

    match (&context.project, &context.dataset, &context.table) {
        (Some(project), Some(dataset), Some(table)) => BigQueryError::TableNotFound {
            project: project.clone(),
            dataset: dataset.clone(),
            table: table.clone(),
            message,
        },
        (Some(project), Some(dataset), None) => BigQueryError::DatasetNotFound {
            project: project.clone(),
            dataset: dataset.clone(),
            message,
        },
        _ => BigQueryError::Remote {
            status: Some(404),
            reason: Some("notFound".to_string()),
            message,
        },
    }
}

/// Capture groups 1.. of the first match.
fn capture(pattern: &str, text: &str) -> Option<Vec<String>> {
    let caps = Regex::new(pattern).ok()?.captures(text)?;
    Some(
        caps.iter()
            .skip(1)
            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect(),
    )
}

fn sql_position(message: &str) -> Option<SqlPosition> {
    let caps = capture(r"\[(\d+):(\d+)\]", message)?;
    Some(SqlPosition {
        line: caps[0].parse().ok()?,
        column: caps[1].parse().ok()?,
    })
}

fn permission_in(message: &str) -> Option<String> {
    capture(r"(bigquery\.[A-Za-z]+\.[A-Za-z]+)", message).map(|caps| caps[0].clone())
}
