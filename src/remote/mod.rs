mod mock;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::schema::TableRef;

pub use mock::{JobScript, MockWarehouse, SubmittedJob};

/// One result row keyed by column name, in result-schema order.
pub type Row = serde_json::Map<String, Value>;

pub type RowStream = BoxStream<'static, Result<Row>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub location: Option<String>,
}

impl JobHandle {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{}:{}", location, self.job_id),
            None => write!(f, "{}", self.job_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreateDisposition {
    #[default]
    CreateIfNeeded,
    CreateNever,
}

impl CreateDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreateDisposition::CreateIfNeeded => "CREATE_IF_NEEDED",
            CreateDisposition::CreateNever => "CREATE_NEVER",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub table: TableRef,
    pub create_disposition: CreateDisposition,
}

impl Destination {
    pub fn create_if_needed(table: TableRef) -> Self {
        Self {
            table,
            create_disposition: CreateDisposition::CreateIfNeeded,
        }
    }
}

/// A standard-SQL statement with positional parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryJobRequest {
    pub query: String,
    pub params: Vec<Value>,
    pub destination: Option<Destination>,
}

impl QueryJobRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: Vec::new(),
            destination: None,
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Csv,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "CSV",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractJobRequest {
    pub source: TableRef,
    pub destination_uri: String,
    pub format: ExportFormat,
    pub gzip: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
}

impl JobState {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_uppercase().as_str() {
            "DONE" => JobState::Done,
            "RUNNING" => JobState::Running,
            _ => JobState::Pending,
        }
    }
}

/// The `errorResult` object attached to a finished job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorPayload {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// The message field when present, otherwise the serialized payload.
    pub fn describe(&self) -> String {
        match self.message.as_deref() {
            Some(message) if !message.is_empty() => message.to_string(),
            _ => serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatistics {
    pub creation_time: Option<i64>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub total_bytes_processed: Option<i64>,
    pub total_slot_ms: Option<i64>,
    pub cache_hit: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobMetadata {
    pub state: JobState,
    pub error_result: Option<ErrorPayload>,
    pub statistics: Option<JobStatistics>,
}

impl JobMetadata {
    pub fn running() -> Self {
        Self {
            state: JobState::Running,
            error_result: None,
            statistics: None,
        }
    }

    pub fn done() -> Self {
        Self {
            state: JobState::Done,
            error_result: None,
            statistics: None,
        }
    }

    pub fn failed(error: ErrorPayload) -> Self {
        Self {
            state: JobState::Done,
            error_result: Some(error),
            statistics: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    pub type_name: Option<String>,
}

impl ResultColumn {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: Some(type_name.into()),
        }
    }
}

/// Rows of a finished query job together with the result schema, which is
/// reported even when there are no rows.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResults {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Row>,
}

impl QueryResults {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub name: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[async_trait]
pub trait JobService: Send + Sync {
    async fn create_query_job(&self, request: &QueryJobRequest) -> Result<JobHandle>;

    async fn create_extract_job(&self, request: &ExtractJobRequest) -> Result<JobHandle>;

    async fn get_job_metadata(&self, job: &JobHandle) -> Result<JobMetadata>;

    async fn get_query_results(&self, job: &JobHandle) -> Result<QueryResults>;

    async fn cancel_job(&self, job: &JobHandle) -> Result<()>;

    /// Starts a query whose rows are pushed as they become available.
    async fn open_query_stream(&self, request: &QueryJobRequest) -> Result<RowStream>;
}

#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn list_datasets(&self) -> Result<Vec<String>>;

    async fn list_tables(&self, dataset: &str) -> Result<Vec<String>>;

    async fn table_fields(&self, table: &TableRef) -> Result<Vec<FieldMeta>>;

    async fn ensure_dataset(&self, dataset: &str) -> Result<()>;
}

#[async_trait]
pub trait ExportStorage: Send + Sync {
    fn bucket(&self) -> &str;

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObject>>;

    async fn signed_read_url(&self, object: &StoredObject, ttl: Duration) -> Result<String>;
}
