use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use serde_json::Value;
use tokio::time::Instant;

use crate::catalog::quote_identifier;
use crate::error::{BigQueryError, DriverError, Result};
use crate::schema::TableRef;
use super::{
    CatalogService, Destination, ErrorPayload, ExportStorage, ExtractJobRequest, FieldMeta,
    JobHandle, JobMetadata, JobService, JobState, JobStatistics, QueryJobRequest, QueryResults,
    ResultColumn, Row, RowStream, StoredObject,
};

const MOCK_PROJECT: &str = "mock-project";

/// Scripted lifecycle of one mock job.
#[derive(Debug, Clone)]
pub struct JobScript {
    running_polls: Option<usize>,
    error: Option<ErrorPayload>,
    results: QueryResults,
    statistics: Option<JobStatistics>,
    rejection: Option<String>,
}

impl JobScript {
    pub fn completed() -> Self {
        Self {
            running_polls: Some(0),
            error: None,
            results: QueryResults::default(),
            statistics: None,
            rejection: None,
        }
    }

    /// Finishes with `rows`; `columns` are `(name, remote type)` pairs.
    pub fn rows(columns: &[(&str, &str)], rows: Vec<Value>) -> Self {
        let results = QueryResults {
            columns: columns.iter().map(|(n, t)| ResultColumn::new(*n, *t)).collect(),
            rows: rows
                .into_iter()
                .filter_map(|row| match row {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
        };
        Self {
            results,
            ..Self::completed()
        }
    }

    pub fn failed(error: ErrorPayload) -> Self {
        Self {
            error: Some(error),
            ..Self::completed()
        }
    }

    pub fn never_finishes() -> Self {
        Self {
            running_polls: None,
            ..Self::completed()
        }
    }

    /// The job submission itself fails with `message`.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            rejection: Some(message.into()),
            ..Self::completed()
        }
    }

    pub fn running_for(mut self, polls: usize) -> Self {
        self.running_polls = Some(polls);
        self
    }

    pub fn with_statistics(mut self, statistics: JobStatistics) -> Self {
        self.statistics = Some(statistics);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedJob {
    pub job_id: String,
    pub query: Option<String>,
    pub params: Vec<Value>,
    pub destination: Option<Destination>,
    pub extract: Option<ExtractJobRequest>,
}

#[derive(Debug, Default)]
struct MockDataset {
    tables: BTreeMap<String, Vec<FieldMeta>>,
    deny_information_schema: bool,
}

struct MockJob {
    script: JobScript,
    polls: usize,
}

#[derive(Default)]
struct MockState {
    rules: Vec<(String, JobScript)>,
    extract_script: Option<JobScript>,
    datasets: BTreeMap<String, MockDataset>,
    objects: Vec<StoredObject>,
    jobs: HashMap<String, MockJob>,
    submitted: Vec<SubmittedJob>,
    polls: Vec<(String, Instant)>,
    cancelled: Vec<String>,
    fail_cancel: bool,
    streams: Vec<String>,
    signed: Vec<String>,
}

/// In-memory warehouse implementing every collaborator seam. Query jobs are
/// answered by the most recently registered rule whose pattern occurs in the
/// SQL; unmatched queries complete with no rows.
#[derive(Clone, Default)]
pub struct MockWarehouse {
    state: Arc<Mutex<MockState>>,
    bucket: String,
}

impl MockWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_query(&self, pattern: impl Into<String>, script: JobScript) -> &Self {
        self.state().rules.push((pattern.into(), script));
        self
    }

    pub fn on_extract(&self, script: JobScript) -> &Self {
        self.state().extract_script = Some(script);
        self
    }

    pub fn add_table(&self, dataset: &str, table: &str, fields: &[(&str, &str)]) -> &Self {
        let fields = fields
            .iter()
            .map(|(name, ty)| FieldMeta {
                name: name.to_string(),
                type_name: ty.to_string(),
            })
            .collect();
        self.state()
            .datasets
            .entry(dataset.to_string())
            .or_default()
            .tables
            .insert(table.to_string(), fields);
        self
    }

    pub fn add_dataset(&self, dataset: &str) -> &Self {
        self.state().datasets.entry(dataset.to_string()).or_default();
        self
    }

    /// INFORMATION_SCHEMA reads on `dataset` fail with a table permission error.
    pub fn deny_information_schema(&self, dataset: &str) -> &Self {
        self.state()
            .datasets
            .entry(dataset.to_string())
            .or_default()
            .deny_information_schema = true;
        self
    }

    pub fn add_object(&self, name: &str) -> &Self {
        self.state().objects.push(StoredObject {
            name: name.to_string(),
            size: None,
        });
        self
    }

    pub fn fail_cancellation(&self) -> &Self {
        self.state().fail_cancel = true;
        self
    }

    pub fn submitted(&self) -> Vec<SubmittedJob> {
        self.state().submitted.clone()
    }

    pub fn submitted_queries(&self) -> Vec<String> {
        self.state()
            .submitted
            .iter()
            .filter_map(|job| job.query.clone())
            .collect()
    }

    pub fn poll_instants(&self, job_id: &str) -> Vec<Instant> {
        self.state()
            .polls
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn poll_count(&self) -> usize {
        self.state().polls.len()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }

    pub fn opened_streams(&self) -> Vec<String> {
        self.state().streams.clone()
    }

    pub fn signed_objects(&self) -> Vec<String> {
        self.state().signed.clone()
    }

    pub fn remote_calls(&self) -> usize {
        let state = self.state();
        state.submitted.len() + state.polls.len() + state.streams.len() + state.signed.len()
    }

    fn script_for(state: &MockState, query: &str) -> JobScript {
        if let Some((_, script)) = state.rules.iter().rev().find(|(p, _)| query.contains(p.as_str())) {
            return script.clone();
        }

        for (name, dataset) in &state.datasets {
            let marker = format!("FROM {}.INFORMATION_SCHEMA.COLUMNS", quote_identifier(name));
            if !query.contains(&marker) {
                continue;
            }
            if dataset.deny_information_schema {
                return JobScript::failed(ErrorPayload {
                    reason: Some("accessDenied".into()),
                    message: Some(format!(
                        "Access Denied: Table {}:{}.secret: Permission bigquery.tables.get denied on table {}:{}.secret (or it may not exist).",
                        MOCK_PROJECT, name, MOCK_PROJECT, name
                    )),
                    ..Default::default()
                });
            }
            return JobScript::rows(
                &[
                    ("column_name", "STRING"),
                    ("table_name", "STRING"),
                    ("table_schema", "STRING"),
                    ("data_type", "STRING"),
                ],
                dataset
                    .tables
                    .iter()
                    .flat_map(|(table, fields)| {
                        fields.iter().map(move |f| {
                            serde_json::json!({
                                "column_name": f.name,
                                "table_name": table,
                                "table_schema": name,
                                "data_type": f.type_name,
                            })
                        })
                    })
                    .collect(),
            );
        }

        JobScript::completed()
    }

    fn register(&self, script: JobScript, submitted: SubmittedJob) -> Result<JobHandle> {
        if let Some(message) = &script.rejection {
            return Err(DriverError::Client(message.clone()));
        }
        let mut state = self.state();
        let job_id = format!("mock_job_{}", state.submitted.len() + 1);
        state.submitted.push(SubmittedJob {
            job_id: job_id.clone(),
            ..submitted
        });
        state.jobs.insert(job_id.clone(), MockJob { script, polls: 0 });
        Ok(JobHandle::new(job_id))
    }

    fn dataset_not_found(dataset: &str) -> DriverError {
        DriverError::BigQuery(BigQueryError::DatasetNotFound {
            project: MOCK_PROJECT.to_string(),
            dataset: dataset.to_string(),
            message: format!("Not found: Dataset {}:{}", MOCK_PROJECT, dataset),
        })
    }
}

#[async_trait]
impl JobService for MockWarehouse {
    async fn create_query_job(&self, request: &QueryJobRequest) -> Result<JobHandle> {
        let script = Self::script_for(&self.state(), &request.query);
        self.register(script, SubmittedJob {
            job_id: String::new(),
            query: Some(request.query.clone()),
            params: request.params.clone(),
            destination: request.destination.clone(),
            extract: None,
        })
    }

    async fn create_extract_job(&self, request: &ExtractJobRequest) -> Result<JobHandle> {
        let script = {
            let state = self.state();
            if !state.datasets.get(&request.source.dataset)
                .map(|d| d.tables.contains_key(&request.source.table))
                .unwrap_or(false)
            {
                return Err(Self::dataset_not_found(&request.source.dataset));
            }
            state.extract_script.clone().unwrap_or_else(JobScript::completed)
        };
        self.register(script, SubmittedJob {
            job_id: String::new(),
            query: None,
            params: Vec::new(),
            destination: None,
            extract: Some(request.clone()),
        })
    }

    async fn get_job_metadata(&self, job: &JobHandle) -> Result<JobMetadata> {
        let mut state = self.state();
        state.polls.push((job.job_id.clone(), Instant::now()));
        let mock = state
            .jobs
            .get_mut(&job.job_id)
            .ok_or_else(|| DriverError::NotFound(format!("job {}", job.job_id)))?;

        let observed = mock.polls;
        mock.polls += 1;

        let finished = matches!(mock.script.running_polls, Some(running) if observed >= running);
        if !finished {
            return Ok(JobMetadata::running());
        }

        Ok(JobMetadata {
            state: JobState::Done,
            error_result: mock.script.error.clone(),
            statistics: mock.script.statistics.clone(),
        })
    }

    async fn get_query_results(&self, job: &JobHandle) -> Result<QueryResults> {
        let state = self.state();
        state
            .jobs
            .get(&job.job_id)
            .map(|mock| mock.script.results.clone())
            .ok_or_else(|| DriverError::NotFound(format!("job {}", job.job_id)))
    }

    async fn cancel_job(&self, job: &JobHandle) -> Result<()> {
        let mut state = self.state();
        state.cancelled.push(job.job_id.clone());
        if state.fail_cancel {
            return Err(DriverError::Client(format!("cannot cancel {}", job.job_id)));
        }
        Ok(())
    }

    async fn open_query_stream(&self, request: &QueryJobRequest) -> Result<RowStream> {
        let script = {
            let mut state = self.state();
            state.streams.push(request.query.clone());
            Self::script_for(&state, &request.query)
        };
        if let Some(message) = script.rejection {
            return Err(DriverError::Client(message));
        }
        if let Some(error) = script.error {
            return Err(DriverError::RemoteJob { message: error.describe() });
        }
        let rows: Vec<Result<Row>> = script.results.rows.into_iter().map(Ok).collect();
        Ok(stream::iter(rows).boxed())
    }
}

#[async_trait]
impl CatalogService for MockWarehouse {
    async fn list_datasets(&self) -> Result<Vec<String>> {
        Ok(self.state().datasets.keys().cloned().collect())
    }

    async fn list_tables(&self, dataset: &str) -> Result<Vec<String>> {
        self.state()
            .datasets
            .get(dataset)
            .map(|d| d.tables.keys().cloned().collect())
            .ok_or_else(|| Self::dataset_not_found(dataset))
    }

    async fn table_fields(&self, table: &TableRef) -> Result<Vec<FieldMeta>> {
        self.state()
            .datasets
            .get(&table.dataset)
            .and_then(|d| d.tables.get(&table.table))
            .cloned()
            .ok_or_else(|| {
                DriverError::BigQuery(BigQueryError::TableNotFound {
                    project: MOCK_PROJECT.to_string(),
                    dataset: table.dataset.clone(),
                    table: table.table.clone(),
                    message: format!("Not found: Table {}:{}", MOCK_PROJECT, table),
                })
            })
    }

    async fn ensure_dataset(&self, dataset: &str) -> Result<()> {
        self.add_dataset(dataset);
        Ok(())
    }
}

#[async_trait]
impl ExportStorage for MockWarehouse {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        Ok(self
            .state()
            .objects
            .iter()
            .filter(|o| o.name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn signed_read_url(&self, object: &StoredObject, ttl: Duration) -> Result<String> {
        self.state().signed.push(object.name.clone());
        Ok(format!(
            "https://storage.googleapis.com/{}/{}?X-Goog-Expires={}",
            self.bucket,
            object.name,
            ttl.as_secs()
        ))
    }
}
