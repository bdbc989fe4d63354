use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use futures::{stream, StreamExt, TryStreamExt};
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::dataset::Dataset;
use gcp_bigquery_client::model::get_query_results_parameters::GetQueryResultsParameters;
use gcp_bigquery_client::model::job::Job as RemoteJob;
use gcp_bigquery_client::yup_oauth2::parse_service_account_key;
use gcp_bigquery_client::Client;
use serde_json::{json, Map, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DriverConfig;
use crate::error::{classify_bq_error, DriverError, ErrorContext, Result};
use crate::remote::{
    CatalogService, ErrorPayload, ExtractJobRequest, FieldMeta, JobHandle, JobMetadata,
    JobService, JobState, JobStatistics, QueryJobRequest, QueryResults, ResultColumn, Row,
    RowStream,
};
use crate::schema::TableRef;
use super::poller::PollPolicy;

/// BigQuery REST client behind the job and catalog seams.
#[derive(Clone)]
pub struct BqClient {
    client: Client,
    project_id: String,
    location: Option<String>,
    policy: PollPolicy,
}

impl BqClient {
    pub async fn new(project_id: impl Into<String>) -> Result<Self> {
        let client = Client::from_application_default_credentials()
            .await
            .map_err(|e| bq_error(e, ErrorContext::new().with_operation("client_init")))?;

        Ok(Self {
            client,
            project_id: project_id.into(),
            location: None,
            policy: PollPolicy::from_config(&DriverConfig::default()),
        })
    }

    /// Authenticates with inline credentials, then a key file, then
    /// application default credentials.
    pub async fn connect(config: &DriverConfig) -> Result<Self> {
        let project_id = config.require_project_id()?.to_string();
        let ctx = || ErrorContext::new().with_operation("client_init");

        let client = if let Some(json) = config.decoded_credentials()? {
            let key = parse_service_account_key(json)
                .map_err(|e| DriverError::Configuration(format!("Invalid service account key: {}", e)))?;
            Client::from_service_account_key(key, false)
                .await
                .map_err(|e| bq_error(e, ctx()))?
        } else if let Some(path) = &config.key_file {
            Client::from_service_account_key_file(path)
                .await
                .map_err(|e| bq_error(e, ctx()))?
        } else {
            Client::from_application_default_credentials()
                .await
                .map_err(|e| bq_error(e, ctx()))?
        };

        info!(project = %project_id, location = ?config.location, "Connected to BigQuery");
        Ok(Self {
            client,
            project_id,
            location: config.location.clone(),
            policy: PollPolicy::from_config(config),
        })
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    /// Bounds how long a query stream waits for its job to complete.
    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn job_reference(&self) -> Value {
        let mut reference = json!({
            "projectId": self.project_id,
            "jobId": format!("bqdriver_{}", Uuid::new_v4().simple()),
        });
        if let Some(location) = &self.location {
            reference["location"] = json!(location);
        }
        reference
    }

    fn table_reference(&self, table: &TableRef) -> Value {
        json!({
            "projectId": self.project_id,
            "datasetId": table.dataset,
            "tableId": table.table,
        })
    }

    async fn insert_job(&self, body: Value, ctx: ErrorContext) -> Result<JobHandle> {
        let job: RemoteJob = serde_json::from_value(body)?;
        let inserted = self
            .client
            .job()
            .insert(&self.project_id, job)
            .await
            .map_err(|e| bq_error(e, ctx))?;

        let inserted = serde_json::to_value(&inserted)?;
        let reference = &inserted["jobReference"];
        let job_id = reference["jobId"]
            .as_str()
            .ok_or_else(|| DriverError::Client("Inserted job has no job id".to_string()))?;
        let location = reference["location"]
            .as_str()
            .map(str::to_string)
            .or_else(|| self.location.clone());

        Ok(JobHandle::new(job_id).with_location(location))
    }

    async fn results_page(&self, job: &JobHandle, page_token: Option<String>) -> Result<Value> {
        let parameters = GetQueryResultsParameters {
            location: job.location.clone(),
            page_token,
            ..Default::default()
        };
        let response = self
            .client
            .job()
            .get_query_results(&self.project_id, &job.job_id, parameters)
            .await
            .map_err(|e| {
                bq_error(e, ErrorContext::new().with_operation("get_query_results"))
            })?;
        Ok(serde_json::to_value(&response)?)
    }
}

/// Fetches a results page, re-fetching while BigQuery reports the job as
/// incomplete. Gives up with `PollTimeout` once `policy.timeout` has elapsed
/// since `started`.
async fn complete_page<F, Fut>(policy: PollPolicy, started: Instant, mut fetch: F) -> Result<Value>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    let mut attempt = 0;
    loop {
        if started.elapsed() > policy.timeout {
            return Err(DriverError::PollTimeout {
                timeout_ms: policy.timeout.as_millis(),
            });
        }
        let page = fetch().await?;
        if page["jobComplete"].as_bool() != Some(false) {
            return Ok(page);
        }
        sleep(policy.delay_for(attempt)).await;
        attempt += 1;
    }
}

fn bq_error(error: BQError, context: ErrorContext) -> DriverError {
    DriverError::BigQuery(classify_bq_error(error, context))
}

#[async_trait]
impl JobService for BqClient {
    async fn create_query_job(&self, request: &QueryJobRequest) -> Result<JobHandle> {
        let mut query = json!({
            "query": request.query,
            "useLegacySql": false,
        });
        if !request.params.is_empty() {
            query["parameterMode"] = json!("POSITIONAL");
            query["queryParameters"] = Value::Array(request.params.iter().map(query_parameter).collect());
        }
        if let Some(destination) = &request.destination {
            query["destinationTable"] = self.table_reference(&destination.table);
            query["createDisposition"] = json!(destination.create_disposition.as_str());
        }

        let body = json!({
            "jobReference": self.job_reference(),
            "configuration": { "query": query },
        });
        self.insert_job(body, ErrorContext::new().with_operation("create_query_job").with_sql(&request.query))
            .await
    }

    async fn create_extract_job(&self, request: &ExtractJobRequest) -> Result<JobHandle> {
        let mut extract = json!({
            "sourceTable": self.table_reference(&request.source),
            "destinationUris": [request.destination_uri],
            "destinationFormat": request.format.as_str(),
        });
        if request.gzip {
            extract["compression"] = json!("GZIP");
        }

        let body = json!({
            "jobReference": self.job_reference(),
            "configuration": { "extract": extract },
        });
        let ctx = ErrorContext::new().with_operation("create_extract_job").with_table(
            &self.project_id,
            &request.source.dataset,
            &request.source.table,
        );
        self.insert_job(body, ctx).await
    }

    async fn get_job_metadata(&self, job: &JobHandle) -> Result<JobMetadata> {
        let remote = self
            .client
            .job()
            .get_job(&self.project_id, &job.job_id, job.location.as_deref())
            .await
            .map_err(|e| bq_error(e, ErrorContext::new().with_operation("get_job")))?;

        Ok(job_metadata(&serde_json::to_value(&remote)?))
    }

    async fn get_query_results(&self, job: &JobHandle) -> Result<QueryResults> {
        let mut page = self.results_page(job, None).await?;
        let fields = page["schema"]["fields"].as_array().cloned().unwrap_or_default();
        let mut results = QueryResults {
            columns: result_columns(&fields),
            rows: page_rows(&fields, &page),
        };

        while let Some(token) = page["pageToken"].as_str().map(str::to_string) {
            debug!(job = %job, rows = results.rows.len(), "Fetching next result page");
            page = self.results_page(job, Some(token)).await?;
            results.rows.extend(page_rows(&fields, &page));
        }

        Ok(results)
    }

    async fn cancel_job(&self, job: &JobHandle) -> Result<()> {
        self.client
            .job()
            .cancel_job(&self.project_id, &job.job_id, job.location.as_deref())
            .await
            .map_err(|e| bq_error(e, ErrorContext::new().with_operation("cancel_job")))?;
        Ok(())
    }

    async fn open_query_stream(&self, request: &QueryJobRequest) -> Result<RowStream> {
        let handle = self.create_query_job(request).await?;
        let started = Instant::now();
        let client = self.clone();

        let pages = stream::try_unfold(Some(None), move |cursor: Option<Option<String>>| {
            let client = client.clone();
            let handle = handle.clone();
            async move {
                let Some(token) = cursor else {
                    return Ok::<_, DriverError>(None);
                };
                let fetch = || client.results_page(&handle, token.clone());
                let page = match complete_page(client.policy, started, fetch).await {
                    Err(e @ DriverError::PollTimeout { .. }) => {
                        warn!(job = %handle, "Query stream timed out, cancelling");
                        if let Err(cancel) = client.cancel_job(&handle).await {
                            warn!(job = %handle, "Cancellation failed: {}", cancel);
                        }
                        return Err(e);
                    }
                    page => page?,
                };
                let fields = page["schema"]["fields"].as_array().cloned().unwrap_or_default();
                let rows = page_rows(&fields, &page);
                let next = page["pageToken"].as_str().map(|t| Some(t.to_string()));
                Ok(Some((rows, next)))
            }
        });

        Ok(pages
            .map_ok(|rows| stream::iter(rows.into_iter().map(Ok::<Row, DriverError>)))
            .try_flatten()
            .boxed())
    }
}

#[async_trait]
impl CatalogService for BqClient {
    async fn list_datasets(&self) -> Result<Vec<String>> {
        let datasets = self
            .client
            .dataset()
            .list(&self.project_id, Default::default())
            .await
            .map_err(|e| bq_error(e, ErrorContext::new().with_operation("list_datasets")))?;

        let datasets = serde_json::to_value(&datasets)?;
        Ok(datasets["datasets"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|d| d["datasetReference"]["datasetId"].as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_tables(&self, dataset: &str) -> Result<Vec<String>> {
        let tables = self
            .client
            .table()
            .list(&self.project_id, dataset, Default::default())
            .await
            .map_err(|e| {
                let ctx = ErrorContext::new()
                    .with_operation("list_tables")
                    .with_dataset(&self.project_id, dataset);
                bq_error(e, ctx)
            })?;

        Ok(tables
            .tables
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.table_reference.table_id)
            .collect())
    }

    async fn table_fields(&self, table: &TableRef) -> Result<Vec<FieldMeta>> {
        let remote = self
            .client
            .table()
            .get(&self.project_id, &table.dataset, &table.table, None)
            .await
            .map_err(|e| {
                let ctx = ErrorContext::new()
                    .with_operation("get_table")
                    .with_table(&self.project_id, &table.dataset, &table.table);
                bq_error(e, ctx)
            })?;

        let remote = serde_json::to_value(&remote)?;
        let fields = remote["schema"]["fields"].clone();
        Ok(serde_json::from_value::<Option<Vec<FieldMeta>>>(fields)?.unwrap_or_default())
    }

    async fn ensure_dataset(&self, dataset: &str) -> Result<()> {
        if self.client.dataset().get(&self.project_id, dataset).await.is_ok() {
            return Ok(());
        }

        let mut ds = Dataset::new(&self.project_id, dataset);
        if let Some(location) = &self.location {
            ds = ds.location(location);
        }
        self.client.dataset().create(ds).await.map_err(|e| {
            let ctx = ErrorContext::new()
                .with_operation("create_dataset")
                .with_dataset(&self.project_id, dataset);
            bq_error(e, ctx)
        })?;
        info!(dataset, "Created dataset");
        Ok(())
    }
}

fn query_parameter(value: &Value) -> Value {
    let (kind, rendered) = match value {
        Value::Bool(b) => ("BOOL", Some(b.to_string())),
        Value::Number(n) if n.is_i64() || n.is_u64() => ("INT64", Some(n.to_string())),
        Value::Number(n) => ("FLOAT64", Some(n.to_string())),
        Value::String(s) => ("STRING", Some(s.clone())),
        Value::Null => ("STRING", None),
        other => ("STRING", Some(other.to_string())),
    };

    let parameter_value = match rendered {
        Some(v) => json!({ "value": v }),
        None => json!({}),
    };
    json!({
        "parameterType": { "type": kind },
        "parameterValue": parameter_value,
    })
}

fn int_field(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn job_metadata(job: &Value) -> JobMetadata {
    let status = &job["status"];
    let state = JobState::parse(status["state"].as_str().unwrap_or_default());

    let error_result = status
        .get("errorResult")
        .filter(|e| !e.is_null())
        .and_then(|e| serde_json::from_value::<ErrorPayload>(e.clone()).ok());

    let stats = &job["statistics"];
    let statistics = stats.is_object().then(|| JobStatistics {
        creation_time: int_field(&stats["creationTime"]),
        start_time: int_field(&stats["startTime"]),
        end_time: int_field(&stats["endTime"]),
        total_bytes_processed: int_field(&stats["totalBytesProcessed"]),
        total_slot_ms: int_field(&stats["totalSlotMs"]),
        cache_hit: stats["query"]["cacheHit"].as_bool(),
    });

    JobMetadata {
        state,
        error_result,
        statistics,
    }
}

fn result_columns(fields: &[Value]) -> Vec<ResultColumn> {
    fields
        .iter()
        .map(|f| ResultColumn {
            name: f["name"].as_str().unwrap_or_default().to_string(),
            type_name: f["type"].as_str().map(str::to_string),
        })
        .collect()
}

fn page_rows(fields: &[Value], page: &Value) -> Vec<Row> {
    page["rows"]
        .as_array()
        .map(|rows| rows.iter().map(|row| record(fields, row)).collect())
        .unwrap_or_default()
}

/// Decodes one `{"f": [{"v": ...}]}` record against its schema fields.
fn record(fields: &[Value], row: &Value) -> Row {
    let cells = row["f"].as_array().cloned().unwrap_or_default();
    let mut out = Map::new();
    for (field, cell) in fields.iter().zip(cells.iter()) {
        let name = field["name"].as_str().unwrap_or_default().to_string();
        out.insert(name, field_value(field, &cell["v"]));
    }
    out
}

fn field_value(field: &Value, raw: &Value) -> Value {
    if field["mode"].as_str() == Some("REPEATED") {
        return match raw.as_array() {
            Some(items) => Value::Array(
                items
                    .iter()
                    .map(|item| scalar_value(field, &item["v"]))
                    .collect(),
            ),
            None => Value::Array(Vec::new()),
        };
    }
    scalar_value(field, raw)
}

/// Temporal cells come back boxed as `{"value": ...}` like the other client
/// libraries return them; row normalization flattens them later.
fn scalar_value(field: &Value, raw: &Value) -> Value {
    if raw.is_null() {
        return Value::Null;
    }
    let text = raw.as_str().unwrap_or_default();

    match field["type"].as_str().unwrap_or_default() {
        "INTEGER" | "INT64" => text.parse::<i64>().map(Value::from).unwrap_or_else(|_| json!(text)),
        "FLOAT" | "FLOAT64" => text.parse::<f64>().map(Value::from).unwrap_or_else(|_| json!(text)),
        "BOOLEAN" | "BOOL" => Value::Bool(text.eq_ignore_ascii_case("true")),
        "DATE" | "DATETIME" | "TIME" => json!({ "value": text }),
        "TIMESTAMP" => json!({ "value": timestamp_text(text) }),
        "RECORD" | "STRUCT" => {
            let nested = field["fields"].as_array().cloned().unwrap_or_default();
            Value::Object(record(&nested, raw))
        }
        _ => match raw {
            Value::String(s) => Value::String(s.clone()),
            other => other.clone(),
        },
    }
}

/// REST timestamps are epoch seconds with a fractional part.
fn timestamp_text(epoch_seconds: &str) -> String {
    epoch_seconds
        .parse::<f64>()
        .ok()
        .and_then(|seconds| DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64))
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| epoch_seconds.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_parameter_types() {
        assert_eq!(query_parameter(&json!("1"))["parameterType"]["type"], "STRING");
        assert_eq!(query_parameter(&json!("1"))["parameterValue"]["value"], "1");
        assert_eq!(query_parameter(&json!(7))["parameterType"]["type"], "INT64");
        assert_eq!(query_parameter(&json!(1.5))["parameterType"]["type"], "FLOAT64");
        assert_eq!(query_parameter(&json!(true))["parameterValue"]["value"], "true");
        assert_eq!(query_parameter(&Value::Null)["parameterValue"], json!({}));
    }

    #[test]
    fn test_job_metadata_running() {
        let metadata = job_metadata(&json!({"status": {"state": "RUNNING"}}));
        assert_eq!(metadata.state, JobState::Running);
        assert!(metadata.error_result.is_none());
        assert!(metadata.statistics.is_none());
    }

    #[test]
    fn test_job_metadata_done_with_error_and_stats() {
        let metadata = job_metadata(&json!({
            "status": {
                "state": "DONE",
                "errorResult": {"reason": "invalidQuery", "message": "Syntax error"}
            },
            "statistics": {
                "creationTime": "1700000000000",
                "totalBytesProcessed": "2048",
                "query": {"cacheHit": true}
            }
        }));
        assert_eq!(metadata.state, JobState::Done);
        assert_eq!(metadata.error_result.unwrap().describe(), "Syntax error");
        let stats = metadata.statistics.unwrap();
        assert_eq!(stats.creation_time, Some(1_700_000_000_000));
        assert_eq!(stats.total_bytes_processed, Some(2048));
        assert_eq!(stats.cache_hit, Some(true));
    }

    #[test]
    fn test_page_rows_decodes_by_schema() {
        let fields = vec![
            json!({"name": "n", "type": "INTEGER"}),
            json!({"name": "day", "type": "DATE"}),
            json!({"name": "ok", "type": "BOOLEAN"}),
            json!({"name": "tags", "type": "STRING", "mode": "REPEATED"}),
            json!({"name": "missing", "type": "FLOAT"}),
        ];
        let page = json!({"rows": [{"f": [
            {"v": "42"},
            {"v": "2024-01-01"},
            {"v": "true"},
            {"v": [{"v": "a"}, {"v": "b"}]},
            {"v": null}
        ]}]});

        let rows = page_rows(&fields, &page);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row["n"], json!(42));
        assert_eq!(row["day"], json!({"value": "2024-01-01"}));
        assert_eq!(row["ok"], json!(true));
        assert_eq!(row["tags"], json!(["a", "b"]));
        assert_eq!(row["missing"], Value::Null);
        let columns: Vec<_> = row.keys().cloned().collect();
        assert_eq!(columns, vec!["n", "day", "ok", "tags", "missing"]);
    }

    #[test]
    fn test_nested_record() {
        let fields = vec![json!({
            "name": "addr",
            "type": "RECORD",
            "fields": [{"name": "city", "type": "STRING"}]
        })];
        let page = json!({"rows": [{"f": [{"v": {"f": [{"v": "Oslo"}]}}]}]});
        assert_eq!(page_rows(&fields, &page)[0]["addr"], json!({"city": "Oslo"}));
    }

    #[test]
    fn test_timestamp_text() {
        assert_eq!(timestamp_text("1.7040672E9"), "2024-01-01T00:00:00.000Z");
        assert_eq!(timestamp_text("garbage"), "garbage");
    }

    fn policy(timeout_secs: u64) -> PollPolicy {
        PollPolicy {
            timeout: std::time::Duration::from_secs(timeout_secs),
            max_interval: std::time::Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_page_waits_for_job_completion() {
        let mut fetches = 0;
        let page = complete_page(policy(60), Instant::now(), || {
            fetches += 1;
            let done = fetches >= 3;
            async move { Ok(json!({"jobComplete": done, "rows": []})) }
        })
        .await;

        let page = tokio_test::assert_ok!(page);
        assert_eq!(page["jobComplete"], json!(true));
        assert_eq!(fetches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_page_times_out_on_incomplete_job() {
        let mut fetches = 0;
        let started = Instant::now();
        let page = complete_page(policy(5), started, || {
            fetches += 1;
            async { Ok(json!({"jobComplete": false})) }
        })
        .await;

        let err = tokio_test::assert_err!(page);
        assert!(matches!(err, DriverError::PollTimeout { timeout_ms: 5000 }));
        assert!(started.elapsed() > std::time::Duration::from_secs(5));
        assert!(fetches < 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_page_passes_fetch_errors_through() {
        let page = complete_page(policy(5), Instant::now(), || async {
            Err(DriverError::Configuration("boom".into()))
        })
        .await;
        assert!(matches!(tokio_test::assert_err!(page), DriverError::Configuration(_)));
    }
}
