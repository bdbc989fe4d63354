use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{DriverError, Result};
use crate::executor::{JobPoller, QueryExecutor, QueryOptions};
use crate::remote::{ExportFormat, ExportStorage, ExtractJobRequest};
use crate::schema::{ColumnType, SchemaProber, TableRef};

pub const SIGNED_URL_TTL: Duration = Duration::from_secs(60 * 60);

const SHARD_PATTERN: &str = "*.csv.gz";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnloadQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct UnloadOptions {
    pub query: Option<UnloadQuery>,
    pub query_options: QueryOptions,
}

impl UnloadOptions {
    pub fn with_sql(sql: impl Into<String>) -> Self {
        Self {
            query: Some(UnloadQuery {
                sql: sql.into(),
                params: Vec::new(),
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnloadResult {
    pub table: String,
    pub types: Vec<ColumnType>,
    pub csv_file: Vec<String>,
    pub csv_no_header: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_bucket_csv_escape_symbol: Option<String>,
}

/// Exports a query or table into the export bucket as gzip CSV shards and
/// hands back signed URLs for every shard.
#[derive(Clone)]
pub struct UnloadPipeline {
    executor: QueryExecutor,
    prober: SchemaProber,
    poller: JobPoller,
    storage: Option<Arc<dyn ExportStorage>>,
    csv_escape_symbol: Option<String>,
}

impl UnloadPipeline {
    pub fn new(
        executor: QueryExecutor,
        prober: SchemaProber,
        storage: Option<Arc<dyn ExportStorage>>,
        csv_escape_symbol: Option<String>,
    ) -> Self {
        let poller = executor.poller().clone();
        Self {
            executor,
            prober,
            poller,
            storage,
            csv_escape_symbol,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.storage.is_some()
    }

    pub async fn unload(&self, table: &TableRef, options: &UnloadOptions) -> Result<UnloadResult> {
        let storage = self.storage.as_ref().ok_or_else(|| {
            DriverError::Configuration("Export bucket misconfigured.".to_string())
        })?;

        let types = match &options.query {
            Some(query) => self.unload_with_sql(storage.as_ref(), table, query, &options.query_options).await?,
            None => self.unload_with_table(storage.as_ref(), table, &options.query_options).await?,
        };

        let csv_file = self.signed_csv_files(storage.as_ref(), table).await?;
        info!(table = %table, files = csv_file.len(), "Unloaded to export bucket");

        Ok(UnloadResult {
            table: table.to_string(),
            types,
            csv_file,
            csv_no_header: false,
            export_bucket_csv_escape_symbol: self.csv_escape_symbol.clone(),
        })
    }

    async fn unload_with_sql(
        &self,
        storage: &dyn ExportStorage,
        table: &TableRef,
        query: &UnloadQuery,
        options: &QueryOptions,
    ) -> Result<Vec<ColumnType>> {
        let types = self.prober.column_types_for_query(&query.sql).await?;
        let export_sql = export_data_sql(&destination_uri(storage.bucket(), table), &query.sql);
        self.executor.execute(&export_sql, &query.params, options).await?;
        Ok(types)
    }

    async fn unload_with_table(
        &self,
        storage: &dyn ExportStorage,
        table: &TableRef,
        options: &QueryOptions,
    ) -> Result<Vec<ColumnType>> {
        let types = self.prober.column_types_for_table(table).await?;
        let request = ExtractJobRequest {
            source: table.clone(),
            destination_uri: destination_uri(storage.bucket(), table),
            format: ExportFormat::Csv,
            gzip: true,
        };

        let job = self.poller.submit_extract(&request).await?;
        self.poller.await_terminal(&job, options, false).await?;
        Ok(types)
    }

    async fn signed_csv_files(&self, storage: &dyn ExportStorage, table: &TableRef) -> Result<Vec<String>> {
        let objects = storage.list_objects(&table.export_prefix()).await?;
        try_join_all(
            objects
                .iter()
                .map(|object| storage.signed_read_url(object, SIGNED_URL_TTL)),
        )
        .await
    }
}

pub fn destination_uri(bucket: &str, table: &TableRef) -> String {
    format!("gs://{}/{}{}", bucket, table.export_prefix(), SHARD_PATTERN)
}

pub fn export_data_sql(uri: &str, sql: &str) -> String {
    format!(
        "EXPORT DATA\n\
         OPTIONS (\n  \
           uri='{}',\n  \
           format='CSV',\n  \
           overwrite=true,\n  \
           header=true,\n  \
           field_delimiter=',',\n  \
           compression='GZIP'\n\
         ) AS\n\
         {}",
        uri, sql
    )
}
