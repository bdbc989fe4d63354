use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::catalog::{self, CatalogReader, TablesSchema};
use crate::config::{DriverConfig, DEFAULT_CONCURRENCY};
use crate::error::Result;
use crate::executor::{
    BqClient, GcsExportStorage, JobPoller, PollPolicy, QueryExecutor, QueryOptions, UsageReporter,
};
use crate::materialize::{
    BufferedResult, MaterializeOptions, MaterializedResult, Materializer, StreamingResult,
};
use crate::remote::{CatalogService, ExportStorage, JobService, Row};
use crate::schema::{self, ColumnType, GenericType, SchemaProber, TableRef};
use crate::unload::{UnloadOptions, UnloadPipeline, UnloadResult};

const TEST_CONNECTION_SQL: &str = "SELECT ? AS number";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub unload_without_temp_table: bool,
}

/// Entry point tying the job engine, materialization, unload and catalog
/// reads to one configuration and one set of remote collaborators.
#[derive(Clone)]
pub struct BigQueryDriver {
    config: Arc<DriverConfig>,
    jobs: Arc<dyn JobService>,
    catalog_service: Arc<dyn CatalogService>,
    storage: Option<Arc<dyn ExportStorage>>,
    executor: QueryExecutor,
    prober: SchemaProber,
    materializer: Materializer,
    unloader: UnloadPipeline,
    catalog: CatalogReader,
}

impl BigQueryDriver {
    pub fn new(
        config: DriverConfig,
        jobs: Arc<dyn JobService>,
        catalog: Arc<dyn CatalogService>,
        storage: Option<Arc<dyn ExportStorage>>,
    ) -> Self {
        let poller = JobPoller::new(jobs.clone(), PollPolicy::from_config(&config));
        Self::assemble(Arc::new(config), jobs, catalog, storage, poller)
    }

    /// Builds the real BigQuery and GCS clients. Storage is only created when
    /// an export bucket is configured.
    pub async fn connect(config: DriverConfig) -> Result<Self> {
        let client = Arc::new(BqClient::connect(&config).await?);
        let storage = GcsExportStorage::from_config(&config)?
            .map(|s| Arc::new(s) as Arc<dyn ExportStorage>);

        info!(
            data_source = %config.data_source,
            unload = storage.is_some(),
            "BigQuery driver ready"
        );
        Ok(Self::new(config, client.clone(), client, storage))
    }

    pub fn with_usage_reporter(self, reporter: Arc<dyn UsageReporter>) -> Self {
        let poller = JobPoller::new(self.jobs.clone(), PollPolicy::from_config(&self.config))
            .with_reporter(reporter);
        Self::assemble(self.config, self.jobs, self.catalog_service, self.storage, poller)
    }

    fn assemble(
        config: Arc<DriverConfig>,
        jobs: Arc<dyn JobService>,
        catalog_service: Arc<dyn CatalogService>,
        storage: Option<Arc<dyn ExportStorage>>,
        poller: JobPoller,
    ) -> Self {
        let executor = QueryExecutor::new(poller);
        let prober = SchemaProber::new(executor.clone(), catalog_service.clone());
        let materializer = Materializer::new(executor.clone(), prober.clone());
        let unloader = UnloadPipeline::new(
            executor.clone(),
            prober.clone(),
            storage.clone(),
            config.export_bucket_csv_escape_symbol.clone(),
        );
        let catalog = CatalogReader::new(executor.clone(), catalog_service.clone());

        Self {
            config,
            jobs,
            catalog_service,
            storage,
            executor,
            prober,
            materializer,
            unloader,
            catalog,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub async fn test_connection(&self) -> Result<()> {
        self.executor
            .execute(TEST_CONNECTION_SQL, &[json!("1")], &QueryOptions::default())
            .await?;
        Ok(())
    }

    pub fn read_only(&self) -> bool {
        self.config.read_only
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            unload_without_temp_table: true,
        }
    }

    pub fn default_concurrency() -> usize {
        DEFAULT_CONCURRENCY
    }

    pub fn is_unload_supported(&self) -> bool {
        self.unloader.is_supported()
    }

    pub async fn query(&self, sql: &str, params: &[Value], options: &QueryOptions) -> Result<Vec<Row>> {
        self.executor.execute(sql, params, options).await
    }

    /// `table` is `dataset.table`; the table is created when missing.
    pub async fn load_into_table(
        &self,
        table: &str,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<bool> {
        let destination: TableRef = table.parse()?;
        self.executor.load_into_table(&destination, sql, params, options).await
    }

    pub async fn column_types_for_query(&self, sql: &str) -> Result<Vec<ColumnType>> {
        self.prober.column_types_for_query(sql).await
    }

    pub async fn column_types_for_table(&self, table: &str) -> Result<Vec<ColumnType>> {
        let table: TableRef = table.parse()?;
        self.prober.column_types_for_table(&table).await
    }

    pub async fn download_query_results(
        &self,
        sql: &str,
        params: &[Value],
        options: &MaterializeOptions,
    ) -> Result<MaterializedResult> {
        self.materializer.materialize(sql, params, options).await
    }

    pub async fn memory(&self, sql: &str, params: &[Value]) -> Result<BufferedResult> {
        self.materializer.memory(sql, params).await
    }

    pub async fn stream(&self, sql: &str, params: &[Value]) -> Result<StreamingResult> {
        self.materializer.stream(sql, params).await
    }

    pub async fn unload(&self, table: &str, options: &UnloadOptions) -> Result<UnloadResult> {
        let table: TableRef = table.parse()?;
        self.unloader.unload(&table, options).await
    }

    pub async fn tables_schema(&self) -> Result<TablesSchema> {
        self.catalog.tables_schema().await
    }

    pub async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        self.catalog.list_tables(schema).await
    }

    pub async fn create_schema_if_not_exists(&self, schema: &str) -> Result<()> {
        self.catalog.create_schema_if_not_exists(schema).await
    }

    pub fn quote_identifier(identifier: &str) -> String {
        catalog::quote_identifier(identifier)
    }

    pub fn to_generic_type(remote_type: &str) -> GenericType {
        schema::to_generic_type(remote_type)
    }
}
