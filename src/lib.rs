pub mod catalog;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod materialize;
pub mod remote;
pub mod schema;
pub mod unload;

pub use catalog::{quote_identifier, CatalogReader, SchemaEntry, TableColumn, TablesSchema};
pub use config::DriverConfig;
pub use driver::{BigQueryDriver, Capabilities};
pub use error::{BigQueryError, DriverError, Result};
pub use executor::{
    BqClient, GcsExportStorage, Job, JobOutcome, JobPoller, PollPolicy, PollState, QueryExecutor,
    QueryOptions, TracingUsageReporter, UsageReporter,
};
pub use materialize::{
    BufferedResult, MaterializeOptions, MaterializedResult, Materializer, ReleaseHandle, Strategy,
    StreamingResult,
};
pub use remote::{CatalogService, ExportStorage, JobService, MockWarehouse, Row, RowStream};
pub use schema::{to_generic_type, BqType, ColumnType, GenericType, SchemaProber, TableRef};
pub use unload::{UnloadOptions, UnloadPipeline, UnloadQuery, UnloadResult};
