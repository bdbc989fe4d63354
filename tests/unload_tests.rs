use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use bqdriver::remote::{ErrorPayload, ExportFormat, ExportStorage, JobScript, MockWarehouse};
use bqdriver::{
    BigQueryDriver, ColumnType, DriverConfig, DriverError, GenericType, TableRef, UnloadOptions,
    UnloadQuery,
};

fn config() -> DriverConfig {
    DriverConfig::new()
        .with_project_id("analytics")
        .with_export_bucket("cube-export")
        .with_poll_timeout(Duration::from_secs(30))
        .with_poll_max_interval(Duration::from_millis(500))
}

fn setup(config: DriverConfig) -> (Arc<MockWarehouse>, BigQueryDriver) {
    let warehouse = Arc::new(MockWarehouse::new().with_bucket("cube-export"));
    warehouse
        .add_object("pre_aggs.orders_v1/000000000000.csv.gz")
        .add_object("pre_aggs.orders_v1/000000000001.csv.gz")
        .add_object("pre_aggs.orders_v1/000000000002.csv.gz")
        .add_object("pre_aggs.users_v1/000000000000.csv.gz");

    let storage: Arc<dyn ExportStorage> = warehouse.clone();
    let driver = BigQueryDriver::new(config, warehouse.clone(), warehouse.clone(), Some(storage));
    (warehouse, driver)
}

#[tokio::test(start_paused = true)]
async fn test_unload_with_sql() {
    let (warehouse, driver) = setup(config().with_csv_escape_symbol("\\"));
    warehouse.on_query(
        "FROM src.orders",
        JobScript::rows(&[("id", "INT64"), ("status", "STRING")], vec![json!({"id": 1, "status": "new"})]),
    );
    warehouse.on_query(
        "bqutil.fn.typeof",
        JobScript::rows(&[("id", "STRING"), ("status", "STRING")], vec![json!({"id": "INT64", "status": "STRING"})]),
    );
    warehouse.on_query("EXPORT DATA", JobScript::completed().running_for(2));

    let options = UnloadOptions {
        query: Some(UnloadQuery {
            sql: "SELECT id, status FROM src.orders WHERE day = '2024-01-01'".into(),
            params: vec![],
        }),
        ..Default::default()
    };
    let result = assert_ok!(driver.unload("pre_aggs.orders_v1", &options).await);

    assert_eq!(result.table, "pre_aggs.orders_v1");
    assert!(!result.csv_no_header);
    assert_eq!(result.csv_file.len(), 3);
    assert!(result.csv_file.iter().all(|url| url.contains("/pre_aggs.orders_v1/")));
    assert!(result.csv_file[0].ends_with("X-Goog-Expires=3600"));
    assert_eq!(result.export_bucket_csv_escape_symbol.as_deref(), Some("\\"));
    assert_eq!(
        result.types,
        vec![
            ColumnType::new("id", GenericType::Bigint),
            ColumnType::new("status", GenericType::Text),
        ]
    );

    let export = warehouse
        .submitted()
        .into_iter()
        .find(|job| job.query.as_deref().map_or(false, |q| q.starts_with("EXPORT DATA")))
        .unwrap();
    let sql = export.query.unwrap();
    assert!(sql.contains("uri='gs://cube-export/pre_aggs.orders_v1/*.csv.gz'"));
    assert!(sql.contains("compression='GZIP'"));
    assert!(sql.contains("header=true"));
    assert!(sql.ends_with("SELECT id, status FROM src.orders WHERE day = '2024-01-01'"));
    assert!(export.params.is_empty());

    let type_queries: Vec<_> = warehouse
        .submitted()
        .into_iter()
        .filter(|job| job.query.as_deref().map_or(false, |q| q.contains("LIMIT 1")))
        .collect();
    assert_eq!(type_queries.len(), 2);
    assert!(type_queries.iter().all(|job| job.params.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn test_unload_table_uses_extract_job() {
    let (warehouse, driver) = setup(config());
    warehouse.add_table("pre_aggs", "orders_v1", &[("id", "INT64"), ("created", "TIMESTAMP")]);
    warehouse.on_extract(JobScript::completed().running_for(1));

    let result = assert_ok!(driver.unload("pre_aggs.orders_v1", &UnloadOptions::default()).await);

    assert_eq!(result.csv_file.len(), 3);
    assert_eq!(
        result.types,
        vec![
            ColumnType::new("id", GenericType::Bigint),
            ColumnType::new("created", GenericType::Timestamp),
        ]
    );
    assert!(result.export_bucket_csv_escape_symbol.is_none());

    let submitted = warehouse.submitted();
    assert_eq!(submitted.len(), 1);
    let extract = submitted[0].extract.clone().unwrap();
    assert_eq!(extract.source, TableRef::new("pre_aggs", "orders_v1"));
    assert_eq!(extract.destination_uri, "gs://cube-export/pre_aggs.orders_v1/*.csv.gz");
    assert_eq!(extract.format, ExportFormat::Csv);
    assert!(extract.gzip);
    assert_eq!(warehouse.poll_instants(&submitted[0].job_id).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unload_without_bucket_fails_before_remote_calls() {
    let warehouse = Arc::new(MockWarehouse::new());
    let driver = BigQueryDriver::new(DriverConfig::new(), warehouse.clone(), warehouse.clone(), None);

    assert!(!driver.is_unload_supported());
    let err = assert_err!(driver.unload("pre_aggs.orders_v1", &UnloadOptions::with_sql("SELECT 1")).await);

    assert!(matches!(err, DriverError::Configuration(_)));
    assert_eq!(warehouse.remote_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unload_with_no_shards() {
    let (warehouse, driver) = setup(config());
    warehouse.add_table("pre_aggs", "empty_v1", &[("id", "INT64")]);

    let result = assert_ok!(driver.unload("pre_aggs.empty_v1", &UnloadOptions::default()).await);
    assert!(result.csv_file.is_empty());
    assert!(warehouse.signed_objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_extract_propagates() {
    let (warehouse, driver) = setup(config());
    warehouse.add_table("pre_aggs", "orders_v1", &[("id", "INT64")]);
    warehouse.on_extract(JobScript::failed(ErrorPayload::with_message("Table too large to be exported")));

    let err = assert_err!(driver.unload("pre_aggs.orders_v1", &UnloadOptions::default()).await);
    match err {
        DriverError::RemoteJob { message } => assert_eq!(message, "Table too large to be exported"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(warehouse.signed_objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unload_result_json_shape() {
    let (warehouse, driver) = setup(config());
    warehouse.add_table("pre_aggs", "users_v1", &[("email", "STRING")]);

    let result = assert_ok!(driver.unload("pre_aggs.users_v1", &UnloadOptions::default()).await);
    let json = serde_json::to_value(&result).unwrap();

    assert_eq!(json["table"], json!("pre_aggs.users_v1"));
    assert_eq!(json["csvNoHeader"], json!(false));
    assert_eq!(json["types"], json!([{"name": "email", "type": "text"}]));
    assert_eq!(json["csvFile"].as_array().unwrap().len(), 1);
}
