use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::Result;
use crate::executor::{QueryExecutor, QueryOptions};
use crate::remote::{CatalogService, Row};
use crate::schema::{to_generic_type, GenericType};

/// schema → table → columns
pub type TablesSchema = BTreeMap<String, BTreeMap<String, Vec<TableColumn>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub generic_type: GenericType,
    #[serde(default)]
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub table_schema: String,
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
}

impl SchemaEntry {
    fn from_row(row: &Row) -> Option<Self> {
        let field = |name: &str| row.get(name).and_then(Value::as_str).map(str::to_string);
        Some(Self {
            table_schema: field("table_schema")?,
            table_name: field("table_name")?,
            column_name: field("column_name")?,
            data_type: field("data_type")?,
        })
    }
}

/// Quotes each dotted part that is not a plain lowercase identifier. A part
/// that needs quoting is replaced by the whole identifier in backticks, so
/// `a.B` becomes ``a.`a.B` ``.
pub fn quote_identifier(identifier: &str) -> String {
    identifier
        .split('.')
        .map(|name| {
            let plain = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if plain {
                name.to_string()
            } else {
                format!("`{}`", identifier)
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

pub fn information_schema_sql(dataset: &str) -> String {
    format!(
        "SELECT\n  \
           columns.column_name as {},\n  \
           columns.table_name as {},\n  \
           columns.table_schema as {},\n  \
           columns.data_type as {}\n\
         FROM {}.INFORMATION_SCHEMA.COLUMNS AS columns",
        quote_identifier("column_name"),
        quote_identifier("table_name"),
        quote_identifier("table_schema"),
        quote_identifier("data_type"),
        quote_identifier(dataset),
    )
}

pub fn build_tables_schema(entries: impl IntoIterator<Item = SchemaEntry>) -> TablesSchema {
    let mut schema = TablesSchema::new();
    for entry in entries {
        let generic_type = to_generic_type(&entry.data_type);
        schema
            .entry(entry.table_schema)
            .or_default()
            .entry(entry.table_name)
            .or_default()
            .push(TableColumn {
                name: entry.column_name,
                data_type: entry.data_type,
                generic_type,
                attributes: Vec::new(),
            });
    }
    schema
}

#[derive(Clone)]
pub struct CatalogReader {
    executor: QueryExecutor,
    catalog: Arc<dyn CatalogService>,
}

impl CatalogReader {
    pub fn new(executor: QueryExecutor, catalog: Arc<dyn CatalogService>) -> Self {
        Self { executor, catalog }
    }

    pub async fn tables_schema(&self) -> Result<TablesSchema> {
        let datasets = self.catalog.list_datasets().await?;
        info!(datasets = datasets.len(), "Reading INFORMATION_SCHEMA columns");

        let loaded = join_all(datasets.iter().map(|dataset| self.dataset_columns(dataset))).await;

        let mut entries = Vec::new();
        for columns in loaded {
            entries.extend(columns?);
        }
        Ok(build_tables_schema(entries))
    }

    async fn dataset_columns(&self, dataset: &str) -> Result<Vec<SchemaEntry>> {
        let sql = information_schema_sql(dataset);
        match self.executor.execute(&sql, &[], &QueryOptions::default()).await {
            Ok(rows) => Ok(rows
                .iter()
                .filter_map(|row| {
                    let entry = SchemaEntry::from_row(row);
                    if entry.is_none() {
                        warn!(dataset, ?row, "Skipping INFORMATION_SCHEMA row with missing columns");
                    }
                    entry
                })
                .collect()),
            Err(e) if e.is_permission_denied() => {
                warn!(dataset, "Skipping dataset without table read permission: {}", e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        match self.catalog.list_tables(schema).await {
            Ok(tables) => Ok(tables),
            Err(e) if e.is_not_found() => {
                warn!(schema, "Dataset not found, no tables to list");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn create_schema_if_not_exists(&self, schema: &str) -> Result<()> {
        self.catalog.ensure_dataset(schema).await
    }
}
