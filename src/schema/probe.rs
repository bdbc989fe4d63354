use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::executor::{QueryExecutor, QueryOptions};
use crate::remote::{CatalogService, QueryResults};
use super::field::{to_generic_type, ColumnType, GenericType};
use super::table::TableRef;

const TYPEOF_FUNCTION: &str = "bqutil.fn.typeof";

/// Resolves column types for ad hoc SQL by running it limited to one row and
/// asking BigQuery for the type of each resulting column.
#[derive(Clone)]
pub struct SchemaProber {
    executor: QueryExecutor,
    catalog: Arc<dyn CatalogService>,
}

impl SchemaProber {
    pub fn new(executor: QueryExecutor, catalog: Arc<dyn CatalogService>) -> Self {
        Self { executor, catalog }
    }

    /// Resolves the column types of `sql` from a one-row sample. Both the
    /// sample and the typeof query run without bound parameters, so `sql`
    /// must not contain `?` placeholders.
    pub async fn column_types_for_query(&self, sql: &str) -> Result<Vec<ColumnType>> {
        let options = QueryOptions::default();
        let row_sql = probe_sql(sql);
        let probe = self.executor.execute_with_schema(&row_sql, &[], &options).await?;

        let columns = probe_columns(&probe);
        if columns.is_empty() {
            return Ok(Vec::new());
        }

        let types_sql = typeof_sql(&row_sql, &columns);
        let types = self.executor.execute(&types_sql, &[], &options).await?;

        Ok(resolve_types(&probe, types.first()))
    }

    pub async fn column_types_for_table(&self, table: &TableRef) -> Result<Vec<ColumnType>> {
        let fields = self.catalog.table_fields(table).await?;
        Ok(fields
            .into_iter()
            .map(|field| ColumnType::from_remote(field.name, &field.type_name))
            .collect())
    }
}

pub fn probe_sql(sql: &str) -> String {
    format!("{} LIMIT 1", sql)
}

pub fn typeof_sql(row_sql: &str, columns: &[String]) -> String {
    let selections = columns
        .iter()
        .map(|c| format!("{}(`{}`) AS `{}`", TYPEOF_FUNCTION, c, c))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "WITH ORIGIN AS ({})\nSELECT {}\nFROM ORIGIN",
        row_sql, selections
    )
}

/// Column names in result-schema order, falling back to the first row's keys
/// when the schema was not reported.
fn probe_columns(probe: &QueryResults) -> Vec<String> {
    if !probe.columns.is_empty() {
        return probe.columns.iter().map(|c| c.name.clone()).collect();
    }
    probe
        .rows
        .first()
        .map(|row| row.keys().cloned().collect())
        .unwrap_or_default()
}

/// An empty probe produces no type row; those columns fall back to the type
/// the probe's result schema reported.
fn resolve_types(probe: &QueryResults, types_row: Option<&serde_json::Map<String, Value>>) -> Vec<ColumnType> {
    probe_columns(probe)
        .into_iter()
        .map(|name| {
            let from_typeof = types_row
                .and_then(|row| row.get(&name))
                .and_then(Value::as_str)
                .filter(|t| !t.eq_ignore_ascii_case("NULL"))
                .map(to_generic_type);

            let generic_type = from_typeof
                .or_else(|| {
                    probe
                        .columns
                        .iter()
                        .find(|c| c.name == name)
                        .and_then(|c| c.type_name.as_deref())
                        .map(to_generic_type)
                })
                .unwrap_or(GenericType::Text);

            ColumnType::new(name, generic_type)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ResultColumn;
    use serde_json::json;

    fn row(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_typeof_sql_wraps_probe_in_cte() {
        let sql = typeof_sql("SELECT 1 AS a LIMIT 1", &["a".into(), "b".into()]);
        assert_eq!(
            sql,
            "WITH ORIGIN AS (SELECT 1 AS a LIMIT 1)\n\
             SELECT bqutil.fn.typeof(`a`) AS `a`, bqutil.fn.typeof(`b`) AS `b`\n\
             FROM ORIGIN"
        );
    }

    #[test]
    fn test_resolve_types_from_typeof_row() {
        let probe = QueryResults {
            columns: vec![ResultColumn::new("a", "INTEGER"), ResultColumn::new("b", "STRING")],
            rows: vec![row(json!({"a": 1, "b": "x"}))],
        };
        let types = row(json!({"a": "INT64", "b": "STRING"}));

        assert_eq!(
            resolve_types(&probe, Some(&types)),
            vec![
                ColumnType::new("a", GenericType::Bigint),
                ColumnType::new("b", GenericType::Text),
            ]
        );
    }

    #[test]
    fn test_resolve_types_without_rows_uses_schema() {
        let probe = QueryResults {
            columns: vec![ResultColumn::new("d", "DATE"), ResultColumn::new("n", "FLOAT")],
            rows: vec![],
        };

        assert_eq!(
            resolve_types(&probe, None),
            vec![
                ColumnType::new("d", GenericType::Date),
                ColumnType::new("n", GenericType::Double),
            ]
        );
    }

    #[test]
    fn test_null_typeof_falls_back_to_schema() {
        let probe = QueryResults {
            columns: vec![ResultColumn::new("flag", "BOOLEAN")],
            rows: vec![row(json!({"flag": null}))],
        };
        let types = row(json!({"flag": "NULL"}));

        assert_eq!(
            resolve_types(&probe, Some(&types)),
            vec![ColumnType::new("flag", GenericType::Boolean)]
        );
    }

    #[test]
    fn test_probe_columns_from_row_keys() {
        let probe = QueryResults {
            columns: vec![],
            rows: vec![row(json!({"x": 1, "y": 2}))],
        };
        assert_eq!(probe_columns(&probe), vec!["x".to_string(), "y".to_string()]);
    }
}
