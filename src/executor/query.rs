use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::remote::{Destination, QueryJobRequest, QueryResults, Row};
use crate::schema::TableRef;
use super::poller::{JobOutcome, JobPoller};
use super::usage::QueryOptions;

/// Flattens a boxed scalar (`{"value": "2024-01-01"}`) to its string payload.
/// Every other cell passes through unchanged.
pub fn normalize_cell(cell: Value) -> Value {
    match cell {
        Value::Object(map) => {
            let inner = match map.get("value") {
                Some(Value::String(inner)) if !inner.is_empty() => Some(inner.clone()),
                _ => None,
            };
            match inner {
                Some(inner) => Value::String(inner),
                None => Value::Object(map),
            }
        }
        other => other,
    }
}

pub fn normalize_row(row: Row) -> Row {
    row.into_iter()
        .map(|(column, cell)| (column, normalize_cell(cell)))
        .collect()
}

#[derive(Clone)]
pub struct QueryExecutor {
    poller: JobPoller,
}

impl QueryExecutor {
    pub fn new(poller: JobPoller) -> Self {
        Self { poller }
    }

    pub fn poller(&self) -> &JobPoller {
        &self.poller
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<Vec<Row>> {
        Ok(self.execute_with_schema(sql, params, options).await?.rows)
    }

    /// Like [`QueryExecutor::execute`] but keeps the result schema, which is
    /// present even when the query produced no rows.
    pub async fn execute_with_schema(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<QueryResults> {
        let request = QueryJobRequest::new(sql).with_params(params.to_vec());
        let results = self.poller.run(&request, options, true).await?.into_results();

        Ok(QueryResults {
            columns: results.columns,
            rows: results.rows.into_iter().map(normalize_row).collect(),
        })
    }

    pub async fn load_into_table(
        &self,
        destination: &TableRef,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<bool> {
        let request = QueryJobRequest::new(sql)
            .with_params(params.to_vec())
            .with_destination(Destination::create_if_needed(destination.clone()));

        let outcome = self.poller.run(&request, options, false).await?;
        debug!(destination = %destination, "Loaded query results into table");
        Ok(matches!(outcome, JobOutcome::Completed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_boxed_string_is_unwrapped() {
        assert_eq!(normalize_cell(json!({"value": "2024-03-01"})), json!("2024-03-01"));
    }

    #[test]
    fn test_plain_cells_pass_through() {
        assert_eq!(normalize_cell(json!(42)), json!(42));
        assert_eq!(normalize_cell(json!("x")), json!("x"));
        assert_eq!(normalize_cell(Value::Null), Value::Null);
        assert_eq!(normalize_cell(json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn test_objects_without_string_payload_pass_through() {
        assert_eq!(normalize_cell(json!({"value": 5})), json!({"value": 5}));
        assert_eq!(normalize_cell(json!({"value": ""})), json!({"value": ""}));
        assert_eq!(normalize_cell(json!({"city": "Oslo"})), json!({"city": "Oslo"}));
    }

    #[test]
    fn test_normalize_row_keeps_column_order() {
        let row = json!({"z": {"value": "1"}, "a": 2, "m": {"value": "2024-01-01T00:00:00Z"}});
        let row = match row {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let normalized = normalize_row(row);
        let columns: Vec<_> = normalized.keys().cloned().collect();
        assert_eq!(columns, vec!["z", "a", "m"]);
        assert_eq!(normalized["z"], json!("1"));
        assert_eq!(normalized["m"], json!("2024-01-01T00:00:00Z"));
    }
}
