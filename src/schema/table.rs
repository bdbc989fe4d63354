use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// A `dataset.table` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Object prefix the table's exported files live under.
    pub fn export_prefix(&self) -> String {
        format!("{}/", self)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

impl FromStr for TableRef {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split('.').collect::<Vec<_>>().as_slice() {
            [dataset, table] if !dataset.is_empty() && !table.is_empty() => {
                Ok(TableRef::new(*dataset, *table))
            }
            _ => Err(DriverError::InvalidTableRef(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table_ref() {
        let table: TableRef = "pre_aggregations.orders_main".parse().unwrap();
        assert_eq!(table.dataset, "pre_aggregations");
        assert_eq!(table.table, "orders_main");
        assert_eq!(table.to_string(), "pre_aggregations.orders_main");
        assert_eq!(table.export_prefix(), "pre_aggregations.orders_main/");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("orders".parse::<TableRef>().is_err());
        assert!("a.b.c".parse::<TableRef>().is_err());
        assert!(".orders".parse::<TableRef>().is_err());
    }
}
