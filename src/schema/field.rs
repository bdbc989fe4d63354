use std::fmt;

use serde::{Deserialize, Serialize};

/// The engine-agnostic type vocabulary shared by every materialization path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GenericType {
    Boolean,
    Bigint,
    Double,
    Date,
    Timestamp,
    Text,
}

impl GenericType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenericType::Boolean => "boolean",
            GenericType::Bigint => "bigint",
            GenericType::Double => "double",
            GenericType::Date => "date",
            GenericType::Timestamp => "timestamp",
            GenericType::Text => "text",
        }
    }
}

impl fmt::Display for GenericType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnType {
    pub name: String,
    #[serde(rename = "type")]
    pub generic_type: GenericType,
}

impl ColumnType {
    pub fn new(name: impl Into<String>, generic_type: GenericType) -> Self {
        Self {
            name: name.into(),
            generic_type,
        }
    }

    pub fn from_remote(name: impl Into<String>, remote_type: &str) -> Self {
        Self::new(name, to_generic_type(remote_type))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum BqType {
    String,
    Bytes,
    Int64,
    Float64,
    Numeric,
    Bignumeric,
    Bool,
    Date,
    Datetime,
    Time,
    Timestamp,
    Geography,
    Interval,
    Json,
    Array,
    Struct,
}

impl BqType {
    /// Parses a BigQuery type name as reported by table metadata,
    /// INFORMATION_SCHEMA or `bqutil.fn.typeof`. Parameterised forms such as
    /// `STRING(10)`, `NUMERIC(10, 2)` or `ARRAY<INT64>` resolve to their base type.
    pub fn parse(name: &str) -> Option<BqType> {
        let lower = name.trim().to_lowercase();
        let base = lower
            .split(|c: char| c == '(' || c == '<')
            .next()
            .unwrap_or_default()
            .trim();

        let ty = match base {
            "string" => BqType::String,
            "bytes" => BqType::Bytes,
            "int64" | "integer" => BqType::Int64,
            "float64" | "float" => BqType::Float64,
            "numeric" => BqType::Numeric,
            "bignumeric" => BqType::Bignumeric,
            "bool" | "boolean" => BqType::Bool,
            "date" => BqType::Date,
            "datetime" => BqType::Datetime,
            "time" => BqType::Time,
            "timestamp" => BqType::Timestamp,
            "geography" => BqType::Geography,
            "interval" => BqType::Interval,
            "json" => BqType::Json,
            "array" => BqType::Array,
            "struct" | "record" => BqType::Struct,
            _ => return None,
        };
        Some(ty)
    }

    pub fn generic_type(&self) -> GenericType {
        match self {
            BqType::Bool => GenericType::Boolean,
            BqType::Int64 => GenericType::Bigint,
            BqType::Float64 | BqType::Numeric | BqType::Bignumeric => GenericType::Double,
            BqType::Date => GenericType::Date,
            BqType::Datetime | BqType::Time | BqType::Timestamp => GenericType::Timestamp,
            BqType::String
            | BqType::Bytes
            | BqType::Geography
            | BqType::Interval
            | BqType::Json
            | BqType::Array
            | BqType::Struct => GenericType::Text,
        }
    }
}

/// Aliases the generic SQL drivers understand, used when a name is not a
/// BigQuery type.
fn base_generic_type(name: &str) -> Option<GenericType> {
    let ty = match name.trim().to_lowercase().as_str() {
        "int" | "smallint" | "bigint" | "tinyint" | "int2" | "int4" | "int8" => GenericType::Bigint,
        "decimal" | "real" | "double" | "double precision" => GenericType::Double,
        "text" | "varchar" | "nvarchar" | "character varying" | "uuid" | "enum" => GenericType::Text,
        "timestamp without time zone" | "timestamp with time zone" => GenericType::Timestamp,
        _ => return None,
    };
    Some(ty)
}

/// Maps a remote column type name into the generic vocabulary. Unknown names
/// map to [`GenericType::Text`].
pub fn to_generic_type(name: &str) -> GenericType {
    BqType::parse(name)
        .map(|ty| ty.generic_type())
        .or_else(|| base_generic_type(name))
        .unwrap_or(GenericType::Text)
}
