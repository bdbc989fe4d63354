mod field;
mod probe;
mod table;

pub use field::{to_generic_type, BqType, ColumnType, GenericType};
pub use probe::{probe_sql, typeof_sql, SchemaProber};
pub use table::TableRef;
