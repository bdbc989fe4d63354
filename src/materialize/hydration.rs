use futures::StreamExt;

use crate::executor::normalize_row;
use crate::remote::RowStream;

/// Converts the client's row representation into plain row mappings, one row
/// at a time as the consumer pulls. Backpressure stays with the source stream.
pub fn hydrate(source: RowStream) -> RowStream {
    source.map(|row| row.map(normalize_row)).boxed()
}
