mod hydration;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::executor::{QueryExecutor, QueryOptions};
use crate::remote::{QueryJobRequest, Row, RowStream};
use crate::schema::{ColumnType, SchemaProber};

pub use hydration::hydrate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    Buffered,
    Streaming,
}

#[derive(Debug, Clone, Default)]
pub struct MaterializeOptions {
    pub stream_import: bool,
    pub query_options: QueryOptions,
}

impl MaterializeOptions {
    pub fn streaming() -> Self {
        Self {
            stream_import: true,
            ..Default::default()
        }
    }

    pub fn strategy(&self) -> Strategy {
        if self.stream_import {
            Strategy::Streaming
        } else {
            Strategy::Buffered
        }
    }
}

/// Release hook handed out with every materialized result. Releasing does not
/// free anything yet; it may be called any number of times.
#[derive(Clone, Default)]
pub struct ReleaseHandle {
    released: Arc<AtomicBool>,
}

impl ReleaseHandle {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            debug!("Released materialized result");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("released", &self.is_released())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedResult {
    pub rows: Vec<Row>,
    pub types: Vec<ColumnType>,
}

pub struct StreamingResult {
    pub rows: RowStream,
    pub types: Vec<ColumnType>,
    pub release: ReleaseHandle,
}

impl fmt::Debug for StreamingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingResult")
            .field("types", &self.types)
            .field("release", &self.release)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum MaterializedResult {
    Buffered(BufferedResult),
    Streaming(StreamingResult),
}

impl MaterializedResult {
    pub fn types(&self) -> &[ColumnType] {
        match self {
            MaterializedResult::Buffered(result) => &result.types,
            MaterializedResult::Streaming(result) => &result.types,
        }
    }

    /// No-op for buffered results.
    pub fn release(&self) {
        if let MaterializedResult::Streaming(result) = self {
            result.release.release();
        }
    }

    pub fn into_buffered(self) -> Option<BufferedResult> {
        match self {
            MaterializedResult::Buffered(result) => Some(result),
            MaterializedResult::Streaming(_) => None,
        }
    }

    pub fn into_streaming(self) -> Option<StreamingResult> {
        match self {
            MaterializedResult::Streaming(result) => Some(result),
            MaterializedResult::Buffered(_) => None,
        }
    }
}

/// Resolves column types once, then materializes with the chosen strategy.
#[derive(Clone)]
pub struct Materializer {
    executor: QueryExecutor,
    prober: SchemaProber,
}

impl Materializer {
    pub fn new(executor: QueryExecutor, prober: SchemaProber) -> Self {
        Self { executor, prober }
    }

    pub async fn materialize(
        &self,
        sql: &str,
        params: &[Value],
        options: &MaterializeOptions,
    ) -> Result<MaterializedResult> {
        let types = self.prober.column_types_for_query(sql).await?;

        match options.strategy() {
            Strategy::Buffered => self
                .buffered(types, sql, params, &options.query_options)
                .await
                .map(MaterializedResult::Buffered),
            Strategy::Streaming => self
                .streaming(types, sql, params)
                .await
                .map(MaterializedResult::Streaming),
        }
    }

    pub async fn memory(&self, sql: &str, params: &[Value]) -> Result<BufferedResult> {
        let types = self.prober.column_types_for_query(sql).await?;
        self.buffered(types, sql, params, &QueryOptions::default()).await
    }

    pub async fn stream(&self, sql: &str, params: &[Value]) -> Result<StreamingResult> {
        let types = self.prober.column_types_for_query(sql).await?;
        self.streaming(types, sql, params).await
    }

    async fn buffered(
        &self,
        types: Vec<ColumnType>,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<BufferedResult> {
        let rows = self.executor.execute(sql, params, options).await?;
        Ok(BufferedResult { rows, types })
    }

    async fn streaming(
        &self,
        types: Vec<ColumnType>,
        sql: &str,
        params: &[Value],
    ) -> Result<StreamingResult> {
        let request = QueryJobRequest::new(sql).with_params(params.to_vec());
        let source = self.executor.poller().jobs().open_query_stream(&request).await?;
        Ok(StreamingResult {
            rows: hydrate(source),
            types,
            release: ReleaseHandle::default(),
        })
    }
}
