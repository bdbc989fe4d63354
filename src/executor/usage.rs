use tracing::debug;

use crate::remote::JobStatistics;

/// Per-call context passed through to usage reporting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub request_id: Option<String>,
    pub query_key: Option<String>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_query_key(mut self, query_key: impl Into<String>) -> Self {
        self.query_key = Some(query_key.into());
        self
    }
}

/// Receives the statistics of every job that finishes successfully.
pub trait UsageReporter: Send + Sync {
    fn report_query_usage(&self, statistics: Option<&JobStatistics>, options: &QueryOptions);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageReporter;

impl UsageReporter for TracingUsageReporter {
    fn report_query_usage(&self, statistics: Option<&JobStatistics>, options: &QueryOptions) {
        let Some(stats) = statistics else {
            return;
        };
        debug!(
            request_id = options.request_id.as_deref().unwrap_or("-"),
            bytes_processed = stats.total_bytes_processed.unwrap_or_default(),
            slot_ms = stats.total_slot_ms.unwrap_or_default(),
            cache_hit = stats.cache_hit.unwrap_or(false),
            "BigQuery job usage"
        );
    }
}
