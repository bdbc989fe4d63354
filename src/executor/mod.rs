mod client;
mod poller;
mod query;
mod storage;
mod usage;

pub use client::BqClient;
pub use poller::{Job, JobOutcome, JobPoller, PollPolicy, PollState};
pub use query::{normalize_cell, normalize_row, QueryExecutor};
pub use storage::GcsExportStorage;
pub use usage::{QueryOptions, TracingUsageReporter, UsageReporter};
