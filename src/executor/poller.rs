use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::remote::{
    Destination, ExtractJobRequest, JobHandle, JobService, JobState, QueryJobRequest, QueryResults,
};
use super::usage::{QueryOptions, TracingUsageReporter, UsageReporter};

const POLL_STEP: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub max_interval: Duration,
}

impl PollPolicy {
    pub fn new(timeout: Duration, max_interval: Duration) -> Self {
        Self { timeout, max_interval }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(config.poll_timeout, config.poll_max_interval)
    }

    /// Sleep after the `attempt`-th unfinished poll: grows by 200ms per
    /// attempt, capped at `max_interval`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        POLL_STEP.saturating_mul(attempt).min(self.max_interval)
    }
}

/// A submitted remote job. Never reused once it reaches a terminal state.
#[derive(Debug, Clone)]
pub struct Job {
    pub handle: JobHandle,
    pub sql: Option<String>,
    pub params: Vec<Value>,
    pub destination: Option<Destination>,
    pub created_at: DateTime<Utc>,
    submitted: Instant,
}

impl Job {
    pub fn new(handle: JobHandle) -> Self {
        Self {
            handle,
            sql: None,
            params: Vec::new(),
            destination: None,
            created_at: Utc::now(),
            submitted: Instant::now(),
        }
    }

    fn from_request(handle: JobHandle, request: &QueryJobRequest) -> Self {
        Self {
            sql: Some(request.query.clone()),
            params: request.params.clone(),
            destination: request.destination.clone(),
            ..Self::new(handle)
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.submitted.elapsed()
    }
}

/// Per-poll view of a job, recomputed from remote metadata every time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Running,
    DoneOk,
    DoneError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Rows(QueryResults),
    Completed,
}

impl JobOutcome {
    pub fn into_results(self) -> QueryResults {
        match self {
            JobOutcome::Rows(results) => results,
            JobOutcome::Completed => QueryResults::default(),
        }
    }
}

enum Phase {
    Polling { attempt: u32 },
    Succeeded,
    Failed(String),
    TimedOut,
}

#[derive(Clone)]
pub struct JobPoller {
    jobs: Arc<dyn JobService>,
    policy: PollPolicy,
    reporter: Arc<dyn UsageReporter>,
}

impl JobPoller {
    pub fn new(jobs: Arc<dyn JobService>, policy: PollPolicy) -> Self {
        Self {
            jobs,
            policy,
            reporter: Arc::new(TracingUsageReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn UsageReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub fn jobs(&self) -> &Arc<dyn JobService> {
        &self.jobs
    }

    pub async fn submit(&self, request: &QueryJobRequest) -> Result<Job> {
        let handle = self.jobs.create_query_job(request).await?;
        debug!(job = %handle, "Submitted query job");
        Ok(Job::from_request(handle, request))
    }

    pub async fn submit_extract(&self, request: &ExtractJobRequest) -> Result<Job> {
        let handle = self.jobs.create_extract_job(request).await?;
        debug!(job = %handle, source = %request.source, "Submitted extract job");
        Ok(Job::new(handle))
    }

    pub async fn poll_once(&self, job: &Job, options: &QueryOptions) -> Result<PollState> {
        let metadata = self.jobs.get_job_metadata(&job.handle).await?;
        if metadata.state != JobState::Done {
            return Ok(PollState::Running);
        }

        if let Some(error) = &metadata.error_result {
            return Ok(PollState::DoneError(error.describe()));
        }

        self.reporter.report_query_usage(metadata.statistics.as_ref(), options);
        Ok(PollState::DoneOk)
    }

    pub async fn await_terminal(
        &self,
        job: &Job,
        options: &QueryOptions,
        want_results: bool,
    ) -> Result<JobOutcome> {
        let mut phase = Phase::Polling { attempt: 0 };

        loop {
            phase = match phase {
                Phase::Polling { attempt } => {
                    if job.elapsed() > self.policy.timeout {
                        Phase::TimedOut
                    } else {
                        match self.poll_once(job, options).await? {
                            PollState::Running => {
                                let delay = self.policy.delay_for(attempt);
                                debug!(job = %job.handle, attempt, ?delay, "Job still running");
                                sleep(delay).await;
                                Phase::Polling { attempt: attempt + 1 }
                            }
                            PollState::DoneOk => Phase::Succeeded,
                            PollState::DoneError(message) => Phase::Failed(message),
                        }
                    }
                }
                Phase::Succeeded => {
                    if !want_results {
                        return Ok(JobOutcome::Completed);
                    }
                    let results = self.jobs.get_query_results(&job.handle).await?;
                    return Ok(JobOutcome::Rows(results));
                }
                Phase::Failed(message) => {
                    return Err(DriverError::RemoteJob { message });
                }
                Phase::TimedOut => {
                    warn!(job = %job.handle, timeout = ?self.policy.timeout, "Job timed out, cancelling");
                    if let Err(e) = self.jobs.cancel_job(&job.handle).await {
                        warn!(job = %job.handle, "Cancellation failed: {}", e);
                    }
                    return Err(DriverError::PollTimeout {
                        timeout_ms: self.policy.timeout.as_millis(),
                    });
                }
            };
        }
    }

    pub async fn run(
        &self,
        request: &QueryJobRequest,
        options: &QueryOptions,
        want_results: bool,
    ) -> Result<JobOutcome> {
        let job = self.submit(request).await?;
        self.await_terminal(&job, options, want_results).await
    }
}
