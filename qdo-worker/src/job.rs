//! Running user jobs and dealing with the messages they fail on.
use std::collections::HashMap;
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use qdo_common::partition::PartitionName;
use qdo_common::queuey::{Message, QueueService};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::FailurePolicy;
use crate::error::ConfigError;

/// How long the queue service keeps archived failures: thirty days.
pub const ERROR_TTL: time::Duration = time::Duration::from_secs(2_592_000);

/// State shared by every run of a job, opened before the loop starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobContext(serde_json::Map<String, serde_json::Value>);

impl JobContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: &str, value: serde_json::Value) -> Option<serde_json::Value> {
        self.0.insert(key.to_owned(), value)
    }
}

/// The user logic applied to every message.
#[async_trait]
pub trait Job: Send + Sync {
    async fn open_context(&self) -> anyhow::Result<JobContext> {
        Ok(JobContext::new())
    }

    async fn process(&self, message: &Message, context: &mut JobContext) -> anyhow::Result<()>;

    async fn close_context(&self, _context: JobContext) {}
}

/// Logs every message it is given.
pub struct LogJob;

#[async_trait]
impl Job for LogJob {
    async fn process(&self, message: &Message, _context: &mut JobContext) -> anyhow::Result<()> {
        info!(
            partition = %message.partition,
            message_id = %message.message_id,
            body = %message.body,
            "processing message"
        );
        Ok(())
    }
}

/// Jobs available by name to the `JOB` option.
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn empty() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }

    /// A registry holding the jobs that ship with the worker.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("log", Arc::new(LogJob));
        registry
    }

    pub fn register(&mut self, name: &str, job: Arc<dyn Job>) {
        self.jobs.insert(name.to_owned(), job);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Job>, ConfigError> {
        self.jobs
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownJob(name.to_owned()))
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// A message the job could not process.
#[derive(Clone, Copy)]
pub struct JobFailure<'a> {
    pub message: &'a Message,
    pub error: &'a anyhow::Error,
}

/// Called for every failed job. Must not fail itself.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn handle(&self, failure: JobFailure<'_>);
}

pub struct LogFailure;

#[async_trait]
impl FailureHandler for LogFailure {
    async fn handle(&self, failure: JobFailure<'_>) {
        error!(
            partition = %failure.message.partition,
            message_id = %failure.message.message_id,
            error = ?failure.error,
            "job failed"
        );
    }
}

#[derive(Serialize)]
struct ArchivedMessage<'a> {
    #[serde(flatten)]
    message: &'a Message,
    queue: &'a PartitionName,
}

/// Logs the failure, then copies the message into the error queue.
pub struct ArchiveFailure {
    queue: Arc<dyn QueueService>,
    error_partition: PartitionName,
}

impl ArchiveFailure {
    pub fn new(queue: Arc<dyn QueueService>) -> Self {
        Self {
            queue,
            error_partition: PartitionName::error(),
        }
    }
}

#[async_trait]
impl FailureHandler for ArchiveFailure {
    async fn handle(&self, failure: JobFailure<'_>) {
        LogFailure.handle(failure).await;

        let archived = ArchivedMessage {
            message: failure.message,
            queue: &failure.message.partition,
        };
        let body = match serde_json::to_string(&archived) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to encode message for the error queue");
                return;
            }
        };

        if let Err(e) = self
            .queue
            .post(&self.error_partition, body, ERROR_TTL)
            .await
        {
            warn!(
                partition = %failure.message.partition,
                message_id = %failure.message.message_id,
                error = %e,
                "failed to archive message"
            );
        }
    }
}

pub fn failure_handler(
    policy: FailurePolicy,
    queue: Arc<dyn QueueService>,
) -> Arc<dyn FailureHandler> {
    match policy {
        FailurePolicy::Log => Arc::new(LogFailure),
        FailurePolicy::Archive => Arc::new(ArchiveFailure::new(queue)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
}

/// Runs a job under a timer and hands its errors to the failure handler.
#[derive(Clone)]
pub struct JobRunner {
    job: Arc<dyn Job>,
    on_failure: Arc<dyn FailureHandler>,
}

impl JobRunner {
    pub fn new(job: Arc<dyn Job>, on_failure: Arc<dyn FailureHandler>) -> Self {
        Self { job, on_failure }
    }

    pub async fn open_context(&self) -> anyhow::Result<JobContext> {
        self.job.open_context().await
    }

    pub async fn close_context(&self, context: JobContext) {
        self.job.close_context(context).await
    }

    /// Never fails: job errors end up with the failure handler.
    pub async fn run(&self, message: &Message, context: &mut JobContext) -> JobOutcome {
        let labels = [("queue", message.partition.queue_id().to_owned())];
        let now = tokio::time::Instant::now();

        match self.job.process(message, context).await {
            Ok(()) => {
                metrics::histogram!("qdo_worker_job_duration_seconds", &labels)
                    .record(now.elapsed().as_secs_f64());
                metrics::counter!("qdo_worker_messages_processed", &labels).increment(1);
                JobOutcome::Completed
            }
            Err(error) => {
                metrics::histogram!("qdo_worker_job_failure_duration_seconds", &labels)
                    .record(now.elapsed().as_secs_f64());
                metrics::counter!("qdo_worker_job_failures", &labels).increment(1);
                self.on_failure
                    .handle(JobFailure {
                        message,
                        error: &error,
                    })
                    .await;
                JobOutcome::Failed
            }
        }
    }
}
