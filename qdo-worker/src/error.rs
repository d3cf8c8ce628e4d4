use qdo_common::checkpoint::CheckpointError;
use qdo_common::partition::PartitionNameError;
use qdo_common::queuey::QueueError;
use thiserror::Error;

/// Enumeration of errors found while validating the worker configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} is not a valid partition policy")]
    ParsePolicyError(String),
    #[error("{0} is not a valid job failure handler")]
    ParseFailurePolicyError(String),
    #[error("invalid partition id: {0}")]
    ParsePartitionError(#[from] PartitionNameError),
    #[error("{0} is not a valid number of seconds")]
    ParseSecondsError(String),
    #[error("the manual partition policy requires at least one partition id")]
    MissingPartitionIds,
    #[error("wait interval must be greater than zero")]
    ZeroWaitInterval,
    #[error("no job registered under the name {0}")]
    UnknownJob(String),
}

/// Enumeration of errors raised by a partition assignor.
#[derive(Error, Debug)]
pub enum AssignorError {
    #[error("coordination service request failed: {0}")]
    Coordination(#[from] etcd_client::Error),
    #[error("failed to encode membership record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("coordination session lost")]
    SessionLost,
}

/// Enumeration of errors that stop the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("queue service error: {0}")]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Assignor(#[from] AssignorError),
    #[error("partition assignment failed, no partitions can be owned")]
    AssignmentFailed,
    #[error("failed to open the job context: {0}")]
    JobContext(anyhow::Error),
    #[error("failed to set up metrics: {0}")]
    Metrics(String),
}
