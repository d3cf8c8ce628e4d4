use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Queue holding copies of messages whose job failed.
pub const ERROR_QUEUE: &str = "qdo_error";
/// Queue holding one checkpoint record per consumed partition.
pub const STATUS_QUEUE: &str = "qdo_status";
/// Number of partitions the reserved queues are created with.
pub const RESERVED_PARTITIONS: u32 = 1;

/// Enumeration of errors raised while parsing a partition name.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PartitionNameError {
    #[error("partition name is empty")]
    Empty,
    #[error("partition name {0:?} has no queue identifier")]
    MissingQueue(String),
    #[error("partition name {0:?} has an invalid partition index")]
    InvalidIndex(String),
}

/// A partition of a queue, identified by the queue id and a 1-based index.
///
/// The external form is either a bare queue id, meaning partition 1, or
/// `<queue_id>-<index>`. Both parse to the same value and `Display` always
/// renders the second form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionName {
    queue_id: String,
    index: u32,
}

impl PartitionName {
    pub fn new(queue_id: &str, index: u32) -> Result<Self, PartitionNameError> {
        if queue_id.is_empty() {
            return Err(PartitionNameError::MissingQueue(format!("-{index}")));
        }
        if index == 0 {
            return Err(PartitionNameError::InvalidIndex(format!("{queue_id}-0")));
        }

        Ok(Self {
            queue_id: queue_id.to_owned(),
            index,
        })
    }

    /// The partition holding checkpoint records.
    pub fn status() -> Self {
        Self {
            queue_id: STATUS_QUEUE.to_owned(),
            index: 1,
        }
    }

    /// The partition failed messages are archived to.
    pub fn error() -> Self {
        Self {
            queue_id: ERROR_QUEUE.to_owned(),
            index: 1,
        }
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Reserved partitions are infrastructure and never handed to jobs.
    pub fn is_reserved(&self) -> bool {
        self.queue_id.starts_with(ERROR_QUEUE) || self.queue_id.starts_with(STATUS_QUEUE)
    }
}

impl FromStr for PartitionName {
    type Err = PartitionNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PartitionNameError::Empty);
        }

        match s.rsplit_once('-') {
            None => Self::new(s, 1),
            Some((queue_id, index)) => {
                if queue_id.is_empty() {
                    return Err(PartitionNameError::MissingQueue(s.to_owned()));
                }
                match index.parse::<u32>() {
                    Ok(index) if index > 0 => Self::new(queue_id, index),
                    _ => Err(PartitionNameError::InvalidIndex(s.to_owned())),
                }
            }
        }
    }
}

impl TryFrom<String> for PartitionName {
    type Error = PartitionNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PartitionName> for String {
    fn from(value: PartitionName) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.queue_id, self.index)
    }
}

/// Opaque marker of the last processed message in a partition.
///
/// The queue service hands out message timestamps, so cursors holding
/// numbers are compared numerically. Anything else falls back to a
/// lexicographic comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Cursor preceding every message of a partition.
    pub fn beginning() -> Self {
        Self("0".to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_beginning(&self) -> bool {
        self.as_timestamp() == Some(0.0)
    }

    pub fn as_timestamp(&self) -> Option<f64> {
        self.0.parse::<f64>().ok()
    }

    /// Order two cursors of the same partition.
    pub fn compare(&self, other: &Cursor) -> Ordering {
        match (self.as_timestamp(), other.as_timestamp()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => self.0.cmp(&other.0),
        }
    }

    pub fn is_after(&self, other: &Cursor) -> bool {
        self.compare(other) == Ordering::Greater
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::beginning()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
