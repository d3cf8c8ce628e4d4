//! Per-partition checkpoints, persisted as records in the reserved status queue.
//!
//! Every consumed partition owns exactly one record. The record is posted the
//! first time the partition is seen and every later checkpoint updates that
//! same record in place, so the status queue holds one message per partition
//! rather than a growing log.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::partition::{Cursor, PartitionName};
use crate::queuey::{Order, QueueError, QueueService};

/// How long the queue service keeps a checkpoint record: three days.
pub const STATUS_TTL: time::Duration = time::Duration::from_secs(259_200);

/// Reading this many records or more means something is badly wrong.
pub const MAX_STATUS_RECORDS: usize = 1000;

/// Enumeration of errors for checkpoint operations.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint store request failed: {0}")]
    Queue(#[from] QueueError),
    #[error("found {count} checkpoint records, the status queue is not trustworthy")]
    TooManyRecords { count: usize },
    #[error("failed to serialize checkpoint record: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CheckpointError {
    /// Consistency errors must stop the worker instead of being logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CheckpointError::TooManyRecords { .. })
    }
}

/// Body of a record in the status queue.
#[derive(Debug, Serialize, Deserialize)]
struct StatusBody {
    partition: PartitionName,
    processed: Cursor,
    #[serde(default)]
    last_worker: String,
}

/// The durable progress of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub partition: PartitionName,
    /// Key of the status message this record is stored in.
    pub record_id: String,
    pub cursor: Cursor,
}

pub struct CheckpointStore {
    queue: Arc<dyn QueueService>,
    status: PartitionName,
    worker: String,
    records: Mutex<HashMap<PartitionName, CheckpointRecord>>,
}

impl CheckpointStore {
    /// Read every record in the status queue. Newer records win.
    pub async fn load(
        queue: Arc<dyn QueueService>,
        worker: &str,
    ) -> Result<Self, CheckpointError> {
        let status = PartitionName::status();
        let records = fetch_records(queue.as_ref(), &status).await?;

        info!(records = records.len(), "loaded checkpoints");

        Ok(Self {
            queue,
            status,
            worker: worker.to_owned(),
            records: Mutex::new(records),
        })
    }

    /// Re-read the durable record of a partition, as another worker may have
    /// moved it since we loaded. The cache follows what was found.
    pub async fn refresh(
        &self,
        partition: &PartitionName,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let mut durable = fetch_records(self.queue.as_ref(), &self.status).await?;

        let mut records = self.records();
        match durable.remove(partition) {
            Some(record) => {
                records.insert(partition.clone(), record.clone());
                Ok(Some(record))
            }
            None => {
                records.remove(partition);
                Ok(None)
            }
        }
    }

    /// The last known record for a partition, if it has one.
    pub fn read(&self, partition: &PartitionName) -> Option<CheckpointRecord> {
        self.records().get(partition).cloned()
    }

    /// The last processed cursor of a partition, if it has a record.
    pub fn cursor(&self, partition: &PartitionName) -> Option<Cursor> {
        self.read(partition).map(|record| record.cursor)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Post a fresh record pointing at the beginning of the partition.
    pub async fn create(
        &self,
        partition: &PartitionName,
    ) -> Result<CheckpointRecord, CheckpointError> {
        self.post(partition, Cursor::beginning()).await
    }

    /// Persist `cursor` as the progress of the record's partition.
    ///
    /// A record the service already purged is posted again rather than
    /// treated as corruption.
    pub async fn write(
        &self,
        record: &CheckpointRecord,
        cursor: &Cursor,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let body = self.body(&record.partition, cursor)?;
        match self
            .queue
            .update(&self.status, &record.record_id, body, STATUS_TTL)
            .await
        {
            Ok(()) => {
                let updated = CheckpointRecord {
                    cursor: cursor.clone(),
                    ..record.clone()
                };
                self.remember(&updated);
                Ok(updated)
            }
            Err(QueueError::NotFound(_)) => {
                warn!(
                    partition = %record.partition,
                    record_id = %record.record_id,
                    "checkpoint record expired, creating a new one"
                );
                self.post(&record.partition, cursor.clone()).await
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn post(
        &self,
        partition: &PartitionName,
        cursor: Cursor,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let body = self.body(partition, &cursor)?;
        let posted = self.queue.post(&self.status, body, STATUS_TTL).await?;

        let record = CheckpointRecord {
            partition: partition.clone(),
            record_id: posted.key,
            cursor,
        };
        self.remember(&record);
        Ok(record)
    }

    fn body(&self, partition: &PartitionName, cursor: &Cursor) -> Result<String, CheckpointError> {
        Ok(serde_json::to_string(&StatusBody {
            partition: partition.clone(),
            processed: cursor.clone(),
            last_worker: self.worker.clone(),
        })?)
    }

    fn remember(&self, record: &CheckpointRecord) {
        self.records()
            .insert(record.partition.clone(), record.clone());
    }

    fn records(&self) -> MutexGuard<'_, HashMap<PartitionName, CheckpointRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Every readable record of the status partition, newest first per partition.
async fn fetch_records(
    queue: &dyn QueueService,
    status: &PartitionName,
) -> Result<HashMap<PartitionName, CheckpointRecord>, CheckpointError> {
    let messages = queue
        .messages(
            status,
            &Cursor::beginning(),
            MAX_STATUS_RECORDS,
            Order::Descending,
        )
        .await?;

    if messages.len() >= MAX_STATUS_RECORDS {
        return Err(CheckpointError::TooManyRecords {
            count: messages.len(),
        });
    }

    let mut records = HashMap::new();
    for message in messages {
        let body: StatusBody = match serde_json::from_str(&message.body) {
            Ok(body) => body,
            Err(error) => {
                warn!(
                    record_id = %message.message_id,
                    error = %error,
                    "skipping unreadable checkpoint record"
                );
                continue;
            }
        };
        records
            .entry(body.partition.clone())
            .or_insert(CheckpointRecord {
                partition: body.partition,
                record_id: message.message_id,
                cursor: body.processed,
            });
    }
    Ok(records)
}
