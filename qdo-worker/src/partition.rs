use std::sync::Arc;

use qdo_common::checkpoint::{CheckpointError, CheckpointRecord, CheckpointStore};
use qdo_common::partition::{Cursor, PartitionName};
use qdo_common::queuey::{Message, Order, QueueError, QueueService};
use tracing::debug;

/// One owned partition: where we are in it and how to read what comes next.
///
/// Only the loop that owns the partition touches its handle. Handles are
/// dropped as soon as the partition is no longer owned.
pub struct PartitionHandle {
    record: CheckpointRecord,
    queue: Arc<dyn QueueService>,
    checkpoints: Arc<CheckpointStore>,
}

impl PartitionHandle {
    /// Continue from the partition's durable checkpoint record, creating it
    /// only when no worker ever wrote one.
    ///
    /// The record is read again from the status queue rather than from the
    /// cache: the previous owner may have moved it since we loaded.
    pub async fn open(
        name: PartitionName,
        queue: Arc<dyn QueueService>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Result<Self, CheckpointError> {
        let record = match checkpoints.refresh(&name).await? {
            Some(record) => record,
            None => {
                debug!(partition = %name, "no checkpoint yet, starting from the beginning");
                checkpoints.create(&name).await?
            }
        };

        Ok(Self {
            record,
            queue,
            checkpoints,
        })
    }

    pub fn name(&self) -> &PartitionName {
        &self.record.partition
    }

    pub fn cursor(&self) -> &Cursor {
        &self.record.cursor
    }

    /// Messages after the cursor, at most `limit` of them.
    pub async fn messages(&self, limit: usize, order: Order) -> Result<Vec<Message>, QueueError> {
        self.queue
            .messages(&self.record.partition, &self.record.cursor, limit, order)
            .await
    }

    /// Persist `cursor` as processed. The cached cursor only moves once the write went through.
    ///
    /// Cursors older than the current one are ignored, checkpoints never go back.
    pub async fn advance(&mut self, cursor: &Cursor) -> Result<(), CheckpointError> {
        if !cursor.is_after(&self.record.cursor) {
            debug!(
                partition = %self.record.partition,
                cursor = %cursor,
                current = %self.record.cursor,
                "ignoring stale cursor"
            );
            return Ok(());
        }

        self.record = self.checkpoints.write(&self.record, cursor).await?;
        Ok(())
    }
}
