//! A `QueueService` held entirely in memory.
//!
//! Timestamps come from a logical clock, so the first message ever posted gets
//! cursor `1` and `0` always means "the beginning of the partition". TTLs are
//! accepted but never enforced.
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time;

use async_trait::async_trait;
use uuid::Uuid;

use crate::partition::{Cursor, PartitionName};
use crate::queuey::{Message, Order, PostedMessage, QueueError, QueueInfo, QueueService};

struct StoredMessage {
    key: String,
    body: String,
    timestamp: u64,
}

#[derive(Default)]
struct State {
    queues: BTreeMap<String, Vec<Vec<StoredMessage>>>,
    clock: u64,
    unavailable: bool,
    failing_updates: bool,
}

impl State {
    fn partition(&self, name: &PartitionName) -> Result<&Vec<StoredMessage>, QueueError> {
        self.queues
            .get(name.queue_id())
            .and_then(|partitions| partitions.get(name.index() as usize - 1))
            .ok_or_else(|| QueueError::NotFound(name.to_string()))
    }

    fn partition_mut(
        &mut self,
        name: &PartitionName,
    ) -> Result<&mut Vec<StoredMessage>, QueueError> {
        self.queues
            .get_mut(name.queue_id())
            .and_then(|partitions| partitions.get_mut(name.index() as usize - 1))
            .ok_or_else(|| QueueError::NotFound(name.to_string()))
    }
}

#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Unavailable)
    }

    fn available(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        let state = self.lock()?;
        if state.unavailable {
            return Err(QueueError::Unavailable);
        }
        Ok(state)
    }

    /// Make every call fail with `QueueError::Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = unavailable;
        }
    }

    /// Make only `update` calls fail, as when a checkpoint write is lost.
    pub fn set_failing_updates(&self, failing: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_updates = failing;
        }
    }

    /// Drop a message, as the service does once its TTL has passed.
    pub fn expire(&self, partition: &PartitionName, key: &str) {
        if let Ok(mut state) = self.state.lock() {
            if let Ok(messages) = state.partition_mut(partition) {
                messages.retain(|m| m.key != key);
            }
        }
    }

    /// Bodies currently stored in a partition, oldest first.
    pub fn bodies(&self, partition: &PartitionName) -> Vec<String> {
        self.state
            .lock()
            .ok()
            .and_then(|state| {
                state
                    .partition(partition)
                    .ok()
                    .map(|messages| messages.iter().map(|m| m.body.clone()).collect())
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueService for InMemoryQueue {
    async fn list_queues(&self) -> Result<Vec<QueueInfo>, QueueError> {
        let state = self.available()?;
        Ok(state
            .queues
            .iter()
            .map(|(queue_id, partitions)| QueueInfo {
                queue_id: queue_id.clone(),
                partitions: partitions.len() as u32,
            })
            .collect())
    }

    async fn create_queue(&self, queue_id: &str, partitions: u32) -> Result<(), QueueError> {
        let mut state = self.available()?;
        if state.queues.contains_key(queue_id) {
            return Err(QueueError::Status {
                status: 409,
                body: format!("queue {queue_id} already exists"),
            });
        }
        let partitions = (0..partitions.max(1)).map(|_| Vec::new()).collect();
        state.queues.insert(queue_id.to_owned(), partitions);
        Ok(())
    }

    async fn messages(
        &self,
        partition: &PartitionName,
        since: &Cursor,
        limit: usize,
        order: Order,
    ) -> Result<Vec<Message>, QueueError> {
        let state = self.available()?;
        let since = since.as_timestamp().ok_or_else(|| QueueError::Status {
            status: 400,
            body: format!("invalid since value {since}"),
        })?;

        let newer = state
            .partition(partition)?
            .iter()
            .filter(|m| m.timestamp as f64 > since);
        let to_message = |m: &StoredMessage| Message {
            message_id: m.key.clone(),
            body: m.body.clone(),
            partition: partition.clone(),
            timestamp: Cursor::new(m.timestamp.to_string()),
        };

        let messages = match order {
            Order::Ascending => newer.take(limit).map(to_message).collect(),
            Order::Descending => newer.rev().take(limit).map(to_message).collect(),
        };
        Ok(messages)
    }

    async fn post(
        &self,
        partition: &PartitionName,
        body: String,
        _ttl: time::Duration,
    ) -> Result<PostedMessage, QueueError> {
        let mut state = self.available()?;
        state.clock += 1;
        let timestamp = state.clock;
        let key = Uuid::now_v7().simple().to_string();

        state.partition_mut(partition)?.push(StoredMessage {
            key: key.clone(),
            body,
            timestamp,
        });

        Ok(PostedMessage {
            key,
            partition: partition.clone(),
            timestamp: Cursor::new(timestamp.to_string()),
        })
    }

    async fn update(
        &self,
        partition: &PartitionName,
        key: &str,
        body: String,
        _ttl: time::Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.available()?;
        if state.failing_updates {
            return Err(QueueError::Status {
                status: 503,
                body: "update rejected".to_owned(),
            });
        }

        let message = state
            .partition_mut(partition)?
            .iter_mut()
            .find(|m| m.key == key)
            .ok_or_else(|| QueueError::NotFound(format!("{partition}:{key}")))?;
        message.body = body;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: time::Duration = time::Duration::from_secs(60);

    #[tokio::test]
    async fn test_messages_since_and_order() {
        let queue = InMemoryQueue::new();
        queue.create_queue("abc123", 2).await.unwrap();
        let partition: PartitionName = "abc123-2".parse().unwrap();

        let first = queue.post(&partition, "m1".to_owned(), TTL).await.unwrap();
        queue.post(&partition, "m2".to_owned(), TTL).await.unwrap();
        queue.post(&partition, "m3".to_owned(), TTL).await.unwrap();

        let ascending = queue
            .messages(&partition, &Cursor::beginning(), 2, Order::Ascending)
            .await
            .unwrap();
        let bodies: Vec<&str> = ascending.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m1", "m2"]);

        let since_first = queue
            .messages(&partition, &first.timestamp, 10, Order::Descending)
            .await
            .unwrap();
        let bodies: Vec<&str> = since_first.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m3", "m2"]);

        let other: PartitionName = "abc123-1".parse().unwrap();
        assert!(queue
            .messages(&other, &Cursor::beginning(), 10, Order::Ascending)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unknown_queue_is_not_found() {
        let queue = InMemoryQueue::new();
        let partition: PartitionName = "missing".parse().unwrap();
        let result = queue.post(&partition, "m1".to_owned(), TTL).await;
        assert!(matches!(result, Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_keeps_key() {
        let queue = InMemoryQueue::new();
        queue.create_queue("q1", 1).await.unwrap();
        let partition: PartitionName = "q1".parse().unwrap();
        let posted = queue.post(&partition, "old".to_owned(), TTL).await.unwrap();

        queue
            .update(&partition, &posted.key, "new".to_owned(), TTL)
            .await
            .unwrap();
        assert_eq!(queue.bodies(&partition), vec!["new"]);

        queue.expire(&partition, &posted.key);
        let result = queue
            .update(&partition, &posted.key, "newer".to_owned(), TTL)
            .await;
        assert!(matches!(result, Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let queue = InMemoryQueue::new();
        queue.set_unavailable(true);
        assert!(matches!(
            queue.list_queues().await,
            Err(QueueError::Unavailable)
        ));
        queue.set_unavailable(false);
        assert!(queue.list_queues().await.unwrap().is_empty());
    }
}
