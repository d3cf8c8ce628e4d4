//! Deciding which partitions this worker owns.
use std::collections::BTreeSet;
use std::sync::RwLock;
use std::time;

use async_trait::async_trait;
use qdo_common::partition::{PartitionName, ERROR_QUEUE, RESERVED_PARTITIONS, STATUS_QUEUE};
use qdo_common::queuey::{QueueError, QueueInfo, QueueService};
use tokio::sync::watch;
use tracing::info;

use crate::config::{Config, PartitionPolicy, WorkerIdentity};
use crate::coordination::{CoordinationSettings, EtcdPartitioner};
use crate::error::AssignorError;

/// Lifecycle of an assignor. Messages are only processed while `Acquired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipState {
    /// Waiting to be granted a set of partitions.
    Acquiring,
    /// The set is stable and may be iterated.
    Acquired,
    /// Partitions must be given up so they can be redistributed.
    Releasing,
    /// Terminal: the session is gone or the assignor was finished.
    Failed,
}

#[async_trait]
pub trait Assignor: Send + Sync {
    fn state(&self) -> OwnershipState;

    /// The partitions currently owned. Empty unless `Acquired`.
    fn partitions(&self) -> Vec<PartitionName>;

    /// Block until a set is acquired or `timeout` passes, whichever comes first.
    async fn wait_for_acquire(&self, timeout: time::Duration) -> Result<(), AssignorError>;

    /// Give up the current set and go back to `Acquiring`.
    async fn release_set(&self) -> Result<(), AssignorError>;

    /// Stop participating. The assignor ends up `Failed` and owns nothing.
    async fn finish(&self);

    /// Follow state changes, including the ones made by background tasks.
    fn subscribe(&self) -> watch::Receiver<OwnershipState>;
}

/// A fixed set of partitions, acquired from the start.
///
/// Exclusive ownership is up to whoever configures the fleet.
pub struct StaticAssignor {
    set: RwLock<Option<Vec<PartitionName>>>,
    states: watch::Sender<OwnershipState>,
}

impl StaticAssignor {
    pub fn new(partitions: Vec<PartitionName>) -> Self {
        let partitions = partitions
            .into_iter()
            .filter(|p| !p.is_reserved())
            .collect();
        Self {
            set: RwLock::new(Some(partitions)),
            states: watch::Sender::new(OwnershipState::Acquired),
        }
    }
}

#[async_trait]
impl Assignor for StaticAssignor {
    fn state(&self) -> OwnershipState {
        match self.set.read() {
            Ok(set) if set.is_some() => OwnershipState::Acquired,
            _ => OwnershipState::Failed,
        }
    }

    fn partitions(&self) -> Vec<PartitionName> {
        self.set
            .read()
            .ok()
            .and_then(|set| set.clone())
            .unwrap_or_default()
    }

    async fn wait_for_acquire(&self, _timeout: time::Duration) -> Result<(), AssignorError> {
        Ok(())
    }

    async fn release_set(&self) -> Result<(), AssignorError> {
        Ok(())
    }

    async fn finish(&self) {
        if let Ok(mut set) = self.set.write() {
            *set = None;
        }
        self.states.send_replace(OwnershipState::Failed);
    }

    fn subscribe(&self) -> watch::Receiver<OwnershipState> {
        self.states.subscribe()
    }
}

/// Resolve the candidate partitions for a policy.
///
/// Reserved partitions never make it into the result, and the reserved queues
/// are created if the queue service does not report them yet.
pub async fn resolve_partition_set(
    queue: &dyn QueueService,
    policy: PartitionPolicy,
    ids: &[PartitionName],
) -> Result<Vec<PartitionName>, QueueError> {
    let queues = queue.list_queues().await?;
    ensure_reserved_queues(queue, &queues).await?;

    let candidates: Vec<PartitionName> = match policy {
        PartitionPolicy::Manual => ids.to_vec(),
        PartitionPolicy::All | PartitionPolicy::Dynamic => {
            queues.iter().flat_map(QueueInfo::partition_names).collect()
        }
    };

    // dedup and keep a stable order, every worker of a fleet must agree on it
    let set: BTreeSet<PartitionName> = candidates
        .into_iter()
        .filter(|p| !p.is_reserved())
        .collect();

    Ok(set.into_iter().collect())
}

async fn ensure_reserved_queues(
    queue: &dyn QueueService,
    queues: &[QueueInfo],
) -> Result<(), QueueError> {
    for reserved in [ERROR_QUEUE, STATUS_QUEUE] {
        if queues.iter().any(|q| q.queue_id == reserved) {
            continue;
        }
        info!(queue_id = reserved, "creating reserved queue");
        queue.create_queue(reserved, RESERVED_PARTITIONS).await?;
    }
    Ok(())
}

/// Pick the assignor implementation matching the configured policy.
pub async fn build_assignor(
    config: &Config,
    identity: &WorkerIdentity,
    partitions: Vec<PartitionName>,
) -> Result<Box<dyn Assignor>, AssignorError> {
    match config.partition_policy {
        PartitionPolicy::Manual | PartitionPolicy::All => {
            Ok(Box::new(StaticAssignor::new(partitions)))
        }
        PartitionPolicy::Dynamic => {
            let settings = CoordinationSettings {
                endpoints: config.coordination.endpoints(),
                prefix: config.coordination.etcd_prefix.clone(),
                lease_ttl: config.coordination.etcd_lease_ttl,
                party_wait: config.coordination.party_wait.0,
            };
            let partitioner =
                EtcdPartitioner::start(settings, identity.as_str(), partitions).await?;
            Ok(Box::new(partitioner))
        }
    }
}
