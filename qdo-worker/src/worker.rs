use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time;

use qdo_common::checkpoint::CheckpointStore;
use qdo_common::health::HealthHandle;
use qdo_common::partition::PartitionName;
use qdo_common::queuey::{Order, QueueService};
use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assignor::{Assignor, OwnershipState};
use crate::config::WorkerIdentity;
use crate::error::WorkerError;
use crate::job::{JobContext, JobRunner};
use crate::partition::PartitionHandle;

/// One message to process plus one to know whether more are waiting.
pub const FETCH_LIMIT: usize = 2;

/// Idle waits stop growing at `2^10` times the base interval.
pub const MAX_BACKOFF_EXPONENT: u32 = 10;

/// `base * jitter * 2^min(waited, 10)`.
pub fn backoff_interval(base: time::Duration, waited: u32, jitter: f64) -> time::Duration {
    let exponent = waited.min(MAX_BACKOFF_EXPONENT);
    base.mul_f64(jitter * f64::from(1u32 << exponent))
}

/// Backoff with a jitter drawn from `[0.8, 1.2]`, so a fleet does not wake up all at once.
pub fn jittered_backoff(base: time::Duration, waited: u32) -> time::Duration {
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    backoff_interval(base, waited, jitter)
}

/// The longest a single idle wait can last.
pub fn max_backoff(base: time::Duration) -> time::Duration {
    backoff_interval(base, MAX_BACKOFF_EXPONENT, 1.2)
}

/// Asks a running `Worker` to stop at its next safe point.
#[derive(Clone, Default)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
}

impl WorkerHandle {
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// What happened during one pass over the owned partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub partitions: usize,
    pub idle: usize,
    pub processed: usize,
}

impl RoundSummary {
    /// No partition had anything to process.
    pub fn is_idle(&self) -> bool {
        self.idle == self.partitions
    }
}

/// Polls owned partitions one message at a time and keeps their checkpoints moving.
pub struct Worker {
    /// An identifier for this worker, recorded on every checkpoint it writes.
    identity: WorkerIdentity,
    queue: Arc<dyn QueueService>,
    checkpoints: Arc<CheckpointStore>,
    assignor: Box<dyn Assignor>,
    /// Assignor state changes, so an idle wait ends as soon as ownership moves.
    states: watch::Receiver<OwnershipState>,
    runner: JobRunner,
    /// Base of the idle backoff.
    wait_interval: time::Duration,
    /// Upper bound of a single wait for the assignor to acquire partitions.
    acquire_timeout: time::Duration,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
    handle: WorkerHandle,
    partitions: HashMap<PartitionName, PartitionHandle>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: WorkerIdentity,
        queue: Arc<dyn QueueService>,
        checkpoints: Arc<CheckpointStore>,
        assignor: Box<dyn Assignor>,
        runner: JobRunner,
        wait_interval: time::Duration,
        acquire_timeout: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        let states = assignor.subscribe();
        Self {
            identity,
            queue,
            checkpoints,
            assignor,
            states,
            runner,
            wait_interval,
            acquire_timeout,
            liveness,
            handle: WorkerHandle::default(),
            partitions: HashMap::new(),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Partitions with an open handle, sorted.
    pub fn open_partitions(&self) -> Vec<PartitionName> {
        let mut names: Vec<PartitionName> = self.partitions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run until stopped or until partition assignment fails.
    ///
    /// The assignor is finished on every way out, errors included.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        info!(worker = %self.identity, "starting worker");

        let result = self.work().await;

        self.partitions.clear();
        self.assignor.finish().await;
        metrics::gauge!("qdo_worker_owned_partitions").set(0.0);

        match &result {
            Ok(()) => info!(worker = %self.identity, "worker stopped"),
            Err(e) => error!(worker = %self.identity, error = %e, "worker stopped"),
        }
        result
    }

    async fn work(&mut self) -> Result<(), WorkerError> {
        let mut context = self
            .runner
            .open_context()
            .await
            .map_err(WorkerError::JobContext)?;

        let result = self.consume(&mut context).await;

        self.runner.close_context(context).await;
        result
    }

    async fn consume(&mut self, context: &mut JobContext) -> Result<(), WorkerError> {
        let mut waited: u32 = 0;

        loop {
            self.liveness.report_healthy();
            if self.handle.is_stopped() {
                info!(worker = %self.identity, "shutdown requested");
                return Ok(());
            }

            match self.turn(context).await? {
                Some(summary) if summary.is_idle() => {
                    self.wait(waited).await;
                    waited = waited.saturating_add(1);
                }
                Some(_) => waited = 0,
                None => {}
            }
        }
    }

    /// Act on the current assignor state once.
    ///
    /// Returns what the round did while `Acquired`, `None` after releasing or
    /// waiting to acquire.
    pub async fn turn(
        &mut self,
        context: &mut JobContext,
    ) -> Result<Option<RoundSummary>, WorkerError> {
        // changes from here on cut the next idle wait short
        drop(self.states.borrow_and_update());

        match self.assignor.state() {
            OwnershipState::Failed => Err(WorkerError::AssignmentFailed),
            OwnershipState::Releasing => {
                info!(
                    worker = %self.identity,
                    partitions = self.partitions.len(),
                    "releasing partitions"
                );
                self.partitions.clear();
                metrics::gauge!("qdo_worker_owned_partitions").set(0.0);
                self.assignor.release_set().await?;
                Ok(None)
            }
            OwnershipState::Acquiring => {
                tokio::select! {
                    _ = self.handle.shutdown.cancelled() => {}
                    result = self.assignor.wait_for_acquire(self.acquire_timeout) => result?,
                }
                Ok(None)
            }
            OwnershipState::Acquired => Ok(Some(self.round(context).await?)),
        }
    }

    /// Process at most one message from every owned partition.
    pub async fn round(&mut self, context: &mut JobContext) -> Result<RoundSummary, WorkerError> {
        let owned = self.assignor.partitions();
        self.partitions.retain(|name, _| owned.contains(name));
        metrics::gauge!("qdo_worker_owned_partitions").set(owned.len() as f64);

        let mut summary = RoundSummary {
            partitions: owned.len(),
            ..Default::default()
        };
        for name in owned {
            if self.step(name, context).await? {
                summary.processed += 1;
            } else {
                summary.idle += 1;
            }
        }
        Ok(summary)
    }

    /// Process the oldest unread message of a partition. Returns whether there was one.
    async fn step(
        &mut self,
        name: PartitionName,
        context: &mut JobContext,
    ) -> Result<bool, WorkerError> {
        let partition = match self.partitions.entry(name) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let opened = PartitionHandle::open(
                    entry.key().clone(),
                    self.queue.clone(),
                    self.checkpoints.clone(),
                )
                .await;
                match opened {
                    Ok(partition) => entry.insert(partition),
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        error!(partition = %entry.key(), error = %e, "failed to open partition");
                        metrics::counter!("qdo_worker_checkpoint_errors").increment(1);
                        return Ok(false);
                    }
                }
            }
        };

        let messages = match partition.messages(FETCH_LIMIT, Order::Ascending).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(partition = %partition.name(), error = %e, "failed to fetch messages");
                metrics::counter!("qdo_worker_fetch_errors").increment(1);
                return Ok(false);
            }
        };
        let Some(message) = messages.into_iter().next() else {
            return Ok(false);
        };

        let outcome = self.runner.run(&message, context).await;
        debug!(
            partition = %partition.name(),
            message_id = %message.message_id,
            outcome = ?outcome,
            "processed message"
        );

        // failed messages are not retried, the checkpoint moves past them too
        if let Err(e) = partition.advance(&message.timestamp).await {
            error!(
                partition = %partition.name(),
                cursor = %message.timestamp,
                error = %e,
                "failed to write checkpoint"
            );
            metrics::counter!("qdo_worker_checkpoint_errors").increment(1);
        }
        Ok(true)
    }

    /// Sleep through an idle backoff, waking early on shutdown or an assignor state change.
    async fn wait(&mut self, waited: u32) {
        let interval = jittered_backoff(self.wait_interval, waited);
        debug!(waited, interval = ?interval, "no messages, backing off");
        metrics::counter!("qdo_worker_wait_for_jobs").increment(1);
        self.liveness.report_healthy();

        tokio::select! {
            _ = self.handle.shutdown.cancelled() => {}
            _ = tokio::time::sleep(interval) => {}
            Ok(()) = self.states.changed() => {
                let state = *self.states.borrow();
                debug!(state = ?state, "assignor state changed, backoff cut short");
            }
        }
    }
}
