use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use qdo_common::checkpoint::CheckpointStore;
use qdo_common::health::HealthRegistry;
use qdo_common::memory::InMemoryQueue;
use qdo_common::partition::{Cursor, PartitionName};
use qdo_common::queuey::{Message, QueueService};
use qdo_worker::assignor::{resolve_partition_set, Assignor, OwnershipState, StaticAssignor};
use qdo_worker::error::AssignorError;
use qdo_worker::config::{FailurePolicy, PartitionPolicy, WorkerIdentity};
use qdo_worker::error::WorkerError;
use tokio::sync::watch;
use qdo_worker::job::{failure_handler, Job, JobContext, JobRunner};
use qdo_worker::worker::{RoundSummary, Worker};

/// Remembers every body it was given, failing on demand.
#[derive(Default)]
struct RecordingJob {
    seen: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingJob {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Job for RecordingJob {
    async fn process(&self, message: &Message, _context: &mut JobContext) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(message.body.clone());
        if self.fail {
            anyhow::bail!("ValueError: could not convert {}", message.body);
        }
        Ok(())
    }
}

/// An assignor whose state the test moves by hand.
#[derive(Clone)]
struct ScriptedAssignor {
    inner: Arc<Script>,
}

struct Script {
    state: Mutex<OwnershipState>,
    set: Mutex<Vec<PartitionName>>,
    states: watch::Sender<OwnershipState>,
    releases: AtomicUsize,
    acquires: AtomicUsize,
}

impl ScriptedAssignor {
    fn acquired(set: Vec<PartitionName>) -> Self {
        Self {
            inner: Arc::new(Script {
                state: Mutex::new(OwnershipState::Acquired),
                set: Mutex::new(set),
                states: watch::Sender::new(OwnershipState::Acquired),
                releases: AtomicUsize::new(0),
                acquires: AtomicUsize::new(0),
            }),
        }
    }

    fn set_state(&self, state: OwnershipState) {
        *self.inner.state.lock().unwrap() = state;
        self.inner.states.send_replace(state);
    }

    fn set_partitions(&self, set: Vec<PartitionName>) {
        *self.inner.set.lock().unwrap() = set;
    }

    fn releases(&self) -> usize {
        self.inner.releases.load(Ordering::SeqCst)
    }

    fn acquires(&self) -> usize {
        self.inner.acquires.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Assignor for ScriptedAssignor {
    fn state(&self) -> OwnershipState {
        *self.inner.state.lock().unwrap()
    }

    fn partitions(&self) -> Vec<PartitionName> {
        match self.state() {
            OwnershipState::Acquired => self.inner.set.lock().unwrap().clone(),
            _ => Vec::new(),
        }
    }

    async fn wait_for_acquire(&self, _timeout: Duration) -> Result<(), AssignorError> {
        self.inner.acquires.fetch_add(1, Ordering::SeqCst);
        self.set_state(OwnershipState::Acquired);
        Ok(())
    }

    async fn release_set(&self) -> Result<(), AssignorError> {
        self.inner.releases.fetch_add(1, Ordering::SeqCst);
        if self.state() != OwnershipState::Failed {
            self.set_state(OwnershipState::Acquiring);
        }
        Ok(())
    }

    async fn finish(&self) {
        self.set_state(OwnershipState::Failed);
    }

    fn subscribe(&self) -> watch::Receiver<OwnershipState> {
        self.inner.states.subscribe()
    }
}

/// Poll `condition` until it holds, failing after two seconds.
async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

struct Fixture {
    queue: Arc<InMemoryQueue>,
    checkpoints: Arc<CheckpointStore>,
    partition: PartitionName,
}

impl Fixture {
    async fn new(bodies: &[&str]) -> Self {
        let queue = Arc::new(InMemoryQueue::new());
        queue.create_queue("abc123", 1).await.unwrap();

        // creates the reserved queues as a side effect
        let partitions = resolve_partition_set(queue.as_ref(), PartitionPolicy::All, &[])
            .await
            .unwrap();
        let partition: PartitionName = "abc123".parse().unwrap();
        assert_eq!(partitions, vec![partition.clone()]);

        for body in bodies {
            queue
                .post(&partition, body.to_string(), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let checkpoints = CheckpointStore::load(queue.clone(), "host-1").await.unwrap();
        Self {
            queue,
            checkpoints: Arc::new(checkpoints),
            partition,
        }
    }

    fn worker(&self, job: Arc<RecordingJob>, failure: FailurePolicy) -> Worker {
        let assignor = StaticAssignor::new(vec![self.partition.clone()]);
        self.worker_with(job, failure, Box::new(assignor), Duration::from_millis(10))
    }

    fn worker_with(
        &self,
        job: Arc<RecordingJob>,
        failure: FailurePolicy,
        assignor: Box<dyn Assignor>,
        wait_interval: Duration,
    ) -> Worker {
        let runner = JobRunner::new(job, failure_handler(failure, self.queue.clone()));
        let liveness = HealthRegistry::new("liveness").register("worker", time::Duration::seconds(30));

        Worker::new(
            WorkerIdentity::new("host", 1, None),
            self.queue.clone(),
            self.checkpoints.clone(),
            assignor,
            runner,
            wait_interval,
            Duration::from_millis(10),
            liveness,
        )
    }

    fn scripted_worker(&self, job: Arc<RecordingJob>, assignor: &ScriptedAssignor) -> Worker {
        self.worker_with(
            job,
            FailurePolicy::Log,
            Box::new(assignor.clone()),
            Duration::from_millis(10),
        )
    }

    fn cursor(&self) -> Option<Cursor> {
        self.checkpoints.cursor(&self.partition)
    }
}

#[tokio::test]
async fn one_message_per_round_oldest_first() {
    let fixture = Fixture::new(&["m1", "m2"]).await;
    let job = Arc::new(RecordingJob::default());
    let mut worker = fixture.worker(job.clone(), FailurePolicy::Log);
    let mut context = JobContext::new();

    let summary = worker.round(&mut context).await.unwrap();
    assert_eq!(
        summary,
        RoundSummary {
            partitions: 1,
            idle: 0,
            processed: 1
        }
    );
    assert_eq!(job.seen(), vec!["m1"]);
    // m1 was the first message ever posted
    assert_eq!(fixture.cursor(), Some(Cursor::new("1")));

    worker.round(&mut context).await.unwrap();
    assert_eq!(job.seen(), vec!["m1", "m2"]);
    assert_eq!(fixture.cursor(), Some(Cursor::new("2")));

    let summary = worker.round(&mut context).await.unwrap();
    assert!(summary.is_idle());
    assert_eq!(job.seen().len(), 2);
}

#[tokio::test]
async fn failing_job_still_advances() {
    let fixture = Fixture::new(&["m1", "m2", "m3"]).await;
    let job = Arc::new(RecordingJob::failing());
    let mut worker = fixture.worker(job.clone(), FailurePolicy::Log);
    let mut context = JobContext::new();

    for _ in 0..5 {
        worker.round(&mut context).await.unwrap();
    }

    // every message was tried exactly once
    assert_eq!(job.seen(), vec!["m1", "m2", "m3"]);
    assert_eq!(fixture.cursor(), Some(Cursor::new("3")));
}

#[tokio::test]
async fn archived_failure_keeps_partition_and_body() {
    let fixture = Fixture::new(&["m1"]).await;
    let job = Arc::new(RecordingJob::failing());
    let mut worker = fixture.worker(job, FailurePolicy::Archive);

    worker.round(&mut JobContext::new()).await.unwrap();

    let archived = fixture.queue.bodies(&PartitionName::error());
    assert_eq!(archived.len(), 1);
    let archived: serde_json::Value = serde_json::from_str(&archived[0]).unwrap();
    assert_eq!(archived["queue"], "abc123-1");
    assert_eq!(archived["body"], "m1");
    assert_eq!(fixture.cursor(), Some(Cursor::new("1")));
}

#[tokio::test]
async fn fetch_errors_count_as_idle() {
    let fixture = Fixture::new(&["m1"]).await;
    let job = Arc::new(RecordingJob::default());
    let mut worker = fixture.worker(job.clone(), FailurePolicy::Log);
    let mut context = JobContext::new();

    // opens the partition and processes m1
    worker.round(&mut context).await.unwrap();
    fixture.queue.set_unavailable(true);

    let summary = worker.round(&mut context).await.unwrap();
    assert!(summary.is_idle());

    fixture.queue.set_unavailable(false);
    fixture
        .queue
        .post(&fixture.partition, "m2".to_owned(), Duration::from_secs(60))
        .await
        .unwrap();
    worker.round(&mut context).await.unwrap();
    assert_eq!(job.seen(), vec!["m1", "m2"]);
}

#[tokio::test]
async fn restarted_worker_resumes_from_checkpoint() {
    let fixture = Fixture::new(&["m1", "m2"]).await;
    let first = Arc::new(RecordingJob::default());
    let mut worker = fixture.worker(first.clone(), FailurePolicy::Log);
    worker.round(&mut JobContext::new()).await.unwrap();
    assert_eq!(first.seen(), vec!["m1"]);

    let reloaded = CheckpointStore::load(fixture.queue.clone(), "host-2")
        .await
        .unwrap();
    let fixture = Fixture {
        checkpoints: Arc::new(reloaded),
        ..fixture
    };
    let second = Arc::new(RecordingJob::default());
    let mut worker = fixture.worker(second.clone(), FailurePolicy::Log);
    worker.round(&mut JobContext::new()).await.unwrap();

    assert_eq!(second.seen(), vec!["m2"]);
}

#[tokio::test]
async fn stopped_worker_exits_cleanly() {
    let fixture = Fixture::new(&[]).await;
    let worker = fixture.worker(Arc::new(RecordingJob::default()), FailurePolicy::Log);
    let handle = worker.handle();

    let running = tokio::spawn(worker.run());
    handle.stop();

    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn finished_assignor_fails_the_worker() {
    let fixture = Fixture::new(&[]).await;
    let queue: Arc<dyn QueueService> = fixture.queue.clone();
    let assignor = StaticAssignor::new(vec![fixture.partition.clone()]);
    assignor.finish().await;

    let worker = Worker::new(
        WorkerIdentity::new("host", 1, None),
        queue.clone(),
        fixture.checkpoints.clone(),
        Box::new(assignor),
        JobRunner::new(
            Arc::new(RecordingJob::default()),
            failure_handler(FailurePolicy::Log, queue),
        ),
        Duration::from_millis(10),
        Duration::from_millis(10),
        HealthRegistry::new("liveness").register("worker", time::Duration::seconds(30)),
    );

    let result = worker.run().await;
    assert!(matches!(result, Err(WorkerError::AssignmentFailed)));
}

#[tokio::test]
async fn failed_assignor_cuts_the_backoff_short() {
    let fixture = Fixture::new(&[]).await;
    let assignor = ScriptedAssignor::acquired(vec![fixture.partition.clone()]);
    // the first idle wait alone lasts at least 8 seconds
    let worker = fixture.worker_with(
        Arc::new(RecordingJob::default()),
        FailurePolicy::Log,
        Box::new(assignor.clone()),
        Duration::from_secs(10),
    );

    let running = tokio::spawn(worker.run());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assignor.set_state(OwnershipState::Failed);

    let result = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("worker kept sleeping after the assignor failed")
        .unwrap();
    assert!(matches!(result, Err(WorkerError::AssignmentFailed)));
}

#[tokio::test]
async fn releasing_assignor_cuts_the_backoff_short() {
    let fixture = Fixture::new(&[]).await;
    let assignor = ScriptedAssignor::acquired(vec![fixture.partition.clone()]);
    let worker = fixture.worker_with(
        Arc::new(RecordingJob::default()),
        FailurePolicy::Log,
        Box::new(assignor.clone()),
        Duration::from_secs(10),
    );
    let handle = worker.handle();

    let running = tokio::spawn(worker.run());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assignor.set_state(OwnershipState::Releasing);

    eventually(|| assignor.releases() == 1 && assignor.acquires() == 1).await;
    assert_eq!(assignor.state(), OwnershipState::Acquired);

    handle.stop();
    let result = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn release_drops_handles_and_reacquires() {
    let fixture = Fixture::new(&["m1"]).await;
    let job = Arc::new(RecordingJob::default());
    let assignor = ScriptedAssignor::acquired(vec![fixture.partition.clone()]);
    let mut worker = fixture.scripted_worker(job.clone(), &assignor);
    let mut context = JobContext::new();

    let summary = worker.turn(&mut context).await.unwrap().unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(worker.open_partitions(), vec![fixture.partition.clone()]);

    assignor.set_state(OwnershipState::Releasing);
    assert_eq!(worker.turn(&mut context).await.unwrap(), None);
    assert_eq!(assignor.releases(), 1);
    assert!(worker.open_partitions().is_empty());
    assert_eq!(assignor.state(), OwnershipState::Acquiring);

    assert_eq!(worker.turn(&mut context).await.unwrap(), None);
    assert_eq!(assignor.acquires(), 1);
    assert_eq!(assignor.state(), OwnershipState::Acquired);

    // the reopened partition continues from its checkpoint
    let summary = worker.turn(&mut context).await.unwrap().unwrap();
    assert!(summary.is_idle());
    assert_eq!(job.seen(), vec!["m1"]);
    assert_eq!(worker.open_partitions(), vec![fixture.partition.clone()]);
}

#[tokio::test]
async fn partition_no_longer_owned_loses_its_handle() {
    let fixture = Fixture::new(&["m1"]).await;
    fixture.queue.create_queue("def456", 1).await.unwrap();
    let other: PartitionName = "def456".parse().unwrap();
    let assignor = ScriptedAssignor::acquired(vec![fixture.partition.clone(), other.clone()]);
    let mut worker = fixture.scripted_worker(Arc::new(RecordingJob::default()), &assignor);
    let mut context = JobContext::new();

    let summary = worker.round(&mut context).await.unwrap();
    assert_eq!(summary.partitions, 2);
    assert_eq!(
        worker.open_partitions(),
        vec![fixture.partition.clone(), other.clone()]
    );

    assignor.set_partitions(vec![fixture.partition.clone()]);
    let summary = worker.round(&mut context).await.unwrap();
    assert_eq!(summary.partitions, 1);
    assert_eq!(worker.open_partitions(), vec![fixture.partition.clone()]);
    assert_eq!(assignor.releases(), 0);
}
