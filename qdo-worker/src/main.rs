//! Consume Queuey partitions and run a job on every message.
use std::sync::Arc;

use envconfig::Envconfig;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use qdo_common::checkpoint::CheckpointStore;
use qdo_common::health::HealthRegistry;
use qdo_common::metrics::{serve, setup_metrics_recorder, setup_router};
use qdo_common::queuey::{QueueService, QueueyClient};
use qdo_worker::assignor::{build_assignor, resolve_partition_set};
use qdo_worker::config::Config;
use qdo_worker::error::WorkerError;
use qdo_worker::job::{failure_handler, JobRegistry, JobRunner};
use qdo_worker::worker::{max_backoff, Worker, WorkerHandle};

/// Extra room on top of the longest sleep before the loop is reported stalled.
const LIVENESS_MARGIN: std::time::Duration = std::time::Duration::from_secs(60);

async fn shutdown(handle: WorkerHandle) {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("shutting down gracefully...");
    handle.stop();
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    config.validate()?;
    let identity = config.identity();

    let client = QueueyClient::new(
        &config.queuey.queuey_url,
        &config.queuey.queuey_application,
        &config.queuey.queuey_app_key,
        config.queuey.queuey_timeout.0,
    )?;
    client.heartbeat().await?;
    let queue: Arc<dyn QueueService> = Arc::new(client);

    let job = JobRegistry::with_builtins().resolve(&config.job)?;
    let runner = JobRunner::new(job, failure_handler(config.job_failure, queue.clone()));

    let partitions = resolve_partition_set(
        queue.as_ref(),
        config.partition_policy,
        &config.partition_ids.0,
    )
    .await?;
    info!(
        policy = ?config.partition_policy,
        partitions = partitions.len(),
        "resolved candidate partitions"
    );

    let checkpoints = Arc::new(CheckpointStore::load(queue.clone(), identity.as_str()).await?);

    let liveness = HealthRegistry::new("liveness");
    let deadline = max_backoff(config.wait_interval.0)
        + config.coordination.party_wait.0
        + LIVENESS_MARGIN;
    let worker_liveness = liveness.register(
        "worker",
        time::Duration::seconds_f64(deadline.as_secs_f64()),
    );

    let recorder_handle =
        setup_metrics_recorder().map_err(|e| WorkerError::Metrics(e.to_string()))?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_router(liveness, recorder_handle);
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    // from here on the worker owns the assignor and finishes it on every exit
    let assignor = build_assignor(&config, &identity, partitions).await?;
    let worker = Worker::new(
        identity,
        queue,
        checkpoints,
        assignor,
        runner,
        config.wait_interval.0,
        config.coordination.party_wait.0,
        worker_liveness,
    );
    tokio::spawn(shutdown(worker.handle()));

    worker.run().await
}
