//! The root dispatcher and worker pool.
//!
//! One task pulls from the prioritized root channel: micro-jobs go straight
//! to the worker-distribution channel, macro-jobs are expanded in place with
//! their micro-jobs fed back into the owning client queue. Worker-side
//! execution runs in parallel, bounded by a semaphore.

use std::sync::Arc;

use pledged_common::JobMetrics;
use pledged_jobs::{ClientToken, JobError, JobMessage, QueueMessage, Worker};
use pledged_sched::RootChannel;
use pledged_store::Outcome;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub(crate) fn spawn_dispatcher(
    channel: Arc<RootChannel<QueueMessage>>,
    dispatch_tx: mpsc::Sender<Arc<JobMessage>>,
    shutdown: CancellationToken,
    metrics: Arc<dyn JobMetrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let local = ClientToken::wrapping(shutdown.clone());
        while let Some(message) = channel.dequeue(&shutdown).await {
            match message {
                QueueMessage::Micro(job) => {
                    let key = job.promise().id();
                    if dispatch_tx.send(job).await.is_err() {
                        warn!("worker channel closed; dropping job for {}", key);
                        break;
                    }
                }
                QueueMessage::Macro(message) => {
                    let queue = message.queue().clone();
                    let result = message.drive(&local, |micro| {
                        if let QueueMessage::Micro(job) = &micro {
                            metrics.record_dispatch(
                                &queue.key().owner,
                                queue.key().priority,
                                &queue.key().name,
                            );
                            debug!("expanded micro-job for {}", job.promise().id());
                        }
                        queue.enqueue(micro)
                    });
                    match result {
                        Ok(count) => {
                            debug!("macro job {} expanded {} jobs", message.promise_id(), count)
                        }
                        Err(JobError::Canceled { token }) if token == local.id() => break,
                        Err(JobError::AlreadyEnumerated) => {
                            // A message is dequeued once; a second run means
                            // scheduling state broke.
                            error!(
                                "macro job {} enumerated twice",
                                message.promise_id()
                            );
                        }
                        Err(e) => {
                            error!("macro job {} expansion failed: {}", message.promise_id(), e)
                        }
                    }
                }
            }
        }
        debug!("dispatcher stopped");
    })
}

pub(crate) fn spawn_worker_pool(
    worker: Arc<dyn Worker>,
    mut dispatch_rx: mpsc::Receiver<Arc<JobMessage>>,
    worker_count: usize,
    shutdown: CancellationToken,
    metrics: Arc<dyn JobMetrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = worker.health_check().await {
            error!("worker {} unhealthy at startup: {}", worker.id(), e);
        }
        let slots = Arc::new(Semaphore::new(worker_count));
        loop {
            let job = tokio::select! {
                job = dispatch_rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };
            let Ok(permit) = slots.clone().acquire_owned().await else {
                break;
            };
            let worker = worker.clone();
            let metrics = metrics.clone();
            tokio::spawn(async move {
                execute_one(worker, job, metrics).await;
                drop(permit);
            });
        }
        debug!("worker pool stopped");
    })
}

async fn execute_one(worker: Arc<dyn Worker>, job: Arc<JobMessage>, metrics: Arc<dyn JobMetrics>) {
    let promise = job.promise();
    if promise.is_complete() {
        return;
    }
    let cancel = job.cancellation_token();
    if cancel.is_cancelled() {
        promise.complete(Outcome::Canceled);
        metrics.record_completion("canceled");
        return;
    }
    match worker.execute(job.work().clone(), promise.input(), cancel).await {
        Ok(payload) => {
            promise.complete(Outcome::Value(payload));
            metrics.record_completion("ok");
        }
        Err(e) if e.is_cancellation() => {
            promise.complete(Outcome::Canceled);
            metrics.record_completion("canceled");
        }
        Err(e) => {
            debug!("job for {} failed: {}", promise.id(), e);
            promise.complete(Outcome::Error {
                kind: "execution".into(),
                message: e.to_string(),
            });
            metrics.record_completion("error");
        }
    }
}
