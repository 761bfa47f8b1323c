use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use pledged_common::{JobMetrics, NullJobMetrics, ServerStats};
use pledged_jobs::{
    ClientToken, Expansion, JobsManager, PromiseRetriever, QueueMessage, WorkDescriptor, Worker,
};
use pledged_sched::{ExpiryQueue, PrioritizedQueueSystem, SchedError};
use pledged_store::{Payload, Promise, PromiseId, PromiseStore, SchemaRegistry};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::CoreConfig;
use crate::dispatcher;

/// The assembled job server: promise store, hierarchical scheduler, jobs
/// manager, dispatcher and worker pool.
pub struct JobServer {
    config: CoreConfig,
    store: Arc<PromiseStore>,
    manager: Arc<JobsManager>,
    scheduler: Arc<PrioritizedQueueSystem<QueueMessage>>,
    metrics: Arc<dyn JobMetrics>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobServer {
    /// Build and start a server. Must be called inside a tokio runtime: the
    /// expiry timer, dispatcher and worker pool are spawned here.
    pub fn start(
        config: CoreConfig,
        worker: Arc<dyn Worker>,
        registry: SchemaRegistry,
    ) -> Result<Arc<Self>> {
        Self::start_with_metrics(config, worker, registry, Arc::new(NullJobMetrics))
    }

    pub fn start_with_metrics(
        config: CoreConfig,
        worker: Arc<dyn Worker>,
        registry: SchemaRegistry,
        metrics: Arc<dyn JobMetrics>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let store = PromiseStore::open(config.service_id, &config.store_options(), registry)
            .context("opening promise store")?;
        let expiry = ExpiryQueue::new(config.expiry_ticks, config.expiry_bucket_count);
        let scheduler = PrioritizedQueueSystem::new(
            config.count_priorities,
            expiry.clone(),
            config.expiry_ticks,
        )?;
        let manager = JobsManager::new();
        let shutdown = CancellationToken::new();

        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_buffer);
        let tasks = vec![
            expiry.run(shutdown.child_token()),
            dispatcher::spawn_dispatcher(
                scheduler.channel(),
                dispatch_tx,
                shutdown.child_token(),
                metrics.clone(),
            ),
            dispatcher::spawn_worker_pool(
                worker,
                dispatch_rx,
                config.worker_count,
                shutdown.child_token(),
                metrics.clone(),
            ),
        ];
        info!(
            "job server started: {} priorities, {} workers",
            config.count_priorities, config.worker_count
        );
        Ok(Arc::new(Self {
            config,
            store,
            manager,
            scheduler,
            metrics,
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PromiseStore> {
        &self.store
    }

    /// Submit one micro-job: mints a promise for `input`, schedules work
    /// against the client's queue, and returns the promise to await.
    pub fn submit(
        &self,
        owner: &str,
        priority: u32,
        queue_name: &str,
        work: WorkDescriptor,
        input: Option<Payload>,
        client: &ClientToken,
    ) -> Result<Arc<Promise>> {
        let store = self.store.clone();
        let retriever: PromiseRetriever = Box::new(move || Ok(store.create(input, None)));
        self.submit_retrieved(owner, priority, queue_name, work, retriever, client)
    }

    /// Submit one micro-job against an existing or to-be-created promise. A
    /// promise that is already complete schedules nothing.
    pub fn submit_retrieved(
        &self,
        owner: &str,
        priority: u32,
        queue_name: &str,
        work: WorkDescriptor,
        retriever: PromiseRetriever,
        client: &ClientToken,
    ) -> Result<Arc<Promise>> {
        let owner_id = owner.to_string();
        let queue = self.scheduler.queue(&owner_id, priority, queue_name)?;
        let (message, promise) = self.manager.register_job_message(
            queue.account(),
            retriever,
            work,
            true,
            client,
            queue.cancellation_token(),
        )?;
        let Some(message) = message else {
            return Ok(promise);
        };
        self.metrics
            .record_submission(&owner_id, priority, queue_name);
        self.enqueue(&owner_id, priority, queue_name, QueueMessage::Micro(message))?;
        Ok(promise)
    }

    /// Submit a batch request against `aggregate`. Concurrent submissions
    /// for the same promise share one macro job; the expansion factory is
    /// only consulted when this call creates the shared job.
    pub fn submit_batch(
        &self,
        owner: &str,
        priority: u32,
        queue_name: &str,
        aggregate: Arc<Promise>,
        expansion_factory: &mut dyn FnMut() -> Expansion,
        client: &ClientToken,
    ) -> Result<Arc<Promise>> {
        let owner_id = owner.to_string();
        let queue = self.scheduler.queue(&owner_id, priority, queue_name)?;
        let message = self.manager.register_macro_message(
            aggregate.clone(),
            expansion_factory,
            queue,
            client,
        )?;
        let Some(message) = message else {
            return Ok(aggregate);
        };
        self.metrics
            .record_submission(&owner_id, priority, queue_name);
        self.enqueue(&owner_id, priority, queue_name, QueueMessage::Macro(message))?;
        Ok(aggregate)
    }

    /// Insert into the client queue, re-resolving when the queue was torn
    /// down by idle expiry between resolution and insertion.
    fn enqueue(
        &self,
        owner: &str,
        priority: u32,
        queue_name: &str,
        message: QueueMessage,
    ) -> Result<()> {
        let owner_id = owner.to_string();
        for _ in 0..8 {
            let queue = self.scheduler.queue(&owner_id, priority, queue_name)?;
            match queue.enqueue(message.clone()) {
                Ok(()) => return Ok(()),
                Err(SchedError::QueueClosed) => {
                    std::thread::yield_now();
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        anyhow::bail!("queue {owner_id}:{priority}:{queue_name} kept closing during submit");
    }

    /// Withdraw one client's interest in a promise.
    pub fn cancel(&self, promise_id: PromiseId, client: &ClientToken, background: bool) -> bool {
        self.manager.cancel_job(promise_id, client, background)
    }

    /// Authoritative cancellation of everything attached to a promise.
    pub fn kill(&self, promise_id: PromiseId, background: bool) -> bool {
        self.manager.kill(promise_id, background)
    }

    pub fn promise(&self, id: PromiseId) -> Option<Arc<Promise>> {
        self.store.get_by_id(id)
    }

    pub fn set_priority_weight(&self, priority: u32, weight: u32) -> Result<()> {
        self.scheduler.set_priority_weight(priority, weight)?;
        Ok(())
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            store: self.store.stats(),
            queues: self.scheduler.stats(),
            macro_jobs: self.manager.macro_job_stats(),
            taken_at: chrono::Utc::now(),
        }
    }

    /// Stop the dispatcher, worker pool and expiry timer. In-flight work is
    /// abandoned; incomplete promises do not survive a restart by design.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("job server stopped");
    }
}

impl std::fmt::Debug for JobServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobServer")
            .field("priorities", &self.config.count_priorities)
            .field("workers", &self.config.worker_count)
            .finish()
    }
}
