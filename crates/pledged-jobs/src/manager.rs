use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pledged_common::MacroJobStats;
use pledged_sched::{ClientJobQueue, SchedulingAccount};
use pledged_store::{Promise, PromiseId};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use ulid::Ulid;

use crate::cancel_pool::CancelSourcePool;
use crate::error::JobResult;
use crate::macro_job::{Expansion, MacroJob, PromiseRetriever};
use crate::macro_message::MacroJobMessage;
use crate::message::{JobMessage, QueueMessage, WorkDescriptor};
use crate::token::ClientToken;

/// A registered owner of `(promise, client)` work, reachable for
/// cancellation routing.
pub trait CancellableJob: Send + Sync {
    /// Withdraw one client's interest without disturbing the others.
    fn cancel_for_client(&self, client: &ClientToken, background: bool);

    /// Authoritative group cancellation.
    fn kill(&self, background: bool);
}

/// The registry of live work.
///
/// Records which owner serves each `(promise, client)` pair for cancellation
/// routing, deduplicates batch requests onto shared macro jobs, and lends
/// out pooled cancellation sources for macro-job runs.
pub struct JobsManager {
    client_requests: DashMap<(PromiseId, Ulid), Arc<dyn CancellableJob>>,
    macro_jobs: DashMap<PromiseId, Arc<MacroJob>>,
    pool: CancelSourcePool,
}

impl JobsManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            client_requests: DashMap::new(),
            macro_jobs: DashMap::new(),
            pool: CancelSourcePool::new(),
        })
    }

    pub fn cancel_pool(&self) -> &CancelSourcePool {
        &self.pool
    }

    /// Obtain or create the target promise and, unless it is already
    /// complete, build a micro-job message scheduled against `account`. A
    /// complete promise emits no message.
    pub fn register_job_message(
        &self,
        account: Arc<SchedulingAccount>,
        retriever: PromiseRetriever,
        work: WorkDescriptor,
        register_client: bool,
        client: &ClientToken,
        group_token: CancellationToken,
    ) -> JobResult<(Option<Arc<JobMessage>>, Arc<Promise>)> {
        let promise = retriever()?;
        if promise.is_complete() {
            return Ok((None, promise));
        }
        let message = JobMessage::new(promise.clone(), work, account, group_token.child_token());
        if register_client {
            let owner: Arc<dyn CancellableJob> = message.clone();
            if !self.try_register_client_request(promise.id(), client, owner) {
                debug!(
                    "client {} already tracks promise {}",
                    client.id(),
                    promise.id()
                );
            }
        }
        Ok((Some(message), promise))
    }

    /// Register a deduplicated batch request: join the live macro job for
    /// this promise or build a fresh one. A dead macro job is purged and the
    /// join retried, since resurrection is forbidden. A complete promise
    /// emits no message.
    pub fn register_macro_message(
        self: &Arc<Self>,
        promise: Arc<Promise>,
        make_expansion: &mut dyn FnMut() -> Expansion,
        queue: Arc<ClientJobQueue<QueueMessage>>,
        client: &ClientToken,
    ) -> JobResult<Option<Arc<MacroJobMessage>>> {
        if promise.is_complete() {
            return Ok(None);
        }
        loop {
            let job = match self.macro_jobs.get(&promise.id()).map(|e| e.value().clone()) {
                Some(job) => job,
                None => {
                    let fresh =
                        MacroJob::new(promise.clone(), make_expansion(), Arc::downgrade(self));
                    match self.macro_jobs.entry(promise.id()) {
                        Entry::Vacant(slot) => {
                            slot.insert(fresh.clone());
                            fresh
                        }
                        // Lost the install race; the winner's job carries
                        // the expansion that will run.
                        Entry::Occupied(slot) => slot.get().clone(),
                    }
                }
            };
            let message =
                MacroJobMessage::new(job.clone(), queue.clone(), client.clone(), Arc::downgrade(self));
            if job.add_participant(&message) {
                if !message.try_track_client_request() {
                    debug!(
                        "macro request for {} joined without client tracking",
                        promise.id()
                    );
                }
                return Ok(Some(message));
            }
            // The job died between lookup and join; forget it and rebuild.
            self.macro_jobs
                .remove_if(&promise.id(), |_, job| job.participant_count() < 0);
        }
    }

    /// Record `(promise, client) → owner` for cancellation routing. Fails if
    /// the pair is already tracked.
    pub fn try_register_client_request(
        &self,
        promise_id: PromiseId,
        client: &ClientToken,
        owner: Arc<dyn CancellableJob>,
    ) -> bool {
        match self.client_requests.entry((promise_id, client.id())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(owner);
                true
            }
        }
    }

    pub fn unregister_client_request(&self, promise_id: PromiseId, client: &ClientToken) -> bool {
        self.client_requests
            .remove(&(promise_id, client.id()))
            .is_some()
    }

    /// Called when a macro job goes dead; only removes the entry if it is
    /// still the dead one (a successor may already be installed).
    pub fn unregister_macro_job(&self, promise_id: PromiseId) {
        self.macro_jobs
            .remove_if(&promise_id, |_, job| job.participant_count() < 0);
    }

    pub fn macro_job(&self, promise_id: PromiseId) -> Option<Arc<MacroJob>> {
        self.macro_jobs.get(&promise_id).map(|e| e.value().clone())
    }

    /// Route one client's cancellation to the owner registered for the
    /// pair. Returns whether an owner was found.
    pub fn cancel_job(&self, promise_id: PromiseId, client: &ClientToken, background: bool) -> bool {
        let owner = self
            .client_requests
            .get(&(promise_id, client.id()))
            .map(|e| e.value().clone());
        match owner {
            Some(owner) => {
                owner.cancel_for_client(client, background);
                true
            }
            None => false,
        }
    }

    /// Authoritative cancellation of everything attached to a promise.
    pub fn kill(&self, promise_id: PromiseId, background: bool) -> bool {
        let mut hit = false;
        if let Some(job) = self.macro_job(promise_id) {
            job.kill(background);
            hit = true;
        }
        let owners: Vec<Arc<dyn CancellableJob>> = self
            .client_requests
            .iter()
            .filter(|e| e.key().0 == promise_id)
            .map(|e| e.value().clone())
            .collect();
        for owner in owners {
            owner.kill(background);
            hit = true;
        }
        hit
    }

    pub fn client_request_count(&self) -> usize {
        self.client_requests.len()
    }

    pub fn macro_job_stats(&self) -> Vec<MacroJobStats> {
        self.macro_jobs.iter().map(|e| e.value().stats()).collect()
    }
}
