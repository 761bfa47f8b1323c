use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pledged_sched::{ClientJobQueue, SchedResult};
use pledged_store::PromiseId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{JobError, JobResult};
use crate::macro_job::MacroJob;
use crate::manager::{CancellableJob, JobsManager};
use crate::message::QueueMessage;
use crate::token::ClientToken;

/// Never enumerated.
pub const STATE_FRESH: i32 = 0;
/// The one-and-only expansion run is in progress.
pub const STATE_ENUMERATING: i32 = 1;
/// Terminal: completed, failed, cancelled, or speculatively dropped.
pub const STATE_DEAD: i32 = -1;

struct MessageInner {
    rented: Option<crate::cancel_pool::RentedSource>,
    job_cancel: Option<CancellationToken>,
    watcher: Option<JoinHandle<()>>,
}

/// One participant's view of a shared [`MacroJob`].
///
/// Created speculatively on a deduplicated request; joins the macro job's
/// participant list on construction and must be disposed exactly once. The
/// `state` cell gates enumeration: only the 0→1 transition grants the right
/// to drive the expansion.
pub struct MacroJobMessage {
    source: Arc<MacroJob>,
    queue: Arc<ClientJobQueue<QueueMessage>>,
    client: ClientToken,
    manager: Weak<JobsManager>,
    state: AtomicI32,
    is_cancelled: AtomicBool,
    is_tracking: AtomicBool,
    cleaned: AtomicBool,
    inner: Mutex<MessageInner>,
}

impl MacroJobMessage {
    pub fn new(
        source: Arc<MacroJob>,
        queue: Arc<ClientJobQueue<QueueMessage>>,
        client: ClientToken,
        manager: Weak<JobsManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            queue,
            client,
            manager,
            state: AtomicI32::new(STATE_FRESH),
            is_cancelled: AtomicBool::new(false),
            is_tracking: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            inner: Mutex::new(MessageInner {
                rented: None,
                job_cancel: None,
                watcher: None,
            }),
        })
    }

    pub fn promise_id(&self) -> PromiseId {
        self.source.promise_id()
    }

    pub fn source(&self) -> &Arc<MacroJob> {
        &self.source
    }

    /// The client queue this message was scheduled through; expansion
    /// inserts its micro-jobs back into the same queue.
    pub fn queue(&self) -> &Arc<ClientJobQueue<QueueMessage>> {
        &self.queue
    }

    pub fn client(&self) -> &ClientToken {
        &self.client
    }

    pub fn state(&self) -> i32 {
        self.state.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::Acquire)
    }

    /// Register this message as the cancellation owner of
    /// `(promise, client)` with the jobs manager.
    ///
    /// Called after construction because the lookup side needs the shared
    /// macro job to exist first. Between the successful registration and the
    /// local flag store, the message may be killed by another participant's
    /// cancellation; the acquire-load of `state` afterwards detects that and
    /// backs the registration out.
    pub fn try_track_client_request(self: &Arc<Self>) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let owner: Arc<dyn CancellableJob> = self.clone();
        if !manager.try_register_client_request(self.promise_id(), &self.client, owner) {
            return false;
        }
        self.is_tracking.store(true, Ordering::Release);
        if self.state.load(Ordering::Acquire) != STATE_FRESH {
            if self.is_tracking.swap(false, Ordering::AcqRel) {
                manager.unregister_client_request(self.promise_id(), &self.client);
            }
            return false;
        }
        true
    }

    /// Drive the expansion. Grants the run only on the first call of a
    /// still-fresh message: a second call is an unsupported operation, and a
    /// dead message yields the empty sequence.
    ///
    /// `caller` is the dispatcher's own token; its cancellation still tears
    /// this participant down like any other exit, then propagates to the
    /// caller untouched. Produced micro-jobs are handed to `sink`, which
    /// inserts them into the scheduling flow.
    pub fn drive(
        self: &Arc<Self>,
        caller: &ClientToken,
        mut sink: impl FnMut(QueueMessage) -> SchedResult<()>,
    ) -> JobResult<u64> {
        match self.state.compare_exchange(
            STATE_FRESH,
            STATE_ENUMERATING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_ENUMERATING) => return Err(JobError::AlreadyEnumerated),
            Err(_) => {
                trace!("dead macro message {} yields nothing", self.promise_id());
                return Ok(0);
            }
        }

        let result = self.source.result().clone();
        if result.is_complete() {
            // A sibling participant already produced the full result.
            self.dispose();
            return Ok(0);
        }

        let Some(job_token) = self.arm_run_token() else {
            // Cancelled before the run could start.
            let produced = self.source.produced();
            self.fail_if_only_producer(produced, None);
            return Ok(0);
        };
        let Some(manager) = self.manager.upgrade() else {
            self.dispose();
            return Ok(0);
        };

        let mut yielded = 0u64;
        let mut failure: Option<JobError> = None;
        let mut finished = false;
        let mut caller_cancelled = false;
        let produced_count;
        {
            let mut expansion = self.source.expansion().lock();
            loop {
                if caller.is_cancelled() {
                    caller_cancelled = true;
                    break;
                }
                if job_token.is_cancelled() {
                    break;
                }
                if result.is_complete() {
                    finished = true;
                    break;
                }
                let item = if expansion.exhausted {
                    None
                } else {
                    expansion.iter.next()
                };
                let Some((retriever, work)) = item else {
                    expansion.exhausted = true;
                    finished = true;
                    break;
                };
                // Re-check: cancellation may have raced the advance.
                if job_token.is_cancelled() {
                    break;
                }
                match manager.register_job_message(
                    self.queue.account(),
                    retriever,
                    work,
                    false,
                    &self.client,
                    self.queue.cancellation_token(),
                ) {
                    Ok((message, child)) => {
                        if let Err(e) = result.set_member(expansion.produced, child) {
                            failure = Some(e);
                            break;
                        }
                        expansion.note_produced(&self.source);
                        if let Some(message) = message {
                            if let Err(e) = sink(QueueMessage::Micro(message)) {
                                failure = Some(e.into());
                                break;
                            }
                            yielded += 1;
                        }
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            produced_count = expansion.produced;
        }

        if caller_cancelled {
            // Cleanup runs on every exit path; the caller's own cancellation
            // only changes how the result is reported.
            self.fail_if_only_producer(produced_count, None);
            return Err(JobError::Canceled {
                token: caller.id(),
            });
        }
        if failure.is_none() && job_token.is_cancelled() && !finished {
            // Cancelled mid-run with no error observed: withdraw, and
            // complete with cancellation only as the last producer.
            self.fail_if_only_producer(produced_count, None);
            return Ok(yielded);
        }
        if let Some(error) = failure {
            debug!("macro job {} expansion failed: {}", self.promise_id(), error);
            result.try_complete(produced_count, Some(error));
        } else {
            result.try_complete(produced_count, None);
        }
        self.spawn_finish(result);
        Ok(yielded)
    }

    /// Idempotent cancellation: mark cancelled, fire the rented source
    /// (possibly in the background so downstream handlers never run on the
    /// caller's thread), then dispose.
    pub fn cancel(&self, background: bool) {
        let rented = {
            let mut inner = self.inner.lock();
            if self.is_cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            inner.rented.take()
        };
        if let Some(rented) = rented {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) if background => {
                    handle.spawn(async move { rented.fire() });
                }
                _ => rented.fire(),
            }
        }
        self.dispose();
    }

    /// Terminal teardown; safe on a never-enumerated instance and runs at
    /// most once. The last participant out completes the shared result with
    /// cancellation if it is still open.
    pub fn dispose(&self) {
        let produced = self.source.produced();
        self.fail_if_only_producer(produced, None);
    }

    fn fail_if_only_producer(&self, count: usize, error: Option<JobError>) {
        self.state.store(STATE_DEAD, Ordering::SeqCst);
        if self.basic_clean_up() {
            let error = error.unwrap_or(JobError::Canceled {
                token: self.client.id(),
            });
            self.source.result().try_complete(count, Some(error));
        }
    }

    /// Cleanup order matters: release the client-token watcher first, then
    /// the jobs-manager registration, then the participant slot (whose zero
    /// transition retires the whole macro job). Runs at most once; returns
    /// whether this was the last participant.
    fn basic_clean_up(&self) -> bool {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return false;
        }
        let (watcher, rented) = {
            let mut inner = self.inner.lock();
            (inner.watcher.take(), inner.rented.take())
        };
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        // An un-fired rented source goes back to the pool here.
        drop(rented);

        if self.is_tracking.swap(false, Ordering::AcqRel) {
            if let Some(manager) = self.manager.upgrade() {
                manager.unregister_client_request(self.promise_id(), &self.client);
            }
        }
        self.source.remove_participant(self)
    }

    /// Rent a cancellation source for the run and watch the client token.
    /// Returns `None` when the message is already cancelled.
    fn arm_run_token(self: &Arc<Self>) -> Option<CancellationToken> {
        let Some(manager) = self.manager.upgrade() else {
            return None;
        };
        let mut inner = self.inner.lock();
        if self.is_cancelled.load(Ordering::Acquire) || self.client.is_cancelled() {
            return None;
        }
        let rented = manager.cancel_pool().rent();
        let token = rented.token();
        inner.rented = Some(rented);
        inner.job_cancel = Some(token.clone());

        let weak = Arc::downgrade(self);
        let client = self.client.clone();
        inner.watcher = Some(tokio::spawn(async move {
            client.cancelled().await;
            if let Some(message) = weak.upgrade() {
                message.cancel(true);
            }
        }));
        Some(token)
    }

    fn spawn_finish(self: &Arc<Self>, result: Arc<crate::builder::ResultBuilder>) {
        let message = self.clone();
        tokio::spawn(async move {
            result.wait_for_all_promises().await;
            message.dispose();
        });
    }
}

impl CancellableJob for MacroJobMessage {
    fn cancel_for_client(&self, client: &ClientToken, background: bool) {
        if client.id() != self.client.id() {
            return;
        }
        self.cancel(background);
    }

    fn kill(&self, background: bool) {
        self.cancel(background);
    }
}

impl std::fmt::Debug for MacroJobMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacroJobMessage")
            .field("promise_id", &self.promise_id())
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
