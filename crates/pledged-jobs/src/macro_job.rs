use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pledged_common::MacroJobStats;
use pledged_store::{Promise, PromiseId, StoreResult};
use tracing::debug;

use crate::builder::ResultBuilder;
use crate::macro_message::MacroJobMessage;
use crate::manager::JobsManager;
use crate::message::WorkDescriptor;

/// Resolves (or creates) the target promise of one unit of work. Called at
/// most once, at registration time.
pub type PromiseRetriever = Box<dyn FnOnce() -> StoreResult<Arc<Promise>> + Send>;

/// The lazy, single-pass expansion of a macro job: one
/// `(promise retriever, work)` pair per micro-job.
pub type Expansion = Box<dyn Iterator<Item = (PromiseRetriever, WorkDescriptor)> + Send>;

pub(crate) struct ExpansionState {
    pub(crate) iter: std::iter::Fuse<Expansion>,
    /// Members produced so far across every driver; feeds `set_member`
    /// indices and completion counts.
    pub(crate) produced: usize,
    pub(crate) exhausted: bool,
}

impl ExpansionState {
    /// Record one produced member; mirrored into the job's lock-free
    /// counter so teardown paths can read it without this lock.
    pub(crate) fn note_produced(&mut self, job: &MacroJob) {
        self.produced += 1;
        job.produced.store(self.produced, Ordering::Release);
    }
}

struct Participants {
    /// −1 once the job is dead; adding participants is then refused.
    count: i64,
    members: Vec<Weak<MacroJobMessage>>,
}

/// Shared state for every client that submitted the same batch request.
///
/// Exactly one participant at a time drives the expansion; the participant
/// membership count is authoritative for liveness, and the transition
/// `0 → −1` is terminal — late joiners must build a fresh macro job.
pub struct MacroJob {
    promise_id: PromiseId,
    result: Arc<ResultBuilder>,
    expansion: Mutex<ExpansionState>,
    produced: AtomicUsize,
    participants: Mutex<Participants>,
    manager: Weak<JobsManager>,
}

impl MacroJob {
    pub fn new(
        promise: Arc<Promise>,
        expansion: Expansion,
        manager: Weak<JobsManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            promise_id: promise.id(),
            result: ResultBuilder::new(promise),
            expansion: Mutex::new(ExpansionState {
                iter: expansion.fuse(),
                produced: 0,
                exhausted: false,
            }),
            produced: AtomicUsize::new(0),
            participants: Mutex::new(Participants {
                count: 0,
                members: Vec::new(),
            }),
            manager,
        })
    }

    pub fn promise_id(&self) -> PromiseId {
        self.promise_id
    }

    pub fn result(&self) -> &Arc<ResultBuilder> {
        &self.result
    }

    pub(crate) fn expansion(&self) -> &Mutex<ExpansionState> {
        &self.expansion
    }

    /// Lock-free view of the produced-member count; safe to read from
    /// teardown paths that may run while a driver holds the expansion lock.
    pub(crate) fn produced(&self) -> usize {
        self.produced.load(Ordering::Acquire)
    }

    /// Join the participant list. Refused once the job is dead: the caller
    /// must construct a fresh macro job for its request.
    pub fn add_participant(&self, message: &Arc<MacroJobMessage>) -> bool {
        let mut participants = self.participants.lock();
        if participants.count < 0 {
            return false;
        }
        participants.count += 1;
        participants.members.push(Arc::downgrade(message));
        true
    }

    /// Leave the participant list; returns whether this was the last
    /// participant. Hitting zero is terminal: the count drops to −1 and the
    /// jobs manager is told to forget this job.
    pub(crate) fn remove_participant(&self, message: &MacroJobMessage) -> bool {
        let retired = {
            let mut participants = self.participants.lock();
            let target = message as *const MacroJobMessage;
            let before = participants.members.len();
            participants.members.retain(|w| w.as_ptr() != target);
            if participants.members.len() == before {
                return false;
            }
            participants.count -= 1;
            if participants.count == 0 {
                participants.count = -1;
                true
            } else {
                false
            }
        };
        if retired {
            debug!("macro job {} retired", self.promise_id);
            if let Some(manager) = self.manager.upgrade() {
                manager.unregister_macro_job(self.promise_id);
            }
        }
        retired
    }

    /// Authoritative group cancellation: cancel every participant. The
    /// member list is snapshotted first because cancellation removes nodes
    /// from it.
    pub fn kill(&self, background: bool) {
        let snapshot: Vec<Arc<MacroJobMessage>> = {
            let participants = self.participants.lock();
            participants
                .members
                .iter()
                .filter_map(Weak::upgrade)
                .collect()
        };
        for message in snapshot {
            message.cancel(background);
        }
    }

    pub fn participant_count(&self) -> i64 {
        self.participants.lock().count
    }

    pub fn stats(&self) -> MacroJobStats {
        MacroJobStats {
            promise_id: self.promise_id.to_string(),
            participants: self.participant_count(),
        }
    }
}

impl std::fmt::Debug for MacroJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacroJob")
            .field("promise_id", &self.promise_id)
            .field("participants", &self.participant_count())
            .finish()
    }
}
