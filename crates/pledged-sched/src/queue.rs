use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pledged_common::QueueStats;
use tokio_util::sync::CancellationToken;

use crate::account::SchedulingAccount;
use crate::error::{SchedError, SchedResult};
use crate::flow::{ActivationEvent, ExpirableFlow, FlowMessage, ParentHandle, SchedulingFlow};
use crate::group::DEFAULT_WEIGHT;

/// Opaque identity of the client owning a queue.
pub type OwnerId = String;

/// Identity of one client job queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub owner: OwnerId,
    pub priority: u32,
    pub name: String,
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.owner, self.priority, self.name)
    }
}

struct LeafInner<M> {
    queue: VecDeque<M>,
    closed: bool,
}

/// An ordered queue of scheduled work belonging to one
/// `(owner, priority, name)` tuple: the leaf scheduling flow.
///
/// Carries a scheduling account and a cancellation token used for group
/// termination of everything scheduled through it.
pub struct ClientJobQueue<M: FlowMessage> {
    key: QueueKey,
    inner: Mutex<LeafInner<M>>,
    counter: AtomicU64,
    active: AtomicBool,
    parent: Mutex<Option<ParentHandle<M>>>,
    account: Arc<SchedulingAccount>,
    cancel: CancellationToken,
    weight: u32,
}

impl<M: FlowMessage> ClientJobQueue<M> {
    pub fn new(key: QueueKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            inner: Mutex::new(LeafInner {
                queue: VecDeque::new(),
                closed: false,
            }),
            counter: AtomicU64::new(0),
            active: AtomicBool::new(false),
            parent: Mutex::new(None),
            account: Arc::new(SchedulingAccount::new()),
            cancel: CancellationToken::new(),
            weight: DEFAULT_WEIGHT,
        })
    }

    pub fn key(&self) -> &QueueKey {
        &self.key
    }

    pub fn account(&self) -> Arc<SchedulingAccount> {
        self.account.clone()
    }

    /// Token cancelled when this queue's work is terminated as a group.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel everything scheduled through this queue.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn enqueue(&self, message: M) -> SchedResult<()> {
        let event = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(SchedError::QueueClosed);
            }
            inner.queue.push_back(message);
            self.account.on_enqueued();
            if inner.queue.len() == 1 {
                self.active.store(true, Ordering::Relaxed);
                Some(ActivationEvent {
                    counter: self.counter.fetch_add(1, Ordering::Relaxed) + 1,
                    activated: true,
                })
            } else {
                None
            }
        };
        if let Some(event) = event {
            let parent = self.parent.lock().clone();
            if let Some(parent) = parent {
                parent.notify(event);
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            owner: self.key.owner.clone(),
            priority: self.key.priority,
            queue: self.key.name.clone(),
            queued: self.account.queued(),
            served: self.account.served(),
            charged: self.account.charged(),
        }
    }
}

impl<M: FlowMessage> SchedulingFlow<M> for ClientJobQueue<M> {
    fn try_dequeue(&self) -> (Option<M>, ActivationEvent) {
        let (message, event) = {
            let mut inner = self.inner.lock();
            let message = inner.queue.pop_front();
            if message.is_some() && inner.queue.is_empty() {
                self.active.store(false, Ordering::Relaxed);
                self.counter.fetch_add(1, Ordering::Relaxed);
            }
            (
                message,
                ActivationEvent {
                    counter: self.counter.load(Ordering::Relaxed),
                    activated: self.active.load(Ordering::Relaxed),
                },
            )
        };
        if let Some(message) = &message {
            self.account.on_served(message.cost(), self.weight);
        }
        (message, event)
    }

    fn activity(&self) -> ActivationEvent {
        ActivationEvent {
            counter: self.counter.load(Ordering::Relaxed),
            activated: self.active.load(Ordering::Relaxed),
        }
    }

    fn bind_parent(&self, parent: ParentHandle<M>) -> SchedResult<()> {
        let mut slot = self.parent.lock();
        if slot.is_some() {
            return Err(SchedError::InvariantViolation(
                "queue already admitted to a group".into(),
            ));
        }
        *slot = Some(parent);
        Ok(())
    }
}

impl<M: FlowMessage> ExpirableFlow<M> for ClientJobQueue<M> {
    fn try_shutdown(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.queue.is_empty() {
            return false;
        }
        inner.closed = true;
        true
    }

    fn reopen(&self) {
        self.inner.lock().closed = false;
    }
}
