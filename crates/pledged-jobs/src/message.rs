use std::sync::Arc;

use pledged_sched::{FlowMessage, SchedulingAccount};
use pledged_store::{Payload, Promise};
use tokio_util::sync::CancellationToken;

use crate::macro_message::MacroJobMessage;
use crate::manager::CancellableJob;
use crate::token::ClientToken;

/// Application-facing description of one unit of work.
#[derive(Debug, Clone)]
pub struct WorkDescriptor {
    pub kind: String,
    pub payload: Option<Payload>,
    pub cost: u64,
}

impl WorkDescriptor {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
            cost: 1,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost.max(1);
        self
    }
}

/// An individually launchable micro-job producing exactly one child promise.
pub struct JobMessage {
    promise: Arc<Promise>,
    work: WorkDescriptor,
    account: Arc<SchedulingAccount>,
    /// Child of the owning queue's group token: queue kill cascades here,
    /// per-client cancellation fires only this job.
    cancel: CancellationToken,
}

impl JobMessage {
    pub fn new(
        promise: Arc<Promise>,
        work: WorkDescriptor,
        account: Arc<SchedulingAccount>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            promise,
            work,
            account,
            cancel,
        })
    }

    pub fn promise(&self) -> Arc<Promise> {
        self.promise.clone()
    }

    pub fn work(&self) -> &WorkDescriptor {
        &self.work
    }

    pub fn account(&self) -> Arc<SchedulingAccount> {
        self.account.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl CancellableJob for JobMessage {
    fn cancel_for_client(&self, _client: &ClientToken, _background: bool) {
        self.cancel.cancel();
    }

    fn kill(&self, _background: bool) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for JobMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobMessage")
            .field("promise", &self.promise.id())
            .field("kind", &self.work.kind)
            .finish()
    }
}

/// What actually travels through the scheduling flows.
#[derive(Clone)]
pub enum QueueMessage {
    Micro(Arc<JobMessage>),
    Macro(Arc<MacroJobMessage>),
}

impl FlowMessage for QueueMessage {
    fn cost(&self) -> u64 {
        match self {
            QueueMessage::Micro(message) => message.work().cost,
            QueueMessage::Macro(_) => 1,
        }
    }
}

impl std::fmt::Debug for QueueMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueMessage::Micro(m) => write!(f, "Micro({})", m.promise.id()),
            QueueMessage::Macro(m) => write!(f, "Macro({})", m.promise_id()),
        }
    }
}
