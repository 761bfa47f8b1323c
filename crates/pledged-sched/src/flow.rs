use std::any::Any;
use std::sync::{Arc, Weak};

/// A message that can travel through scheduling flows. `cost` feeds the
/// deficit accounting; the default treats every message as one unit of work.
pub trait FlowMessage: Send + 'static {
    fn cost(&self) -> u64 {
        1
    }
}

/// Identity of a child inside a scheduling group. Generational so that
/// events addressed to a removed-and-reused slot are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildId {
    pub index: u32,
    pub generation: u32,
}

impl ChildId {
    /// Placeholder id used where a sink has exactly one child (the root
    /// channel over the root group).
    pub const ROOT: ChildId = ChildId {
        index: 0,
        generation: 0,
    };
}

/// A flow's activity snapshot. Counters increase monotonically per flow on
/// every idle/non-empty flip, so stale deliveries are detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationEvent {
    pub counter: u64,
    pub activated: bool,
}

/// Opaque payload a group observer attached to a child at admission.
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// Activity-change notification surfaced to a group's observer.
#[derive(Clone)]
pub struct GroupEvent {
    pub child: ChildId,
    pub counter: u64,
    pub activated: bool,
    pub attachment: Option<Attachment>,
}

impl std::fmt::Debug for GroupEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupEvent")
            .field("child", &self.child)
            .field("counter", &self.counter)
            .field("activated", &self.activated)
            .finish()
    }
}

/// Receiver of child activation events; implemented by groups and by the
/// root channel.
pub trait ActivationSink<M: FlowMessage>: Send + Sync {
    fn on_child_event(&self, child: ChildId, event: ActivationEvent);
}

/// A child's handle to its enclosing group. Enqueue-side flips are posted
/// through this after the child's own lock is released; the sink applies
/// them under its lock with a staleness check.
pub struct ParentHandle<M: FlowMessage> {
    sink: Weak<dyn ActivationSink<M>>,
    child: ChildId,
}

impl<M: FlowMessage> Clone for ParentHandle<M> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            child: self.child,
        }
    }
}

impl<M: FlowMessage> ParentHandle<M> {
    pub fn new(sink: Weak<dyn ActivationSink<M>>, child: ChildId) -> Self {
        Self { sink, child }
    }

    pub fn notify(&self, event: ActivationEvent) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_child_event(self.child, event);
        }
    }
}

/// The scheduling flow primitive: leaf queues and groups alike.
pub trait SchedulingFlow<M: FlowMessage>: Send + Sync {
    /// Dequeue one message. The returned event is the flow's post-call
    /// activity snapshot, which the caller applies inline (dequeue-side
    /// deactivations never travel through the parent handle).
    fn try_dequeue(&self) -> (Option<M>, ActivationEvent);

    /// Current activity snapshot without dequeuing.
    fn activity(&self) -> ActivationEvent;

    /// Parent hookup, called exactly once at admission. A second bind is an
    /// invariant violation.
    fn bind_parent(&self, parent: ParentHandle<M>) -> crate::SchedResult<()>;
}

/// A flow that idle expiry may shut down and, on rollback, reopen.
pub trait ExpirableFlow<M: FlowMessage>: SchedulingFlow<M> {
    /// Refuse new work and report success only if the flow is drained. A
    /// false return aborts the removal that requested it.
    fn try_shutdown(&self) -> bool;

    /// Undo a shutdown after a sibling's refusal aborted the removal.
    fn reopen(&self);
}

#[cfg(test)]
impl FlowMessage for u64 {}

#[cfg(test)]
impl FlowMessage for String {}
