use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{SchedError, SchedResult};
use crate::flow::{
    ActivationEvent, ActivationSink, Attachment, ChildId, FlowMessage, GroupEvent, ParentHandle,
    SchedulingFlow,
};

/// Default weight for a newly admitted child.
pub const DEFAULT_WEIGHT: u32 = 10;

type GroupObserver = Box<dyn Fn(GroupEvent) + Send + Sync>;

struct ChildSlot<M: FlowMessage> {
    flow: Arc<dyn SchedulingFlow<M>>,
    weight: u32,
    deficit: i64,
    active: bool,
    last_counter: u64,
    attachment: Option<Attachment>,
}

struct Slot<M: FlowMessage> {
    generation: u32,
    child: Option<ChildSlot<M>>,
}

struct GroupInner<M: FlowMessage> {
    slots: Vec<Slot<M>>,
    free: Vec<u32>,
    active_count: usize,
    cursor: usize,
}

/// A composite flow multiplexing children with deficit-weighted round-robin.
///
/// Children are held in an arena with generational ids; events addressed to
/// removed slots are discarded. The group itself is a flow, so groups nest.
pub struct SchedulingGroup<M: FlowMessage> {
    inner: Mutex<GroupInner<M>>,
    counter: AtomicU64,
    active: AtomicBool,
    parent: Mutex<Option<ParentHandle<M>>>,
    observer: RwLock<Option<GroupObserver>>,
}

impl<M: FlowMessage> SchedulingGroup<M> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(GroupInner {
                slots: Vec::new(),
                free: Vec::new(),
                active_count: 0,
                cursor: 0,
            }),
            counter: AtomicU64::new(0),
            active: AtomicBool::new(false),
            parent: Mutex::new(None),
            observer: RwLock::new(None),
        })
    }

    /// Observer hook for keyed collections layered over this group; sees
    /// every child activity flip together with the admission attachment.
    pub fn set_observer(&self, observer: GroupObserver) {
        *self.observer.write() = Some(observer);
    }

    /// Admit a child with the given weight. The child is bound back to this
    /// group so enqueue-side activation events reach it.
    pub fn add_child(
        self: &Arc<Self>,
        flow: Arc<dyn SchedulingFlow<M>>,
        weight: u32,
        attachment: Option<Attachment>,
    ) -> SchedResult<ChildId> {
        if weight == 0 {
            return Err(SchedError::InvalidConfig("child weight must be positive".into()));
        }
        let snapshot = flow.activity();
        let (id, self_event) = {
            let mut inner = self.inner.lock();
            let index = match inner.free.pop() {
                Some(index) => index,
                None => {
                    inner.slots.push(Slot {
                        generation: 0,
                        child: None,
                    });
                    (inner.slots.len() - 1) as u32
                }
            };
            let slot = &mut inner.slots[index as usize];
            let id = ChildId {
                index,
                generation: slot.generation,
            };
            slot.child = Some(ChildSlot {
                flow: flow.clone(),
                weight,
                deficit: 0,
                active: snapshot.activated,
                last_counter: snapshot.counter,
                attachment,
            });
            if snapshot.activated {
                inner.active_count += 1;
            }
            let active_count = inner.active_count;
            (id, self.refresh_activity(active_count))
        };

        let sink: Arc<dyn ActivationSink<M>> = self.clone();
        if let Err(e) = flow.bind_parent(ParentHandle::new(Arc::downgrade(&sink), id)) {
            // Roll the slot back; the flow already belongs to another group.
            let _ = self.detach(id);
            return Err(e);
        }
        if let Some(event) = self_event {
            self.publish(event);
        }
        Ok(id)
    }

    /// Remove a child, returning its flow. Unknown or stale ids are loud:
    /// removal races mean bookkeeping has desynchronized.
    pub fn remove_child(&self, id: ChildId) -> SchedResult<Arc<dyn SchedulingFlow<M>>> {
        let (flow, self_event) = self.detach(id)?;
        if let Some(event) = self_event {
            self.publish(event);
        }
        Ok(flow)
    }

    /// Adjust a child's weight at runtime.
    pub fn set_weight(&self, id: ChildId, weight: u32) -> SchedResult<()> {
        if weight == 0 {
            return Err(SchedError::InvalidConfig("child weight must be positive".into()));
        }
        let mut inner = self.inner.lock();
        let slot = Self::slot_mut(&mut inner, id)
            .ok_or_else(|| SchedError::InvariantViolation(format!("no child {id:?}")))?;
        slot.weight = weight;
        Ok(())
    }

    pub fn child_weight(&self, id: ChildId) -> Option<u32> {
        let mut inner = self.inner.lock();
        Self::slot_mut(&mut inner, id).map(|slot| slot.weight)
    }

    fn detach(&self, id: ChildId) -> SchedResult<(Arc<dyn SchedulingFlow<M>>, Option<ActivationEvent>)> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or_else(|| SchedError::InvariantViolation(format!("no child {id:?}")))?;
        let Some(child) = slot.child.take() else {
            return Err(SchedError::InvariantViolation(format!("no child {id:?}")));
        };
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(id.index);
        if child.active {
            inner.active_count -= 1;
        }
        let active_count = inner.active_count;
        Ok((child.flow, self.refresh_activity(active_count)))
    }

    fn slot_mut(inner: &mut GroupInner<M>, id: ChildId) -> Option<&mut ChildSlot<M>> {
        inner
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.child.as_mut())
    }

    /// Recompute the group's own activity. Must be called with the inner
    /// lock held so flips stay serialized and counters ordered.
    fn refresh_activity(&self, active_count: usize) -> Option<ActivationEvent> {
        let now_active = active_count > 0;
        if self.active.load(Ordering::Relaxed) == now_active {
            return None;
        }
        self.active.store(now_active, Ordering::Relaxed);
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Some(ActivationEvent {
            counter,
            activated: now_active,
        })
    }

    fn publish(&self, event: ActivationEvent) {
        let parent = self.parent.lock().clone();
        if let Some(parent) = parent {
            parent.notify(event);
        }
    }

    fn emit(&self, events: Vec<GroupEvent>) {
        if events.is_empty() {
            return;
        }
        let observer = self.observer.read();
        if let Some(observer) = observer.as_ref() {
            for event in events {
                observer(event);
            }
        }
    }
}

impl<M: FlowMessage> ActivationSink<M> for SchedulingGroup<M> {
    fn on_child_event(&self, child: ChildId, event: ActivationEvent) {
        let (observer_event, self_event) = {
            let mut inner = self.inner.lock();
            let Some(slot) = Self::slot_mut(&mut inner, child) else {
                debug!("activation event for removed child {:?} discarded", child);
                return;
            };
            if event.counter <= slot.last_counter {
                debug!(
                    "stale activation event for child {:?} discarded ({} <= {})",
                    child, event.counter, slot.last_counter
                );
                return;
            }
            slot.last_counter = event.counter;
            if slot.active == event.activated {
                return;
            }
            slot.active = event.activated;
            let attachment = slot.attachment.clone();
            if event.activated {
                inner.active_count += 1;
            } else {
                inner.active_count -= 1;
            }
            let active_count = inner.active_count;
            (
                GroupEvent {
                    child,
                    counter: event.counter,
                    activated: event.activated,
                    attachment,
                },
                self.refresh_activity(active_count),
            )
        };
        self.emit(vec![observer_event]);
        if let Some(event) = self_event {
            self.publish(event);
        }
    }
}

impl<M: FlowMessage> SchedulingFlow<M> for SchedulingGroup<M> {
    fn try_dequeue(&self) -> (Option<M>, ActivationEvent) {
        let (message, observer_events, self_event) = {
            let mut inner = self.inner.lock();
            let mut observer_events = Vec::new();
            let mut message = None;

            let len = inner.slots.len();
            if inner.active_count > 0 && len > 0 {
                let mut index = inner.cursor % len;
                let mut scanned = 0;
                while scanned < len {
                    let slot = &mut inner.slots[index];
                    let generation = slot.generation;
                    let Some(child) = slot.child.as_mut().filter(|c| c.active) else {
                        index = (index + 1) % len;
                        scanned += 1;
                        continue;
                    };
                    if child.deficit <= 0 {
                        child.deficit += i64::from(child.weight);
                    }
                    let (msg, snapshot) = child.flow.try_dequeue();
                    let mut flipped = false;
                    if snapshot.counter > child.last_counter {
                        child.last_counter = snapshot.counter;
                        if child.active != snapshot.activated {
                            child.active = snapshot.activated;
                            flipped = true;
                            observer_events.push(GroupEvent {
                                child: ChildId {
                                    index: index as u32,
                                    generation,
                                },
                                counter: snapshot.counter,
                                activated: snapshot.activated,
                                attachment: child.attachment.clone(),
                            });
                        }
                    }
                    match msg {
                        Some(msg) => {
                            child.deficit -= msg.cost() as i64;
                            let exhausted = child.deficit <= 0;
                            if flipped {
                                inner.active_count -= 1;
                            }
                            inner.cursor = if exhausted { (index + 1) % len } else { index };
                            message = Some(msg);
                            break;
                        }
                        None => {
                            let still_active = child.active;
                            if flipped {
                                inner.active_count -= 1;
                            } else if still_active {
                                // An active child must produce a message or
                                // report its own deactivation.
                                warn!("active child yielded no message; skipping this round");
                            }
                            index = (index + 1) % len;
                            scanned += 1;
                        }
                    }
                }
            }

            let active_count = inner.active_count;
            (message, observer_events, self.refresh_activity(active_count))
        };
        self.emit(observer_events);
        if let Some(event) = self_event {
            self.publish(event);
        }
        (message, self.activity())
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
                "group already admitted to a parent".into(),
            ));
        }
        *slot = Some(parent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ClientJobQueue, QueueKey};

    fn key(name: &str) -> QueueKey {
        QueueKey {
            owner: "owner".into(),
            priority: 0,
            name: name.into(),
        }
    }

    #[test]
    fn dequeues_fifo_from_single_child() -> SchedResult<()> {
        let group: Arc<SchedulingGroup<u64>> = SchedulingGroup::new();
        let q = ClientJobQueue::new(key("a"));
        group.add_child(q.clone(), DEFAULT_WEIGHT, None)?;
        for v in [1u64, 2, 3] {
            q.enqueue(v)?;
        }
        let mut got = Vec::new();
        while let (Some(v), _) = group.try_dequeue() {
            got.push(v);
        }
        assert_eq!(got, vec![1, 2, 3]);
        assert!(!group.activity().activated);
        Ok(())
    }

    #[test]
    fn service_tracks_weight_ratio() -> SchedResult<()> {
        let group: Arc<SchedulingGroup<u64>> = SchedulingGroup::new();
        let light = ClientJobQueue::new(key("light"));
        let heavy = ClientJobQueue::new(key("heavy"));
        group.add_child(light.clone(), 10, None)?;
        group.add_child(heavy.clone(), 20, None)?;
        for v in 0..1000u64 {
            light.enqueue(v)?;
            heavy.enqueue(v + 1000)?;
        }
        let mut light_served = 0u64;
        let mut heavy_served = 0u64;
        for _ in 0..900 {
            match group.try_dequeue().0 {
                Some(v) if v < 1000 => light_served += 1,
                Some(_) => heavy_served += 1,
                None => break,
            }
        }
        let ratio = heavy_served as f64 / light_served as f64;
        assert!(
            (ratio - 2.0).abs() < 0.1,
            "expected ~1:2 service, got {light_served}:{heavy_served}"
        );
        Ok(())
    }

    #[test]
    fn activation_propagates_through_nested_groups() -> SchedResult<()> {
        let root: Arc<SchedulingGroup<u64>> = SchedulingGroup::new();
        let mid: Arc<SchedulingGroup<u64>> = SchedulingGroup::new();
        let q = ClientJobQueue::new(key("nested"));
        mid.add_child(q.clone(), DEFAULT_WEIGHT, None)?;
        root.add_child(mid.clone(), DEFAULT_WEIGHT, None)?;
        assert!(!root.activity().activated);

        q.enqueue(7)?;
        assert!(root.activity().activated);
        assert_eq!(root.try_dequeue().0, Some(7));
        assert!(!root.activity().activated);
        Ok(())
    }

    #[test]
    fn double_admission_is_loud() -> SchedResult<()> {
        let a: Arc<SchedulingGroup<u64>> = SchedulingGroup::new();
        let b: Arc<SchedulingGroup<u64>> = SchedulingGroup::new();
        let q = ClientJobQueue::new(key("dup"));
        a.add_child(q.clone(), DEFAULT_WEIGHT, None)?;
        assert!(matches!(
            b.add_child(q, DEFAULT_WEIGHT, None),
            Err(SchedError::InvariantViolation(_))
        ));
        Ok(())
    }

    #[test]
    fn removed_child_events_are_discarded() -> SchedResult<()> {
        let group: Arc<SchedulingGroup<u64>> = SchedulingGroup::new();
        let q = ClientJobQueue::new(key("gone"));
        let id = group.add_child(q.clone(), DEFAULT_WEIGHT, None)?;
        group.remove_child(id)?;
        // The slot is gone; a late event for the stale id must not panic or
        // corrupt the active count.
        group.on_child_event(
            id,
            ActivationEvent {
                counter: 99,
                activated: true,
            },
        );
        assert!(!group.activity().activated);
        assert!(group.remove_child(id).is_err());
        Ok(())
    }

    #[test]
    fn weight_is_adjustable_at_runtime() -> SchedResult<()> {
        let group: Arc<SchedulingGroup<u64>> = SchedulingGroup::new();
        let q = ClientJobQueue::new(key("w"));
        let id = group.add_child(q, DEFAULT_WEIGHT, None)?;
        assert_eq!(group.child_weight(id), Some(DEFAULT_WEIGHT));
        group.set_weight(id, 30)?;
        assert_eq!(group.child_weight(id), Some(30));
        assert!(group.set_weight(id, 0).is_err());
        Ok(())
    }

    #[test]
    fn observer_sees_activity_flips() -> SchedResult<()> {
        let group: Arc<SchedulingGroup<u64>> = SchedulingGroup::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            group.set_observer(Box::new(move |ev| seen.lock().push(ev.activated)));
        }
        let q = ClientJobQueue::new(key("obs"));
        group.add_child(q.clone(), DEFAULT_WEIGHT, None)?;
        q.enqueue(1)?;
        let _ = group.try_dequeue();
        assert_eq!(*seen.lock(), vec![true, false]);
        Ok(())
    }
}
