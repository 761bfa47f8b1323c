use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{SchedError, SchedResult};
use crate::expiry::ExpiryQueue;
use crate::flow::{
    ActivationEvent, Attachment, ChildId, ExpirableFlow, FlowMessage, GroupEvent, ParentHandle,
    SchedulingFlow,
};
use crate::group::{SchedulingGroup, DEFAULT_WEIGHT};

struct EntryState {
    /// Counter of the newest activation event applied; only strictly newer
    /// events are accepted.
    epoch: u64,
    /// Bootstrap flag: a fresh entry accepts its first event regardless of
    /// counter and counts as deactivated-now until used.
    newly_added: bool,
    /// Tick of the last deactivation; `u64::MAX` while active.
    deactivated_at: u64,
}

struct SystemEntry<Q> {
    value: Arc<Q>,
    child: ChildId,
    state: Mutex<EntryState>,
    /// At most one pending expiry task exists per entry.
    in_expiry_queue: AtomicBool,
}

/// A keyed collection of equally-weighted flows over one scheduling group,
/// with idle expiry.
///
/// Used for both hierarchy layers: owner → inner system and name → client
/// job queue. Lookups are safe to call concurrently with mutations; results
/// may be stale by the time the caller inspects them.
pub struct ClientQueueSystem<K, Q, M>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    Q: ExpirableFlow<M> + Send + Sync + 'static,
    M: FlowMessage,
{
    group: Arc<SchedulingGroup<M>>,
    entries: DashMap<K, Arc<SystemEntry<Q>>>,
    /// Serializes admissions and removals; reads stay lock-free.
    admit_lock: Mutex<()>,
    closed: AtomicBool,
    factory: Box<dyn Fn(&K) -> Arc<Q> + Send + Sync>,
    expiry: Arc<ExpiryQueue>,
    expiry_ticks: u64,
}

impl<K, Q, M> ClientQueueSystem<K, Q, M>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    Q: ExpirableFlow<M> + Send + Sync + 'static,
    M: FlowMessage,
{
    pub fn new(
        factory: Box<dyn Fn(&K) -> Arc<Q> + Send + Sync>,
        expiry: Arc<ExpiryQueue>,
        expiry_ticks: u64,
    ) -> Arc<Self> {
        let system = Arc::new(Self {
            group: SchedulingGroup::new(),
            entries: DashMap::new(),
            admit_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            factory,
            expiry,
            expiry_ticks,
        });
        let weak = Arc::downgrade(&system);
        system.group.set_observer(Box::new(move |event| {
            if let Some(system) = weak.upgrade() {
                system.on_group_event(event);
            }
        }));
        system
    }

    /// Return the existing flow for `key`, or build one, admit it to the
    /// scheduling group and arm its expiry.
    pub fn get_or_add(self: &Arc<Self>, key: &K) -> SchedResult<Arc<Q>> {
        if let Some(entry) = self.entries.get(key) {
            return Ok(entry.value.clone());
        }
        let _guard = self.admit_lock.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedError::QueueClosed);
        }
        if let Some(entry) = self.entries.get(key) {
            return Ok(entry.value.clone());
        }

        let value = (self.factory)(key);
        let attachment: Attachment = Arc::new(key.clone());
        let child = self
            .group
            .add_child(value.clone(), DEFAULT_WEIGHT, Some(attachment))?;
        let now = self.expiry.now_ticks();
        let entry = Arc::new(SystemEntry {
            value: value.clone(),
            child,
            state: Mutex::new(EntryState {
                epoch: 0,
                newly_added: true,
                deactivated_at: now,
            }),
            in_expiry_queue: AtomicBool::new(false),
        });
        self.entries.insert(key.clone(), entry.clone());
        // Never-used entries are eligible for expiry.
        if !entry.in_expiry_queue.swap(true, Ordering::AcqRel) {
            self.schedule(key, now + self.expiry_ticks);
        }
        Ok(value)
    }

    pub fn try_get(&self, key: &K) -> Option<Arc<Q>> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Snapshot of current members; may be stale by the time it is read.
    pub fn list_members(&self) -> Vec<(K, Arc<Q>)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn on_group_event(self: &Arc<Self>, event: GroupEvent) {
        let Some(attachment) = event.attachment else {
            return;
        };
        let Some(key) = attachment.downcast_ref::<K>() else {
            return;
        };
        let Some(entry) = self.entries.get(key).map(|e| e.value().clone()) else {
            return;
        };
        let deactivated_now = {
            let mut state = entry.state.lock();
            if event.counter <= state.epoch && !state.newly_added {
                debug!("stale activity event discarded (counter {})", event.counter);
                return;
            }
            state.newly_added = false;
            state.epoch = state.epoch.max(event.counter);
            if event.activated {
                state.deactivated_at = u64::MAX;
                None
            } else {
                let now = self.expiry.now_ticks();
                state.deactivated_at = now;
                Some(now)
            }
        };
        if let Some(now) = deactivated_now {
            if !entry.in_expiry_queue.swap(true, Ordering::AcqRel) {
                self.schedule(key, now + self.expiry_ticks);
            }
        }
    }

    fn schedule(self: &Arc<Self>, key: &K, due: u64) {
        let weak = Arc::downgrade(self);
        let key = key.clone();
        self.expiry.schedule_at(
            due,
            Box::new(move |now| {
                if let Some(system) = weak.upgrade() {
                    system.expiry_fired(key, now);
                }
            }),
        );
    }

    /// One pending expiry task fired: remove the entry iff it is still idle
    /// and old enough; otherwise re-arm or stand down.
    fn expiry_fired(self: &Arc<Self>, key: K, now: u64) {
        let next_due = {
            let _guard = self.admit_lock.lock();
            let Some(entry) = self.entries.get(&key).map(|e| e.value().clone()) else {
                return;
            };
            let deactivated_at = entry.state.lock().deactivated_at;
            if deactivated_at == u64::MAX {
                // Reactivated: release the pending slot, then close the
                // window where a deactivation raced the release.
                entry.in_expiry_queue.store(false, Ordering::Release);
                let again = entry.state.lock().deactivated_at;
                if again != u64::MAX && !entry.in_expiry_queue.swap(true, Ordering::AcqRel) {
                    Some(again + self.expiry_ticks)
                } else {
                    None
                }
            } else if now.saturating_sub(deactivated_at) >= self.expiry_ticks {
                if entry.value.try_shutdown() {
                    self.entries.remove(&key);
                    if let Err(e) = self.group.remove_child(entry.child) {
                        warn!("expired entry had no scheduling slot: {}", e);
                    }
                    debug!(
                        "removed idle entry after {}ms",
                        now.saturating_sub(deactivated_at)
                    );
                    None
                } else {
                    // An enqueue slipped in before its activation event was
                    // applied; check again a full interval later.
                    Some(now + self.expiry_ticks)
                }
            } else {
                Some(deactivated_at + self.expiry_ticks)
            }
        };
        if let Some(due) = next_due {
            self.schedule(&key, due);
        }
    }
}

impl<K, Q, M> SchedulingFlow<M> for ClientQueueSystem<K, Q, M>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    Q: ExpirableFlow<M> + Send + Sync + 'static,
    M: FlowMessage,
{
    fn try_dequeue(&self) -> (Option<M>, ActivationEvent) {
        self.group.try_dequeue()
    }

    fn activity(&self) -> ActivationEvent {
        self.group.activity()
    }

    fn bind_parent(&self, parent: ParentHandle<M>) -> SchedResult<()> {
        self.group.bind_parent(parent)
    }
}

impl<K, Q, M> ExpirableFlow<M> for ClientQueueSystem<K, Q, M>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    Q: ExpirableFlow<M> + Send + Sync + 'static,
    M: FlowMessage,
{
    fn try_shutdown(&self) -> bool {
        let _guard = self.admit_lock.lock();
        self.closed.store(true, Ordering::Release);
        let mut shut = Vec::new();
        for entry in self.entries.iter() {
            if entry.value().value.try_shutdown() {
                shut.push(entry.value().value.clone());
            } else {
                for flow in shut {
                    flow.reopen();
                }
                self.closed.store(false, Ordering::Release);
                return false;
            }
        }
        true
    }

    fn reopen(&self) {
        let _guard = self.admit_lock.lock();
        for entry in self.entries.iter() {
            entry.value().value.reopen();
        }
        self.closed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ClientJobQueue, QueueKey};

    const TICKS: u64 = 10_000;

    fn new_system(
        expiry: &Arc<ExpiryQueue>,
    ) -> Arc<ClientQueueSystem<String, ClientJobQueue<u64>, u64>> {
        ClientQueueSystem::new(
            Box::new(|name: &String| {
                ClientJobQueue::new(QueueKey {
                    owner: "owner".into(),
                    priority: 0,
                    name: name.clone(),
                })
            }),
            expiry.clone(),
            TICKS,
        )
    }

    #[test]
    fn get_or_add_returns_one_instance_per_key() -> SchedResult<()> {
        let expiry = ExpiryQueue::new(TICKS, 20);
        let system = new_system(&expiry);
        let a = system.get_or_add(&"builds".to_string())?;
        let b = system.get_or_add(&"builds".to_string())?;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(system.contains_key(&"builds".to_string()));
        assert_eq!(system.list_members().len(), 1);
        Ok(())
    }

    #[test]
    fn never_used_entry_expires() -> SchedResult<()> {
        let expiry = ExpiryQueue::new(TICKS, 20);
        let system = new_system(&expiry);
        system.get_or_add(&"idle".to_string())?;
        assert!(system.contains_key(&"idle".to_string()));

        expiry.sweep_at(expiry.now_ticks() + TICKS + 1);
        assert!(!system.contains_key(&"idle".to_string()));

        // Re-get builds a fresh queue with zero statistics.
        let fresh = system.get_or_add(&"idle".to_string())?;
        assert_eq!(fresh.stats().queued, 0);
        Ok(())
    }

    #[test]
    fn active_entry_survives_expiry_sweep() -> SchedResult<()> {
        let expiry = ExpiryQueue::new(TICKS, 20);
        let system = new_system(&expiry);
        let q = system.get_or_add(&"busy".to_string())?;
        q.enqueue(1)?;

        expiry.sweep_at(expiry.now_ticks() + TICKS + 1);
        assert!(system.contains_key(&"busy".to_string()));
        assert_eq!(system.try_dequeue().0, Some(1));
        Ok(())
    }

    #[test]
    fn drained_entry_expires_after_reidle() -> SchedResult<()> {
        let expiry = ExpiryQueue::new(TICKS, 20);
        let system = new_system(&expiry);
        let q = system.get_or_add(&"cycle".to_string())?;
        q.enqueue(1)?;
        // First sweep: active, so the pending task stands down.
        expiry.sweep_at(expiry.now_ticks() + TICKS + 1);
        assert!(system.contains_key(&"cycle".to_string()));

        // Drain; deactivation re-arms expiry.
        assert_eq!(system.try_dequeue().0, Some(1));
        expiry.sweep_at(expiry.now_ticks() + 2 * TICKS + 2);
        assert!(!system.contains_key(&"cycle".to_string()));
        Ok(())
    }

    #[test]
    fn closed_system_refuses_admissions() -> SchedResult<()> {
        let expiry = ExpiryQueue::new(TICKS, 20);
        let system = new_system(&expiry);
        system.get_or_add(&"a".to_string())?;
        assert!(system.try_shutdown());
        assert!(matches!(
            system.get_or_add(&"b".to_string()),
            Err(SchedError::QueueClosed)
        ));
        system.reopen();
        system.get_or_add(&"b".to_string())?;
        Ok(())
    }

    #[test]
    fn shutdown_aborts_when_a_member_is_busy() -> SchedResult<()> {
        let expiry = ExpiryQueue::new(TICKS, 20);
        let system = new_system(&expiry);
        let idle = system.get_or_add(&"idle".to_string())?;
        let busy = system.get_or_add(&"busy".to_string())?;
        busy.enqueue(5)?;

        assert!(!system.try_shutdown());
        // The rollback reopened the idle sibling.
        idle.enqueue(1)?;
        Ok(())
    }
}
