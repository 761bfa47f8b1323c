use std::sync::Arc;

use pledged_common::QueueStats;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{SchedError, SchedResult};
use crate::expiry::ExpiryQueue;
use crate::flow::{
    ActivationEvent, ActivationSink, ChildId, FlowMessage, ParentHandle, SchedulingFlow,
};
use crate::group::SchedulingGroup;
use crate::queue::{ClientJobQueue, OwnerId, QueueKey};
use crate::system::ClientQueueSystem;

/// Inner layer: named queues of one owner at one priority.
pub type QueueSystem<M> = ClientQueueSystem<String, ClientJobQueue<M>, M>;
/// Outer layer: owners within one priority class.
pub type OwnerSystem<M> = ClientQueueSystem<OwnerId, QueueSystem<M>, M>;

/// Async hand-off between the scheduling tree and the dispatcher task.
///
/// Enqueue-side activations of the root group land here and wake the
/// dispatcher; dequeue-side state is applied inline by `try_dequeue`.
pub struct RootChannel<M: FlowMessage> {
    root: Arc<SchedulingGroup<M>>,
    notify: Notify,
}

impl<M: FlowMessage> ActivationSink<M> for RootChannel<M> {
    fn on_child_event(&self, _child: ChildId, event: ActivationEvent) {
        if event.activated {
            self.notify.notify_one();
        }
    }
}

impl<M: FlowMessage> RootChannel<M> {
    fn attach(root: &Arc<SchedulingGroup<M>>) -> SchedResult<Arc<Self>> {
        let channel = Arc::new(Self {
            root: root.clone(),
            notify: Notify::new(),
        });
        let sink: Arc<dyn ActivationSink<M>> = channel.clone();
        root.bind_parent(ParentHandle::new(Arc::downgrade(&sink), ChildId::ROOT))?;
        Ok(channel)
    }

    pub fn try_dequeue(&self) -> Option<M> {
        self.root.try_dequeue().0
    }

    /// Dequeue the next message, parking until the root activates. Returns
    /// `None` once `cancel` fires.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<M> {
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.try_dequeue() {
                return Some(message);
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }
}

struct Tier<M: FlowMessage> {
    system: Arc<OwnerSystem<M>>,
    child: ChildId,
}

/// A fixed array of priority classes composed over client queue systems.
///
/// Priority `p` defaults to weight `(p + 1) * 10`, so higher classes receive
/// proportionally more service; weights are reconfigurable at runtime.
pub struct PrioritizedQueueSystem<M: FlowMessage> {
    root: Arc<SchedulingGroup<M>>,
    tiers: Vec<Tier<M>>,
    channel: Arc<RootChannel<M>>,
}

impl<M: FlowMessage> PrioritizedQueueSystem<M> {
    pub fn new(
        count_priorities: u32,
        expiry: Arc<ExpiryQueue>,
        expiry_ticks: u64,
    ) -> SchedResult<Arc<Self>> {
        if count_priorities == 0 {
            return Err(SchedError::InvalidConfig(
                "count_priorities must be positive".into(),
            ));
        }
        let root = SchedulingGroup::new();
        let channel = RootChannel::attach(&root)?;
        let mut tiers = Vec::with_capacity(count_priorities as usize);
        for priority in 0..count_priorities {
            let system = Self::owner_system(priority, &expiry, expiry_ticks);
            let child = root.add_child(system.clone(), (priority + 1) * 10, None)?;
            tiers.push(Tier { system, child });
        }
        Ok(Arc::new(Self {
            root,
            tiers,
            channel,
        }))
    }

    fn owner_system(
        priority: u32,
        expiry: &Arc<ExpiryQueue>,
        expiry_ticks: u64,
    ) -> Arc<OwnerSystem<M>> {
        let inner_expiry = expiry.clone();
        ClientQueueSystem::new(
            Box::new(move |owner: &OwnerId| {
                let owner = owner.clone();
                ClientQueueSystem::new(
                    Box::new(move |name: &String| {
                        ClientJobQueue::new(QueueKey {
                            owner: owner.clone(),
                            priority,
                            name: name.clone(),
                        })
                    }),
                    inner_expiry.clone(),
                    expiry_ticks,
                )
            }),
            expiry.clone(),
            expiry_ticks,
        )
    }

    pub fn count_priorities(&self) -> u32 {
        self.tiers.len() as u32
    }

    pub fn get(&self, priority: u32) -> Option<Arc<OwnerSystem<M>>> {
        self.tiers.get(priority as usize).map(|t| t.system.clone())
    }

    pub fn priority_weight(&self, priority: u32) -> Option<u32> {
        let tier = self.tiers.get(priority as usize)?;
        self.root.child_weight(tier.child)
    }

    pub fn set_priority_weight(&self, priority: u32, weight: u32) -> SchedResult<()> {
        let tier = self
            .tiers
            .get(priority as usize)
            .ok_or_else(|| SchedError::InvalidConfig(format!("unknown priority {priority}")))?;
        self.root.set_weight(tier.child, weight)
    }

    /// Resolve (or create) the client job queue for one
    /// `(owner, priority, name)` tuple. Retries when resolution races idle
    /// expiry of an intermediate system.
    pub fn queue(
        &self,
        owner: &OwnerId,
        priority: u32,
        name: &str,
    ) -> SchedResult<Arc<ClientJobQueue<M>>> {
        let tier = self
            .tiers
            .get(priority as usize)
            .ok_or_else(|| SchedError::InvalidConfig(format!("unknown priority {priority}")))?;
        let name = name.to_string();
        for _ in 0..8 {
            let owners = tier.system.get_or_add(owner)?;
            match owners.get_or_add(&name) {
                Ok(queue) => return Ok(queue),
                Err(SchedError::QueueClosed) => {
                    std::thread::yield_now();
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(SchedError::InvariantViolation(
            "queue resolution kept racing idle expiry".into(),
        ))
    }

    pub fn channel(&self) -> Arc<RootChannel<M>> {
        self.channel.clone()
    }

    /// Per-queue account snapshots across every tier.
    pub fn stats(&self) -> Vec<QueueStats> {
        let mut out = Vec::new();
        for tier in &self.tiers {
            for (_, owners) in tier.system.list_members() {
                for (_, queue) in owners.list_members() {
                    out.push(queue.stats());
                }
            }
        }
        out
    }
}
