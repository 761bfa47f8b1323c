//! Hierarchical weighted-fair scheduling.
//!
//! A *flow* is the leaf abstraction producing messages; a *group*
//! multiplexes child flows with deficit-weighted round-robin. Client queues
//! are keyed collections of equally-weighted flows with idle expiry, and the
//! prioritized system composes a fixed number of weighted tiers under one
//! root that feeds the dispatcher.
//!
//! All primitives are synchronous and lock-guarded; nothing awaits while
//! holding a lock. Activation events carry per-child monotone counters so
//! out-of-order delivery is detected and discarded.

pub mod account;
pub mod error;
pub mod expiry;
pub mod flow;
pub mod group;
pub mod priority;
pub mod queue;
pub mod system;

pub use account::{SchedulingAccount, CHARGE_SCALE};
pub use error::{SchedError, SchedResult};
pub use expiry::ExpiryQueue;
pub use flow::{
    ActivationEvent, ActivationSink, Attachment, ChildId, ExpirableFlow, FlowMessage, GroupEvent,
    ParentHandle, SchedulingFlow,
};
pub use group::{SchedulingGroup, DEFAULT_WEIGHT};
pub use priority::{OwnerSystem, PrioritizedQueueSystem, QueueSystem, RootChannel};
pub use queue::{ClientJobQueue, OwnerId, QueueKey};
pub use system::ClientQueueSystem;
