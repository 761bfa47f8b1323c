//! Job registration, deduplication and macro-job expansion.
//!
//! The jobs manager is the registry of live work: it deduplicates client
//! requests onto shared promises, routes cancellation from client tokens to
//! the owning job, and expands macro jobs — single queued entries that
//! lazily unfold into many micro-jobs at dequeue time, shared between every
//! client that submitted the same batch.

pub mod builder;
pub mod cancel_pool;
pub mod error;
pub mod macro_job;
pub mod macro_message;
pub mod manager;
pub mod message;
pub mod token;
pub mod worker;

pub use builder::ResultBuilder;
pub use cancel_pool::{CancelSourcePool, RentedSource};
pub use error::{JobError, JobResult};
pub use macro_job::{Expansion, MacroJob, PromiseRetriever};
pub use macro_message::MacroJobMessage;
pub use manager::{CancellableJob, JobsManager};
pub use message::{JobMessage, QueueMessage, WorkDescriptor};
pub use token::ClientToken;
pub use worker::Worker;
