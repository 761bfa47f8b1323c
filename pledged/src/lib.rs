//! pledged: a deduplicating promise job server.
//!
//! Clients submit compute requests against promises; identical requests
//! collapse onto shared work, the hierarchical fair scheduler spreads
//! service across priority classes and per-client queues, macro jobs expand
//! lazily into micro-jobs at dequeue time, and completed promise payloads
//! are shed to a fjall-backed key-value store.

pub mod config;
mod dispatcher;
pub mod observability;
pub mod server;

pub use config::{ConfigError, CoreConfig};
pub use observability::{CountingMetrics, ServerHealthCheck};
pub use server::JobServer;

pub use pledged_common::{
    HealthCheck, HealthCheckResult, HealthStatus, JobMetrics, MacroJobStats, NullJobMetrics,
    QueueStats, ServerStats, StoreStats,
};
pub use pledged_jobs::{
    ClientToken, Expansion, JobError, PromiseRetriever, WorkDescriptor, Worker,
};
pub use pledged_store::{
    Outcome, Payload, Promise, PromiseId, SchemaRegistry, SCHEMA_ERROR, SCHEMA_PROMISE_LIST,
};
