//! Abstract metrics interfaces and read-only stats snapshots

use serde::{Deserialize, Serialize};

/// Job-server metrics sink. Implementations forward to whatever metrics
/// backend the embedding process uses; the core never depends on one.
pub trait JobMetrics: Send + Sync {
    /// Record a promise submission against a named queue
    fn record_submission(&self, owner: &str, priority: u32, queue: &str);

    /// Record a dispatched micro-job
    fn record_dispatch(&self, owner: &str, priority: u32, queue: &str);

    /// Record a completed micro-job with its outcome kind
    fn record_completion(&self, outcome: &str);

    /// Record the current size of a client queue
    fn record_queue_size(&self, owner: &str, priority: u32, queue: &str, size: u64);
}

/// No-op sink used when the embedder does not wire a backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJobMetrics;

impl JobMetrics for NullJobMetrics {
    fn record_submission(&self, _owner: &str, _priority: u32, _queue: &str) {}
    fn record_dispatch(&self, _owner: &str, _priority: u32, _queue: &str) {}
    fn record_completion(&self, _outcome: &str) {}
    fn record_queue_size(&self, _owner: &str, _priority: u32, _queue: &str, _size: u64) {}
}

/// Snapshot of one client queue's scheduling account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub owner: String,
    pub priority: u32,
    pub queue: String,
    /// Total messages ever enqueued
    pub queued: u64,
    /// Total messages dequeued for dispatch
    pub served: u64,
    /// Accumulated weighted charge
    pub charged: u64,
}

/// Snapshot of one live macro job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroJobStats {
    pub promise_id: String,
    pub participants: i64,
}

/// Snapshot of the promise store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Incomplete promises held by strong reference
    pub live_strong: usize,
    /// Completed promises held by weak handle
    pub live_weak: usize,
    /// Blobs written to the KV store since open
    pub persisted: u64,
    /// Dead weak handles pruned by housekeeping
    pub swept: u64,
}

/// Aggregate server snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStats {
    pub store: StoreStats,
    pub queues: Vec<QueueStats>,
    pub macro_jobs: Vec<MacroJobStats>,
    pub taken_at: chrono::DateTime<chrono::Utc>,
}
