//! Observability implementations for the job server

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pledged_common::{HealthCheck, HealthCheckResult, HealthStatus, JobMetrics};

use crate::server::JobServer;

/// In-process metrics sink counting submissions, dispatches and outcomes.
#[derive(Clone, Default)]
pub struct CountingMetrics {
    inner: Arc<CountersInner>,
}

#[derive(Default)]
struct CountersInner {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    completions: Mutex<HashMap<String, u64>>,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    pub fn dispatched(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    pub fn completions(&self, outcome: &str) -> u64 {
        self.inner
            .completions
            .lock()
            .get(outcome)
            .copied()
            .unwrap_or(0)
    }
}

impl JobMetrics for CountingMetrics {
    fn record_submission(&self, _owner: &str, _priority: u32, _queue: &str) {
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dispatch(&self, _owner: &str, _priority: u32, _queue: &str) {
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn record_completion(&self, outcome: &str) {
        *self
            .inner
            .completions
            .lock()
            .entry(outcome.to_string())
            .or_insert(0) += 1;
    }

    fn record_queue_size(&self, _owner: &str, _priority: u32, _queue: &str, _size: u64) {}
}

/// Health probe over a running server: warns when incomplete promises pile
/// up against a backlogged scheduler.
pub struct ServerHealthCheck {
    server: Arc<JobServer>,
}

impl ServerHealthCheck {
    pub fn new(server: Arc<JobServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl HealthCheck for ServerHealthCheck {
    fn name(&self) -> &str {
        "job-server"
    }

    async fn check(&self) -> HealthCheckResult {
        let stats = self.server.stats();
        let backlog: u64 = stats
            .queues
            .iter()
            .map(|q| q.queued.saturating_sub(q.served))
            .sum();
        if backlog > 10_000 {
            let mut result = HealthCheckResult::critical(
                self.name(),
                format!("{backlog} messages awaiting dispatch"),
            );
            result.status = HealthStatus::Warning;
            return result;
        }
        HealthCheckResult::healthy(self.name())
    }

    fn is_critical(&self) -> bool {
        true
    }
}
