use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type ExpiryFn = Box<dyn FnOnce(u64) + Send>;

/// Single shared expiry queue driving idle-queue removal.
///
/// Time is measured in milliseconds since queue construction; callbacks land
/// in coarse buckets so one periodic timer serves every client queue system.
/// Callbacks run outside the queue's lock and re-schedule themselves when
/// their entry turns out not to be expirable yet.
pub struct ExpiryQueue {
    epoch: Instant,
    bucket_ms: u64,
    buckets: Mutex<BTreeMap<u64, Vec<ExpiryFn>>>,
}

impl ExpiryQueue {
    pub fn new(expiry_ticks: u64, bucket_count: u32) -> Arc<Self> {
        let bucket_ms = (expiry_ticks / u64::from(bucket_count.max(1))).max(1);
        Arc::new(Self {
            epoch: Instant::now(),
            bucket_ms,
            buckets: Mutex::new(BTreeMap::new()),
        })
    }

    /// Milliseconds since this queue was created.
    pub fn now_ticks(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn schedule_at(&self, due_tick: u64, f: ExpiryFn) {
        let bucket = due_tick / self.bucket_ms;
        self.buckets.lock().entry(bucket).or_default().push(f);
    }

    /// Fire every callback whose bucket is due at `now_tick`. Split out from
    /// the timer so tests can drive time explicitly.
    pub fn sweep_at(&self, now_tick: u64) {
        let due: Vec<ExpiryFn> = {
            let mut buckets = self.buckets.lock();
            let later = buckets.split_off(&(now_tick / self.bucket_ms + 1));
            let due = std::mem::replace(&mut *buckets, later);
            due.into_values().flatten().collect()
        };
        if !due.is_empty() {
            debug!("expiry sweep firing {} callbacks", due.len());
        }
        // Run callbacks outside the bucket lock: they take entry and group
        // locks and may re-schedule into this queue.
        for f in due {
            f(now_tick);
        }
    }

    pub fn pending(&self) -> usize {
        self.buckets.lock().values().map(Vec::len).sum()
    }

    /// Periodic timer task sweeping one bucket interval at a time.
    pub fn run(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(queue.bucket_ms));
            loop {
                tokio::select! {
                    _ = tick.tick() => queue.sweep_at(queue.now_ticks()),
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn fires_due_buckets_only() {
        let q = ExpiryQueue::new(1000, 20);
        let fired = Arc::new(AtomicU64::new(0));
        for due in [100u64, 200, 5000] {
            let fired = fired.clone();
            q.schedule_at(due, Box::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }
        q.sweep_at(250);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(q.pending(), 1);
        q.sweep_at(6000);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn callbacks_can_reschedule() {
        let q = ExpiryQueue::new(1000, 20);
        let fired = Arc::new(AtomicU64::new(0));
        {
            let q2 = q.clone();
            let fired = fired.clone();
            q.schedule_at(
                10,
                Box::new(move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                    let fired = fired.clone();
                    q2.schedule_at(2000, Box::new(move |_| {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }));
                }),
            );
        }
        q.sweep_at(100);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        q.sweep_at(2100);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
