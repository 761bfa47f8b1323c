use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

struct PoolInner {
    free: Mutex<Vec<CancellationToken>>,
    generation: AtomicU64,
}

/// A free-list of reusable cancellation sources.
///
/// Only never-triggered tokens live in the pool. A rented source returns on
/// drop unless it was fired; returning a triggered source is asserted
/// against, and the generation tag makes use-after-return detectable.
#[derive(Clone)]
pub struct CancelSourcePool {
    inner: Arc<PoolInner>,
}

impl CancelSourcePool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn rent(&self) -> RentedSource {
        let token = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(CancellationToken::new);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        trace!("rented cancellation source generation {}", generation);
        RentedSource {
            pool: self.inner.clone(),
            token,
            generation,
            fired: false,
        }
    }

    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Relaxed)
    }
}

impl Default for CancelSourcePool {
    fn default() -> Self {
        Self::new()
    }
}

/// One rented cancellation source for the lifetime of one macro-job run.
pub struct RentedSource {
    pool: Arc<PoolInner>,
    token: CancellationToken,
    generation: u64,
    fired: bool,
}

impl RentedSource {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Trigger the source. Consumes the rental: a triggered source never
    /// goes back into the pool.
    pub fn fire(mut self) {
        self.fired = true;
        self.token.cancel();
    }
}

impl Drop for RentedSource {
    fn drop(&mut self) {
        if self.fired {
            return;
        }
        assert!(
            !self.token.is_cancelled(),
            "triggered cancellation source returned to the pool"
        );
        self.pool.free.lock().push(self.token.clone());
    }
}
