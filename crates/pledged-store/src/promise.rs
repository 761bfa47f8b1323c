use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::id::PromiseId;
use crate::payload::{Outcome, Payload};

type UpdateFn = Box<dyn FnOnce(&Promise) + Send>;

/// A first-class identity for a future or completed computation result.
///
/// Completion is sticky: once `is_complete` returns true it never reverts,
/// and every update subscriber registered before the transition observes it
/// exactly once, in registration order.
pub struct Promise {
    id: PromiseId,
    complete: AtomicBool,
    inner: Mutex<PromiseInner>,
    done: Notify,
}

struct PromiseInner {
    input: Option<Payload>,
    outcome: Option<Outcome>,
    subscribers: Vec<UpdateFn>,
}

impl Promise {
    pub fn new(id: PromiseId, input: Option<Payload>, outcome: Option<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            id,
            complete: AtomicBool::new(outcome.is_some()),
            inner: Mutex::new(PromiseInner {
                input,
                outcome,
                subscribers: Vec::new(),
            }),
            done: Notify::new(),
        })
    }

    pub fn id(&self) -> PromiseId {
        self.id
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn input(&self) -> Option<Payload> {
        self.inner.lock().input.clone()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.lock().outcome.clone()
    }

    /// Register a callback for the incomplete→complete transition. Returns
    /// false (without registering) when the promise is already complete;
    /// the transition has happened and will not happen again.
    pub fn subscribe(&self, f: impl FnOnce(&Promise) + Send + 'static) -> bool {
        let mut inner = self.inner.lock();
        if inner.outcome.is_some() {
            return false;
        }
        inner.subscribers.push(Box::new(f));
        true
    }

    /// Complete the promise. The first caller wins; later calls are no-ops
    /// returning false. Subscribers run on the completing thread, after the
    /// completion flag is visible.
    pub fn complete(&self, outcome: Outcome) -> bool {
        let subscribers = {
            let mut inner = self.inner.lock();
            if inner.outcome.is_some() {
                return false;
            }
            inner.outcome = Some(outcome);
            self.complete.store(true, Ordering::Release);
            std::mem::take(&mut inner.subscribers)
        };
        for f in subscribers {
            f(self);
        }
        self.done.notify_waiters();
        true
    }

    /// Wait until the promise completes; returns immediately if it already
    /// has.
    pub async fn wait_complete(&self) {
        loop {
            let notified = self.done.notified();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id)
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn payload(bytes: &[u8]) -> Payload {
        Payload::new(2, bytes.to_vec())
    }

    #[test]
    fn completion_is_first_wins_and_sticky() {
        let p = Promise::new(PromiseId::new(1, 1), None, None);
        assert!(!p.is_complete());
        assert!(p.complete(Outcome::Value(payload(b"a"))));
        assert!(!p.complete(Outcome::Value(payload(b"b"))));
        assert!(p.is_complete());
        assert_eq!(p.outcome(), Some(Outcome::Value(payload(b"a"))));
    }

    #[test]
    fn subscribers_fire_exactly_once_in_order() {
        let p = Promise::new(PromiseId::new(1, 2), None, None);
        let hits = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let hits = hits.clone();
            assert!(p.subscribe(move |_| hits.lock().push(tag)));
        }
        p.complete(Outcome::Canceled);
        assert_eq!(*hits.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn late_subscribe_is_refused() {
        let p = Promise::new(PromiseId::new(1, 3), None, Some(Outcome::Canceled));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        assert!(!p.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wait_complete_wakes_on_completion() {
        let p = Promise::new(PromiseId::new(1, 4), None, None);
        let waiter = {
            let p = p.clone();
            tokio::spawn(async move { p.wait_complete().await })
        };
        tokio::task::yield_now().await;
        p.complete(Outcome::Value(payload(b"done")));
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn wait_complete_returns_immediately_when_done() {
        let p = Promise::new(PromiseId::new(1, 5), None, Some(Outcome::Canceled));
        p.wait_complete().await;
    }
}
