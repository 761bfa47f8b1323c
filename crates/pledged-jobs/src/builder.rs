use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pledged_store::{Outcome, Payload, Promise, PromiseId, SCHEMA_PROMISE_LIST};
use tracing::debug;

use crate::error::{JobError, JobResult};

/// Promise-list accumulator behind a macro job's aggregated result.
///
/// Collects child promises at contiguous indices and completes the
/// aggregated promise exactly once: with the id list on success, with a
/// cancellation outcome when the last participant withdraws, or with the
/// first error observed.
pub struct ResultBuilder {
    promise: Arc<Promise>,
    members: Mutex<Vec<Arc<Promise>>>,
    complete: AtomicBool,
}

impl ResultBuilder {
    pub fn new(promise: Arc<Promise>) -> Arc<Self> {
        Arc::new(Self {
            promise,
            members: Mutex::new(Vec::new()),
            complete: AtomicBool::new(false),
        })
    }

    pub fn promise(&self) -> Arc<Promise> {
        self.promise.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire) || self.promise.is_complete()
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    /// Record the child promise at `index`. Indices must form a contiguous
    /// prefix; a gap means the producer's counting broke.
    pub fn set_member(&self, index: usize, child: Arc<Promise>) -> JobResult<()> {
        let mut members = self.members.lock();
        match index.cmp(&members.len()) {
            std::cmp::Ordering::Less => {
                members[index] = child;
                Ok(())
            }
            std::cmp::Ordering::Equal => {
                members.push(child);
                Ok(())
            }
            std::cmp::Ordering::Greater => Err(JobError::InvariantViolation(format!(
                "member index {index} skips past {}",
                members.len()
            ))),
        }
    }

    /// Complete the aggregated promise. The first caller wins; later calls
    /// are swallowed and report false.
    pub fn try_complete(&self, count: usize, error: Option<JobError>) -> bool {
        if self.complete.swap(true, Ordering::AcqRel) {
            if let Some(error) = error {
                debug!("late completion swallowed: {}", error);
            }
            return false;
        }
        let outcome = match error {
            None => {
                let members = self.members.lock();
                let ids: Vec<PromiseId> = members.iter().take(count).map(|p| p.id()).collect();
                match bincode::serialize(&ids) {
                    Ok(bytes) => Outcome::Value(Payload::new(SCHEMA_PROMISE_LIST, bytes)),
                    Err(e) => Outcome::Error {
                        kind: "encode".into(),
                        message: e.to_string(),
                    },
                }
            }
            Some(JobError::Canceled { .. }) => Outcome::Canceled,
            Some(error) => Outcome::Error {
                kind: "execution".into(),
                message: error.to_string(),
            },
        };
        self.promise.complete(outcome);
        true
    }

    /// Wait until every collected child promise has completed.
    pub async fn wait_for_all_promises(&self) {
        let members = self.members.lock().clone();
        for child in members {
            child.wait_complete().await;
        }
    }
}
