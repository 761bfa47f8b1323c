use thiserror::Error;
use ulid::Ulid;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Error, Debug)]
pub enum JobError {
    /// Expected control flow; carries the identity of the triggering token
    /// so local and foreign cancellation are distinguishable.
    #[error("canceled by token {token}")]
    Canceled { token: Ulid },
    /// A macro-job message's expansion was requested a second time.
    #[error("expansion already enumerated")]
    AlreadyEnumerated,
    /// Surfaced by a worker; stored on the child promise.
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("job invariant violated: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Sched(#[from] pledged_sched::SchedError),
    #[error(transparent)]
    Store(#[from] pledged_store::StoreError),
}

impl JobError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, JobError::Canceled { .. })
    }
}
