use thiserror::Error;

pub type SchedResult<T> = Result<T, SchedError>;

#[derive(Error, Debug)]
pub enum SchedError {
    /// A condition that must never occur in correct code: double admission,
    /// a dequeue from a child that lied about its activity, pool misuse.
    #[error("scheduling invariant violated: {0}")]
    InvariantViolation(String),
    /// The flow has been shut down by idle expiry; re-resolve and retry.
    #[error("queue closed")]
    QueueClosed,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
