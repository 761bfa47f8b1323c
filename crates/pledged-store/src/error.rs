use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid promise id: {0}")]
    InvalidPromiseId(String),
    #[error("payload of {size} bytes exceeds the persistence limit")]
    OversizePayload { size: usize },
    #[error("persistence: {0}")]
    Persistence(String),
    #[error("corrupt blob for promise {id}")]
    Corrupt { id: String },
    #[error("invalid store options: {0}")]
    InvalidOptions(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<fjall::Error> for StoreError {
    fn from(e: fjall::Error) -> Self {
        StoreError::Persistence(e.to_string())
    }
}
