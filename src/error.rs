use thiserror::Error;

#[derive(Debug, Error)]
pub enum CqfError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("filter is full: needed {needed} free slots, {available} available")]
    CapacityExhausted { needed: u64, available: u64 },

    #[error("lock for region {region} is held by another writer")]
    LockContended { region: usize },

    #[error("malformed persisted filter: {0}")]
    MalformedPersisted(String),

    #[error("incompatible filters: {0}")]
    IncompatibleMerge(String),

    #[error("buffered filter has no fast tier")]
    FastTierMissing,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mmap failed: {0}")]
    Mmap(std::io::Error),
}

impl CqfError {
    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CqfError::LockContended { .. })
    }
}

pub type Result<T> = std::result::Result<T, CqfError>;
