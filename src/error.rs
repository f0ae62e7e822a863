use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The task was cancelled. Surfaced as-is, never retried at this layer.
    #[error("download cancelled")]
    Cancelled,

    #[error("block {block_index} tried to negotiate the block layout, only block 0 may")]
    ProtocolViolation { block_index: usize },

    #[error("block count from strategy must be larger than 0, the current one is {0}")]
    InvalidBlockCount(usize),

    #[error("failed to persist breakpoint for task {id}")]
    PersistenceFailure { id: String },

    #[error("fetched length doesn't match the expected length, {actual} != {expected}")]
    IntegrityMismatch { expected: u64, actual: u64 },

    #[error("no block with index {0} in breakpoint")]
    MissingBlock(usize),

    #[error("remote file changed since the breakpoint was stored ({expected} -> {actual})")]
    ResourceChanged { expected: String, actual: String },

    #[error("unexpected response status {0}")]
    UnexpectedStatus(u16),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
