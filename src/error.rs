//! Crate-local error types for library-surface boundaries.
//!
//! Task- and `main`-level code uses `anyhow::Result` for context-carrying
//! propagation; these enums sit at the boundaries of the `proto`, `kv`, and
//! `storage` modules where callers want to match on the failure kind.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("frame exceeds maximum size ({len} > {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("append length {got} does not match declared block length {expected}")]
    AppendLengthMismatch { got: usize, expected: usize },

    #[error("append count {count} overflows against block length {blocklen}")]
    AppendCountOverflow { count: u64, blocklen: u64 },

    #[error("unknown request type tag {0}")]
    UnknownRequestType(u8),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("DynamoDB-KV request failed with non-retryable status: {0}")]
    NonRetryable(String),

    #[error("item has unexpected size: expected {expected} bytes, got {got}")]
    UnexpectedSize { expected: usize, got: usize },

    #[error("KV request queue is shut down")]
    QueueClosed,

    #[error("request was cancelled by a queue flush")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Kv(#[from] KvError),
}
