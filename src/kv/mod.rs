//! The DynamoDB-backed KV request queue: a prioritized, rate-limited,
//! retrying scheduler sitting between the dispatcher/deletion controller and
//! the DynamoDB-KV backend.

pub mod client;
mod heap;
mod queue;

pub use client::{contains_throttle_marker, DynamoKv, KvBackend, KvCallError, KvOp, KvOutcome};
pub use queue::{KvQueue, KvQueueHandle, KvResult};
