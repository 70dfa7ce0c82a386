//! Log-Backed Storage (LBS) server: an append-only, fixed-block-size
//! storage service backed by a remote DynamoDB-KV store, serving one
//! client connection at a time.

pub mod config;
pub mod deletion;
pub mod dispatch;
pub mod error;
pub mod kv;
pub mod logging;
pub mod metrics;
pub mod objmap;
pub mod proto;
pub mod storage;
