//! Prometheus metrics for the deletion controller and the KV request queue,
//! in the shape of the teacher's `timeline_metrics.rs` (`Lazy` statics
//! wrapping `register_*_vec!` macros), but over the plain `prometheus` crate
//! rather than the teacher's internal workspace wrapper around it.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};

pub static DELETES_ISSUED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lbsd_deletes_issued_total",
        "Total number of DELETE operations issued against the KV backend"
    )
    .unwrap()
});

pub static DELETED_TO_WRITES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lbsd_deleted_to_writes_total",
        "Total number of DeletedTo watermark writes"
    )
    .unwrap()
});

pub static KV_REQUESTS_SENT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lbsd_kv_requests_sent_total",
        "Total number of KV requests sent to the backend"
    )
    .unwrap()
});

pub static KV_REQUESTS_RETRIED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lbsd_kv_requests_retried_total",
        "Total number of KV requests retried after a transient or throttle failure"
    )
    .unwrap()
});

pub static KV_THROTTLE_EPISODES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lbsd_kv_throttle_episodes_total",
        "Total number of times the KV queue entered a rate-limited state"
    )
    .unwrap()
});

pub static KV_INFLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "lbsd_kv_requests_inflight",
        "Number of KV requests currently in flight"
    )
    .unwrap()
});
