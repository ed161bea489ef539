//! Metric name constants, mirrored after `cyclotron_core::metrics_consts`.

/// Increments a label-less counter via `common-metrics`. Small wrapper so
/// call sites in `engine.rs` don't need to spell out an empty label slice
/// every time.
pub fn inc_counter(name: &'static str) {
    common_metrics::inc(name, &[], 1);
}

pub const ENQUEUE_ATTEMPT: &str = "jobqueue_enqueue_attempt";
pub const ENQUEUE_DEDUPED: &str = "jobqueue_enqueue_deduped";
pub const ENQUEUE_CREATED: &str = "jobqueue_enqueue_created";

pub const DEQUEUE_ATTEMPT: &str = "jobqueue_dequeue_attempt";
pub const DEQUEUE_RETRY: &str = "jobqueue_dequeue_retry";
pub const DEQUEUE_EMPTY: &str = "jobqueue_dequeue_empty";
pub const DEQUEUE_ASSIGNED: &str = "jobqueue_dequeue_assigned";

pub const FINISH_ATTEMPT: &str = "jobqueue_finish_attempt";
pub const FINISH_SUCCEEDED: &str = "jobqueue_finish_succeeded";
pub const FINISH_FAILED: &str = "jobqueue_finish_failed";
