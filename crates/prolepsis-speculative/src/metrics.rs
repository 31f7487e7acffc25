//! Prometheus-style metrics for the speculative engine.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a cache hit
pub fn record_hit(latency: Duration) {
    counter!("prolepsis_cache_hits_total").increment(1);
    histogram!("prolepsis_lookup_duration_seconds", "result" => "hit")
        .record(latency.as_secs_f64());
}

/// Record a cache miss and the synchronous build it caused
pub fn record_miss(latency: Duration) {
    counter!("prolepsis_cache_misses_total").increment(1);
    histogram!("prolepsis_lookup_duration_seconds", "result" => "miss")
        .record(latency.as_secs_f64());
}

/// Record a commit gate rejection
pub fn record_gate_rejection() {
    counter!("prolepsis_commit_rejections_total").increment(1);
}

/// Record an executed commitment
pub fn record_commit() {
    counter!("prolepsis_commits_total").increment(1);
}

/// Record a confirmed commitment
pub fn record_confirmation() {
    counter!("prolepsis_confirmations_total").increment(1);
}

/// Record a completed rollback
pub fn record_rollback(reason: &'static str) {
    counter!("prolepsis_rollbacks_total", "reason" => reason).increment(1);
}

/// Record an escalated rollback
pub fn record_escalation() {
    counter!("prolepsis_rollback_escalations_total").increment(1);
}

/// Record an LRU eviction
pub fn record_eviction() {
    counter!("prolepsis_cache_evictions_total").increment(1);
}

/// Record a failed build
pub fn record_build_failure(path: &'static str) {
    counter!("prolepsis_build_failures_total", "path" => path).increment(1);
}

/// Record a background precompute tick
pub fn record_tick(built: usize, duration: Duration) {
    counter!("prolepsis_precomputed_total").increment(built as u64);
    histogram!("prolepsis_tick_duration_seconds").record(duration.as_secs_f64());
}

/// Update resident cache and open commitment gauges
pub fn record_occupancy(entries: usize, open_commitments: usize) {
    gauge!("prolepsis_cache_entries").set(entries as f64);
    gauge!("prolepsis_open_commitments").set(open_commitments as f64);
}
