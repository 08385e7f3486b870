// src/core/metrics.rs

//! Defines and registers Prometheus metrics for membership and merge monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Gauge, Histogram, TextEncoder, register_counter_vec, register_gauge,
    register_histogram,
};

lazy_static! {
    // --- Membership Gauges ---
    /// The number of members in the currently published view.
    pub static ref MEMBER_COUNT: Gauge =
        register_gauge!("gridmerge_members", "Number of members in the current member list.").unwrap();
    /// The version of the currently published view.
    pub static ref MEMBER_LIST_VERSION: Gauge =
        register_gauge!("gridmerge_member_list_version", "Version of the current member list.").unwrap();
    /// The number of members that are unreachable but not yet removed.
    pub static ref MISSING_MEMBERS: Gauge =
        register_gauge!("gridmerge_missing_members", "Number of members currently suspected missing.").unwrap();
    /// A boolean gauge indicating if a split-brain merge is in progress.
    pub static ref MERGE_IN_PROGRESS: Gauge =
        register_gauge!("gridmerge_merge_in_progress", "Split-brain merge in progress (1 for true, 0 for false).").unwrap();

    // --- Counters ---
    /// Merge attempts by final outcome (`merged`, `failed`, `ignored`).
    pub static ref MERGES_TOTAL: CounterVec =
        register_counter_vec!("gridmerge_merges_total", "Total number of merge attempts, labeled by outcome.", &["outcome"]).unwrap();
    /// Incoming merge entries by the decision the policy produced.
    pub static ref MERGED_ENTRIES_TOTAL: CounterVec =
        register_counter_vec!("gridmerge_merged_entries_total", "Total number of merged entries, labeled by decision.", &["decision"]).unwrap();

    // --- Histograms ---
    /// Wall-clock duration of successful merges.
    pub static ref MERGE_DURATION_SECONDS: Histogram =
        register_histogram!("gridmerge_merge_duration_seconds", "Duration of completed split-brain merges.").unwrap();
}

/// Gathers all registered metrics and encodes them into the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# failed to encode metrics: {e}"))
}
