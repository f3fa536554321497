//! Operator metrics.

/// Total number of handler chain passes run against deploy requests.
pub const METRIC_CHAIN_PASSES: &str = "stagedeploy_chain_passes_total";
/// Total number of handler chain passes which returned an error.
pub const METRIC_CHAIN_ERRORS: &str = "stagedeploy_chain_errors_total";
/// Total number of deploy jobs submitted to the pipeline engine.
pub const METRIC_JOBS_SUBMITTED: &str = "stagedeploy_jobs_submitted_total";
/// Total number of held deploy jobs released by the admission queue.
pub const METRIC_JOBS_RELEASED: &str = "stagedeploy_jobs_released_total";
/// Total number of deploy requests which reached the completed state.
pub const METRIC_REQUESTS_COMPLETED: &str = "stagedeploy_requests_completed_total";
/// Total number of status writes rejected due to a conflicting concurrent write.
pub const METRIC_STATUS_CONFLICTS: &str = "stagedeploy_status_conflicts_total";

/// Register the operator's metrics.
///
/// This function should be called only once, early in the lifetime of the process.
pub fn register_operator_metrics() {
    metrics::register_counter!(METRIC_CHAIN_PASSES, metrics::Unit::Count, "Total number of handler chain passes.");
    metrics::register_counter!(METRIC_CHAIN_ERRORS, metrics::Unit::Count, "Total number of failed handler chain passes.");
    metrics::register_counter!(METRIC_JOBS_SUBMITTED, metrics::Unit::Count, "Total number of deploy jobs submitted.");
    metrics::register_counter!(METRIC_JOBS_RELEASED, metrics::Unit::Count, "Total number of held deploy jobs released.");
    metrics::register_counter!(METRIC_REQUESTS_COMPLETED, metrics::Unit::Count, "Total number of completed deploy requests.");
    metrics::register_counter!(METRIC_STATUS_CONFLICTS, metrics::Unit::Count, "Total number of conflicting status writes.");
}
