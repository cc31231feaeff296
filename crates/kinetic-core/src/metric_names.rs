//! Metric names shared by every crate that records through the `metrics` facade.

// HTTP metrics
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

// Coordination metrics
pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "rate_limit_decisions_total";
pub const CACHE_LOOKUPS_TOTAL: &str = "cache_lookups_total";
pub const SCHEDULER_JOB_RUNS_TOTAL: &str = "scheduler_job_runs_total";
pub const PRESENCE_SWEEP_TRANSITIONS_TOTAL: &str = "presence_sweep_transitions_total";
pub const PRESENCE_ONLINE_USERS: &str = "presence_online_users";
