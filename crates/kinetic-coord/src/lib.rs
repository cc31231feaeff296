//! Coordination primitives built on the shared key-value store.
//!
//! None of these components hold an in-process lock. Atomicity comes only
//! from the store's own increment primitives; every other read-modify-write
//! (presence indices, session indices, login-attempt records) can race and
//! the last writer wins.

pub mod jobs;
pub mod presence;
pub mod rate_limit;
pub mod scheduler;
pub mod session;

pub use crate::presence::{
    PresenceRecord, PresenceSettings, PresenceStats, PresenceStatus, PresenceTracker,
    PresenceUpdate, SweepReport,
};
pub use crate::rate_limit::{
    BypassRules, KeyGenerator, ProgressiveDecision, ProgressiveLockout, RateLimitDecision,
    RateLimitGuard, RateLimitOutcome, RateLimitPolicy, RateLimitSettings, RateLimiter,
    RequestIdentity, RouteClass,
};
pub use crate::scheduler::{
    CronSchedule, JobHandler, JobOverride, JobRunReport, JobScheduler, ManualTicker,
    ScheduledJob, SchedulerSettings, Ticker, TimerHandle, TokioTicker,
};
pub use crate::session::{
    BlockStatus, CompactionReport, LoginAttemptRecord, NewSession, SessionCoordinator,
    SessionRecord, SessionSettings, SessionStats,
};
