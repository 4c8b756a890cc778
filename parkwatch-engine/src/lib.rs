//! The parkwatch core: task planning, bounded capture execution,
//! change inference, and scheduling.
//!
//! Control flow: the [Scheduler] discovers work and materializes tasks
//! through [planner::plan]; the [ExecutionEngine] pulls due tasks and
//! runs capture + detection under two layered semaphores; every
//! completed snapshot is posted to the [ChangeEngine], which diffs it
//! against the previous snapshot of the same camera and writes change
//! rows.
//!
//! All process-wide knobs arrive through [EngineConfig] at
//! construction. There are no globals.

use std::time::Duration;

pub mod change;
pub mod executor;
pub mod planner;
pub mod scheduler;

pub use change::ChangeEngine;
pub use executor::ExecutionEngine;
pub use planner::{plan, PlanRequest};
pub use scheduler::{RerunTarget, RunNowOutcome, Scheduler};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Rejected synchronously before any state change.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("store failure: {0}")]
    Store(#[from] parkwatch_store::Error),
    #[error("{0}")]
    Types(#[from] parkwatch_types::Error),
    #[error("detector failure: {0}")]
    Detect(#[from] parkwatch_detect::Error),
    #[error("worker panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// The engine is draining; no new work is accepted.
    #[error("shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Process-wide tuning, injected at engine construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global permit count across all combos.
    pub max_combo_concurrency: usize,
    /// Permit count within one `(ip, channel)` combo.
    pub max_workers_per_combo: usize,
    /// RTSP connect limit.
    pub rtsp_connect_timeout: Duration,
    /// Transport retries after the first attempt.
    pub task_retry_count: u32,
    /// Sleep between transport retries.
    pub retry_backoff: Duration,
    /// Task deadline is `max(30 s, deadline_factor x window)`.
    pub task_deadline_factor: u32,
    /// Zone for day boundaries and trigger times.
    pub wall_timezone: chrono_tz::Tz,
    /// How long in-flight tasks get to finish on shutdown.
    pub drain_grace: Duration,
    /// Auto-rule poll cadence.
    pub rule_tick: Duration,
    /// Stuck-`playing` sweep cadence.
    pub reaper_tick: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_combo_concurrency: 4,
            max_workers_per_combo: 2,
            rtsp_connect_timeout: Duration::from_secs(10),
            task_retry_count: 2,
            retry_backoff: Duration::from_secs(2),
            task_deadline_factor: 2,
            wall_timezone: chrono_tz::Asia::Shanghai,
            drain_grace: Duration::from_secs(15),
            rule_tick: Duration::from_secs(30),
            reaper_tick: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Wall deadline for one task, measured from entering `playing`.
    pub(crate) fn deadline_for(&self, window_secs: i64) -> Duration {
        let scaled = (self.task_deadline_factor as i64).saturating_mul(window_secs.max(0));
        Duration::from_secs(scaled.max(30) as u64)
    }

    /// Frame read limit: `min(30 s, window)`.
    pub(crate) fn read_timeout_for(&self, window_secs: i64) -> Duration {
        Duration::from_secs(window_secs.clamp(1, 30) as u64)
    }
}
