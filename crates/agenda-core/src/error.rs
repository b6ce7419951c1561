//! Error types for the job processor.

use thiserror::Error;

/// Errors surfaced by the processor itself (not by user handlers).
#[derive(Debug, Error)]
pub enum AgendaError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("job definition {0:?} is not registered")]
    UnknownDefinition(String),

    #[error("stop timed out after {0:?} with jobs still running")]
    StopTimeout(std::time::Duration),

    #[error("processor is already running")]
    AlreadyRunning,

    #[error("processor is not running")]
    NotRunning,
}

/// Errors returned by a [`crate::repository::JobRepository`] implementation.
///
/// These are always treated as transient by the core (§7): they are logged
/// and reported on the `error` event stream, never allowed to crash the tick
/// loop.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("backend connection error: {0}")]
    Connection(String),

    #[error("backend query error: {0}")]
    Query(String),

    #[error("job {0} not found")]
    NotFound(uuid::Uuid),
}

/// Errors computing a repeating job's next `nextRunAt` (§4.J, §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("failed to calculate nextRunAt due to invalid repeat interval")]
    InvalidRepeatInterval,

    #[error("failed to calculate nextRunAt due to invalid repeatAt time")]
    InvalidRepeatAt,

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("job has passed its endDate with no remaining occurrences")]
    PastEndDate,
}

/// The outcome a user handler reports back to the dispatcher (§4.H, §4.J).
#[derive(Debug, Error)]
pub enum JobError {
    /// The handler returned/signaled a failure with a human message.
    #[error("{0}")]
    Failed(String),

    /// The liveness watchdog detected an expired lease mid-execution (§4.H, §7).
    #[error("execution canceled, took more than {0}ms")]
    WatchdogTimeout(i64),
}
