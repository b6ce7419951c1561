//! §6.5 Configuration options.

use chrono::Duration;

use crate::definition::DEFAULT_LOCK_LIFETIME;
use crate::error::ScheduleError;
use crate::interval::parse_ms_or_human;
use crate::job::Priority;

/// Process-level configuration (§6.5). `forkedWorker` (child-process
/// execution mode) is explicitly out of scope (§1) and has no field here.
#[derive(Debug, Clone)]
pub struct AgendaConfig {
    /// Worker identity; used to filter out self-originated remote state
    /// events (§5, §6.2) and as the `source` of published state events.
    pub name: String,
    /// Poll period.
    pub process_every: Duration,
    pub default_concurrency: usize,
    pub max_concurrency: usize,
    /// 0 = unbounded.
    pub default_lock_limit: usize,
    /// 0 = unbounded. Also called `totalLockLimit`.
    pub lock_limit: usize,
    pub default_lock_lifetime: Duration,
    pub default_priority: Priority,
}

impl AgendaConfig {
    /// Parses `process_every` from either a millisecond integer or a human
    /// interval string (§6.5).
    pub fn with_process_every(mut self, value: &str) -> Result<Self, ScheduleError> {
        self.process_every = parse_ms_or_human(value)?;
        Ok(self)
    }
}

impl Default for AgendaConfig {
    fn default() -> Self {
        AgendaConfig {
            name: String::new(),
            process_every: Duration::milliseconds(5000),
            default_concurrency: 5,
            max_concurrency: 20,
            default_lock_limit: 0,
            lock_limit: 0,
            default_lock_lifetime: DEFAULT_LOCK_LIFETIME,
            default_priority: Priority::NORMAL,
        }
    }
}
