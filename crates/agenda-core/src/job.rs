//! §3 DATA MODEL, §4.A Job Record & State Machine.
//!
//! `Job` is the durable unit the whole processor revolves around. Every
//! field here is either persisted verbatim by a [`crate::repository::JobRepository`]
//! or derived from persisted fields; nothing here is process-local except
//! `id` becoming `None` before the first `save()`.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `type` field of §3: whether at most one scheduled instance of a name may
/// exist in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    Normal,
    Single,
}

/// Signed priority; higher runs earlier (§3, §4.B I4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOWEST: Priority = Priority(-20);
    pub const LOW: Priority = Priority(-10);
    pub const NORMAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(10);
    pub const HIGHEST: Priority = Priority(20);

    /// Maps the string aliases from §3 to their numeric value. Any other
    /// string is treated as a base-10 integer literal, falling back to
    /// `NORMAL` if that also fails to parse — mirrors the forgiving
    /// behavior expected of a builder convenience method, not a strict
    /// parser the caller must validate against.
    pub fn parse(value: &str) -> Priority {
        match value {
            "lowest" => Priority::LOWEST,
            "low" => Priority::LOW,
            "normal" => Priority::NORMAL,
            "high" => Priority::HIGH,
            "highest" => Priority::HIGHEST,
            other => other.parse::<i32>().map(Priority).unwrap_or(Priority::NORMAL),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// `uniqueOpts` of §3: governs whether a `unique` upsert may update an
/// existing matching document or only ever inserts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UniqueOpts {
    pub insert_only: bool,
}

/// The durable job record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Assigned by the repository on first `save()`; never mutated after.
    pub id: Option<Uuid>,
    pub name: String,
    pub data: serde_json::Value,
    pub job_type: JobType,
    pub priority: Priority,

    pub next_run_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,

    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub fail_count: u32,
    pub fail_reason: Option<String>,

    /// Human interval (`"5 minutes"`) or cron expression, or `None`.
    pub repeat_interval: Option<String>,
    /// Time-of-day string (`"3:30pm"`), or `None`.
    pub repeat_at: Option<String>,
    /// IANA zone for cron/repeatAt evaluation; `None` means UTC.
    pub repeat_timezone: Option<String>,

    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Weekday names to skip, comma-separated (e.g. `"Saturday,Sunday"`).
    pub skip_days: Option<String>,

    pub disabled: bool,

    /// Query fragment used only at save time to upsert on a caller-supplied
    /// key (§3, §4.D, §6.1).
    pub unique: Option<serde_json::Value>,
    pub unique_opts: Option<UniqueOpts>,

    pub progress: Option<f64>,
}

impl Job {
    /// A brand-new, never-persisted job for `name`, due immediately.
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Job {
            id: None,
            name: name.into(),
            data,
            job_type: JobType::Normal,
            priority: Priority::default(),
            next_run_at: Some(Utc::now()),
            locked_at: None,
            last_run_at: None,
            last_finished_at: None,
            failed_at: None,
            fail_count: 0,
            fail_reason: None,
            repeat_interval: None,
            repeat_at: None,
            repeat_timezone: None,
            start_date: None,
            end_date: None,
            skip_days: None,
            disabled: false,
            unique: None,
            unique_opts: None,
            progress: None,
        }
    }

    /// Lease lifetime check: is `locked_at` still within `lock_lifetime`?
    pub fn lease_is_alive(&self, lock_lifetime: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.locked_at {
            Some(locked_at) => locked_at + lock_lifetime > now,
            None => false,
        }
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat_interval.is_some() || self.repeat_at.is_some()
    }

    /// Computed state per the §4.A table. Checked in the table's own order;
    /// a job can genuinely satisfy more than one predicate (e.g. `repeating`
    /// and `scheduled` at once) so callers needing a specific fact should
    /// prefer the dedicated predicate methods below over this summary.
    pub fn state(&self, lock_lifetime: chrono::Duration, now: DateTime<Utc>) -> JobState {
        if self.disabled {
            return JobState::Disabled;
        }
        if let Some(locked_at) = self.locked_at {
            return if locked_at + lock_lifetime > now {
                JobState::Running
            } else {
                JobState::ExpiredLease
            };
        }
        if self.is_failed() {
            return JobState::Failed;
        }
        if self.is_completed() {
            return JobState::Completed;
        }
        match self.next_run_at {
            Some(next) if next > now => JobState::Scheduled,
            Some(_) => JobState::Queued,
            None => JobState::Completed,
        }
    }

    fn is_completed(&self) -> bool {
        match (self.last_finished_at, self.failed_at) {
            (Some(finished), Some(failed)) => finished >= failed,
            (Some(_), None) => true,
            _ => false,
        }
    }

    fn is_failed(&self) -> bool {
        match (self.last_finished_at, self.failed_at) {
            (Some(finished), Some(failed)) => failed >= finished,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

/// §4.A state table, as an enumerable summary for diagnostics/tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Scheduled,
    Queued,
    Running,
    ExpiredLease,
    Completed,
    Failed,
    Disabled,
}

/// `a < b` iff `a.nextRunAt < b.nextRunAt`, or equal and `a.priority >
/// b.priority` (§4.B). Used by the priority queue; does not itself
/// implement `Ord` on `Job` because jobs compare only on these two fields,
/// never on identity — two distinct jobs due at the same instant with the
/// same priority compare `Equal` and insertion order decides the tie
/// (stable insert, §4.B).
pub fn queue_order(a: &Job, b: &Job) -> Ordering {
    let a_next = a.next_run_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
    let b_next = b.next_run_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
    a_next.cmp(&b_next).then_with(|| b.priority.cmp(&a.priority))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_job() -> Job {
        Job::new("send", serde_json::json!({}))
    }

    #[test]
    fn queued_when_due_in_past_and_unlocked() {
        let mut job = base_job();
        job.next_run_at = Some(Utc::now() - chrono::Duration::seconds(5));
        assert_eq!(
            job.state(chrono::Duration::minutes(10), Utc::now()),
            JobState::Queued
        );
    }

    #[test]
    fn scheduled_when_due_in_future() {
        let mut job = base_job();
        job.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
        assert_eq!(
            job.state(chrono::Duration::minutes(10), Utc::now()),
            JobState::Scheduled
        );
    }

    #[test]
    fn running_while_lease_alive_then_expired_after_lifetime() {
        let mut job = base_job();
        let lifetime = chrono::Duration::milliseconds(500);
        job.locked_at = Some(Utc::now());
        assert_eq!(job.state(lifetime, Utc::now()), JobState::Running);

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(job.state(lifetime, later), JobState::ExpiredLease);
    }

    #[test]
    fn priority_ordering_is_descending_for_equal_next_run_at() {
        let at = Utc::now();
        let mut low = base_job();
        low.next_run_at = Some(at);
        low.priority = Priority::LOW;
        let mut high = base_job();
        high.next_run_at = Some(at);
        high.priority = Priority::HIGH;

        assert_eq!(queue_order(&high, &low), Ordering::Less);
        assert_eq!(queue_order(&low, &high), Ordering::Greater);
    }

    #[test]
    fn earlier_next_run_at_sorts_first_regardless_of_priority() {
        let mut earlier = base_job();
        earlier.next_run_at = Some(Utc::now());
        earlier.priority = Priority::LOWEST;
        let mut later = base_job();
        later.next_run_at = Some(Utc::now() + chrono::Duration::minutes(1));
        later.priority = Priority::HIGHEST;

        assert_eq!(queue_order(&earlier, &later), Ordering::Less);
    }
}
