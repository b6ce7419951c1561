//! §4.D / §6.1 Repository adapter — the narrow, store-agnostic interface
//! the processor core consumes. Backends (Postgres, in-memory, ...) live in
//! separate crates and implement this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::job::Job;

/// A read/bulk-write filter over the job collection. Fields are ANDed;
/// `None` means "no constraint on this field". This is deliberately a
/// plain struct rather than a query-builder DSL — the core only ever needs
/// these specific shapes (§6.1 `queryJobs`, `removeJobs`, `disableJobs`,
/// `enableJobs`).
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub name: Option<String>,
    pub names_not_in: Option<Vec<String>>,
    pub id: Option<Uuid>,
    pub disabled: Option<bool>,
    pub sort: Option<JobSort>,
    pub limit: Option<i64>,
    pub skip: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct JobSort {
    pub next_run_at_ascending: bool,
    pub priority_descending: bool,
}

impl Default for JobSort {
    /// §6.5: `{nextRunAt: asc, priority: desc}`.
    fn default() -> Self {
        JobSort {
            next_run_at_ascending: true,
            priority_descending: true,
        }
    }
}

/// Result of `queryJobs` (§6.1): the page plus the total matching count.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub records: Vec<Job>,
    pub total: i64,
}

/// A patch applied by `saveJobState` (§6.1). `None` leaves the
/// corresponding field untouched; this is how the dispatcher/rescheduler
/// persist partial outcomes (e.g. `touch()` only ever sets `locked_at` and
/// optionally `progress`).
#[derive(Debug, Clone, Default)]
pub struct JobStateDelta {
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub fail_count: Option<u32>,
    pub fail_reason: Option<Option<String>>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    pub locked_at: Option<Option<DateTime<Utc>>>,
    pub progress: Option<Option<f64>>,
}

/// The store-agnostic interface the core calls (§4.D, §6.1).
///
/// Implementations MUST make `get_next_job_to_run` a single-winner atomic
/// operation under concurrent callers (I1): exactly one caller may ever
/// observe a given due job as claimed at a time.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Establish the backend connection; idempotent.
    async fn connect(&self) -> Result<(), RepositoryError>;

    /// Insert or update, honoring `single`/`unique` upsert semantics
    /// (§6.1). Returns the canonical record with `id` populated.
    async fn save_job(&self, job: Job) -> Result<Job, RepositoryError>;

    /// Atomic claim selector (§4.E): picks one record for `name` that is
    /// due (`next_run_at <= scan_horizon`) and unlocked, OR whose lease has
    /// expired (`locked_at <= lock_deadline`), ordered by
    /// `(next_run_at asc, priority desc)`, and stamps `locked_at = now` on
    /// it atomically. Returns the *post-claim* record.
    async fn get_next_job_to_run(
        &self,
        name: &str,
        scan_horizon: DateTime<Utc>,
        lock_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError>;

    /// Atomic claim of one specific id, used by the on-the-fly locker
    /// (§4.G). Fails (returns `None`) if the job is disabled or already
    /// validly leased by someone else.
    async fn lock_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>, RepositoryError>;

    /// Clears `locked_at` for one record.
    async fn unlock_job(&self, id: Uuid) -> Result<(), RepositoryError>;

    /// Bulk clear, used at shutdown (§4.I).
    async fn unlock_jobs(&self, ids: &[Uuid]) -> Result<(), RepositoryError>;

    /// Persists a run outcome (§6.1).
    async fn save_job_state(&self, id: Uuid, delta: JobStateDelta) -> Result<(), RepositoryError>;

    async fn remove_jobs(&self, query: &JobQuery) -> Result<u64, RepositoryError>;

    async fn query_jobs(&self, query: &JobQuery) -> Result<JobPage, RepositoryError>;

    async fn get_job_by_id(&self, id: Uuid) -> Result<Option<Job>, RepositoryError>;

    /// Count of not-yet-completed records.
    async fn get_queue_size(&self) -> Result<u64, RepositoryError>;

    async fn disable_jobs(&self, query: &JobQuery) -> Result<u64, RepositoryError>;

    async fn enable_jobs(&self, query: &JobQuery) -> Result<u64, RepositoryError>;

    /// For diagnostics/purge (§4.C, §8 P7).
    async fn get_distinct_job_names(&self) -> Result<Vec<String>, RepositoryError>;
}
