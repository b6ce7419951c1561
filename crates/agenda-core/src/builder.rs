//! Job builder — the surface callers use to construct and save a [`Job`].
//!
//! The abstract interfaces (§6) describe `JobRepository`/`NotificationChannel`
//! but not how a caller actually gets a `Job` onto the queue; every real
//! scheduler needs one, so this is built the way the rest of the crate's
//! public surface reads: small, chainable, and thin over the repository.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::AgendaError;
use crate::fly;
use crate::job::{Job, JobType, Priority, UniqueOpts};
use crate::processor::Shared;

pub struct JobBuilder {
    shared: Arc<Shared>,
    job: Job,
    skip_immediate: bool,
}

impl JobBuilder {
    pub(crate) fn new(shared: Arc<Shared>, name: String, data: serde_json::Value) -> Self {
        let mut job = Job::new(name, data);
        job.priority = shared.config.default_priority;
        JobBuilder {
            shared,
            job,
            skip_immediate: false,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.job.priority = priority;
        self
    }

    pub fn single(mut self) -> Self {
        self.job.job_type = JobType::Single;
        self
    }

    pub fn unique(mut self, key: serde_json::Value, opts: UniqueOpts) -> Self {
        self.job.unique = Some(key);
        self.job.unique_opts = Some(opts);
        self
    }

    /// Runs once, at `when`.
    pub fn schedule(mut self, when: DateTime<Utc>) -> Self {
        self.job.next_run_at = Some(when);
        self
    }

    /// Runs immediately (the default for a freshly created job, but spelled
    /// out for callers migrating from `schedule`).
    pub fn now(mut self) -> Self {
        self.job.next_run_at = Some(Utc::now());
        self
    }

    /// Repeats on a human interval (`"5 minutes"`) or cron expression.
    pub fn repeat_every(mut self, interval: impl Into<String>) -> Self {
        self.job.repeat_interval = Some(interval.into());
        self
    }

    /// Repeats once daily at a time-of-day (`"3:30pm"`).
    pub fn repeat_at(mut self, time_of_day: impl Into<String>) -> Self {
        self.job.repeat_at = Some(time_of_day.into());
        self
    }

    pub fn timezone(mut self, tz: Tz) -> Self {
        self.job.repeat_timezone = Some(tz.to_string());
        self
    }

    pub fn start_date(mut self, when: DateTime<Utc>) -> Self {
        self.job.start_date = Some(when);
        self
    }

    pub fn end_date(mut self, when: DateTime<Utc>) -> Self {
        self.job.end_date = Some(when);
        self
    }

    pub fn skip_days(mut self, days: impl Into<String>) -> Self {
        self.job.skip_days = Some(days.into());
        self
    }

    /// When set, a repeating job's first run is deferred to its first
    /// computed occurrence instead of running immediately on save (§4.J).
    /// Defaults to `false`, matching agenda.js: a freshly defined repeating
    /// job runs once right away, then settles into its schedule.
    pub fn skip_immediate(mut self, skip: bool) -> Self {
        self.skip_immediate = skip;
        self
    }

    /// Persists the job and, if it is due within the next poll window, hands
    /// it straight to the on-the-fly locker instead of waiting (§4.G).
    pub async fn save(mut self) -> Result<Job, AgendaError> {
        if self.skip_immediate && (self.job.repeat_interval.is_some() || self.job.repeat_at.is_some()) {
            // Resolve the first occurrence the same way the rescheduler
            // would after a run, so a freshly created repeating job doesn't
            // need a prior lastRunAt to know when it's next due.
            let anchor = self.job.clone();
            self.job.next_run_at = crate::reschedule::compute_next_run(&anchor)?;
        }

        let saved = self.shared.repo.save_job(self.job).await?;

        if let Some(next) = saved.next_run_at {
            if next <= Utc::now() + self.shared.config.process_every {
                fly::enqueue_fly_candidate(&self.shared, saved.clone()).await;
            }
        }

        if let Some(channel) = &self.shared.notification {
            if let Some(id) = saved.id {
                let _ = channel
                    .publish(crate::notification::JobNotification {
                        job_id: id,
                        job_name: saved.name.clone(),
                        next_run_at: saved.next_run_at,
                        priority: saved.priority,
                        timestamp: Utc::now(),
                    })
                    .await;
            }
        }

        Ok(saved)
    }
}
