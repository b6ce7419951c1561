//! An in-memory [`JobRepository`], used by this crate's own test suite and
//! by `agenda-testing`. Not a production backend: nothing here survives a
//! process restart. See `agenda-postgres` for that.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::job::Job;
use crate::repository::{JobPage, JobQuery, JobRepository, JobSort, JobStateDelta};

#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(job: &Job, query: &JobQuery) -> bool {
        if let Some(name) = &query.name {
            if &job.name != name {
                return false;
            }
        }
        if let Some(names_not_in) = &query.names_not_in {
            if names_not_in.contains(&job.name) {
                return false;
            }
        }
        if let Some(id) = query.id {
            if job.id != Some(id) {
                return false;
            }
        }
        if let Some(disabled) = query.disabled {
            if job.disabled != disabled {
                return false;
            }
        }
        true
    }

    fn sorted(mut jobs: Vec<Job>, sort: JobSort) -> Vec<Job> {
        jobs.sort_by(|a, b| {
            let a_next = a.next_run_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
            let b_next = b.next_run_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
            let by_time = if sort.next_run_at_ascending {
                a_next.cmp(&b_next)
            } else {
                b_next.cmp(&a_next)
            };
            by_time.then_with(|| {
                if sort.priority_descending {
                    b.priority.cmp(&a.priority)
                } else {
                    a.priority.cmp(&b.priority)
                }
            })
        });
        jobs
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn connect(&self) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn save_job(&self, mut job: Job) -> Result<Job, RepositoryError> {
        let mut jobs = self.jobs.lock().unwrap();

        if let Some(unique) = job.unique.clone() {
            let existing = jobs
                .values()
                .find(|candidate| candidate.name == job.name && candidate.unique.as_ref() == Some(&unique))
                .map(|candidate| candidate.id);
            if let Some(Some(existing_id)) = existing {
                let insert_only = job.unique_opts.map(|o| o.insert_only).unwrap_or(false);
                if insert_only {
                    return Ok(jobs.get(&existing_id).unwrap().clone());
                }
                job.id = Some(existing_id);
                jobs.insert(existing_id, job.clone());
                return Ok(job);
            }
        }

        if job.job_type == crate::job::JobType::Single {
            let existing = jobs
                .values()
                .find(|candidate| candidate.name == job.name)
                .cloned();
            if let Some(existing) = existing {
                let existing_id = existing.id;
                job.id = existing_id;
                // §6.1: redefining a `single` job on every app restart must
                // not reset a schedule already in flight.
                job.next_run_at = existing.next_run_at;
                jobs.insert(existing_id.unwrap(), job.clone());
                return Ok(job);
            }
        }

        let id = job.id.unwrap_or_else(Uuid::new_v4);
        job.id = Some(id);
        jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn get_next_job_to_run(
        &self,
        name: &str,
        scan_horizon: DateTime<Utc>,
        lock_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut candidates: Vec<Job> = jobs
            .values()
            .filter(|job| {
                job.name == name
                    && !job.disabled
                    && job.next_run_at.map(|t| t <= scan_horizon).unwrap_or(false)
                    && (job.locked_at.is_none() || job.locked_at.unwrap() <= lock_deadline)
            })
            .cloned()
            .collect();
        candidates = Self::sorted(candidates, JobSort::default());
        let Some(mut chosen) = candidates.into_iter().next() else {
            return Ok(None);
        };
        chosen.locked_at = Some(now);
        jobs.insert(chosen.id.unwrap(), chosen.clone());
        Ok(Some(chosen))
    }

    async fn lock_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>, RepositoryError> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get(&id).cloned() else {
            return Ok(None);
        };
        if job.disabled || job.locked_at.is_some() {
            return Ok(None);
        }
        let mut locked = job;
        locked.locked_at = Some(now);
        jobs.insert(id, locked.clone());
        Ok(Some(locked))
    }

    async fn unlock_job(&self, id: Uuid) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&id) {
            job.locked_at = None;
        }
        Ok(())
    }

    async fn unlock_jobs(&self, ids: &[Uuid]) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.lock().unwrap();
        for id in ids {
            if let Some(job) = jobs.get_mut(id) {
                job.locked_at = None;
            }
        }
        Ok(())
    }

    async fn save_job_state(&self, id: Uuid, delta: JobStateDelta) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        if let Some(v) = delta.last_run_at {
            job.last_run_at = Some(v);
        }
        if let Some(v) = delta.last_finished_at {
            job.last_finished_at = Some(v);
        }
        if let Some(v) = delta.failed_at {
            job.failed_at = Some(v);
        }
        if let Some(v) = delta.fail_count {
            job.fail_count = v;
        }
        if let Some(v) = delta.fail_reason {
            job.fail_reason = v;
        }
        if let Some(v) = delta.next_run_at {
            job.next_run_at = v;
        }
        if let Some(v) = delta.locked_at {
            job.locked_at = v;
        }
        if let Some(v) = delta.progress {
            job.progress = v;
        }
        Ok(())
    }

    async fn remove_jobs(&self, query: &JobQuery) -> Result<u64, RepositoryError> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, job| !Self::matches(job, query));
        Ok((before - jobs.len()) as u64)
    }

    async fn query_jobs(&self, query: &JobQuery) -> Result<JobPage, RepositoryError> {
        let jobs = self.jobs.lock().unwrap();
        let mut matching: Vec<Job> = jobs.values().filter(|job| Self::matches(job, query)).cloned().collect();
        matching = Self::sorted(matching, query.sort.unwrap_or_default());
        let total = matching.len() as i64;
        if let Some(skip) = query.skip {
            matching = matching.into_iter().skip(skip.max(0) as usize).collect();
        }
        if let Some(limit) = query.limit {
            matching.truncate(limit.max(0) as usize);
        }
        Ok(JobPage { records: matching, total })
    }

    async fn get_job_by_id(&self, id: Uuid) -> Result<Option<Job>, RepositoryError> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn get_queue_size(&self) -> Result<u64, RepositoryError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .values()
            .filter(|job| !job.disabled && job.next_run_at.is_some())
            .count() as u64)
    }

    async fn disable_jobs(&self, query: &JobQuery) -> Result<u64, RepositoryError> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut count = 0;
        for job in jobs.values_mut() {
            if Self::matches(job, query) {
                job.disabled = true;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn enable_jobs(&self, query: &JobQuery) -> Result<u64, RepositoryError> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut count = 0;
        for job in jobs.values_mut() {
            if Self::matches(job, query) {
                job.disabled = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_distinct_job_names(&self) -> Result<Vec<String>, RepositoryError> {
        let jobs = self.jobs.lock().unwrap();
        let mut names: Vec<String> = jobs.values().map(|j| j.name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}
