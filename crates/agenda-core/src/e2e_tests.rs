//! End-to-end tests against the in-memory repository, covering the
//! processor's externally observable behavior rather than individual
//! module internals (those are covered by each module's own unit tests).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::definition::{DefinitionOptions, JobContext, JobHandler};
use crate::error::JobError;
use crate::memory::InMemoryJobRepository;
use crate::processor::Agenda;
use crate::repository::JobRepository;
use crate::{AgendaConfig, JobType, Priority, UniqueOpts};

fn fast_config(name: &str) -> AgendaConfig {
    AgendaConfig {
        name: name.to_string(),
        process_every: chrono::Duration::milliseconds(20),
        default_lock_lifetime: chrono::Duration::milliseconds(200),
        ..Default::default()
    }
}

struct RecordingHandler {
    seen: Arc<std::sync::Mutex<Vec<i32>>>,
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        self.seen.lock().unwrap().push(ctx.job.priority.0);
        Ok(())
    }
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn immediate_job_runs_without_waiting_for_schedule() {
    let repo = Arc::new(InMemoryJobRepository::new());
    let agenda = Agenda::new(repo, fast_config("immediate"));
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = ran.clone();
    agenda.define(
        "ping",
        Arc::new(crate::definition::FnHandler(move |_ctx| {
            let ran = ran2.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })),
    );

    agenda.create("ping", serde_json::json!({})).now().save().await.unwrap();
    agenda.start().await.unwrap();

    assert!(wait_until(|| ran.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);

    agenda.stop(Duration::from_secs(1)).await.unwrap();
}

/// Mirrors the literal scenario: three jobs due at the same instant with
/// priorities [-10, 10, 0] dispatch in priority-descending order.
#[tokio::test]
async fn equal_due_time_dispatches_in_priority_order() {
    let repo = Arc::new(InMemoryJobRepository::new());
    let agenda = Agenda::new(repo, fast_config("priority-order"));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    agenda.define_with(
        "work",
        Arc::new(RecordingHandler { seen: seen.clone() }),
        DefinitionOptions {
            concurrency: Some(1),
            ..Default::default()
        },
    );

    let now = Utc::now();
    for priority in [Priority::LOW, Priority::HIGH, Priority::NORMAL] {
        agenda
            .create("work", serde_json::json!({}))
            .priority(priority)
            .schedule(now)
            .save()
            .await
            .unwrap();
    }

    agenda.start().await.unwrap();
    assert!(wait_until(|| seen.lock().unwrap().len() == 3, Duration::from_secs(2)).await);
    agenda.stop(Duration::from_secs(1)).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![10, 0, -10]);
}

/// A lease abandoned by one process (simulated by letting its lock
/// lifetime lapse with no running handler) is picked up by another.
#[tokio::test]
async fn expired_lease_is_reclaimed_by_another_worker() {
    let repo = Arc::new(InMemoryJobRepository::new());

    let now = Utc::now();
    let horizon = now + chrono::Duration::seconds(10);
    let deadline = now - chrono::Duration::seconds(1);

    let mut job = crate::job::Job::new("reclaim-me", serde_json::json!({}));
    job.next_run_at = Some(now - chrono::Duration::seconds(5));
    let saved = repo.save_job(job).await.unwrap();

    // worker A claims it, then "dies" without releasing the lease.
    let claimed_a = repo
        .get_next_job_to_run("reclaim-me", horizon, now, now)
        .await
        .unwrap();
    assert_eq!(claimed_a.unwrap().id, saved.id);

    // worker B scans after the lease's lock lifetime has elapsed.
    let claimed_b = repo
        .get_next_job_to_run("reclaim-me", horizon, deadline, now)
        .await
        .unwrap();
    assert!(claimed_b.is_none(), "lease hasn't expired relative to this deadline yet");

    let later = now + chrono::Duration::seconds(2);
    let claimed_b = repo
        .get_next_job_to_run("reclaim-me", horizon, now, later)
        .await
        .unwrap();
    assert_eq!(claimed_b.unwrap().id, saved.id);
}

#[tokio::test]
async fn unique_insert_only_ignores_a_later_save() {
    let repo = InMemoryJobRepository::new();

    let mut first = crate::job::Job::new("dedupe", serde_json::json!({"v": 1}));
    first.unique = Some(serde_json::json!({"key": "a"}));
    first.unique_opts = Some(UniqueOpts { insert_only: true });
    let saved_first = repo.save_job(first).await.unwrap();

    let mut second = crate::job::Job::new("dedupe", serde_json::json!({"v": 2}));
    second.unique = Some(serde_json::json!({"key": "a"}));
    second.unique_opts = Some(UniqueOpts { insert_only: true });
    let saved_second = repo.save_job(second).await.unwrap();

    assert_eq!(saved_first.id, saved_second.id);
    assert_eq!(saved_second.data, serde_json::json!({"v": 1}));
}

#[tokio::test]
async fn single_type_upsert_reuses_the_existing_record() {
    let repo = InMemoryJobRepository::new();

    let future_run = Utc::now() + chrono::Duration::hours(1);
    let mut first = crate::job::Job::new("heartbeat", serde_json::json!({"n": 1}));
    first.job_type = JobType::Single;
    first.next_run_at = Some(future_run);
    let saved_first = repo.save_job(first).await.unwrap();

    // Redefining the job at a later app restart must not reset a schedule
    // already in flight (§6.1).
    let mut second = crate::job::Job::new("heartbeat", serde_json::json!({"n": 2}));
    second.job_type = JobType::Single;
    second.next_run_at = Some(Utc::now());
    let saved_second = repo.save_job(second).await.unwrap();

    assert_eq!(saved_first.id, saved_second.id);
    assert_eq!(saved_second.data, serde_json::json!({"n": 2}));
    assert_eq!(saved_second.next_run_at, Some(future_run));
}

/// A per-definition lock limit of 1 keeps a second due instance queued
/// locally rather than claimed, even though the repository has both due.
#[tokio::test]
async fn lock_limit_gates_how_many_instances_one_worker_claims() {
    let repo = Arc::new(InMemoryJobRepository::new());
    let agenda = Agenda::new(repo.clone(), fast_config("lock-limit"));

    let running = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let running2 = running.clone();
    let max_seen2 = max_seen.clone();
    agenda.define_with(
        "slow-task",
        Arc::new(crate::definition::FnHandler(move |_ctx| {
            let running = running2.clone();
            let max_seen = max_seen2.clone();
            async move {
                let current = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })),
        DefinitionOptions {
            concurrency: Some(5),
            lock_limit: Some(1),
            ..Default::default()
        },
    );

    for _ in 0..3 {
        agenda
            .create("slow-task", serde_json::json!({}))
            .now()
            .save()
            .await
            .unwrap();
    }

    agenda.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    agenda.drain().await;
    agenda.stop(Duration::from_secs(2)).await.unwrap();
}
