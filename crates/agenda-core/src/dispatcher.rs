//! §4.H Dispatcher — drains the priority queue, enforces concurrency gates,
//! races the handler's two completion signals against a liveness watchdog,
//! and hands outcomes to the rescheduler.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::definition::{CompletionHandle, Definition, JobContext, LeaseClock, TouchHandle};
use crate::error::JobError;
use crate::events::{EventKind, ProcessorEvent};
use crate::job::Job;
use crate::processor::Shared;
use crate::repository::JobStateDelta;
use crate::reschedule::{finalize_failure, finalize_success};

/// Platform-safe timer ceiling (§4.H): mirrors the ~24.8 day limit of a
/// 32-bit millisecond timer so a far-future `nextRunAt` never overflows the
/// underlying sleep primitive.
const MAX_TIMER_MS: i64 = i32::MAX as i64;

/// Requests a dispatcher pass. Coalesces concurrent requests into a single
/// in-flight pass plus at most one more, so a burst of completions doesn't
/// spawn a storm of overlapping sweeps (§5: scheduling decisions are
/// effectively single-threaded even though handlers run concurrently).
pub(crate) fn wake(shared: &Arc<Shared>) {
    if shared
        .dispatch_running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        shared.dispatch_pending.store(true, Ordering::SeqCst);
        return;
    }
    let shared = shared.clone();
    tokio::spawn(async move {
        loop {
            shared.dispatch_pending.store(false, Ordering::SeqCst);
            dispatch_pass(&shared).await;
            if !shared.dispatch_pending.load(Ordering::SeqCst) {
                break;
            }
        }
        shared.dispatch_running.store(false, Ordering::SeqCst);
    });
}

/// One sweep of the queue (§4.H steps 1-7). Ends when the queue is empty, the
/// earliest remaining job isn't due yet (a timer is armed for it instead),
/// or a concurrency gate blocks the earliest candidate.
pub(crate) async fn dispatch_pass(shared: &Arc<Shared>) {
    let mut handled: HashSet<Uuid> = HashSet::new();

    loop {
        let candidate = {
            let queue = shared.queue.lock().await;
            if queue.is_empty() {
                return;
            }
            queue.peek_next(&handled, |_| true)
        };
        let Some(job) = candidate else {
            return;
        };
        let id = job.id.expect("queued job always has an id");
        shared.queue.lock().await.remove(id);

        let now = Utc::now();

        if let Some(next) = job.next_run_at {
            if next > now + shared.config.process_every {
                release_far_future(shared, &job).await;
                handled.insert(id);
                continue;
            }
            if next > now {
                shared.queue.lock().await.insert(job.clone());
                schedule_timer_if_needed(shared.clone(), id, next, now);
                return;
            }
        }

        let Some(def) = shared.registry.get(&job.name) else {
            warn!(job_id = %id, job_name = %job.name, "dispatcher: no definition registered, dropping from local queue");
            handled.insert(id);
            continue;
        };

        let max_ok = shared.registry.total_running() < shared.config.max_concurrency as i64;
        let name_ok = def.running() < def.concurrency as i64;

        if name_ok && max_ok {
            handled.insert(id);
            spawn_job_run(shared.clone(), job, def.clone());
            if shared.registry.total_running() < shared.config.max_concurrency as i64 {
                continue;
            }
            return;
        }

        shared.queue.lock().await.insert(job);
        return;
    }
}

async fn release_far_future(shared: &Arc<Shared>, job: &Job) {
    let id = job.id.expect("queued job always has an id");
    if let Some(def) = shared.registry.get(&job.name) {
        def.dec_locked();
    }
    shared.locally_locked.lock().await.remove(&id);
    if let Err(err) = shared.repo.unlock_job(id).await {
        warn!(job_id = %id, error = %err, "dispatcher: failed to release far-future lease");
        shared.events.emit(ProcessorEvent::repository_error_for(
            job.clone(),
            format!("failed to release far-future lease: {err}"),
        ));
    }
}

fn schedule_timer_if_needed(
    shared: Arc<Shared>,
    id: Uuid,
    next_run_at: chrono::DateTime<Utc>,
    now: chrono::DateTime<Utc>,
) {
    let shared_for_guard = shared.clone();
    tokio::spawn(async move {
        {
            let mut scheduled = shared_for_guard.timer_scheduled.lock().await;
            if scheduled.contains(&id) {
                return;
            }
            scheduled.insert(id);
        }

        let wait_ms = (next_run_at - now).num_milliseconds().clamp(0, MAX_TIMER_MS);
        tokio::time::sleep(std::time::Duration::from_millis(wait_ms as u64)).await;

        shared_for_guard.timer_scheduled.lock().await.remove(&id);
        wake(&shared_for_guard);
    });
}

/// Liveness watchdog (§4.H, §5): wakes every `min(processEvery,
/// lockLifetime/2)` and checks whether `clock` (the lease's last known
/// `lockedAt`, kept current by `TouchHandle::touch`) is still within
/// `lock_lifetime` of now. Runs until it finds an expired lease; the caller
/// races this against the handler so a `touch()` mid-run genuinely resets
/// the clock the watchdog reads, instead of a deadline computed once up
/// front.
async fn watch_lease(clock: LeaseClock, lock_lifetime: chrono::Duration, process_every: chrono::Duration) -> JobError {
    let half_lifetime = lock_lifetime / 2;
    let tick = process_every
        .min(half_lifetime)
        .to_std()
        .unwrap_or(std::time::Duration::from_millis(100))
        .max(std::time::Duration::from_millis(1));

    loop {
        tokio::time::sleep(tick).await;
        if clock.get() + lock_lifetime <= Utc::now() {
            return JobError::WatchdogTimeout(lock_lifetime.num_milliseconds());
        }
    }
}

/// Runs one claimed job's handler to completion and persists the outcome
/// (§4.H "Running a job").
fn spawn_job_run(shared: Arc<Shared>, mut job: Job, def: Arc<Definition>) {
    let id = job.id.expect("queued job always has an id");
    def.inc_running();

    tokio::spawn(async move {
        let started_at = Utc::now();
        job.last_run_at = Some(started_at);
        if let Err(err) = shared
            .repo
            .save_job_state(
                id,
                JobStateDelta {
                    last_run_at: Some(started_at),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(job_id = %id, error = %err, "dispatcher: failed to persist lastRunAt");
            shared.events.emit(ProcessorEvent::repository_error_for(
                job.clone(),
                format!("failed to persist lastRunAt: {err}"),
            ));
        }
        shared.events.emit(ProcessorEvent {
            kind: EventKind::Start,
            job: Some(job.clone()),
            error: None,
            remote: false,
            at: started_at,
        });

        let (completion, completion_rx) = CompletionHandle::new();
        let clock = LeaseClock::new(job.locked_at.unwrap_or(started_at));
        let touch = TouchHandle::new(shared.repo.clone(), id, clock.clone());
        let ctx = JobContext {
            job: job.clone(),
            touch,
            completion,
        };

        let outcome = tokio::select! {
            result = def.handler.run(ctx) => result,
            result = completion_rx => result.unwrap_or_else(|_| {
                Err(JobError::Failed("completion signal dropped without a result".to_string()))
            }),
            err = watch_lease(clock, def.lock_lifetime, shared.config.process_every) => Err(err),
        };

        let finished_at = Utc::now();
        let (delta, event_kind, error_text) = match &outcome {
            Ok(()) => {
                finalize_success(&mut job, finished_at);
                (
                    JobStateDelta {
                        last_finished_at: Some(finished_at),
                        next_run_at: Some(job.next_run_at),
                        locked_at: Some(None),
                        failed_at: job.failed_at,
                        fail_count: Some(job.fail_count),
                        fail_reason: Some(job.fail_reason.clone()),
                        ..Default::default()
                    },
                    EventKind::Success,
                    None,
                )
            }
            Err(err) => {
                finalize_failure(&mut job, finished_at, err.to_string());
                (
                    JobStateDelta {
                        failed_at: Some(finished_at),
                        fail_count: Some(job.fail_count),
                        fail_reason: Some(job.fail_reason.clone()),
                        locked_at: Some(None),
                        ..Default::default()
                    },
                    EventKind::Fail,
                    Some(err.to_string()),
                )
            }
        };

        if let Err(err) = shared.repo.save_job_state(id, delta).await {
            error!(job_id = %id, error = %err, "dispatcher: failed to persist job outcome");
            shared.events.emit(ProcessorEvent::repository_error_for(
                job.clone(),
                format!("failed to persist job outcome: {err}"),
            ));
        }

        shared.events.emit(ProcessorEvent {
            kind: EventKind::Complete,
            job: Some(job.clone()),
            error: None,
            remote: false,
            at: finished_at,
        });
        shared.events.emit(ProcessorEvent {
            kind: event_kind,
            job: Some(job.clone()),
            error: error_text,
            remote: false,
            at: finished_at,
        });

        def.dec_running();
        def.dec_locked();
        shared.locally_locked.lock().await.remove(&id);

        wake(&shared);
    });
}
