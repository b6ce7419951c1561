//! §4.G On-the-fly locker — lets `now()`/`schedule()`/`every()` callers, and
//! incoming [`crate::notification::JobNotification`]s, skip straight to
//! dispatch instead of waiting for the next poll.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::events::ProcessorEvent;
use crate::job::Job;
use crate::processor::Shared;

/// Queues `job` for immediate locking and kicks the locker loop if it is
/// idle (§4.G).
pub(crate) async fn enqueue_fly_candidate(shared: &Arc<Shared>, job: Job) {
    shared.fly_queue.lock().await.push_back(job);
    run_fly_locker_if_idle(shared.clone());
}

pub(crate) fn run_fly_locker_if_idle(shared: Arc<Shared>) {
    if shared
        .locking_on_the_fly
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    tokio::spawn(async move {
        run_fly_locker(&shared).await;
        shared.locking_on_the_fly.store(false, Ordering::SeqCst);
    });
}

/// Single entrant: only one locker loop runs at a time per process (§4.G
/// "isLockingOnTheFly single-entrant guard").
async fn run_fly_locker(shared: &Arc<Shared>) {
    loop {
        if shared.draining.load(Ordering::SeqCst) {
            shared.fly_queue.lock().await.clear();
            return;
        }

        let candidate = shared.fly_queue.lock().await.pop_front();
        let Some(job) = candidate else {
            return;
        };

        let Some(def) = shared.registry.get(&job.name) else {
            continue;
        };

        let name_gate_open = def.lock_limit == 0 || def.locked() < def.lock_limit as i64;
        let global_gate_open = shared.config.lock_limit == 0
            || shared.registry.total_locked() < shared.config.lock_limit as i64;

        if !name_gate_open || !global_gate_open {
            // The gate is closed; remaining candidates are no more likely to
            // succeed right now, so drop them rather than spin. They remain
            // due in the store and will be picked up by the next poll.
            shared.fly_queue.lock().await.clear();
            return;
        }

        let now = Utc::now();
        match shared.repo.lock_job(job.id.expect("saved job has id"), now).await {
            Ok(Some(locked)) => {
                def.inc_locked();
                shared.locally_locked.lock().await.insert(locked.id.unwrap());
                shared.queue.lock().await.insert(locked);
                crate::dispatcher::wake(shared);
            }
            Ok(None) => {
                // Lost the race to another worker, or disabled since save.
            }
            Err(err) => {
                warn!(job_id = %job.id.unwrap(), error = %err, "on-the-fly locker: lock failed");
                shared.events.emit(ProcessorEvent::repository_error_for(
                    job,
                    format!("on-the-fly locker: lock failed: {err}"),
                ));
            }
        }
    }
}
