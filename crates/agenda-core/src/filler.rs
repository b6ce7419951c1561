//! §4.F Queue filler — pulls due jobs for one definition name out of the
//! repository and into the in-memory priority queue.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::definition::Definition;
use crate::events::ProcessorEvent;
use crate::lease::{lock_deadline, scan_horizon};
use crate::processor::Shared;

/// Repeatedly claims jobs for `name` until the repository reports none left
/// due, or this definition's concurrency/lock gates close.
///
/// Re-entrant calls for the same name are coalesced: if a fill for `name` is
/// already in flight, this call returns immediately rather than racing a
/// second claim loop against it (§4.F "serialized by a per-name filling
/// flag to prevent recursive double-entry with the on-the-fly path").
pub(crate) async fn fill_definition(shared: &Arc<Shared>, name: &str) {
    {
        let mut filling = shared.filling.lock().await;
        if filling.contains(name) {
            return;
        }
        filling.insert(name.to_string());
    }

    fill_definition_inner(shared, name).await;

    shared.filling.lock().await.remove(name);
}

/// §4.E `shouldLock`: whether `def`'s per-name and the process-wide lock
/// limits still have room for one more locked instance.
fn should_lock(def: &Definition, shared: &Shared) -> bool {
    if def.lock_limit != 0 && def.locked() >= def.lock_limit as i64 {
        return false;
    }
    if shared.config.lock_limit != 0 && shared.registry.total_locked() >= shared.config.lock_limit as i64 {
        return false;
    }
    true
}

async fn fill_definition_inner(shared: &Arc<Shared>, name: &str) {
    let Some(def) = shared.registry.get(name) else {
        return;
    };

    loop {
        if shared.draining.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        if !should_lock(&def, shared) {
            return;
        }

        let now = Utc::now();
        let horizon = scan_horizon(now, shared.config.process_every);
        let deadline = lock_deadline(now, def.lock_lifetime);

        let claimed = match shared.repo.get_next_job_to_run(name, horizon, deadline, now).await {
            Ok(job) => job,
            Err(err) => {
                warn!(job_name = name, error = %err, "queue filler: claim failed");
                shared.events.emit(ProcessorEvent::repository_error(format!(
                    "queue filler: claim failed for {name}: {err}"
                )));
                return;
            }
        };

        let Some(job) = claimed else {
            return;
        };

        let Some(id) = job.id else {
            debug!(job_name = name, "queue filler: claimed job missing id, skipping");
            continue;
        };

        // §4.E: the gate may have closed while the claim above was in
        // flight (e.g. the on-the-fly locker claimed concurrently for the
        // same name). Re-check before committing to this claim.
        if !should_lock(&def, shared) {
            if let Err(err) = shared.repo.unlock_job(id).await {
                warn!(job_id = %id, error = %err, "queue filler: failed to release job past the lock gate");
                shared.events.emit(ProcessorEvent::repository_error_for(
                    job,
                    format!("failed to release job past the lock gate: {err}"),
                ));
            }
            return;
        }

        def.inc_locked();
        shared.locally_locked.lock().await.insert(id);
        shared.queue.lock().await.insert(job);
    }
}
