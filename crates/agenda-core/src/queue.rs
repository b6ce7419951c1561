//! §4.B Priority queue — the in-memory sequence of jobs this process has
//! already leased and is waiting to dispatch.

use std::collections::HashSet;

use uuid::Uuid;

use crate::job::{queue_order, Job};

/// Jobs leased by this process, ordered by `(nextRunAt asc, priority
/// desc)` (I4). Ties preserve insertion order (stable insert, §4.B).
#[derive(Default)]
pub struct PriorityQueue {
    items: Vec<Job>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        PriorityQueue { items: Vec::new() }
    }

    /// Stable positional insert: finds the first slot whose job does not
    /// sort strictly before `job`, so equal-key jobs keep FIFO order.
    pub fn insert(&mut self, job: Job) {
        let pos = self
            .items
            .iter()
            .position(|existing| queue_order(existing, &job) == std::cmp::Ordering::Greater)
            .unwrap_or(self.items.len());
        self.items.insert(pos, job);
    }

    /// Removes the job with this id, if present, returning it.
    pub fn remove(&mut self, id: Uuid) -> Option<Job> {
        let pos = self.items.iter().position(|j| j.id == Some(id))?;
        Some(self.items.remove(pos))
    }

    /// Returns a clone of the earliest job for which `can_dispatch` returns
    /// true, skipping ids present in `handled` (§4.B, §4.H step 7).
    pub fn peek_next<F>(&self, handled: &HashSet<Uuid>, can_dispatch: F) -> Option<Job>
    where
        F: Fn(&Job) -> bool,
    {
        self.items
            .iter()
            .find(|job| {
                job.id.map(|id| !handled.contains(&id)).unwrap_or(true) && can_dispatch(job)
            })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Diagnostic snapshot, ordered as the queue currently stands.
    pub fn snapshot(&self) -> Vec<Job> {
        self.items.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Priority;
    use chrono::Utc;

    fn job_at(priority: Priority, offset_secs: i64) -> Job {
        let mut job = Job::new("send", serde_json::json!({}));
        job.id = Some(Uuid::new_v4());
        job.priority = priority;
        job.next_run_at = Some(Utc::now() + chrono::Duration::seconds(offset_secs));
        job
    }

    #[test]
    fn insert_keeps_priority_order_for_equal_next_run_at() {
        let mut queue = PriorityQueue::new();
        let now_offset = 0;
        let low = job_at(Priority::LOW, now_offset);
        let high = job_at(Priority::HIGH, now_offset);
        let normal = job_at(Priority::NORMAL, now_offset);

        queue.insert(low.clone());
        queue.insert(high.clone());
        queue.insert(normal.clone());

        let snapshot = queue.snapshot();
        let priorities: Vec<i32> = snapshot.iter().map(|j| j.priority.0).collect();
        assert_eq!(priorities, vec![10, 0, -10]);
    }

    #[test]
    fn peek_next_skips_handled_ids() {
        let mut queue = PriorityQueue::new();
        let a = job_at(Priority::NORMAL, 0);
        let b = job_at(Priority::NORMAL, 1);
        queue.insert(a.clone());
        queue.insert(b.clone());

        let mut handled = HashSet::new();
        handled.insert(a.id.unwrap());

        let next = queue.peek_next(&handled, |_| true).unwrap();
        assert_eq!(next.id, b.id);
    }

    #[test]
    fn peek_next_respects_dispatch_gate() {
        let mut queue = PriorityQueue::new();
        queue.insert(job_at(Priority::NORMAL, 0));
        assert!(queue.peek_next(&HashSet::new(), |_| false).is_none());
    }

    #[test]
    fn remove_by_id_drops_the_right_job() {
        let mut queue = PriorityQueue::new();
        let a = job_at(Priority::NORMAL, 0);
        let b = job_at(Priority::NORMAL, 1);
        queue.insert(a.clone());
        queue.insert(b.clone());

        let removed = queue.remove(a.id.unwrap()).unwrap();
        assert_eq!(removed.id, a.id);
        assert_eq!(queue.len(), 1);
    }
}
