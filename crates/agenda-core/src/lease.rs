//! §4.E Lease protocol — the pure arithmetic half (deciding the horizon
//! and deadline the repository's atomic claim query is evaluated against).
//! The atomicity itself lives in the [`crate::repository::JobRepository`]
//! implementation; this module only computes the two timestamps it needs.

use chrono::{DateTime, Duration, Utc};

/// `scanHorizon = now + processEvery`. Jobs due before the *next* poll are
/// claimed during *this* poll (§4.E) — the scan is slightly eager on
/// purpose.
pub fn scan_horizon(now: DateTime<Utc>, process_every: Duration) -> DateTime<Utc> {
    now + process_every
}

/// `lockDeadline = now - lockLifetime`. A lease stamped at or before this
/// instant is abandoned and reclaimable (§4.E, I5).
pub fn lock_deadline(now: DateTime<Utc>, lock_lifetime: Duration) -> DateTime<Utc> {
    now - lock_lifetime
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_horizon_is_eager_by_process_every() {
        let now = Utc::now();
        let horizon = scan_horizon(now, Duration::milliseconds(5000));
        assert_eq!(horizon, now + Duration::milliseconds(5000));
    }

    #[test]
    fn lock_deadline_is_behind_now_by_lock_lifetime() {
        let now = Utc::now();
        let deadline = lock_deadline(now, Duration::minutes(10));
        assert_eq!(deadline, now - Duration::minutes(10));
    }
}
