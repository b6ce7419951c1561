//! §4.J Rescheduler — computes the next run for repeating jobs and
//! finalizes outcomes on the job record.

use chrono::{DateTime, Datelike, Utc, Weekday};

use crate::cron_spec::{next_interval_occurrence, next_repeat_at_occurrence, resolve_timezone, RepeatIntervalSpec};
use crate::error::ScheduleError;
use crate::job::Job;

/// Parses the comma-separated weekday list of `skipDays` (§3, §4.J).
fn parse_skip_days(raw: &str) -> Vec<Weekday> {
    raw.split(',')
        .filter_map(|name| match name.trim().to_lowercase().as_str() {
            "monday" | "mon" => Some(Weekday::Mon),
            "tuesday" | "tue" => Some(Weekday::Tue),
            "wednesday" | "wed" => Some(Weekday::Wed),
            "thursday" | "thu" => Some(Weekday::Thu),
            "friday" | "fri" => Some(Weekday::Fri),
            "saturday" | "sat" => Some(Weekday::Sat),
            "sunday" | "sun" => Some(Weekday::Sun),
            _ => None,
        })
        .collect()
}

/// Moves `when` forward a day at a time, preserving time-of-day, until its
/// weekday is not in `skip_days` (§4.J: "move forward to next allowed
/// weekday preserving time-of-day").
fn apply_skip_days(mut when: DateTime<Utc>, skip_days: &[Weekday]) -> DateTime<Utc> {
    if skip_days.is_empty() {
        return when;
    }
    // Bounded: at most 7 days can possibly be skipped before we are back to
    // the original weekday, so this always terminates.
    for _ in 0..7 {
        if skip_days.contains(&when.weekday()) {
            when += chrono::Duration::days(1);
        } else {
            break;
        }
    }
    when
}

/// Computes the next `nextRunAt` for a repeating job (§4.J).
///
/// Returns `Ok(None)` if the job is past its `endDate` with no remaining
/// occurrence — the caller treats that the same as a one-shot job
/// finishing (§3, §6).
pub fn compute_next_run(job: &Job) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let anchor = job.last_run_at.or(job.last_finished_at).unwrap_or_else(Utc::now);
    let tz = resolve_timezone(job.repeat_timezone.as_deref())?;

    let mut next = if let Some(interval) = &job.repeat_interval {
        let spec = RepeatIntervalSpec::parse(interval)?;
        next_interval_occurrence(&spec, anchor, tz)?
    } else if let Some(repeat_at) = &job.repeat_at {
        next_repeat_at_occurrence(repeat_at, anchor, tz)?
    } else {
        return Ok(None);
    };

    if let Some(skip_days) = &job.skip_days {
        next = apply_skip_days(next, &parse_skip_days(skip_days));
    }

    if let Some(start) = job.start_date {
        if next < start {
            next = start;
        }
    }

    if let Some(end) = job.end_date {
        if next > end {
            return Ok(None);
        }
    }

    Ok(Some(next))
}

/// Applies a successful run's outcome to `job` in place (§4.J).
///
/// One-shot jobs get `nextRunAt = None`; repeating jobs get the computed
/// next occurrence, or are marked failed if the computation itself failed
/// (invalid cron/interval/repeatAt — §7).
pub fn finalize_success(job: &mut Job, finished_at: DateTime<Utc>) {
    job.last_finished_at = Some(finished_at);
    job.locked_at = None;

    if job.is_repeating() {
        match compute_next_run(job) {
            Ok(next) => job.next_run_at = next,
            Err(err) => {
                job.failed_at = Some(finished_at);
                job.fail_count += 1;
                job.fail_reason = Some(err.to_string());
                job.next_run_at = None;
            }
        }
    } else {
        job.next_run_at = None;
    }
}

/// Applies a failed run's outcome to `job` in place (§4.J, §7).
///
/// Failures never auto-reschedule: `nextRunAt` is left untouched so a
/// caller reacting to the `fail` event may set it explicitly; `failCount`
/// is incremented unconditionally, matching the consensus behavior
/// documented in §9's open question (incremented on every failure, never
/// reset on success).
pub fn finalize_failure(job: &mut Job, failed_at: DateTime<Utc>, reason: String) {
    job.failed_at = Some(failed_at);
    job.fail_reason = Some(reason);
    job.fail_count += 1;
    job.locked_at = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use chrono::TimeZone;

    fn job_with_interval(interval: &str) -> Job {
        let mut job = Job::new("report", serde_json::json!({}));
        job.repeat_interval = Some(interval.to_string());
        job.last_run_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        job
    }

    #[test]
    fn success_reschedules_repeating_job() {
        let mut job = job_with_interval("1 hour");
        finalize_success(&mut job, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap());
        assert_eq!(
            job.next_run_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap())
        );
        assert!(job.locked_at.is_none());
    }

    #[test]
    fn success_clears_next_run_at_for_one_shot_job() {
        let mut job = Job::new("send", serde_json::json!({}));
        job.locked_at = Some(Utc::now());
        finalize_success(&mut job, Utc::now());
        assert_eq!(job.next_run_at, None);
    }

    #[test]
    fn invalid_repeat_interval_marks_job_failed_with_specific_reason() {
        let mut job = job_with_interval("asd");
        finalize_success(&mut job, Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap());
        assert_eq!(job.next_run_at, None);
        assert_eq!(job.fail_count, 1);
        assert_eq!(
            job.fail_reason.as_deref(),
            Some("failed to calculate nextRunAt due to invalid repeat interval")
        );
    }

    #[test]
    fn failure_increments_fail_count_and_does_not_reschedule() {
        let mut job = job_with_interval("1 hour");
        job.locked_at = Some(Utc::now());
        finalize_failure(&mut job, Utc::now(), "boom".to_string());
        assert_eq!(job.fail_count, 1);
        assert_eq!(job.fail_reason.as_deref(), Some("boom"));
        assert!(job.locked_at.is_none());
        // nextRunAt untouched by failure path.
        assert_eq!(job.next_run_at, None);
    }

    #[test]
    fn end_date_in_the_past_drops_the_next_occurrence() {
        let mut job = job_with_interval("1 hour");
        job.end_date = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap());
        assert_eq!(compute_next_run(&job).unwrap(), None);
    }

    #[test]
    fn start_date_clamps_an_earlier_occurrence_forward() {
        let mut job = job_with_interval("1 hour");
        job.start_date = Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        assert_eq!(
            compute_next_run(&job).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn skip_days_moves_forward_preserving_time_of_day() {
        // 2024-01-06 is a Saturday; interval lands there, should roll to Monday.
        let mut job = Job::new("report", serde_json::json!({}));
        job.repeat_interval = Some("1 day".to_string());
        job.last_run_at = Some(Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).unwrap());
        job.skip_days = Some("Saturday,Sunday".to_string());
        let next = compute_next_run(&job).unwrap().unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.format("%H:%M").to_string(), "09:00");
    }
}
