//! Cron expression and `repeatAt` evaluation (§4.J).
//!
//! `repeatInterval` is polymorphic: either a human interval (`"5 minutes"`)
//! or a cron expression (`"0 6 * * *"`). We try the human parser first
//! since it is unambiguous and cheap; anything it rejects is handed to
//! `cron::Schedule`.

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

use crate::error::ScheduleError;
use crate::interval::parse_human_interval;

/// Resolves `repeatTimezone`; `None` (unset) means UTC per §3.
pub fn resolve_timezone(tz: Option<&str>) -> Result<Tz, ScheduleError> {
    match tz {
        None => Ok(Tz::UTC),
        Some(name) => Tz::from_str(name).map_err(|_| ScheduleError::UnknownTimezone(name.to_string())),
    }
}

/// Either a human interval or a cron expression. `repeatInterval` is
/// classified into one of these before use; callers that already know
/// which kind they have can construct this directly.
pub enum RepeatIntervalSpec {
    Human(chrono::Duration),
    Cron(Schedule),
}

impl RepeatIntervalSpec {
    pub fn parse(raw: &str) -> Result<Self, ScheduleError> {
        if let Ok(duration) = parse_human_interval(raw) {
            return Ok(RepeatIntervalSpec::Human(duration));
        }
        // The `cron` crate requires a leading seconds field; callers write
        // standard 5-field unix cron ("0 6 * * *"), so pad it with a
        // seconds field of `0` before handing it off.
        let trimmed = raw.trim();
        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };
        Schedule::from_str(&normalized)
            .map(RepeatIntervalSpec::Cron)
            .map_err(|_| ScheduleError::InvalidRepeatInterval)
    }
}

/// Next occurrence for a `repeatInterval` value, after `after` (typically
/// `lastRunAt` or `lastFinishedAt`, §4.J), evaluated in `tz`.
pub fn next_interval_occurrence(
    spec: &RepeatIntervalSpec,
    after: DateTime<Utc>,
    tz: Tz,
) -> Result<DateTime<Utc>, ScheduleError> {
    match spec {
        RepeatIntervalSpec::Human(duration) => Ok(after + *duration),
        RepeatIntervalSpec::Cron(schedule) => {
            let after_tz = after.with_timezone(&tz);
            schedule
                .after(&after_tz)
                .next()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or(ScheduleError::InvalidRepeatInterval)
        }
    }
}

/// Parses `repeatAt`-shaped strings like `"3:30pm"`, `"15:30"`, `"3pm"`.
fn parse_time_of_day(raw: &str) -> Result<NaiveTime, ScheduleError> {
    let trimmed = raw.trim();
    let candidates = [
        "%I:%M%P", // 3:30pm
        "%I:%M %P",
        "%I%P",  // 3pm
        "%I %P", // 3 pm
        "%H:%M", // 15:30
        "%H:%M:%S",
    ];
    for fmt in candidates {
        if let Ok(t) = NaiveTime::parse_from_str(&trimmed.to_lowercase(), fmt) {
            return Ok(t);
        }
    }
    Err(ScheduleError::InvalidRepeatAt)
}

/// Next occurrence of the `repeatAt` wall-clock time, strictly after
/// `after`, evaluated in `tz` (§4.J).
pub fn next_repeat_at_occurrence(
    raw: &str,
    after: DateTime<Utc>,
    tz: Tz,
) -> Result<DateTime<Utc>, ScheduleError> {
    let time = parse_time_of_day(raw)?;
    let after_local = after.with_timezone(&tz);

    let mut candidate_date = after_local.date_naive();
    loop {
        let naive = candidate_date.and_time(time);
        let candidate = tz
            .from_local_datetime(&naive)
            .single()
            .or_else(|| tz.from_local_datetime(&naive).earliest());
        if let Some(candidate) = candidate {
            if candidate > after_local {
                return Ok(candidate.with_timezone(&Utc));
            }
        }
        candidate_date = candidate_date.succ_opt().ok_or(ScheduleError::InvalidRepeatAt)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn cron_daily_6am_gmt_lands_on_expected_day() {
        let tz = resolve_timezone(Some("GMT")).unwrap();
        let spec = RepeatIntervalSpec::parse("0 6 * * *").unwrap();
        let last_run = Utc.with_ymd_and_hms(2015, 1, 1, 6, 1, 0).unwrap();
        let next = next_interval_occurrence(&spec, last_run, tz).unwrap();
        assert_eq!(next.with_timezone(&tz).format("%Y-%m-%d %H").to_string(), "2015-01-02 06");
    }

    #[test]
    fn human_interval_adds_duration_to_last_run() {
        let spec = RepeatIntervalSpec::parse("5 minutes").unwrap();
        let last_run = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let next = next_interval_occurrence(&spec, last_run, Tz::UTC).unwrap();
        assert_eq!(next, last_run + chrono::Duration::minutes(5));
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        assert!(RepeatIntervalSpec::parse("asd").is_err());
    }

    #[test]
    fn repeat_at_finds_next_occurrence_of_time_of_day() {
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 16, 0, 0).unwrap();
        let next = next_repeat_at_occurrence("3:30pm", after, Tz::UTC).unwrap();
        assert_eq!(next.format("%Y-%m-%d %H:%M").to_string(), "2024-03-02 15:30");
    }

    #[test]
    fn repeat_at_same_day_when_time_still_ahead() {
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let next = next_repeat_at_occurrence("3:30pm", after, Tz::UTC).unwrap();
        assert_eq!(next.format("%Y-%m-%d %H:%M").to_string(), "2024-03-01 15:30");
    }
}
