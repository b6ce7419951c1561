//! Human-readable interval parsing (`"5 minutes"`, `"2 hours"`, `"1 day"`).
//!
//! Used both for `repeatInterval` (§3, §4.J) and for `processEvery` (§6.5),
//! which accepts the same strings or a plain millisecond count.

use chrono::Duration;

use crate::error::ScheduleError;

/// Parses `"<number> <unit>"`, optionally plural, case-insensitive, with an
/// optional bare number falling back to seconds (mirrors the forgiving
/// style of interval parsers elsewhere in the ecosystem). Returns
/// `Err(ScheduleError::InvalidRepeatInterval)` for anything else, including
/// cron-expression-shaped input (that path is handled separately by
/// [`crate::cron_spec`]).
pub fn parse_human_interval(input: &str) -> Result<Duration, ScheduleError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ScheduleError::InvalidRepeatInterval);
    }

    if let Ok(seconds) = trimmed.parse::<i64>() {
        return Ok(Duration::seconds(seconds));
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let amount_str = parts.next().unwrap_or_default();
    let unit = parts.next().unwrap_or_default().trim().to_lowercase();

    let amount: i64 = amount_str
        .parse()
        .map_err(|_| ScheduleError::InvalidRepeatInterval)?;

    let unit = unit.trim_end_matches('s');
    let duration = match unit {
        "millisecond" | "ms" => Duration::milliseconds(amount),
        "second" | "sec" | "s" => Duration::seconds(amount),
        "minute" | "min" => Duration::minutes(amount),
        "hour" | "hr" | "h" => Duration::hours(amount),
        "day" | "d" => Duration::days(amount),
        "week" | "w" => Duration::weeks(amount),
        _ => return Err(ScheduleError::InvalidRepeatInterval),
    };

    Ok(duration)
}

/// Parses `processEvery`-shaped config values: either milliseconds (a bare
/// integer) or a human interval string (§6.5).
pub fn parse_ms_or_human(input: &str) -> Result<Duration, ScheduleError> {
    if let Ok(ms) = input.trim().parse::<i64>() {
        return Ok(Duration::milliseconds(ms));
    }
    parse_human_interval(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plural_units() {
        assert_eq!(
            parse_human_interval("5 minutes").unwrap(),
            Duration::minutes(5)
        );
        assert_eq!(
            parse_human_interval("2 hours").unwrap(),
            Duration::hours(2)
        );
        assert_eq!(parse_human_interval("1 day").unwrap(), Duration::days(1));
    }

    #[test]
    fn parses_singular_and_abbreviated_units() {
        assert_eq!(
            parse_human_interval("1 minute").unwrap(),
            Duration::minutes(1)
        );
        assert_eq!(parse_human_interval("10 s").unwrap(), Duration::seconds(10));
    }

    #[test]
    fn bare_number_is_seconds() {
        assert_eq!(parse_human_interval("30").unwrap(), Duration::seconds(30));
    }

    #[test]
    fn invalid_interval_is_rejected() {
        assert_eq!(
            parse_human_interval("asd"),
            Err(ScheduleError::InvalidRepeatInterval)
        );
        assert_eq!(
            parse_human_interval("five minutes"),
            Err(ScheduleError::InvalidRepeatInterval)
        );
    }

    #[test]
    fn process_every_accepts_milliseconds() {
        assert_eq!(
            parse_ms_or_human("5000").unwrap(),
            Duration::milliseconds(5000)
        );
    }
}
