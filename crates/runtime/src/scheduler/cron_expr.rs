//! Cron expression evaluation.
//!
//! Accepts standard five-field expressions (`min hour dom month dow`, with
//! `0` or `7` = Sunday), the `@daily`-style presets, and the seconds-first
//! six/seven-field form understood by the `cron` crate. Five-field input is
//! rewritten into the seconds-first form before parsing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::types::SchedulerError;

/// Preset names and their five-field expansions.
pub const PRESETS: &[(&str, &str)] = &[
    ("@yearly", "0 0 1 1 *"),
    ("@annually", "0 0 1 1 *"),
    ("@monthly", "0 0 1 * *"),
    ("@weekly", "0 0 * * 0"),
    ("@daily", "0 0 * * *"),
    ("@midnight", "0 0 * * *"),
    ("@hourly", "0 * * * *"),
    ("@minutely", "* * * * *"),
];

/// Expand a preset, or return the expression unchanged.
pub fn expand_preset(expression: &str) -> &str {
    let trimmed = expression.trim();
    PRESETS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(trimmed))
        .map(|(_, expanded)| *expanded)
        .unwrap_or(trimmed)
}

/// Rewrite an expression into the seconds-first form the parser expects.
pub fn normalize(expression: &str) -> Result<String, SchedulerError> {
    let expanded = expand_preset(expression);
    let fields: Vec<&str> = expanded.split_whitespace().collect();

    match fields.len() {
        5 => Ok(format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            translate_day_of_week(fields[4]).map_err(|reason| invalid(expression, reason))?
        )),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(invalid(
            expression,
            format!("expected 5 fields or a preset, found {n}"),
        )),
    }
}

/// Parse an expression into a reusable schedule.
pub fn parse(expression: &str) -> Result<Schedule, SchedulerError> {
    let normalized = normalize(expression)?;
    Schedule::from_str(&normalized).map_err(|e| invalid(expression, e.to_string()))
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, SchedulerError> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))
}

/// Next fire time strictly after `now`, evaluated in `timezone`.
pub fn next_fire_time(now: DateTime<Utc>, expression: &str, timezone: Tz) -> Option<DateTime<Utc>> {
    let schedule = parse(expression).ok()?;
    next_after(&schedule, now, timezone)
}

/// The next `count` fire times after `now`.
pub fn next_fire_times(
    now: DateTime<Utc>,
    expression: &str,
    timezone: Tz,
    count: usize,
) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
    let schedule = parse(expression)?;
    Ok(schedule
        .after(&now.with_timezone(&timezone))
        .take(count)
        .map(|dt| dt.with_timezone(&Utc))
        .collect())
}

pub(crate) fn next_after(
    schedule: &Schedule,
    now: DateTime<Utc>,
    timezone: Tz,
) -> Option<DateTime<Utc>> {
    schedule
        .after(&now.with_timezone(&timezone))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

fn invalid(expression: &str, reason: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidCron {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

/// Standard cron numbers Sunday 0 (or 7) through Saturday 6; the parser
/// numbers Sunday 1 through Saturday 7. Names and `*` pass through.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    field
        .split(',')
        .map(translate_dow_part)
        .collect::<Result<Vec<_>, _>>()
        .map(|parts| parts.join(","))
}

fn translate_dow_part(part: &str) -> Result<String, String> {
    let (base, step) = match part.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (part, None),
    };
    let suffix = step.map(|s| format!("/{s}")).unwrap_or_default();

    if base == "*" || base == "?" {
        return Ok(part.to_string());
    }

    if let Some((start, end)) = base.split_once('-') {
        let (start, end) = match (shift_day(start)?, shift_day(end)?) {
            (Some(s), Some(e)) => (s, e),
            // Named ranges are already in the parser's vocabulary.
            _ => return Ok(part.to_string()),
        };
        if start <= end {
            return Ok(format!("{start}-{end}{suffix}"));
        }
        // e.g. "5-7" (Fri..Sun) becomes "6-7,1"
        if step.is_some() {
            return Err(format!("wrapping day-of-week range with step: {part}"));
        }
        return Ok(format!("{start}-7,1-{end}"));
    }

    match shift_day(base)? {
        Some(day) => Ok(format!("{day}{suffix}")),
        None => Ok(part.to_string()),
    }
}

fn shift_day(token: &str) -> Result<Option<u8>, String> {
    if !token.chars().all(|c| c.is_ascii_digit()) || token.is_empty() {
        return Ok(None);
    }
    let day: u8 = token
        .parse()
        .map_err(|_| format!("invalid day of week: {token}"))?;
    if day > 7 {
        return Err(format!("day of week out of range: {day}"));
    }
    Ok(Some(day % 7 + 1))
}
