//! POSIX-style 5-field cron expressions.
//!
//! Fields: minute, hour, day-of-month, month, day-of-week (0–7, both 0
//! and 7 meaning Sunday). Each field accepts `*`, numbers, ranges `a-b`,
//! steps `*/n` and `a-b/n`, and comma lists. Evaluation is minute
//! resolution; the next-occurrence scan walks forward minute by minute,
//! which is cheap at this granularity and trivially correct.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

/// Scan bound for next-occurrence: four years covers Feb 29 rules.
const MAX_SCAN_MINUTES: i64 = 4 * 366 * 24 * 60;

const FIELDS: [(&str, u32, u32); 5] = [
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("day-of-month", 1, 31),
    ("month", 1, 12),
    ("day-of-week", 0, 7),
];

/// Validate a 5-field cron expression.
///
/// # Errors
///
/// Returns a message naming the offending field.
pub fn validate(expr: &str) -> Result<(), String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("expected 5 fields, got {}", fields.len()));
    }
    for (field, (name, min, max)) in fields.iter().zip(FIELDS) {
        validate_field(field, name, min, max)?;
    }
    Ok(())
}

fn validate_field(field: &str, name: &str, min: u32, max: u32) -> Result<(), String> {
    if field.is_empty() {
        return Err(format!("{name} field is empty"));
    }
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("{name} step '{step}' is not a number"))?;
                if step == 0 {
                    return Err(format!("{name} step must be positive"));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        if range == "*" {
            continue;
        }
        let (lo, hi) = match range.split_once('-') {
            Some((lo, hi)) => (parse_bound(lo, name)?, parse_bound(hi, name)?),
            None => {
                if step.is_some() {
                    // "n/step" without a range start is not POSIX cron.
                    return Err(format!("{name} step requires '*' or a range"));
                }
                let v = parse_bound(range, name)?;
                (v, v)
            }
        };
        if lo > hi {
            return Err(format!("{name} range {lo}-{hi} is inverted"));
        }
        if lo < min || hi > max {
            return Err(format!("{name} value out of range {min}-{max}"));
        }
    }
    Ok(())
}

fn parse_bound(s: &str, name: &str) -> Result<u32, String> {
    s.parse().map_err(|_| format!("{name} value '{s}' is not a number"))
}

/// Whether a single (pre-validated) field matches a value.
fn field_matches(field: &str, value: u32) -> bool {
    field.split(',').any(|part| {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<u32>().unwrap_or(1)),
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (0, u32::MAX)
        } else {
            match range.split_once('-') {
                Some((lo, hi)) => match (lo.parse(), hi.parse()) {
                    (Ok(lo), Ok(hi)) => (lo, hi),
                    _ => return false,
                },
                None => match range.parse::<u32>() {
                    Ok(v) => (v, v),
                    Err(_) => return false,
                },
            }
        };
        value >= lo && value <= hi && (value - lo) % step == 0
    })
}

/// Whether `dt` (UTC, minute resolution) matches the expression.
#[must_use]
pub fn matches(expr: &str, dt: &DateTime<Utc>) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }

    let minute_hour_month = field_matches(fields[0], dt.minute())
        && field_matches(fields[1], dt.hour())
        && field_matches(fields[3], dt.month());
    if !minute_hour_month {
        return false;
    }

    let dow = dt.weekday().num_days_from_sunday();
    let dom_matches = field_matches(fields[2], dt.day());
    // Sunday answers to both 0 and 7.
    let dow_matches = field_matches(fields[4], dow) || (dow == 0 && field_matches(fields[4], 7));

    // POSIX: when both day fields are restricted, either may match.
    let dom_restricted = fields[2] != "*";
    let dow_restricted = fields[4] != "*";
    match (dom_restricted, dow_restricted) {
        (true, true) => dom_matches || dow_matches,
        (true, false) => dom_matches,
        (false, true) => dow_matches,
        (false, false) => true,
    }
}

/// The first matching instant strictly after `after`, if any within the
/// scan bound.
#[must_use]
pub fn next_occurrence(expr: &str, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut candidate = after
        .with_second(0)
        .and_then(|dt| dt.with_nanosecond(0))?
        + Duration::minutes(1);
    for _ in 0..MAX_SCAN_MINUTES {
        if matches(expr, &candidate) {
            return Some(candidate);
        }
        candidate += Duration::minutes(1);
    }
    None
}
