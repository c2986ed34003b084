//! Minimal iCalendar event extraction.
//!
//! Understands enough of RFC 5545 for calendar feeds in the wild: folded
//! lines, VEVENT blocks, date and date-time DTSTART/DTEND (UTC, TZID, and
//! floating forms), text escaping, and DAILY/WEEKLY recurrence with
//! INTERVAL, COUNT, UNTIL, and BYDAY. Everything else is ignored rather
//! than rejected; a feed that is not iCalendar at all is an error.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use super::{CalendarEvent, EventWindow};

/// Hard cap on expanded occurrences per event, against pathological
/// RRULEs.
const MAX_OCCURRENCES: usize = 1000;

/// Parse an iCalendar document into events overlapping `window`.
///
/// # Errors
///
/// Returns a message when the input is not an iCalendar document.
pub fn parse_events(
    ics: &str,
    window: EventWindow,
    timezone: Tz,
) -> Result<Vec<CalendarEvent>, String> {
    let lines = unfold(ics);
    if !lines.iter().any(|l| l.starts_with("BEGIN:VCALENDAR")) {
        return Err("missing BEGIN:VCALENDAR".to_owned());
    }

    let mut events = Vec::new();
    let mut current: Option<Vec<Property>> = None;
    for line in &lines {
        if line == "BEGIN:VEVENT" {
            current = Some(Vec::new());
        } else if line == "END:VEVENT" {
            if let Some(props) = current.take() {
                if let Some(parsed) = build_event(&props, timezone) {
                    expand(&parsed, window, &mut events);
                }
            }
        } else if let Some(props) = current.as_mut() {
            if let Some(property) = Property::parse(line) {
                props.push(property);
            }
        }
    }

    events.retain(|event| {
        let end = event.end.unwrap_or(event.start);
        end >= window.from && event.start <= window.to
    });
    Ok(events)
}

/// Join folded lines (continuations start with space or tab).
fn unfold(ics: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in ics.lines() {
        if raw.starts_with(' ') || raw.starts_with('\t') {
            if let Some(last) = lines.last_mut() {
                last.push_str(&raw[1..]);
                continue;
            }
        }
        lines.push(raw.to_owned());
    }
    lines
}

/// A content line: `NAME;PARAM=V;PARAM=V:VALUE`.
struct Property {
    name: String,
    params: Vec<(String, String)>,
    value: String,
}

impl Property {
    fn parse(line: &str) -> Option<Self> {
        let colon = line.find(':')?;
        let (head, value) = line.split_at(colon);
        let value = &value[1..];
        let mut parts = head.split(';');
        let name = parts.next()?.to_ascii_uppercase();
        let params = parts
            .filter_map(|p| {
                let (k, v) = p.split_once('=')?;
                Some((k.to_ascii_uppercase(), v.to_owned()))
            })
            .collect();
        Some(Self {
            name,
            params,
            value: value.to_owned(),
        })
    }

    fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed VEVENT before recurrence expansion.
struct ParsedEvent {
    base: CalendarEvent,
    duration: Option<Duration>,
    rrule: Option<String>,
}

fn build_event(props: &[Property], timezone: Tz) -> Option<ParsedEvent> {
    let find = |name: &str| props.iter().find(|p| p.name == name);

    let dtstart = find("DTSTART")?;
    let (start, all_day) = parse_stamp(dtstart, timezone)?;
    let end = find("DTEND").and_then(|p| parse_stamp(p, timezone)).map(|(end, _)| end);

    let base = CalendarEvent {
        summary: find("SUMMARY").map_or_else(String::new, |p| unescape(&p.value)),
        start,
        end,
        all_day,
        location: find("LOCATION").map(|p| unescape(&p.value)).filter(|s| !s.is_empty()),
        description: find("DESCRIPTION").map(|p| unescape(&p.value)).filter(|s| !s.is_empty()),
        source_name: None,
    };
    Some(ParsedEvent {
        duration: end.map(|end| end - start),
        rrule: find("RRULE").map(|p| p.value.clone()),
        base,
    })
}

/// Parse a DTSTART/DTEND/UNTIL stamp. Returns the UTC instant and whether
/// it was a date (all-day) value.
fn parse_stamp(prop: &Property, timezone: Tz) -> Option<(DateTime<Utc>, bool)> {
    let value = prop.value.trim();
    let is_date = prop.param("VALUE") == Some("DATE") || value.len() == 8;

    if is_date {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        let midnight = date.and_hms_opt(0, 0, 0)?;
        return Some((localize(midnight, timezone)?, true));
    }

    if let Some(stripped) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?;
        return Some((Utc.from_utc_datetime(&naive), false));
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;
    let zone = prop
        .param("TZID")
        .and_then(|tzid| tzid.parse::<Tz>().ok())
        .unwrap_or(timezone);
    Some((localize(naive, zone)?, false))
}

fn localize(naive: NaiveDateTime, zone: Tz) -> Option<DateTime<Utc>> {
    zone.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Undo RFC 5545 text escaping.
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n' | 'N') => out.push('\n'),
                Some(escaped) => out.push(escaped),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Recurrence rule subset.
struct Rule {
    freq: Freq,
    interval: i64,
    count: Option<usize>,
    until: Option<DateTime<Utc>>,
    by_day: Vec<Weekday>,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Freq {
    Daily,
    Weekly,
}

fn parse_rrule(rrule: &str, timezone: Tz) -> Option<Rule> {
    let mut freq = None;
    let mut interval = 1;
    let mut count = None;
    let mut until = None;
    let mut by_day = Vec::new();

    for part in rrule.split(';') {
        let Some((key, value)) = part.split_once('=') else { continue };
        match key.to_ascii_uppercase().as_str() {
            "FREQ" => {
                freq = match value.to_ascii_uppercase().as_str() {
                    "DAILY" => Some(Freq::Daily),
                    "WEEKLY" => Some(Freq::Weekly),
                    // Other frequencies are outside the supported subset.
                    _ => return None,
                };
            }
            "INTERVAL" => interval = value.parse().ok().filter(|i| *i >= 1)?,
            "COUNT" => count = Some(value.parse().ok()?),
            "UNTIL" => {
                let prop = Property {
                    name: "UNTIL".to_owned(),
                    params: Vec::new(),
                    value: value.to_owned(),
                };
                until = Some(parse_stamp(&prop, timezone)?.0);
            }
            "BYDAY" => {
                for code in value.split(',') {
                    by_day.push(match code.trim() {
                        "SU" => Weekday::Sun,
                        "MO" => Weekday::Mon,
                        "TU" => Weekday::Tue,
                        "WE" => Weekday::Wed,
                        "TH" => Weekday::Thu,
                        "FR" => Weekday::Fri,
                        "SA" => Weekday::Sat,
                        // Ordinal BYDAY (e.g. 2MO) is outside the subset.
                        _ => return None,
                    });
                }
            }
            _ => {}
        }
    }

    Some(Rule {
        freq: freq?,
        interval,
        count,
        until,
        by_day,
    })
}

/// Expand an event (applying its RRULE, if any) into `out`.
fn expand(parsed: &ParsedEvent, window: EventWindow, out: &mut Vec<CalendarEvent>) {
    let Some(rrule) = &parsed.rrule else {
        out.push(parsed.base.clone());
        return;
    };
    // An unsupported rule degrades to the base occurrence rather than
    // dropping the event.
    let Some(rule) = parse_rrule(rrule, Tz::UTC) else {
        out.push(parsed.base.clone());
        return;
    };

    let mut produced = 0usize;
    let mut occurrence = parsed.base.start;
    let step = match rule.freq {
        Freq::Daily => Duration::days(rule.interval),
        Freq::Weekly => Duration::weeks(rule.interval),
    };

    while produced < MAX_OCCURRENCES {
        if let Some(count) = rule.count {
            if produced >= count {
                break;
            }
        }
        if let Some(until) = rule.until {
            if occurrence > until {
                break;
            }
        }
        if occurrence > window.to {
            break;
        }

        let candidates: Vec<DateTime<Utc>> =
            if rule.freq == Freq::Weekly && !rule.by_day.is_empty() {
                // Emit one occurrence per listed weekday within this week.
                let week_start = occurrence
                    - Duration::days(i64::from(occurrence.weekday().num_days_from_monday()));
                rule.by_day
                    .iter()
                    .map(|day| {
                        week_start + Duration::days(i64::from(day.num_days_from_monday()))
                    })
                    .collect()
            } else {
                vec![occurrence]
            };

        for candidate in candidates {
            if candidate < parsed.base.start || candidate > window.to {
                continue;
            }
            if let Some(until) = rule.until {
                if candidate > until {
                    continue;
                }
            }
            if let Some(count) = rule.count {
                if produced >= count {
                    break;
                }
            }
            let mut event = parsed.base.clone();
            event.start = candidate;
            event.end = parsed.duration.map(|d| candidate + d);
            out.push(event);
            produced += 1;
        }

        occurrence += step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn window() -> EventWindow {
        EventWindow {
            from: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            to: Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(),
        }
    }

    fn wrap(body: &str) -> String {
        format!("BEGIN:VCALENDAR\r\nVERSION:2.0\r\n{body}\r\nEND:VCALENDAR\r\n")
    }

    #[test]
    fn rejects_non_ics_input() {
        assert!(parse_events("<html></html>", window(), Tz::UTC).is_err());
    }

    #[test]
    fn parses_utc_event() {
        let ics = wrap(
            "BEGIN:VEVENT\r\nDTSTART:20240601T090000Z\r\nDTEND:20240601T100000Z\r\nSUMMARY:Standup\r\nEND:VEVENT",
        );
        let events = parse_events(&ics, window(), Tz::UTC).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].summary, "Standup");
        assert_eq!(events[0].start, Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
        assert_eq!(events[0].end, Some(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()));
        assert!(!events[0].all_day);
    }

    #[test]
    fn floating_time_uses_config_zone() {
        let ics = wrap("BEGIN:VEVENT\r\nDTSTART:20240601T090000\r\nSUMMARY:Local\r\nEND:VEVENT");
        let events = parse_events(&ics, window(), chrono_tz::Europe::Brussels).unwrap();
        // 09:00 CEST == 07:00 UTC in June.
        assert_eq!(events[0].start, Utc.with_ymd_and_hms(2024, 6, 1, 7, 0, 0).unwrap());
    }

    #[test]
    fn tzid_param_wins_over_config_zone() {
        let ics = wrap(
            "BEGIN:VEVENT\r\nDTSTART;TZID=America/New_York:20240601T090000\r\nSUMMARY:NY\r\nEND:VEVENT",
        );
        let events = parse_events(&ics, window(), Tz::UTC).unwrap();
        // 09:00 EDT == 13:00 UTC.
        assert_eq!(events[0].start, Utc.with_ymd_and_hms(2024, 6, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn all_day_event() {
        let ics = wrap(
            "BEGIN:VEVENT\r\nDTSTART;VALUE=DATE:20240601\r\nDTEND;VALUE=DATE:20240602\r\nSUMMARY:Holiday\r\nEND:VEVENT",
        );
        let events = parse_events(&ics, window(), Tz::UTC).unwrap();
        assert!(events[0].all_day);
        assert_eq!(events[0].start, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn folded_summary_is_joined_and_unescaped() {
        let ics = wrap(
            "BEGIN:VEVENT\r\nDTSTART:20240601T090000Z\r\nSUMMARY:Team\r\n  sync\\, weekly\r\nEND:VEVENT",
        );
        let events = parse_events(&ics, window(), Tz::UTC).unwrap();
        assert_eq!(events[0].summary, "Team sync, weekly");
    }

    #[test]
    fn daily_rrule_expands_within_window() {
        let ics = wrap(
            "BEGIN:VEVENT\r\nDTSTART:20240601T090000Z\r\nRRULE:FREQ=DAILY;COUNT=5\r\nSUMMARY:Daily\r\nEND:VEVENT",
        );
        let events = parse_events(&ics, window(), Tz::UTC).unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[4].start, Utc.with_ymd_and_hms(2024, 6, 5, 9, 0, 0).unwrap());
    }

    #[test]
    fn weekly_byday_emits_listed_days() {
        // 2024-06-03 is a Monday.
        let ics = wrap(
            "BEGIN:VEVENT\r\nDTSTART:20240603T080000Z\r\nRRULE:FREQ=WEEKLY;COUNT=4;BYDAY=MO,WE\r\nSUMMARY:Gym\r\nEND:VEVENT",
        );
        let events = parse_events(&ics, window(), Tz::UTC).unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].start, Utc.with_ymd_and_hms(2024, 6, 3, 8, 0, 0).unwrap());
        assert_eq!(events[1].start, Utc.with_ymd_and_hms(2024, 6, 5, 8, 0, 0).unwrap());
        assert_eq!(events[2].start, Utc.with_ymd_and_hms(2024, 6, 10, 8, 0, 0).unwrap());
    }

    #[test]
    fn rrule_until_bounds_expansion() {
        let ics = wrap(
            "BEGIN:VEVENT\r\nDTSTART:20240601T090000Z\r\nRRULE:FREQ=DAILY;UNTIL=20240603T090000Z\r\nSUMMARY:Short\r\nEND:VEVENT",
        );
        let events = parse_events(&ics, window(), Tz::UTC).unwrap();
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn unsupported_rrule_degrades_to_base() {
        let ics = wrap(
            "BEGIN:VEVENT\r\nDTSTART:20240601T090000Z\r\nRRULE:FREQ=MONTHLY\r\nSUMMARY:Monthly\r\nEND:VEVENT",
        );
        let events = parse_events(&ics, window(), Tz::UTC).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn events_outside_window_are_dropped() {
        let ics = wrap(
            "BEGIN:VEVENT\r\nDTSTART:20200101T090000Z\r\nSUMMARY:Ancient\r\nEND:VEVENT",
        );
        let events = parse_events(&ics, window(), Tz::UTC).unwrap();
        assert!(events.is_empty());
    }
}
