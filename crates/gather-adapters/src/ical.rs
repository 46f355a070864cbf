//! Minimal iCalendar (RFC 5545) reader for `VEVENT` components.
//!
//! Only the properties the calendar adapter consumes are kept. Recurrence
//! rules are not expanded; a recurring event yields its first start.

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use gather_core::{CalendarRecord, CalendarStart};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalendarParseError {
    #[error("document has no VCALENDAR component")]
    MissingCalendar,
    #[error("component {0} is never closed")]
    Unterminated(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ContentLine {
    name: String,
    params: Vec<(String, String)>,
    value: String,
}

impl ContentLine {
    fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Read every `VEVENT` in `text`, in document order.
pub fn read_calendar(text: &str) -> Result<Vec<CalendarRecord>, CalendarParseError> {
    let mut seen_calendar = false;
    let mut stack: Vec<String> = Vec::new();
    let mut current: Option<CalendarRecord> = None;
    let mut events = Vec::new();

    for raw in unfold(text) {
        let Some(line) = parse_content_line(&raw) else {
            continue;
        };

        match line.name.as_str() {
            "BEGIN" => {
                let component = line.value.trim().to_ascii_uppercase();
                if component == "VCALENDAR" {
                    seen_calendar = true;
                }
                if component == "VEVENT" && current.is_none() {
                    current = Some(CalendarRecord::default());
                }
                stack.push(component);
            }
            "END" => {
                let component = line.value.trim().to_ascii_uppercase();
                if let Some(pos) = stack.iter().rposition(|c| *c == component) {
                    stack.truncate(pos);
                }
                if component == "VEVENT" && !stack.iter().any(|c| c == "VEVENT") {
                    if let Some(event) = current.take() {
                        events.push(event);
                    }
                }
            }
            _ => {
                // Properties of nested components (VALARM) are not the event's own.
                if stack.last().map(String::as_str) != Some("VEVENT") {
                    continue;
                }
                if let Some(event) = current.as_mut() {
                    apply_property(event, &line);
                }
            }
        }
    }

    if !seen_calendar {
        return Err(CalendarParseError::MissingCalendar);
    }
    if let Some(open) = stack.pop() {
        return Err(CalendarParseError::Unterminated(open));
    }
    Ok(events)
}

fn apply_property(event: &mut CalendarRecord, line: &ContentLine) {
    match line.name.as_str() {
        "UID" => event.uid = non_empty(unescape_text(&line.value)),
        "SUMMARY" => event.summary = non_empty(unescape_text(&line.value)),
        "DESCRIPTION" => event.description = non_empty(unescape_text(&line.value)),
        "URL" => event.url = non_empty(line.value.trim().to_string()),
        "RECURRENCE-ID" => event.recurrence_id = non_empty(line.value.trim().to_string()),
        "DTSTART" => {
            event.raw_start = Some(line.value.trim().to_string());
            event.start = parse_dtstart(line);
        }
        _ => {}
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Join folded lines: a line starting with a space or tab continues the previous one.
fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.lines() {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = raw.strip_prefix(' ').or_else(|| raw.strip_prefix('\t')) {
            if let Some(prev) = lines.last_mut() {
                prev.push_str(rest);
                continue;
            }
        }
        if !raw.is_empty() {
            lines.push(raw.to_string());
        }
    }
    lines
}

fn parse_content_line(line: &str) -> Option<ContentLine> {
    let mut in_quotes = false;
    let mut split_at = None;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => {
                split_at = Some(idx);
                break;
            }
            _ => {}
        }
    }
    let split_at = split_at?;
    let (head, value) = (&line[..split_at], &line[split_at + 1..]);

    let mut parts = split_unquoted(head, ';').into_iter();
    let name = parts.next()?.trim().to_ascii_uppercase();
    if name.is_empty() {
        return None;
    }
    let params = parts
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            Some((
                key.trim().to_ascii_uppercase(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect();

    Some(ContentLine {
        name,
        params,
        value: value.to_string(),
    })
}

fn split_unquoted(input: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, ch) in input.char_indices() {
        if ch == '"' {
            in_quotes = !in_quotes;
        } else if ch == sep && !in_quotes {
            out.push(&input[start..idx]);
            start = idx + ch.len_utf8();
        }
    }
    out.push(&input[start..]);
    out
}

fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn parse_dtstart(line: &ContentLine) -> Option<CalendarStart> {
    let value = line.value.trim();
    let is_date = line
        .param("VALUE")
        .map(|v| v.eq_ignore_ascii_case("DATE"))
        .unwrap_or(false)
        || value.len() == 8;

    if is_date {
        return NaiveDate::parse_from_str(value, "%Y%m%d")
            .ok()
            .map(CalendarStart::Date);
    }

    if let Some(utc) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S").ok()?;
        return Some(CalendarStart::Utc(Utc.from_utc_datetime(&naive)));
    }

    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .ok()
        .map(CalendarStart::Local)
}
