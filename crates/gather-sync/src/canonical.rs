//! Maps source-native records onto [`CanonicalEvent`].
//!
//! This is the only place that matches on [`SourceRecord`] variants.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use gather_core::{
    CalendarRecord, CalendarStart, CanonicalEvent, EventfulRecord, PredictHqRecord, SourceKind,
    SourceRecord, DEFAULT_CATEGORY, MAX_DESCRIPTION_CHARS, PRICE_CHECK_SITE, PRICE_FREE, TBA,
};
use thiserror::Error;
use uuid::Uuid;

const PREDICTHQ_DESCRIPTION: &str = "No description available";
const CALENDAR_DESCRIPTION: &str = "Holiday event from Google Calendar";
const EVENTFUL_DESCRIPTION: &str = "Eventful event";
const HOLIDAY_CATEGORY: &str = "Holiday";

const NAIVE_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("record has no title")]
    MissingTitle,
}

/// Canonical `date` / `time` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateParts {
    pub date: String,
    pub time: String,
}

impl DateParts {
    pub fn tba() -> Self {
        Self {
            date: TBA.to_string(),
            time: TBA.to_string(),
        }
    }

    fn date_only(date: NaiveDate) -> Self {
        Self {
            date: date.format("%Y-%m-%d").to_string(),
            time: TBA.to_string(),
        }
    }

    fn date_time(dt: NaiveDateTime) -> Self {
        Self {
            date: dt.format("%Y-%m-%d").to_string(),
            time: dt.format("%H:%M").to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Canonicalizer {
    city_venue: String,
    country_venue: String,
}

impl Canonicalizer {
    pub fn new(city_venue: impl Into<String>, country_venue: impl Into<String>) -> Self {
        Self {
            city_venue: city_venue.into(),
            country_venue: country_venue.into(),
        }
    }

    pub fn canonicalize(&self, record: &SourceRecord) -> Result<CanonicalEvent, DropReason> {
        match record {
            SourceRecord::PredictHq(r) => self.from_predicthq(r),
            SourceRecord::Calendar(r) => self.from_calendar(r),
            SourceRecord::Eventful(r) => self.from_eventful(r),
        }
    }

    fn from_predicthq(&self, r: &PredictHqRecord) -> Result<CanonicalEvent, DropReason> {
        let kind = SourceKind::PredictHq;
        let title = clean(Some(r.title.as_str())).ok_or(DropReason::MissingTitle)?;
        let when = r
            .start
            .as_deref()
            .map(resolve_text_timestamp)
            .unwrap_or_else(DateParts::tba);
        let venue = r
            .entities
            .iter()
            .filter(|e| e.kind == "venue")
            .find_map(|e| clean(e.name.as_deref()))
            .unwrap_or_else(|| self.city_venue.clone());
        let ticket_url = r
            .entities
            .iter()
            .filter(|e| e.kind == "website")
            .find_map(|e| clean(e.formatted_url.as_deref()))
            .unwrap_or_else(|| {
                let native_id = clean(Some(r.id.as_str()))
                    .unwrap_or_else(|| fingerprint(kind, &title, r.start.as_deref()));
                synthesize_ticket_key(kind, &native_id)
            });

        Ok(CanonicalEvent {
            title,
            description: bounded_description(r.description.as_deref(), PREDICTHQ_DESCRIPTION),
            date: when.date,
            time: when.time,
            venue,
            image_url: String::new(),
            ticket_url,
            price: PRICE_CHECK_SITE.to_string(),
            category: clean(r.category.as_deref()).unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            source_site: kind.site_name().to_string(),
        })
    }

    fn from_calendar(&self, r: &CalendarRecord) -> Result<CanonicalEvent, DropReason> {
        let kind = SourceKind::GoogleCalendar;
        let title = clean(r.summary.as_deref()).ok_or(DropReason::MissingTitle)?;
        let when = match r.start {
            Some(CalendarStart::Date(date)) => DateParts::date_only(date),
            Some(CalendarStart::Local(dt)) => DateParts::date_time(dt),
            Some(CalendarStart::Utc(dt)) => DateParts::date_time(dt.naive_utc()),
            None => DateParts::tba(),
        };
        let ticket_url = clean(r.url.as_deref()).unwrap_or_else(|| {
            let native_id = match (clean(r.uid.as_deref()), clean(r.recurrence_id.as_deref())) {
                (Some(uid), Some(instance)) => format!("{uid}-{instance}"),
                (Some(uid), None) => uid,
                (None, _) => fingerprint(kind, &title, r.raw_start.as_deref()),
            };
            synthesize_ticket_key(kind, &native_id)
        });

        Ok(CanonicalEvent {
            title,
            description: bounded_description(r.description.as_deref(), CALENDAR_DESCRIPTION),
            date: when.date,
            time: when.time,
            venue: self.country_venue.clone(),
            image_url: String::new(),
            ticket_url,
            price: PRICE_FREE.to_string(),
            category: HOLIDAY_CATEGORY.to_string(),
            source_site: kind.site_name().to_string(),
        })
    }

    fn from_eventful(&self, r: &EventfulRecord) -> Result<CanonicalEvent, DropReason> {
        let kind = SourceKind::Eventful;
        let title = clean(r.title.as_deref()).ok_or(DropReason::MissingTitle)?;
        let when = r
            .start_time
            .as_deref()
            .map(resolve_text_timestamp)
            .unwrap_or_else(DateParts::tba);
        let ticket_url = clean(r.url.as_deref()).unwrap_or_else(|| {
            let native_id = clean(r.id.as_deref())
                .unwrap_or_else(|| fingerprint(kind, &title, r.start_time.as_deref()));
            synthesize_ticket_key(kind, &native_id)
        });

        Ok(CanonicalEvent {
            title,
            description: bounded_description(r.description.as_deref(), EVENTFUL_DESCRIPTION),
            date: when.date,
            time: when.time,
            venue: clean(r.venue_name.as_deref()).unwrap_or_else(|| self.city_venue.clone()),
            image_url: clean(r.medium_image_url()).unwrap_or_default(),
            ticket_url,
            price: PRICE_CHECK_SITE.to_string(),
            category: clean(r.category.as_deref()).unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            source_site: kind.site_name().to_string(),
        })
    }
}

/// `<tag>-event-<native id>`.
pub fn synthesize_ticket_key(kind: SourceKind, native_id: &str) -> String {
    format!("{}-event-{}", kind.tag(), native_id.trim())
}

/// Stand-in native id for records that carry none upstream.
fn fingerprint(kind: SourceKind, title: &str, raw_start: Option<&str>) -> String {
    let material = format!("{}|{}|{}", kind.tag(), title, raw_start.unwrap_or_default().trim());
    Uuid::new_v5(&Uuid::NAMESPACE_URL, material.as_bytes()).to_string()
}

fn clean(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn bounded_description(value: Option<&str>, fallback: &str) -> String {
    let text = clean(value).unwrap_or_else(|| fallback.to_string());
    truncate_chars(&text, MAX_DESCRIPTION_CHARS)
}

/// Cut to at most `max_chars` characters, never inside a UTF-8 sequence.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Normalize an upstream timestamp string. Unresolvable parts become `TBA`.
pub fn resolve_text_timestamp(raw: &str) -> DateParts {
    let raw = raw.trim();
    if raw.is_empty() {
        return DateParts::tba();
    }

    // Keep the wall-clock time in the offset the source gave.
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return DateParts::date_time(dt.naive_local());
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return DateParts::date_time(dt);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return DateParts::date_only(date);
    }

    // Last resort: a leading date with an optional `HH:MM` after the separator.
    let Some(date) = raw
        .get(..10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
    else {
        return DateParts::tba();
    };
    let time = raw
        .get(11..16)
        .and_then(|t| NaiveTime::parse_from_str(t, "%H:%M").ok())
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| TBA.to_string());
    DateParts {
        date: date.format("%Y-%m-%d").to_string(),
        time,
    }
}
