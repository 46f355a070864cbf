//! Core domain model for Gather: the canonical event, stored rows, and the
//! source-native record shapes produced by each adapter.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "gather-core";

/// Placeholder for a date or time the source could not resolve.
pub const TBA: &str = "TBA";
pub const DEFAULT_CATEGORY: &str = "General";
pub const PRICE_CHECK_SITE: &str = "Check site";
pub const PRICE_FREE: &str = "Free";
pub const MAX_DESCRIPTION_CHARS: usize = 500;

/// Identity of an upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Commercial events API (PredictHQ).
    PredictHq,
    /// Public iCalendar feed (Google Calendar holidays).
    GoogleCalendar,
    /// Secondary events API (Eventful).
    Eventful,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::PredictHq,
        SourceKind::GoogleCalendar,
        SourceKind::Eventful,
    ];

    /// Stable tag used in registry entries and synthesized ticket keys.
    pub fn tag(self) -> &'static str {
        match self {
            SourceKind::PredictHq => "predicthq",
            SourceKind::GoogleCalendar => "google-calendar",
            SourceKind::Eventful => "eventful",
        }
    }

    /// Value written to `source_site`.
    pub fn site_name(self) -> &'static str {
        match self {
            SourceKind::PredictHq => "PredictHQ",
            SourceKind::GoogleCalendar => "Google Calendar ICS",
            SourceKind::Eventful => "Eventful",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Unified event shape handed to the store. `ticket_url` is the uniqueness key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub title: String,
    pub description: String,
    /// `YYYY-MM-DD` or [`TBA`].
    pub date: String,
    /// `HH:MM` (24h) or [`TBA`].
    pub time: String,
    pub venue: String,
    pub image_url: String,
    pub ticket_url: String,
    pub price: String,
    pub category: String,
    pub source_site: String,
}

/// A persisted event row, including the store-managed columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    #[serde(flatten)]
    pub event: CanonicalEvent,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Source-native record as parsed by an adapter. Only the canonicalizer
/// inspects the variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "kebab-case")]
pub enum SourceRecord {
    PredictHq(PredictHqRecord),
    Calendar(CalendarRecord),
    Eventful(EventfulRecord),
}

impl SourceRecord {
    pub fn source(&self) -> SourceKind {
        match self {
            SourceRecord::PredictHq(_) => SourceKind::PredictHq,
            SourceRecord::Calendar(_) => SourceKind::GoogleCalendar,
            SourceRecord::Eventful(_) => SourceKind::Eventful,
        }
    }
}

/// One entry of the PredictHQ `results` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictHqRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// ISO-8601, usually with a `Z` suffix.
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Upstream sends `null` as well as omitting the field.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub entities: Vec<PredictHqEntity>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictHqEntity {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub formatted_url: Option<String>,
}

/// A `VEVENT` component read from an iCalendar feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CalendarRecord {
    pub uid: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    /// Set on an override of one instance of a recurring event; shares the master's `uid`.
    pub recurrence_id: Option<String>,
    pub start: Option<CalendarStart>,
    /// Unparsed `DTSTART` value, kept for fingerprinting and diagnostics.
    pub raw_start: Option<String>,
}

/// `DTSTART` in one of the three iCalendar forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CalendarStart {
    /// `VALUE=DATE`: a whole-day event.
    Date(NaiveDate),
    /// Floating or `TZID=`-qualified wall-clock time.
    Local(NaiveDateTime),
    /// UTC time (`...Z`).
    Utc(DateTime<Utc>),
}

/// One entry of the Eventful `events.event` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventfulRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// `YYYY-MM-DD HH:MM:SS` in the venue's local time.
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub venue_name: Option<String>,
    #[serde(default)]
    pub image: Option<EventfulImage>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventfulImage {
    #[serde(default)]
    pub medium: Option<EventfulImageSize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventfulImageSize {
    #[serde(default)]
    pub url: Option<String>,
}

impl EventfulRecord {
    pub fn medium_image_url(&self) -> Option<&str> {
        self.image
            .as_ref()
            .and_then(|image| image.medium.as_ref())
            .and_then(|medium| medium.url.as_deref())
    }
}
