//! Source adapter contracts, the three upstream adapters, and the source registry.

pub mod ical;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use gather_core::{EventfulRecord, PredictHqRecord, SourceKind, SourceRecord};
use gather_storage::{FetchError, FetchRequest, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub use ical::{read_calendar, CalendarParseError};

pub const CRATE_NAME: &str = "gather-adapters";

const DEFAULT_PREDICTHQ_LIMIT: u32 = 20;
const DEFAULT_EVENTFUL_PAGE_SIZE: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{kind} credential missing (set {env})")]
    MissingCredential { kind: SourceKind, env: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unparseable {kind} response: {message}")]
    Parse { kind: SourceKind, message: String },
    #[error("{kind} did not finish within {seconds}s")]
    TimedOut { kind: SourceKind, seconds: u64 },
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    /// Configuration problems are warnings; everything else is an error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, AdapterError::MissingCredential { .. })
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceKind;

    /// Checked before any network call.
    fn ensure_configured(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<FetchedPage, AdapterError>;

    /// Malformed individual records are dropped and logged; only an
    /// unreadable document is an error.
    fn parse(&self, page: &FetchedPage) -> Result<Vec<SourceRecord>, AdapterError>;
}

/// Credential check, fetch, then parse.
pub async fn collect_records(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    ctx: &AdapterContext,
) -> Result<Vec<SourceRecord>, AdapterError> {
    adapter.ensure_configured()?;
    let page = adapter.fetch(http, ctx).await?;
    let records = adapter.parse(&page)?;
    debug!(
        run_id = %ctx.run_id,
        source = %adapter.source(),
        url = %page.url,
        fetched_at = %page.fetched_at,
        records = records.len(),
        "page parsed"
    );
    Ok(records)
}

async fn fetch_page(
    source: SourceKind,
    http: &HttpFetcher,
    request: &FetchRequest,
) -> Result<FetchedPage, AdapterError> {
    let resp = http.fetch(source.tag(), request).await?;
    Ok(FetchedPage {
        url: resp.final_url,
        body: resp.body,
        fetched_at: Utc::now(),
    })
}

/// Treats unset, blank, and `YOUR_...` placeholder values as missing.
pub fn resolve_credential(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.starts_with("YOUR_") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_json_document(source: SourceKind, page: &FetchedPage) -> Result<JsonValue, AdapterError> {
    serde_json::from_slice(&page.body).map_err(|e| AdapterError::Parse {
        kind: source,
        message: e.to_string(),
    })
}

/// Deserialize each item on its own so one bad record cannot sink the batch.
fn decode_each<T: DeserializeOwned>(source: SourceKind, items: Vec<JsonValue>) -> Vec<T> {
    items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value::<T>(item) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(%source, index, error = %err, "dropping malformed record");
                None
            }
        })
        .collect()
}

/// Commercial events API: geo-bounded, bearer-authenticated.
#[derive(Debug, Clone)]
pub struct PredictHqAdapter {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub credential_env: String,
    pub origin: String,
    pub radius: String,
    pub limit: u32,
}

#[async_trait]
impl SourceAdapter for PredictHqAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::PredictHq
    }

    fn ensure_configured(&self) -> Result<(), AdapterError> {
        if self.api_key.is_none() {
            return Err(AdapterError::MissingCredential {
                kind: self.source(),
                env: self.credential_env.clone(),
            });
        }
        Ok(())
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<FetchedPage, AdapterError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| AdapterError::MissingCredential {
            kind: self.source(),
            env: self.credential_env.clone(),
        })?;
        let request = FetchRequest::get(&self.endpoint)
            .query("location.around.origin", &self.origin)
            .query("location.around.radius", &self.radius)
            .query(
                "active.gte",
                ctx.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .query("limit", self.limit)
            .bearer_token(api_key)
            .accept("application/json");
        fetch_page(self.source(), http, &request).await
    }

    fn parse(&self, page: &FetchedPage) -> Result<Vec<SourceRecord>, AdapterError> {
        let doc = parse_json_document(self.source(), page)?;
        let results = match doc.get("results") {
            Some(JsonValue::Array(items)) => items.clone(),
            Some(JsonValue::Null) | None => Vec::new(),
            Some(other) => {
                return Err(AdapterError::Parse {
                    kind: self.source(),
                    message: format!("`results` is not a list: {other}"),
                })
            }
        };
        Ok(decode_each::<PredictHqRecord>(self.source(), results)
            .into_iter()
            .map(SourceRecord::PredictHq)
            .collect())
    }
}

/// Public iCalendar feed; no credentials.
#[derive(Debug, Clone)]
pub struct GoogleCalendarAdapter {
    pub feed_url: String,
}

#[async_trait]
impl SourceAdapter for GoogleCalendarAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::GoogleCalendar
    }

    async fn fetch(&self, http: &HttpFetcher, _ctx: &AdapterContext) -> Result<FetchedPage, AdapterError> {
        fetch_page(self.source(), http, &FetchRequest::get(&self.feed_url)).await
    }

    fn parse(&self, page: &FetchedPage) -> Result<Vec<SourceRecord>, AdapterError> {
        let text = String::from_utf8_lossy(&page.body);
        let events = read_calendar(&text).map_err(|e| AdapterError::Parse {
            kind: self.source(),
            message: e.to_string(),
        })?;
        Ok(events.into_iter().map(SourceRecord::Calendar).collect())
    }
}

/// Secondary events API: location + date-range search keyed by app key.
#[derive(Debug, Clone)]
pub struct EventfulAdapter {
    pub endpoint: String,
    pub app_key: Option<String>,
    pub credential_env: String,
    pub location: String,
    pub page_size: u32,
}

#[async_trait]
impl SourceAdapter for EventfulAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Eventful
    }

    fn ensure_configured(&self) -> Result<(), AdapterError> {
        if self.app_key.is_none() {
            return Err(AdapterError::MissingCredential {
                kind: self.source(),
                env: self.credential_env.clone(),
            });
        }
        Ok(())
    }

    async fn fetch(&self, http: &HttpFetcher, _ctx: &AdapterContext) -> Result<FetchedPage, AdapterError> {
        let app_key = self.app_key.as_deref().ok_or_else(|| AdapterError::MissingCredential {
            kind: self.source(),
            env: self.credential_env.clone(),
        })?;
        let request = FetchRequest::get(&self.endpoint)
            .query("app_key", app_key)
            .query("location", &self.location)
            .query("date", "Future")
            .query("page_size", self.page_size)
            .query("sort_order", "date");
        fetch_page(self.source(), http, &request).await
    }

    fn parse(&self, page: &FetchedPage) -> Result<Vec<SourceRecord>, AdapterError> {
        let doc = parse_json_document(self.source(), page)?;
        // `events` is null on an empty search; `event` is an object when there is one hit.
        let items = match doc.get("events").and_then(|events| events.get("event")) {
            Some(JsonValue::Array(items)) => items.clone(),
            Some(JsonValue::Null) | None => Vec::new(),
            Some(single) => vec![single.clone()],
        };
        Ok(decode_each::<EventfulRecord>(self.source(), items)
            .into_iter()
            .map(SourceRecord::Eventful)
            .collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub region: RegionConfig,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    /// Fallback venue for city-scoped sources and the Eventful location query.
    pub city: String,
    /// Fallback venue for national calendars.
    pub country: String,
    /// `"lat,lon"`.
    pub origin: String,
    pub radius: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub endpoint: String,
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn kind(&self) -> Option<SourceKind> {
        SourceKind::from_tag(&self.source_id)
    }
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

pub fn load_source_registry(path: impl AsRef<Path>) -> Result<SourceRegistry> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let registry: SourceRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    for source in &registry.sources {
        if source.kind().is_none() {
            bail!("{}: unknown source_id {}", path.display(), source.source_id);
        }
    }
    Ok(registry)
}

fn default_credential_env(kind: SourceKind) -> Option<&'static str> {
    match kind {
        SourceKind::PredictHq => Some("PREDICTHQ_API_KEY"),
        SourceKind::Eventful => Some("EVENTFUL_APP_KEY"),
        SourceKind::GoogleCalendar => None,
    }
}

pub fn adapter_for_source(
    source: &SourceConfig,
    region: &RegionConfig,
    lookup_env: &dyn Fn(&str) -> Option<String>,
) -> Option<Arc<dyn SourceAdapter>> {
    let kind = source.kind()?;
    let credential_env = source
        .credential_env
        .clone()
        .or_else(|| default_credential_env(kind).map(str::to_string))
        .unwrap_or_default();
    let credential = if credential_env.is_empty() {
        None
    } else {
        resolve_credential(lookup_env(&credential_env))
    };

    let adapter: Arc<dyn SourceAdapter> = match kind {
        SourceKind::PredictHq => Arc::new(PredictHqAdapter {
            endpoint: source.endpoint.clone(),
            api_key: credential,
            credential_env,
            origin: region.origin.clone(),
            radius: region.radius.clone(),
            limit: source.limit.unwrap_or(DEFAULT_PREDICTHQ_LIMIT),
        }),
        SourceKind::GoogleCalendar => Arc::new(GoogleCalendarAdapter {
            feed_url: source.endpoint.clone(),
        }),
        SourceKind::Eventful => Arc::new(EventfulAdapter {
            endpoint: source.endpoint.clone(),
            app_key: credential,
            credential_env,
            location: region.city.clone(),
            page_size: source.limit.unwrap_or(DEFAULT_EVENTFUL_PAGE_SIZE),
        }),
    };
    Some(adapter)
}

/// Adapters for every enabled registry entry, credentials read through `lookup_env`.
pub fn build_adapters(
    registry: &SourceRegistry,
    lookup_env: &dyn Fn(&str) -> Option<String>,
) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    registry
        .enabled()
        .map(|source| {
            adapter_for_source(source, &registry.region, lookup_env)
                .with_context(|| format!("no adapter registered for {}", source.source_id))
        })
        .collect()
}
