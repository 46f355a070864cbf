//! Deduplicating event store + HTTP fetch utilities for Gather.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use gather_core::{CanonicalEvent, StoredEvent};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "gather-storage";

const ERROR_BODY_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// A single GET request against an upstream source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub bearer_token: Option<String>,
    pub accept: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn accept(mut self, content_type: impl Into<String>) -> Self {
        self.accept = Some(content_type.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out for {url}")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
}

/// Thin wrapper over a shared `reqwest::Client` with an enforced per-request
/// timeout. No retries: a failed fetch is retried by the next sweep.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch(
        &self,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        if let Some(token) = &request.bearer_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(accept) = &request.accept {
            builder = builder.header(ACCEPT, accept.as_str());
        }

        debug!(source_id, url = %request.url, "fetching");
        let resp = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout {
                    url: request.url.clone(),
                }
            } else {
                FetchError::Request(err)
            }
        })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                body: excerpt(&text, ERROR_BODY_EXCERPT_CHARS),
            });
        }

        let body = resp.bytes().await?.to_vec();
        debug!(source_id, %status, bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Result of [`EventStore::upsert_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// A row with the same `ticket_url` already existed; nothing was written.
    Skipped,
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: i64,
    title: String,
    description: String,
    date: String,
    time: String,
    venue: String,
    image_url: String,
    ticket_url: String,
    price: String,
    category: String,
    source_site: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<EventRow> for StoredEvent {
    fn from(row: EventRow) -> Self {
        StoredEvent {
            id: row.id,
            event: CanonicalEvent {
                title: row.title,
                description: row.description,
                date: row.date,
                time: row.time,
                venue: row.venue,
                image_url: row.image_url,
                ticket_url: row.ticket_url,
                price: row.price,
                category: row.category,
                source_site: row.source_site,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Durable event table keyed on `ticket_url`. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    /// Open (creating if needed) the SQLite database at `database_url`.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .with_context(|| format!("opening database {database_url}"))?;

        info!(database_url, "event store connected");
        Ok(Self { pool })
    }

    /// Private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory database")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .context("running event store migrations")?;
        Ok(())
    }

    /// Insert `event` unless a row with its `ticket_url` already exists.
    ///
    /// The uniqueness constraint is the only serialization point: concurrent
    /// callers racing on one key see exactly one `Inserted`.
    pub async fn upsert_if_absent(&self, event: &CanonicalEvent) -> anyhow::Result<UpsertOutcome> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO events
               (title, description, date, time, venue, image_url, ticket_url,
                price, category, source_site, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(ticket_url) DO NOTHING",
        )
        .bind(&event.title)
        .bind(&event.description)
        .bind(&event.date)
        .bind(&event.time)
        .bind(&event.venue)
        .bind(&event.image_url)
        .bind(&event.ticket_url)
        .bind(&event.price)
        .bind(&event.category)
        .bind(&event.source_site)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting event {}", event.ticket_url))?;

        if result.rows_affected() == 0 {
            debug!(ticket_url = %event.ticket_url, "duplicate ticket_url, skipped");
            Ok(UpsertOutcome::Skipped)
        } else {
            Ok(UpsertOutcome::Inserted)
        }
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await
            .context("counting events")?;
        Ok(count)
    }

    pub async fn find_by_ticket_url(&self, ticket_url: &str) -> anyhow::Result<Option<StoredEvent>> {
        let row = sqlx::query_as::<_, EventRow>("SELECT * FROM events WHERE ticket_url = ?1")
            .bind(ticket_url)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("looking up event {ticket_url}"))?;
        Ok(row.map(StoredEvent::from))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
