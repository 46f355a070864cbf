//! Sweep orchestration: runs every adapter concurrently, canonicalizes what
//! they return, and writes through the dedup store. Also hosts the daily
//! scheduler.

pub mod canonical;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gather_adapters::{
    build_adapters, collect_records, load_source_registry, AdapterContext, AdapterError,
    SourceAdapter,
};
use gather_core::SourceKind;
use gather_storage::{EventStore, HttpClientConfig, HttpFetcher, UpsertOutcome};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use canonical::{Canonicalizer, DropReason};

pub const CRATE_NAME: &str = "gather-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub adapter_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://gather.db?mode=rwc".to_string()),
            scheduler_enabled: lookup("GATHER_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            sync_cron: lookup("SYNC_CRON").unwrap_or_else(|| "0 0 2 * * *".to_string()),
            user_agent: lookup("GATHER_USER_AGENT").unwrap_or_else(|| "gather-bot/0.1".to_string()),
            http_timeout_secs: lookup("GATHER_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            adapter_timeout_secs: lookup("GATHER_ADAPTER_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            workspace_root: lookup("GATHER_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

/// Per-source outcome of one sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source: SourceKind,
    pub fetched: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub failed_writes: usize,
    /// Set when the adapter produced nothing because it failed.
    pub error: Option<String>,
}

impl SourceReport {
    fn new(source: SourceKind) -> Self {
        Self {
            source,
            fetched: 0,
            inserted: 0,
            skipped: 0,
            dropped: 0,
            failed_writes: 0,
            error: None,
        }
    }

    fn failed(source: SourceKind, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(source)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
}

impl SyncRunSummary {
    pub fn inserted(&self) -> usize {
        self.sources.iter().map(|s| s.inserted).sum()
    }

    pub fn skipped(&self) -> usize {
        self.sources.iter().map(|s| s.skipped).sum()
    }

    pub fn dropped(&self) -> usize {
        self.sources.iter().map(|s| s.dropped).sum()
    }

    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.error.is_some()).count()
    }

    pub fn report_for(&self, source: SourceKind) -> Option<&SourceReport> {
        self.sources.iter().find(|s| s.source == source)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("a sweep is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    Running,
}

/// Single-flight guard: at most one sweep holds a permit at a time.
#[derive(Debug, Default)]
pub struct SweepGate {
    running: AtomicBool,
}

impl SweepGate {
    pub fn state(&self) -> SweepState {
        if self.running.load(Ordering::Acquire) {
            SweepState::Running
        } else {
            SweepState::Idle
        }
    }

    pub fn try_enter(&self) -> Option<SweepPermit<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepPermit { gate: self })
    }
}

/// Returns the gate to `Idle` when dropped.
#[derive(Debug)]
pub struct SweepPermit<'a> {
    gate: &'a SweepGate,
}

impl Drop for SweepPermit<'_> {
    fn drop(&mut self) {
        self.gate.running.store(false, Ordering::Release);
    }
}

pub struct SyncPipeline {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    http: HttpFetcher,
    store: EventStore,
    canonicalizer: Canonicalizer,
    adapter_timeout: Duration,
    gate: SweepGate,
}

impl SyncPipeline {
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        http: HttpFetcher,
        store: EventStore,
        canonicalizer: Canonicalizer,
    ) -> Self {
        Self {
            adapters,
            http,
            store,
            canonicalizer,
            adapter_timeout: Duration::from_secs(60),
            gate: SweepGate::default(),
        }
    }

    pub fn with_adapter_timeout(mut self, timeout: Duration) -> Self {
        self.adapter_timeout = timeout;
        self
    }

    /// Registry, credentials, HTTP client and migrated store, all from `config`.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let registry_path = config.registry_path();
        let registry = load_source_registry(&registry_path)?;
        let adapters = build_adapters(&registry, &|name| std::env::var(name).ok())?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let store = EventStore::connect(&config.database_url).await?;
        store.migrate().await?;
        let canonicalizer = Canonicalizer::new(&registry.region.city, &registry.region.country);

        info!(
            registry = %registry_path.display(),
            sources = adapters.len(),
            "sync pipeline ready"
        );
        Ok(Self::new(adapters, http, store, canonicalizer)
            .with_adapter_timeout(Duration::from_secs(config.adapter_timeout_secs)))
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn state(&self) -> SweepState {
        self.gate.state()
    }

    /// One sweep across every adapter. Refused while another sweep holds the gate.
    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let _permit = self.gate.try_enter().ok_or(SyncError::AlreadyRunning)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("sweep", %run_id);
        Ok(self.sweep(run_id).instrument(span).await)
    }

    async fn sweep(&self, run_id: Uuid) -> SyncRunSummary {
        let started_at = Utc::now();
        let ctx = AdapterContext::new(run_id);
        info!(sources = self.adapters.len(), "sweep started");

        let handles: Vec<(SourceKind, JoinHandle<SourceReport>)> = self
            .adapters
            .iter()
            .map(|adapter| {
                let source = adapter.source();
                let task = sweep_source(
                    Arc::clone(adapter),
                    self.http.clone(),
                    self.store.clone(),
                    self.canonicalizer.clone(),
                    ctx.clone(),
                    self.adapter_timeout,
                )
                .instrument(info_span!("source", %source));
                (source, tokio::spawn(task))
            })
            .collect();

        let mut sources = Vec::with_capacity(handles.len());
        for (source, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(join_err) => {
                    error!(%source, error = %join_err, "adapter task aborted");
                    SourceReport::failed(source, format!("adapter task aborted: {join_err}"))
                }
            };
            sources.push(report);
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources,
        };
        info!(
            inserted = summary.inserted(),
            skipped = summary.skipped(),
            dropped = summary.dropped(),
            failed_sources = summary.failed_sources(),
            "sweep finished"
        );
        summary
    }
}

async fn sweep_source(
    adapter: Arc<dyn SourceAdapter>,
    http: HttpFetcher,
    store: EventStore,
    canonicalizer: Canonicalizer,
    ctx: AdapterContext,
    timeout: Duration,
) -> SourceReport {
    let source = adapter.source();
    let collected = tokio::time::timeout(timeout, collect_records(adapter.as_ref(), &http, &ctx))
        .await
        .unwrap_or_else(|_| {
            Err(AdapterError::TimedOut {
                kind: source,
                seconds: timeout.as_secs(),
            })
        });

    let records = match collected {
        Ok(records) => records,
        Err(err) => {
            if err.is_configuration() {
                warn!(error = %err, "source skipped");
            } else {
                error!(error = %err, "source failed");
            }
            return SourceReport::failed(source, err.to_string());
        }
    };

    let mut report = SourceReport::new(source);
    report.fetched = records.len();
    for record in &records {
        let event = match canonicalizer.canonicalize(record) {
            Ok(event) => event,
            Err(reason) => {
                warn!(%reason, "dropping record");
                report.dropped += 1;
                continue;
            }
        };
        match store.upsert_if_absent(&event).await {
            Ok(UpsertOutcome::Inserted) => report.inserted += 1,
            Ok(UpsertOutcome::Skipped) => report.skipped += 1,
            Err(err) => {
                error!(ticket_url = %event.ticket_url, error = %err, "event write failed");
                report.failed_writes += 1;
            }
        }
    }

    debug!(
        fetched = report.fetched,
        inserted = report.inserted,
        skipped = report.skipped,
        dropped = report.dropped,
        failed_writes = report.failed_writes,
        "source finished"
    );
    report
}

/// Cron job that triggers a sweep. Overlapping triggers are skipped.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled sweep complete"),
                Err(SyncError::AlreadyRunning) => {
                    warn!("previous sweep still running; scheduled trigger skipped")
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Sweep immediately, then on `config.sync_cron` until ctrl-c.
pub async fn run_forever(pipeline: Arc<SyncPipeline>, config: &SyncConfig) -> Result<()> {
    match pipeline.run_once().await {
        Ok(summary) => info!(run_id = %summary.run_id, "startup sweep complete"),
        Err(err) => warn!(error = %err, "startup sweep skipped"),
    }

    if !config.scheduler_enabled {
        warn!("scheduler disabled (GATHER_SCHEDULER_ENABLED); exiting after startup sweep");
        return Ok(());
    }

    let mut sched = build_scheduler(Arc::clone(&pipeline), &config.sync_cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    pipeline.store().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gather_adapters::{EventfulAdapter, FetchedPage, GoogleCalendarAdapter, PredictHqAdapter};
    use gather_core::SourceRecord;
    use gather_storage::FetchError;
    use std::collections::HashMap;
    use std::path::Path;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    /// Serves a fixture file in place of the network, then parses with the real adapter.
    struct FixtureAdapter {
        inner: Arc<dyn SourceAdapter>,
        file: PathBuf,
    }

    impl FixtureAdapter {
        fn new(inner: Arc<dyn SourceAdapter>, file: &str) -> Arc<dyn SourceAdapter> {
            let file = workspace_root()
                .join("fixtures")
                .join(inner.source().tag())
                .join("sample")
                .join(file);
            Arc::new(Self { inner, file })
        }
    }

    #[async_trait]
    impl SourceAdapter for FixtureAdapter {
        fn source(&self) -> SourceKind {
            self.inner.source()
        }

        async fn fetch(&self, _http: &HttpFetcher, _ctx: &AdapterContext) -> Result<FetchedPage, AdapterError> {
            let body = tokio::fs::read(&self.file)
                .await
                .map_err(|e| AdapterError::Message(format!("reading {}: {e}", self.file.display())))?;
            Ok(FetchedPage {
                url: format!("fixture://{}", self.file.display()),
                body,
                fetched_at: Utc::now(),
            })
        }

        fn parse(&self, page: &FetchedPage) -> Result<Vec<SourceRecord>, AdapterError> {
            self.inner.parse(page)
        }
    }

    enum Misbehaviour {
        Unavailable,
        Hang,
        Panic,
    }

    struct BrokenAdapter {
        source: SourceKind,
        mode: Misbehaviour,
    }

    #[async_trait]
    impl SourceAdapter for BrokenAdapter {
        fn source(&self) -> SourceKind {
            self.source
        }

        async fn fetch(&self, _http: &HttpFetcher, _ctx: &AdapterContext) -> Result<FetchedPage, AdapterError> {
            match self.mode {
                Misbehaviour::Unavailable => Err(FetchError::HttpStatus {
                    status: 503,
                    url: "https://api.predicthq.com/v1/events/".into(),
                    body: "upstream unavailable".into(),
                }
                .into()),
                Misbehaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(AdapterError::Message("woke up".into()))
                }
                Misbehaviour::Panic => panic!("adapter blew up"),
            }
        }

        fn parse(&self, _page: &FetchedPage) -> Result<Vec<SourceRecord>, AdapterError> {
            Ok(Vec::new())
        }
    }

    fn broken(source: SourceKind, mode: Misbehaviour) -> Arc<dyn SourceAdapter> {
        Arc::new(BrokenAdapter { source, mode })
    }

    fn predicthq_fixture() -> Arc<dyn SourceAdapter> {
        FixtureAdapter::new(
            Arc::new(PredictHqAdapter {
                endpoint: "http://127.0.0.1:9/v1/events/".into(),
                api_key: Some("test-key".into()),
                credential_env: "PREDICTHQ_API_KEY".into(),
                origin: "-33.8688,151.2093".into(),
                radius: "20km".into(),
                limit: 20,
            }),
            "response.json",
        )
    }

    fn calendar_fixture() -> Arc<dyn SourceAdapter> {
        FixtureAdapter::new(
            Arc::new(GoogleCalendarAdapter {
                feed_url: "http://127.0.0.1:9/basic.ics".into(),
            }),
            "feed.ics",
        )
    }

    fn eventful_fixture() -> Arc<dyn SourceAdapter> {
        FixtureAdapter::new(
            Arc::new(EventfulAdapter {
                endpoint: "http://127.0.0.1:9/json/events/search".into(),
                app_key: Some("test-key".into()),
                credential_env: "EVENTFUL_APP_KEY".into(),
                location: "Sydney".into(),
                page_size: 10,
            }),
            "response.json",
        )
    }

    async fn pipeline(adapters: Vec<Arc<dyn SourceAdapter>>) -> SyncPipeline {
        let store = EventStore::in_memory().await.expect("store");
        store.migrate().await.expect("migrate");
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("http");
        SyncPipeline::new(adapters, http, store, Canonicalizer::new("Sydney", "Australia"))
    }

    #[tokio::test]
    async fn sweep_writes_every_source_into_the_store() {
        let pipeline = pipeline(vec![predicthq_fixture(), calendar_fixture(), eventful_fixture()]).await;
        let summary = pipeline.run_once().await.expect("sweep");

        assert_eq!(summary.failed_sources(), 0);
        assert_eq!(summary.inserted(), 7);
        assert_eq!(pipeline.store().count().await.expect("count"), 7);

        let holiday = pipeline
            .store()
            .find_by_ticket_url("google-calendar-event-20250126_australia_day@google.com")
            .await
            .expect("lookup")
            .expect("australia day stored");
        assert_eq!(holiday.event.date, "2025-01-26");
        assert_eq!(holiday.event.time, "TBA");
        assert_eq!(holiday.event.category, "Holiday");
        assert_eq!(holiday.event.venue, "Australia");
        assert_eq!(holiday.event.price, "Free");

        let fireworks = pipeline
            .store()
            .find_by_ticket_url("google-calendar-event-20251231_nye_fireworks@google.com")
            .await
            .expect("lookup")
            .expect("fireworks stored");
        assert_eq!(fireworks.event.title, "New Year's Eve Fireworks (Midnight Show)");
        assert_eq!(fireworks.event.time, "13:00");

        let comedy = pipeline
            .store()
            .find_by_ticket_url("eventful-event-E0-001-456")
            .await
            .expect("lookup")
            .expect("comedy night stored");
        assert_eq!(comedy.event.venue, "Sydney");
        assert_eq!(comedy.event.category, "General");
        assert_eq!(comedy.event.date, "TBA");
    }

    #[tokio::test]
    async fn repeated_sweeps_do_not_grow_the_store() {
        let pipeline = pipeline(vec![predicthq_fixture(), calendar_fixture(), eventful_fixture()]).await;
        let first = pipeline.run_once().await.expect("first sweep");
        let before = pipeline.store().count().await.expect("count");

        let second = pipeline.run_once().await.expect("second sweep");
        assert_eq!(pipeline.store().count().await.expect("count"), before);
        assert_eq!(second.inserted(), 0);
        assert_eq!(second.skipped(), first.inserted());
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn a_failing_source_does_not_block_the_others() {
        let pipeline = pipeline(vec![
            broken(SourceKind::PredictHq, Misbehaviour::Unavailable),
            calendar_fixture(),
            eventful_fixture(),
        ])
        .await;
        let summary = pipeline.run_once().await.expect("sweep");

        let phq = summary.report_for(SourceKind::PredictHq).expect("report");
        assert_eq!(phq.inserted, 0);
        assert!(phq.error.as_deref().unwrap_or_default().contains("503"));
        assert_eq!(summary.report_for(SourceKind::GoogleCalendar).unwrap().inserted, 3);
        assert_eq!(summary.report_for(SourceKind::Eventful).unwrap().inserted, 2);
        assert_eq!(pipeline.store().count().await.expect("count"), 5);
    }

    #[tokio::test]
    async fn a_hanging_source_is_cut_off_by_its_timeout() {
        let pipeline = pipeline(vec![broken(SourceKind::Eventful, Misbehaviour::Hang), calendar_fixture()])
            .await
            .with_adapter_timeout(Duration::from_millis(100));
        let summary = pipeline.run_once().await.expect("sweep");

        let eventful = summary.report_for(SourceKind::Eventful).expect("report");
        assert!(eventful
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("did not finish"));
        assert_eq!(summary.report_for(SourceKind::GoogleCalendar).unwrap().inserted, 3);
        assert_eq!(pipeline.state(), SweepState::Idle);
    }

    #[tokio::test]
    async fn a_panicking_source_is_reported_not_propagated() {
        let pipeline = pipeline(vec![broken(SourceKind::PredictHq, Misbehaviour::Panic), eventful_fixture()]).await;
        let summary = pipeline.run_once().await.expect("sweep");

        let phq = summary.report_for(SourceKind::PredictHq).expect("report");
        assert!(phq.error.as_deref().unwrap_or_default().contains("aborted"));
        assert_eq!(summary.report_for(SourceKind::Eventful).unwrap().inserted, 2);
    }

    #[tokio::test]
    async fn overlapping_sweeps_are_refused() {
        let pipeline = Arc::new(
            pipeline(vec![broken(SourceKind::PredictHq, Misbehaviour::Hang)])
                .await
                .with_adapter_timeout(Duration::from_millis(400)),
        );

        let running = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.run_once().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(pipeline.state(), SweepState::Running);
        assert_eq!(pipeline.run_once().await.unwrap_err(), SyncError::AlreadyRunning);

        running.await.expect("join").expect("first sweep");
        assert_eq!(pipeline.state(), SweepState::Idle);
        assert!(pipeline.run_once().await.is_ok());
    }

    #[test]
    fn gate_permits_are_exclusive_and_released_on_drop() {
        let gate = SweepGate::default();
        let permit = gate.try_enter().expect("first permit");
        assert_eq!(gate.state(), SweepState::Running);
        assert!(gate.try_enter().is_none());
        drop(permit);
        assert_eq!(gate.state(), SweepState::Idle);
        assert!(gate.try_enter().is_some());
    }

    #[tokio::test]
    async fn scheduler_accepts_the_daily_cron_and_rejects_garbage() {
        let pipeline = Arc::new(pipeline(Vec::new()).await);
        assert!(build_scheduler(Arc::clone(&pipeline), "0 0 2 * * *").await.is_ok());
        assert!(build_scheduler(pipeline, "every day at two").await.is_err());
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = SyncConfig::from_lookup(&|_| None);
        assert_eq!(defaults.sync_cron, "0 0 2 * * *");
        assert_eq!(defaults.adapter_timeout_secs, 60);
        assert!(defaults.scheduler_enabled);
        assert_eq!(defaults.registry_path(), PathBuf::from("./sources.yaml"));

        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "sqlite::memory:"),
            ("GATHER_SCHEDULER_ENABLED", "false"),
            ("GATHER_HTTP_TIMEOUT_SECS", "5"),
            ("GATHER_ADAPTER_TIMEOUT_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config = SyncConfig::from_lookup(&|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.database_url, "sqlite::memory:");
        assert!(!config.scheduler_enabled);
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(config.adapter_timeout_secs, 60);
    }
}
