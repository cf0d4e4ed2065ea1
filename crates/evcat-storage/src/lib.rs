//! Persistence gateway for canonical events + rate-limited HTTP fetching for live adapters.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use evcat_core::{CanonicalEvent, InvariantViolation};
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "evcat-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    #[error("event store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("event store document is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Identity-keyed upsert target. `upsert_batch` is all-or-nothing.
#[async_trait]
pub trait EventStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn get(&self, identity_key: &str) -> Result<Option<CanonicalEvent>, StoreError>;

    async fn upsert_batch(
        &self,
        events: Vec<CanonicalEvent>,
    ) -> Result<Vec<UpsertOutcome>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

/// Rejects the whole batch before any write if one event breaks a persisted invariant.
pub fn check_batch(events: &[CanonicalEvent]) -> Result<(), StoreError> {
    for event in events {
        event.check_persistable()?;
    }
    Ok(())
}

fn apply_upserts(
    map: &mut BTreeMap<String, CanonicalEvent>,
    events: Vec<CanonicalEvent>,
) -> Vec<UpsertOutcome> {
    events
        .into_iter()
        .map(|event| match map.get_mut(&event.identity_key) {
            Some(existing) => {
                existing.merge_from(event);
                UpsertOutcome::Updated
            }
            None => {
                map.insert(event.identity_key.clone(), event);
                UpsertOutcome::Inserted
            }
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<BTreeMap<String, CanonicalEvent>>,
    unavailable: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage; every call fails with `StoreError::Unavailable` until reset.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> Vec<CanonicalEvent> {
        self.events.lock().await.values().cloned().collect()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }

    async fn get(&self, identity_key: &str) -> Result<Option<CanonicalEvent>, StoreError> {
        self.ensure_available()?;
        Ok(self.events.lock().await.get(identity_key).cloned())
    }

    async fn upsert_batch(
        &self,
        events: Vec<CanonicalEvent>,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        self.ensure_available()?;
        check_batch(&events)?;
        let mut map = self.events.lock().await;
        Ok(apply_upserts(&mut map, events))
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.ensure_available()?;
        Ok(self.events.lock().await.len())
    }
}

/// Single JSON document holding every event, replaced atomically on each batch.
#[derive(Debug)]
pub struct JsonFileEventStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileEventStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> StoreError {
        if matches!(
            source.kind(),
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound
        ) {
            StoreError::Unavailable(format!("{}: {source}", path.display()))
        } else {
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, CanonicalEvent>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(self.io_error(&self.path, err)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        let events: Vec<CanonicalEvent> = serde_json::from_slice(&bytes)?;
        Ok(events
            .into_iter()
            .map(|e| (e.identity_key.clone(), e))
            .collect())
    }

    /// Temp file in the target directory, then rename over the previous document.
    async fn write_atomically(
        &self,
        map: &BTreeMap<String, CanonicalEvent>,
    ) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| self.io_error(&parent, e))?;

        let events: Vec<&CanonicalEvent> = map.values().collect();
        let bytes = serde_json::to_vec_pretty(&events)?;
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| self.io_error(&temp_path, e))?;
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error(&temp_path, err));
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error(&self.path, err));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for JsonFileEventStore {
    fn backend(&self) -> &'static str {
        "json-file"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        self.load().await.map(|_| ())
    }

    async fn get(&self, identity_key: &str) -> Result<Option<CanonicalEvent>, StoreError> {
        Ok(self.load().await?.remove(identity_key))
    }

    async fn upsert_batch(
        &self,
        events: Vec<CanonicalEvent>,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        check_batch(&events)?;
        let _guard = self.write_lock.lock().await;
        let mut map = self.load().await?;
        let outcomes = apply_upserts(&mut map, events);
        self.write_atomically(&map).await?;
        debug!(path = %self.path.display(), events = map.len(), "event document replaced");
        Ok(outcomes)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.load().await?.len())
    }
}

/// Postgres-backed store: one JSONB document per identity key, one transaction per batch.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("connecting to postgres event store")?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                identity_key TEXT PRIMARY KEY,
                id UUID NOT NULL,
                source_id TEXT NOT NULL,
                document JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating events table")?;
        Ok(())
    }
}

fn map_pg_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        other => StoreError::Database(other),
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn get(&self, identity_key: &str) -> Result<Option<CanonicalEvent>, StoreError> {
        let row = sqlx::query("SELECT document FROM events WHERE identity_key = $1")
            .bind(identity_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_pg_error)?;
        match row {
            Some(row) => {
                let Json(event): Json<CanonicalEvent> = row.try_get("document")?;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    async fn upsert_batch(
        &self,
        events: Vec<CanonicalEvent>,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        check_batch(&events)?;
        let mut tx = self.pool.begin().await.map_err(map_pg_error)?;
        let mut outcomes = Vec::with_capacity(events.len());

        for event in events {
            let existing = sqlx::query(
                "SELECT document FROM events WHERE identity_key = $1 FOR UPDATE",
            )
            .bind(&event.identity_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_pg_error)?;

            let (merged, outcome) = match existing {
                Some(row) => {
                    let Json(mut stored): Json<CanonicalEvent> = row.try_get("document")?;
                    stored.merge_from(event);
                    (stored, UpsertOutcome::Updated)
                }
                None => (event, UpsertOutcome::Inserted),
            };

            sqlx::query(
                r#"
                INSERT INTO events (identity_key, id, source_id, document, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (identity_key) DO UPDATE
                   SET document = EXCLUDED.document,
                       updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&merged.identity_key)
            .bind(merged.id)
            .bind(&merged.source_id)
            .bind(Json(&merged))
            .bind(merged.created_at)
            .bind(merged.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(map_pg_error)?;
            outcomes.push(outcome);
        }

        tx.commit().await.map_err(map_pg_error)?;
        Ok(outcomes)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(map_pg_error)?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as usize)
    }
}

/// How a listing fetch failed, as far as retrying it is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailure {
    /// 429, or 503 sent with a `Retry-After` hint.
    Throttled { retry_after: Option<Duration> },
    ServerError,
    /// Timeout or connection failure before any status arrived.
    Transport,
    Permanent,
}

impl FetchFailure {
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => FetchFailure::Throttled { retry_after },
            StatusCode::SERVICE_UNAVAILABLE if retry_after.is_some() => {
                FetchFailure::Throttled { retry_after }
            }
            s if s.is_server_error() => FetchFailure::ServerError,
            _ => FetchFailure::Permanent,
        }
    }

    pub fn from_request_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            FetchFailure::Transport
        } else {
            FetchFailure::Permanent
        }
    }
}

fn header_text(
    headers: &reqwest::header::HeaderMap,
    name: reqwest::header::HeaderName,
) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub first_delay: Duration,
    /// Upper bound for any single wait, including server-requested ones.
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            first_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-based), or `None` to give up.
    pub fn next_delay(&self, retry: usize, failure: FetchFailure) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        match failure {
            FetchFailure::Permanent => None,
            FetchFailure::Throttled {
                retry_after: Some(wait),
            } => Some(wait.min(self.ceiling)),
            _ => {
                let doubling = 1u32.checked_shl((retry - 1) as u32).unwrap_or(u32::MAX);
                Some(self.first_delay.saturating_mul(doubling).min(self.ceiling))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub retry: RetryPolicy,
    /// Requests per source allowed per `refill_every`.
    pub per_source_rate: Option<RateLimit>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 2,
            retry: RetryPolicy::default(),
            per_source_rate: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
struct TokenBucket {
    limit: RateLimit,
    state: Mutex<(u32, Instant)>,
}

impl TokenBucket {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: Mutex::new((limit.capacity, Instant::now())),
        }
    }

    async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let (tokens, last_refill) = *state;
            let refill_ms = self.limit.refill_every.as_millis();
            if refill_ms > 0 {
                let refills = (last_refill.elapsed().as_millis() / refill_ms) as u32;
                if refills > 0 {
                    *state = (
                        tokens.saturating_add(refills).min(self.limit.capacity),
                        Instant::now(),
                    );
                }
            }
            if state.0 > 0 {
                state.0 -= 1;
                return;
            }
            drop(state);
            tokio::time::sleep(self.limit.refill_every).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub final_url: String,
    pub content_type: Option<String>,
    pub text: String,
}

/// Shared HTTP client: global and per-source concurrency caps, optional per-source token
/// bucket, and retries that honour `Retry-After`.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, (Arc<Semaphore>, Option<Arc<TokenBucket>>)>>,
    rate: Option<RateLimit>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            rate: config.per_source_rate,
            retry: config.retry,
        })
    }

    async fn source_gates(&self, source_id: &str) -> (Arc<Semaphore>, Option<Arc<TokenBucket>>) {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| {
                (
                    Arc::new(Semaphore::new(self.per_source_limit)),
                    self.rate.map(|r| Arc::new(TokenBucket::new(r))),
                )
            })
            .clone()
    }

    pub async fn get_text(&self, source_id: &str, url: &str) -> Result<FetchedBody, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let (source_gate, bucket) = self.source_gates(source_id).await;
        let _source = source_gate.acquire().await.map_err(|_| FetchError::Closed)?;
        if let Some(bucket) = bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedBody, FetchError> {
        let mut retry = 0usize;
        loop {
            retry += 1;
            let (failure, error) = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let content_type =
                            header_text(resp.headers(), reqwest::header::CONTENT_TYPE);
                        let text = resp.text().await.map_err(|source| FetchError::Request {
                            url: final_url.clone(),
                            source,
                        })?;
                        return Ok(FetchedBody {
                            final_url,
                            content_type,
                            text,
                        });
                    }
                    let retry_after = header_text(resp.headers(), reqwest::header::RETRY_AFTER)
                        .and_then(|v| parse_retry_after(&v));
                    (
                        FetchFailure::from_status(status, retry_after),
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        },
                    )
                }
                Err(source) => (
                    FetchFailure::from_request_error(&source),
                    FetchError::Request {
                        url: url.to_string(),
                        source,
                    },
                ),
            };
            let Some(wait) = self.retry.next_delay(retry, failure) else {
                return Err(error);
            };
            debug!(retry, wait_ms = wait.as_millis() as u64, ?failure, "retrying listing fetch");
            tokio::time::sleep(wait).await;
        }
    }
}
