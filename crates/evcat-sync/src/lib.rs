//! Sync pipeline orchestration: harvest, validate, resolve dates, normalize, key, dedupe, upsert, report.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use evcat_adapters::{
    adapter_for_source, AdapterContext, AdapterOutput, AdapterSpec, HarvestMode, SourceAdapter,
};
use evcat_core::{
    collapse_whitespace, CanonicalEvent, CategoryRules, Coordinates, DropReason, Price,
    SchemaNormalizer, Venue, VenueField,
};
use evcat_dates::{DateInput, DateResolver};
use evcat_storage::{
    EventStore, FetchConfig, HttpFetcher, JsonFileEventStore, PgEventStore, UpsertOutcome,
};
use evcat_validate::{CandidateValidator, ValidatorRules, Verdict};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strsim::jaro_winkler;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "evcat-sync";

/// How a source's events are keyed when deduplicating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityBasis {
    /// `title|date`, falling back to the venue when no date resolved.
    #[default]
    Date,
    /// `title|@venue` always; for residencies listed without dates.
    Venue,
}

/// What happens to an accepted candidate whose date cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndatedPolicy {
    #[default]
    Drop,
    Keep,
}

impl UndatedPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "drop" => Some(UndatedPolicy::Drop),
            "keep" => Some(UndatedPolicy::Keep),
            _ => None,
        }
    }
}

fn parse_harvest_mode(value: &str) -> Option<HarvestMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "fixture" | "fixtures" => Some(HarvestMode::Fixture),
        "live" => Some(HarvestMode::Live),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub version: u32,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    /// Contextual city for venues that arrive without one.
    pub city: String,
    /// Fallback venue when a listing names none.
    pub venue: Venue,
    #[serde(default)]
    pub identity_basis: IdentityBasis,
    /// Category for events that no keyword rule matches.
    #[serde(default)]
    pub default_category: Option<String>,
    pub adapter: AdapterSpec,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.source_id.trim().is_empty() {
                bail!("source registry contains an entry without source_id");
            }
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id `{}` in source registry", source.source_id);
            }
            if source.venue.name.trim().is_empty() || source.city.trim().is_empty() {
                bail!("source `{}` needs a venue name and a city", source.source_id);
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Keyword category rules from `path`, or none when the file is absent.
pub fn load_category_rules(path: impl AsRef<Path>) -> Result<CategoryRules> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(CategoryRules::default());
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub database_url: Option<String>,
    pub store_path: PathBuf,
    pub reports_dir: PathBuf,
    pub harvest_mode: HarvestMode,
    pub max_concurrency: usize,
    pub adapter_timeout: Duration,
    pub undated_policy: UndatedPolicy,
    pub near_duplicate_threshold: f64,
    /// Consecutive unhealthy runs after which a source is flagged.
    pub health_alert_threshold: usize,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse_u64 = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let workspace_root = lookup("EVCAT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let undated_policy = match lookup("EVCAT_UNDATED_POLICY") {
            Some(raw) => UndatedPolicy::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown EVCAT_UNDATED_POLICY; dropping undated candidates");
                UndatedPolicy::Drop
            }),
            None => UndatedPolicy::Drop,
        };
        let harvest_mode = match lookup("EVCAT_HARVEST_MODE") {
            Some(raw) => parse_harvest_mode(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown EVCAT_HARVEST_MODE; using fixtures");
                HarvestMode::Fixture
            }),
            None => HarvestMode::Fixture,
        };

        Self {
            database_url: lookup("EVCAT_DATABASE_URL")
                .or_else(|| lookup("DATABASE_URL"))
                .filter(|v| !v.trim().is_empty()),
            store_path: lookup("EVCAT_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("data").join("events.json")),
            reports_dir: lookup("EVCAT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("reports")),
            harvest_mode,
            max_concurrency: parse_u64("EVCAT_MAX_CONCURRENCY", 4).max(1) as usize,
            adapter_timeout: Duration::from_secs(parse_u64("EVCAT_ADAPTER_TIMEOUT_SECS", 60)),
            undated_policy,
            near_duplicate_threshold: lookup("EVCAT_NEAR_DUPLICATE_THRESHOLD")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| (0.0..=1.0).contains(v))
                .unwrap_or(DedupConfig::default().near_duplicate_threshold),
            health_alert_threshold: parse_u64("EVCAT_HEALTH_ALERT_THRESHOLD", 3).max(1) as usize,
            scheduler_enabled: lookup("EVCAT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: lookup("EVCAT_SYNC_CRON_1").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            sync_cron_2: lookup("EVCAT_SYNC_CRON_2").unwrap_or_else(|| "0 0 18 * * *".to_string()),
            user_agent: lookup("EVCAT_USER_AGENT").unwrap_or_else(|| "evcat-bot/0.1".to_string()),
            http_timeout_secs: parse_u64("EVCAT_HTTP_TIMEOUT_SECS", 20),
            workspace_root,
        }
    }
}

/// Identity key: normalized title plus ISO date, or `@venue` when undated or venue-keyed.
pub fn identity_key(event: &CanonicalEvent, basis: IdentityBasis) -> String {
    let title = normalize_key_fragment(&event.title);
    match (basis, event.date) {
        (IdentityBasis::Date, Some(date)) => format!("{title}|{}", date.iso_day()),
        _ => format!("{title}|@{}", normalize_key_fragment(event.venue.name())),
    }
}

pub fn normalize_key_fragment(input: &str) -> String {
    collapse_whitespace(input).to_lowercase()
}

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Jaro-Winkler score at which two same-day titles are flagged for review.
    pub near_duplicate_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            near_duplicate_threshold: 0.92,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    New,
    Duplicate { first_source: String },
}

/// Pair of distinct identities whose titles look alike. Reported, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearDuplicate {
    pub identity_key_a: String,
    pub source_a: String,
    pub identity_key_b: String,
    pub source_b: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
struct AdmittedIdentity {
    identity_key: String,
    title_key: String,
    day: Option<NaiveDate>,
    source_id: String,
}

/// Exact identity-key deduplication across one run. First seen wins.
#[derive(Debug)]
pub struct DedupEngine {
    config: DedupConfig,
    first_source: HashMap<String, String>,
    admitted: Vec<AdmittedIdentity>,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            first_source: HashMap::new(),
            admitted: Vec::new(),
        }
    }

    pub fn admit(&mut self, event: &CanonicalEvent) -> Admission {
        if let Some(first) = self.first_source.get(&event.identity_key) {
            return Admission::Duplicate {
                first_source: first.clone(),
            };
        }
        self.first_source
            .insert(event.identity_key.clone(), event.source_id.clone());
        self.admitted.push(AdmittedIdentity {
            identity_key: event.identity_key.clone(),
            title_key: normalize_key_fragment(&event.title),
            day: event.date.map(|d| d.day),
            source_id: event.source_id.clone(),
        });
        Admission::New
    }

    pub fn admitted_count(&self) -> usize {
        self.admitted.len()
    }

    pub fn similarity(a: &str, b: &str) -> f64 {
        jaro_winkler(&normalize_key_fragment(a), &normalize_key_fragment(b))
    }

    pub fn near_duplicates(&self) -> Vec<NearDuplicate> {
        let mut pairs = Vec::new();
        for (i, a) in self.admitted.iter().enumerate() {
            for b in &self.admitted[i + 1..] {
                if a.day != b.day {
                    continue;
                }
                let score = jaro_winkler(&a.title_key, &b.title_key);
                if score >= self.config.near_duplicate_threshold {
                    pairs.push(NearDuplicate {
                        identity_key_a: a.identity_key.clone(),
                        source_a: a.source_id.clone(),
                        identity_key_b: b.identity_key.clone(),
                        source_b: b.source_id.clone(),
                        score,
                    });
                }
            }
        }
        pairs
    }
}

#[derive(Debug)]
pub enum HarvestOutcome {
    Completed(AdapterOutput),
    TimedOut,
    Failed(String),
}

#[derive(Debug)]
pub struct HarvestResult {
    pub source_id: String,
    pub outcome: HarvestOutcome,
    pub elapsed: Duration,
}

/// Runs adapters concurrently under a permit cap and a per-adapter deadline.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    max_concurrency: usize,
    timeout: Duration,
}

impl WorkerPool {
    pub fn new(max_concurrency: usize, timeout: Duration) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            timeout,
        }
    }

    /// Results come back in input order whatever the completion order.
    pub async fn harvest(
        &self,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        http: Arc<HttpFetcher>,
        ctx: Arc<AdapterContext>,
    ) -> Vec<HarvestResult> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut results: Vec<HarvestResult> = adapters
            .iter()
            .map(|adapter| HarvestResult {
                source_id: adapter.source_id().to_string(),
                outcome: HarvestOutcome::Failed("harvest task did not complete".to_string()),
                elapsed: Duration::ZERO,
            })
            .collect();

        let mut tasks = JoinSet::new();
        for (index, adapter) in adapters.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let http = Arc::clone(&http);
            let ctx = Arc::clone(&ctx);
            let timeout = self.timeout;
            let span = info_span!("harvest", source_id = adapter.source_id());
            tasks.spawn(
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return (
                            index,
                            HarvestOutcome::Failed("worker pool closed".to_string()),
                            Duration::ZERO,
                        );
                    };
                    let started = Instant::now();
                    let outcome =
                        match tokio::time::timeout(timeout, adapter.produce_candidates(&http, &ctx))
                            .await
                        {
                            Ok(Ok(output)) => HarvestOutcome::Completed(output),
                            Ok(Err(err)) => {
                                warn!(error = %err, "adapter failed");
                                HarvestOutcome::Failed(err.to_string())
                            }
                            Err(_) => {
                                warn!(timeout_ms = timeout.as_millis() as u64, "adapter timed out");
                                HarvestOutcome::TimedOut
                            }
                        };
                    (index, outcome, started.elapsed())
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome, elapsed)) => {
                    results[index].outcome = outcome;
                    results[index].elapsed = elapsed;
                }
                Err(err) => error!(error = %err, "harvest task aborted"),
            }
        }
        results
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStatus {
    #[default]
    Ok,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub source_id: String,
    pub adapter_status: AdapterStatus,
    pub adapter_error: Option<String>,
    pub elapsed_ms: u64,
    pub harvested: usize,
    pub extraction_failures: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub dated: usize,
    pub undated: usize,
    pub duplicates: usize,
    pub inserted: usize,
    pub updated: usize,
    pub reject_reasons: BTreeMap<String, usize>,
    pub drops: BTreeMap<String, usize>,
    /// Unhealthy runs in a row, this one included.
    #[serde(default)]
    pub consecutive_failures: usize,
    #[serde(default)]
    pub alerting: bool,
}

impl SourceStats {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }

    fn record_drops(&mut self, reason: DropReason, count: usize) {
        if count > 0 {
            *self.drops.entry(reason.as_str().to_string()).or_default() += count;
        }
    }

    pub fn persisted(&self) -> usize {
        self.inserted + self.updated
    }

    /// The adapter completed and at least one candidate passed validation.
    pub fn healthy(&self) -> bool {
        self.adapter_status == AdapterStatus::Ok && self.accepted > 0
    }
}

/// Previous run reports consulted when counting a source's failure streak.
pub const HEALTH_HISTORY_RUNS: usize = 10;

/// Failure streak for `current`, counting back through `history` (newest first) until a
/// healthy run or a run without this source.
pub fn consecutive_failures(current: &SourceStats, history: &[SyncRunSummary]) -> usize {
    if current.healthy() {
        return 0;
    }
    1 + history
        .iter()
        .take(HEALTH_HISTORY_RUNS)
        .map_while(|run| {
            run.sources
                .iter()
                .find(|s| s.source_id == current.source_id)
                .filter(|s| !s.healthy())
        })
        .count()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub harvest_mode: HarvestMode,
    pub undated_policy: UndatedPolicy,
    pub store_backend: String,
    pub enabled_sources: usize,
    pub harvested: usize,
    pub persisted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub sources: Vec<SourceStats>,
    pub near_duplicates: Vec<NearDuplicate>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Postgres when a database URL is configured, the JSON document store otherwise.
pub async fn open_event_store(config: &SyncConfig) -> Result<Arc<dyn EventStore>> {
    match &config.database_url {
        Some(url) => Ok(Arc::new(PgEventStore::connect(url).await?)),
        None => Ok(Arc::new(JsonFileEventStore::new(config.store_path.clone()))),
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn EventStore>,
    http: Arc<HttpFetcher>,
    today: Option<NaiveDate>,
}

impl SyncPipeline {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = open_event_store(&config).await?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: SyncConfig, store: Arc<dyn EventStore>) -> Result<Self> {
        let http = HttpFetcher::new(FetchConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            global_concurrency: config.max_concurrency * 2,
            ..Default::default()
        })?;
        Ok(Self {
            config,
            store,
            http: Arc::new(http),
            today: None,
        })
    }

    /// Pins the date used for year inference instead of reading the clock.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, store = self.store.backend());
        self.run_with_id(run_id).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let registry = self.load_source_registry().await?;
        let sources: Vec<SourceConfig> = registry.enabled().cloned().collect();
        let rules = ValidatorRules::from_optional_yaml_file(
            self.config.workspace_root.join("rules").join("denylist.yaml"),
        )?;
        let categories =
            load_category_rules(self.config.workspace_root.join("rules").join("categories.yaml"))?;
        info!(sources = sources.len(), mode = ?self.config.harvest_mode, "sync run started");

        let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();
        let mut build_errors: HashMap<String, String> = HashMap::new();
        for source in &sources {
            match adapter_for_source(&source.source_id, &source.adapter) {
                Ok(adapter) => adapters.push(Arc::from(adapter)),
                Err(err) => {
                    warn!(source_id = %source.source_id, error = %err, "adapter could not be built");
                    build_errors.insert(source.source_id.clone(), err.to_string());
                }
            }
        }

        let ctx = Arc::new(AdapterContext {
            run_id,
            fetched_at: started_at,
            mode: self.config.harvest_mode,
            workspace_root: self.config.workspace_root.clone(),
        });
        let pool = WorkerPool::new(self.config.max_concurrency, self.config.adapter_timeout);
        let mut harvested: HashMap<String, HarvestResult> = pool
            .harvest(adapters, Arc::clone(&self.http), ctx)
            .await
            .into_iter()
            .map(|r| (r.source_id.clone(), r))
            .collect();

        let resolver = self
            .today
            .map(DateResolver::new)
            .unwrap_or_else(DateResolver::from_clock);
        let mut dedup = DedupEngine::new(DedupConfig {
            near_duplicate_threshold: self.config.near_duplicate_threshold,
        });
        let mut events = Vec::new();
        let mut stats = Vec::with_capacity(sources.len());

        for source in &sources {
            let mut source_stats = SourceStats::new(&source.source_id);
            if let Some(err) = build_errors.remove(&source.source_id) {
                source_stats.adapter_status = AdapterStatus::Failed;
                source_stats.adapter_error = Some(err);
            } else if let Some(result) = harvested.remove(&source.source_id) {
                source_stats.elapsed_ms = result.elapsed.as_millis() as u64;
                match result.outcome {
                    HarvestOutcome::Completed(output) => events.extend(self.normalize_source(
                        source,
                        output,
                        &resolver,
                        &rules,
                        &categories,
                        &mut dedup,
                        &mut source_stats,
                    )),
                    HarvestOutcome::TimedOut => source_stats.adapter_status = AdapterStatus::TimedOut,
                    HarvestOutcome::Failed(err) => {
                        source_stats.adapter_status = AdapterStatus::Failed;
                        source_stats.adapter_error = Some(err);
                    }
                }
            }
            info!(
                source_id = %source.source_id,
                status = ?source_stats.adapter_status,
                harvested = source_stats.harvested,
                accepted = source_stats.accepted,
                rejected = source_stats.rejected,
                undated = source_stats.undated,
                duplicates = source_stats.duplicates,
                "source normalized"
            );
            stats.push(source_stats);
        }

        self.store
            .ping()
            .await
            .with_context(|| format!("{} event store is unavailable", self.store.backend()))?;

        let snapshot = events.clone();
        let outcomes = self
            .store
            .upsert_batch(events)
            .await
            .context("upserting canonical events")?;
        let index: HashMap<String, usize> = stats
            .iter()
            .enumerate()
            .map(|(i, s)| (s.source_id.clone(), i))
            .collect();
        for (event, outcome) in snapshot.iter().zip(&outcomes) {
            if let Some(&i) = index.get(&event.source_id) {
                match outcome {
                    UpsertOutcome::Inserted => stats[i].inserted += 1,
                    UpsertOutcome::Updated => stats[i].updated += 1,
                }
            }
        }

        self.record_source_health(&mut stats);

        let near_duplicates = dedup.near_duplicates();
        for pair in &near_duplicates {
            info!(
                a = %pair.identity_key_a,
                b = %pair.identity_key_b,
                score = pair.score,
                "near-duplicate titles kept apart"
            );
        }

        let finished_at = Utc::now();
        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            harvest_mode: self.config.harvest_mode,
            undated_policy: self.config.undated_policy,
            store_backend: self.store.backend().to_string(),
            enabled_sources: sources.len(),
            harvested: stats.iter().map(|s| s.harvested).sum(),
            persisted: outcomes.len(),
            inserted: stats.iter().map(|s| s.inserted).sum(),
            updated: stats.iter().map(|s| s.updated).sum(),
            sources: stats,
            near_duplicates,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: String::new(),
        };

        let manifest_path = self
            .export_parquet_snapshots(&reports_dir, &summary, &snapshot)
            .await?;
        summary.parquet_manifest = manifest_path.display().to_string();
        self.write_reports(&reports_dir, &summary).await?;

        info!(
            persisted = summary.persisted,
            inserted = summary.inserted,
            updated = summary.updated,
            "sync run complete"
        );
        Ok(summary)
    }

    fn normalize_source(
        &self,
        source: &SourceConfig,
        output: AdapterOutput,
        resolver: &DateResolver,
        rules: &ValidatorRules,
        categories: &CategoryRules,
        dedup: &mut DedupEngine,
        stats: &mut SourceStats,
    ) -> Vec<CanonicalEvent> {
        let normalizer = SchemaNormalizer::for_city(&source.city)
            .with_categories(categories.clone(), source.default_category.clone());
        let mut validator = CandidateValidator::new(rules.clone());
        stats.harvested = output.candidates.len();
        stats.extraction_failures = output.extraction_failures;
        stats.record_drops(DropReason::ExtractionFailure, output.extraction_failures);

        let mut admitted = Vec::new();
        for candidate in output.candidates {
            if let Verdict::Reject(reason) = validator.check(&candidate.title) {
                debug!(title = %candidate.title, reason = reason.label(), "candidate rejected");
                stats.rejected += 1;
                *stats
                    .reject_reasons
                    .entry(reason.label().to_string())
                    .or_default() += 1;
                stats.record_drops(DropReason::ValidationRejected, 1);
                continue;
            }
            stats.accepted += 1;

            let resolved = resolver.resolve(&DateInput {
                text: candidate.raw_date.as_deref(),
                url: Some(candidate.source_url.as_str()),
                machine: candidate.machine_date.as_deref(),
            });
            let date = match resolved {
                Some(resolved) => {
                    stats.dated += 1;
                    Some(resolved.date)
                }
                None => {
                    stats.undated += 1;
                    if self.config.undated_policy == UndatedPolicy::Drop {
                        debug!(title = %candidate.title, "no date resolved; dropped");
                        stats.record_drops(DropReason::DateUnresolved, 1);
                        continue;
                    }
                    None
                }
            };

            let mut event =
                normalizer.normalize(CanonicalEvent::from_candidate(candidate, date, &source.venue));
            event.assign_identity(identity_key(&event, source.identity_basis));
            match dedup.admit(&event) {
                Admission::New => admitted.push(event),
                Admission::Duplicate { first_source } => {
                    debug!(
                        identity_key = %event.identity_key,
                        first_source = %first_source,
                        "duplicate identity dropped"
                    );
                    stats.duplicates += 1;
                    stats.record_drops(DropReason::DuplicateIdentity, 1);
                }
            }
        }
        admitted
    }

    fn record_source_health(&self, stats: &mut [SourceStats]) {
        let history = if self.config.reports_dir.exists() {
            read_run_summaries(&self.config.reports_dir).unwrap_or_else(|err| {
                warn!(error = %err, "previous run reports unreadable; health starts fresh");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        for source in stats.iter_mut() {
            source.consecutive_failures = consecutive_failures(source, &history);
            source.alerting = source.consecutive_failures >= self.config.health_alert_threshold;
            if source.alerting {
                warn!(
                    source_id = %source.source_id,
                    consecutive_failures = source.consecutive_failures,
                    status = ?source.adapter_status,
                    "source has produced no events for several runs"
                );
            }
        }
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            persisted = summary.persisted,
                            "scheduled sync complete"
                        ),
                        Err(err) => error!(error = ?err, "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        SourceRegistry::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    async fn write_reports(&self, reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        fs::write(reports_dir.join("daily_brief.md"), daily_brief_markdown(summary))
            .await
            .context("writing daily_brief.md")?;

        let report = serde_json::to_vec_pretty(summary).context("serializing run report")?;
        fs::write(reports_dir.join("run_report.json"), report)
            .await
            .context("writing run_report.json")?;
        Ok(())
    }

    async fn export_parquet_snapshots(
        &self,
        reports_dir: &Path,
        summary: &SyncRunSummary,
        events: &[CanonicalEvent],
    ) -> Result<PathBuf> {
        let snapshot_dir = reports_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let events_path = snapshot_dir.join("events.parquet");
        let stats_path = snapshot_dir.join("source_stats.parquet");
        write_events_parquet(&events_path, events)?;
        write_source_stats_parquet(&stats_path, &summary.sources)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            run_id: summary.run_id,
            files: vec![
                manifest_entry("events", reports_dir, &events_path)?,
                manifest_entry("source_stats", reports_dir, &stats_path)?,
            ],
        };

        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_once().await
}

fn daily_brief_markdown(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# Event Catalog Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Store: {}", summary.store_backend),
        format!("- Enabled sources: {}", summary.enabled_sources),
        format!(
            "- Persisted events: {} ({} new, {} updated)",
            summary.persisted, summary.inserted, summary.updated
        ),
        String::new(),
        "## Sources".to_string(),
        String::new(),
        "| source | status | harvested | accepted | rejected | undated | duplicates | new | updated |"
            .to_string(),
        "|---|---|---|---|---|---|---|---|---|".to_string(),
    ];
    for s in &summary.sources {
        lines.push(format!(
            "| {} | {:?} | {} | {} | {} | {} | {} | {} | {} |",
            s.source_id,
            s.adapter_status,
            s.harvested,
            s.accepted,
            s.rejected,
            s.undated,
            s.duplicates,
            s.inserted,
            s.updated
        ));
    }
    let unhealthy: Vec<&SourceStats> = summary
        .sources
        .iter()
        .filter(|s| s.consecutive_failures > 0)
        .collect();
    if !unhealthy.is_empty() {
        lines.push(String::new());
        lines.push("## Source health".to_string());
        for s in unhealthy {
            lines.push(format!(
                "- {}{}: {} run(s) in a row without events",
                if s.alerting { "**ALERT** " } else { "" },
                s.source_id,
                s.consecutive_failures
            ));
        }
    }
    if !summary.near_duplicates.is_empty() {
        lines.push(String::new());
        lines.push("## Near duplicates (not merged)".to_string());
        for pair in &summary.near_duplicates {
            lines.push(format!(
                "- `{}` ({}) ~ `{}` ({}): {:.3}",
                pair.identity_key_a, pair.source_a, pair.identity_key_b, pair.source_b, pair.score
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Every `run_report.json` under `reports_root`, newest run first.
pub fn read_run_summaries(reports_root: &Path) -> Result<Vec<SyncRunSummary>> {
    let mut summaries = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|entry| entry.path().join("run_report.json"))
        .filter(|path| path.exists())
        .map(|path| -> Result<SyncRunSummary> {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(summaries)
}

/// Markdown digest of the most recent `runs` run reports under `<workspace>/reports`.
pub fn report_daily_markdown(runs: usize, reports_root: Option<PathBuf>) -> Result<String> {
    let reports_root = reports_root.unwrap_or_else(|| PathBuf::from("./reports"));
    let summaries = read_run_summaries(&reports_root)?;

    let mut lines = vec!["# Event Catalog Report".to_string(), String::new()];
    for summary in summaries.iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- persisted: {} ({} new, {} updated)",
            summary.persisted, summary.inserted, summary.updated
        ));
        let failing: Vec<&str> = summary
            .sources
            .iter()
            .filter(|s| s.adapter_status != AdapterStatus::Ok)
            .map(|s| s.source_id.as_str())
            .collect();
        if !failing.is_empty() {
            lines.push(format!("- failing sources: {}", failing.join(", ")));
        }
        let alerting: Vec<String> = summary
            .sources
            .iter()
            .filter(|s| s.alerting)
            .map(|s| format!("{} ({})", s.source_id, s.consecutive_failures))
            .collect();
        if !alerting.is_empty() {
            lines.push(format!("- alerting sources: {}", alerting.join(", ")));
        }
        if !summary.near_duplicates.is_empty() {
            lines.push(format!("- near duplicates: {}", summary.near_duplicates.len()));
        }
        lines.push(format!("- parquet manifest: `{}`", summary.parquet_manifest));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn strings<'a>(values: impl Iterator<Item = Option<&'a str>>) -> StringArray {
    StringArray::from(values.collect::<Vec<_>>())
}

fn write_events_parquet(path: &Path, events: &[CanonicalEvent]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("identity_key", DataType::Utf8, false),
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("date", DataType::Utf8, true),
        ArrowField::new("time", DataType::Utf8, true),
        ArrowField::new("venue", DataType::Utf8, false),
        ArrowField::new("city", DataType::Utf8, true),
        ArrowField::new("price", DataType::Utf8, true),
        ArrowField::new("url", DataType::Utf8, true),
        ArrowField::new("longitude", DataType::Float64, true),
        ArrowField::new("latitude", DataType::Float64, true),
    ]));

    let ids: Vec<String> = events.iter().map(|e| e.id.to_string()).collect();
    let days: Vec<Option<String>> = events.iter().map(|e| e.date.map(|d| d.iso_day())).collect();
    let times: Vec<Option<String>> = events
        .iter()
        .map(|e| e.date.and_then(|d| d.time).map(|t| t.format("%H:%M").to_string()))
        .collect();
    let pairs: Vec<Option<[f64; 2]>> = events
        .iter()
        .map(|e| match e.coordinates {
            Some(Coordinates::Pair(pair)) => Some(pair),
            _ => None,
        })
        .collect();

    let columns: Vec<Arc<dyn arrow_array::Array>> = vec![
        Arc::new(strings(events.iter().map(|e| Some(e.identity_key.as_str())))),
        Arc::new(strings(ids.iter().map(|s| Some(s.as_str())))),
        Arc::new(strings(events.iter().map(|e| Some(e.source_id.as_str())))),
        Arc::new(strings(events.iter().map(|e| Some(e.title.as_str())))),
        Arc::new(strings(days.iter().map(|d| d.as_deref()))),
        Arc::new(strings(times.iter().map(|t| t.as_deref()))),
        Arc::new(strings(events.iter().map(|e| Some(e.venue.name())))),
        Arc::new(strings(events.iter().map(|e| match &e.venue {
            VenueField::Object(v) => Some(v.city.as_str()),
            VenueField::Name(_) => None,
        }))),
        Arc::new(strings(events.iter().map(|e| match &e.price {
            Some(Price::Display(p)) => Some(p.as_str()),
            _ => None,
        }))),
        Arc::new(strings(events.iter().map(|e| e.url.as_deref()))),
        Arc::new(Float64Array::from(pairs.iter().map(|p| p.map(|[lng, _]| lng)).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(pairs.iter().map(|p| p.map(|[_, lat]| lat)).collect::<Vec<_>>())),
    ];

    let batch = RecordBatch::try_new(schema, columns).context("building events record batch")?;
    write_parquet(path, batch)
}

fn write_source_stats_parquet(path: &Path, stats: &[SourceStats]) -> Result<()> {
    let counters: [(&str, fn(&SourceStats) -> usize); 11] = [
        ("harvested", |s| s.harvested),
        ("extraction_failures", |s| s.extraction_failures),
        ("accepted", |s| s.accepted),
        ("rejected", |s| s.rejected),
        ("dated", |s| s.dated),
        ("undated", |s| s.undated),
        ("duplicates", |s| s.duplicates),
        ("inserted", |s| s.inserted),
        ("updated", |s| s.updated),
        ("elapsed_ms", |s| s.elapsed_ms as usize),
        ("consecutive_failures", |s| s.consecutive_failures),
    ];

    let mut fields = vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("adapter_status", DataType::Utf8, false),
    ];
    fields.extend(
        counters
            .iter()
            .map(|(name, _)| ArrowField::new(*name, DataType::UInt64, false)),
    );

    let statuses: Vec<String> = stats
        .iter()
        .map(|s| format!("{:?}", s.adapter_status).to_lowercase())
        .collect();
    let mut columns: Vec<Arc<dyn arrow_array::Array>> = vec![
        Arc::new(strings(stats.iter().map(|s| Some(s.source_id.as_str())))),
        Arc::new(strings(statuses.iter().map(|s| Some(s.as_str())))),
    ];
    for (_, get) in counters {
        columns.push(Arc::new(UInt64Array::from(
            stats.iter().map(|s| get(s) as u64).collect::<Vec<_>>(),
        )));
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("building source_stats record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
