//! Cycle orchestration: configuration, relevance rules, adapter fan-out,
//! dedup and notification.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use itif_adapters::{enabled_adapters, AdapterContext, FetchFailure, FetchOutcome, SourceAdapter, SourceKind};
use itif_core::Record;
use itif_notify::{
    DeliveryReport, LogSink, NotificationBatcher, NotificationSink, TelegramConfig, TelegramSink,
    DEFAULT_BATCH_SIZE,
};
use itif_storage::{
    DedupStore, FirestoreConfig, FirestoreStore, HydrationReport, LocalMirror, MemoryRemoteStore,
    RemoteStore, StoreError, DEFAULT_REMOTE_PAGE_SIZE,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use itif_adapters::SourceConfig;

pub const CRATE_NAME: &str = "itif-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub async fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub seen_file: PathBuf,
    pub reports_enabled: bool,
    pub batch_size: usize,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub remote_page_size: usize,
    pub firestore_project_id: Option<String>,
    pub firestore_collection: String,
    pub firestore_access_token: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    /// Defaults rooted at `workspace_root`, ignoring the environment.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            seen_file: PathBuf::from("seen_urls.json"),
            reports_enabled: false,
            batch_size: DEFAULT_BATCH_SIZE,
            user_agent: format!("itif-bot/{}", env!("CARGO_PKG_VERSION")),
            scheduler_enabled: false,
            sync_cron: "0 0 */5 * * *".to_string(),
            remote_page_size: DEFAULT_REMOTE_PAGE_SIZE,
            firestore_project_id: None,
            firestore_collection: "internships".to_string(),
            firestore_access_token: None,
            telegram_bot_token: None,
            telegram_chat_id: None,
        }
    }

    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::for_workspace(
            std::env::var("ITIF_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        );

        Self {
            seen_file: std::env::var("ITIF_SEEN_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.seen_file),
            reports_enabled: env_flag("ITIF_REPORTS_ENABLED"),
            batch_size: std::env::var("ITIF_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
            user_agent: std::env::var("ITIF_USER_AGENT").unwrap_or(defaults.user_agent),
            scheduler_enabled: env_flag("ITIF_SCHEDULER_ENABLED"),
            sync_cron: std::env::var("ITIF_SYNC_CRON").unwrap_or(defaults.sync_cron),
            remote_page_size: std::env::var("ITIF_REMOTE_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.remote_page_size),
            firestore_project_id: env_opt("FIRESTORE_PROJECT_ID"),
            firestore_collection: env_opt("FIRESTORE_COLLECTION").unwrap_or(defaults.firestore_collection),
            firestore_access_token: env_opt("FIRESTORE_ACCESS_TOKEN"),
            telegram_bot_token: env_opt("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env_opt("TELEGRAM_CHAT_ID"),
            workspace_root: defaults.workspace_root,
        }
    }

    pub fn mirror_path(&self) -> PathBuf {
        self.workspace_root.join(&self.seen_file)
    }
}

// ---------------------------------------------------------------------------
// Relevance

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownAgePolicy {
    #[default]
    Exclude,
    Include,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceRules {
    #[serde(default = "default_rules_version")]
    pub version: u32,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,
    #[serde(default)]
    pub unknown_age: UnknownAgePolicy,
}

fn default_rules_version() -> u32 {
    1
}

fn default_window_hours() -> i64 {
    24
}

impl RelevanceRules {
    pub async fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("relevance.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// How many records each filter stage removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterReport {
    pub input: usize,
    pub dropped_keyword: usize,
    pub dropped_location: usize,
    pub dropped_recency: usize,
    pub kept: usize,
}

/// Keyword, then location, then recency. Matching is case-insensitive substring.
#[derive(Debug, Clone)]
pub struct RelevanceFilter {
    keywords: Vec<String>,
    locations: Vec<String>,
    window: chrono::Duration,
    unknown_age: UnknownAgePolicy,
}

impl RelevanceFilter {
    pub fn new(rules: &RelevanceRules) -> Self {
        let lower = |terms: &[String]| {
            terms
                .iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
        };
        Self {
            keywords: lower(&rules.keywords),
            locations: lower(&rules.locations),
            window: chrono::Duration::hours(rules.window_hours.max(0)),
            unknown_age: rules.unknown_age,
        }
    }

    /// An empty keyword list accepts everything.
    pub fn matches_keywords(&self, record: &Record) -> bool {
        if self.keywords.is_empty() {
            return true;
        }
        let title = record.title().to_lowercase();
        let description = record.description().to_lowercase();
        self.keywords
            .iter()
            .any(|k| title.contains(k.as_str()) || description.contains(k.as_str()))
    }

    pub fn matches_location(&self, record: &Record) -> bool {
        if self.locations.is_empty() {
            return true;
        }
        let location = record.location().to_lowercase();
        self.locations.iter().any(|l| location.contains(l.as_str()))
    }

    pub fn is_recent(&self, record: &Record, now: DateTime<Utc>) -> bool {
        match record.posted_at() {
            Some(posted_at) => posted_at >= now - self.window,
            None => self.unknown_age == UnknownAgePolicy::Include,
        }
    }

    pub fn is_relevant(&self, record: &Record, now: DateTime<Utc>) -> bool {
        self.matches_keywords(record) && self.matches_location(record) && self.is_recent(record, now)
    }

    pub fn apply(&self, records: Vec<Record>, now: DateTime<Utc>) -> (Vec<Record>, FilterReport) {
        let mut report = FilterReport {
            input: records.len(),
            ..Default::default()
        };
        let kept = records
            .into_iter()
            .filter(|r| {
                if !self.matches_keywords(r) {
                    report.dropped_keyword += 1;
                    false
                } else if !self.matches_location(r) {
                    report.dropped_location += 1;
                    false
                } else if !self.is_recent(r, now) {
                    report.dropped_recency += 1;
                    false
                } else {
                    true
                }
            })
            .collect::<Vec<_>>();
        report.kept = kept.len();
        (kept, report)
    }
}

// ---------------------------------------------------------------------------
// Cycle

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("no source adapters are configured")]
    NoAdapters,
    #[error("local dedup mirror can be neither read nor written")]
    LocalMirrorUnavailable(#[source] StoreError),
    /// A fetch, filter, dedup or delivery stage panicked. Adapters were torn
    /// down and the mirror flushed before this was returned.
    #[error("cycle {run_id} aborted: {message}")]
    StagePanicked { run_id: Uuid, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStatus {
    SetupFailed,
    Succeeded,
    Failed,
    TimedOut,
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterReport {
    pub source_id: String,
    pub status: AdapterStatus,
    pub records: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub adapters_configured: usize,
    pub adapters_ready: usize,
    pub adapters_succeeded: usize,
    pub adapters: Vec<AdapterReport>,
    pub fetched: usize,
    pub filter: FilterReport,
    pub already_seen: usize,
    pub repeated_in_cycle: usize,
    pub fresh: usize,
    pub delivery: DeliveryReport,
    pub empty_summary_sent: bool,
    pub hydration: HydrationReport,
    pub remote_degraded: bool,
    pub reports_dir: Option<String>,
}

struct StageOutput {
    adapters: Vec<AdapterReport>,
    fetched: usize,
    filter: FilterReport,
    already_seen: usize,
    repeated_in_cycle: usize,
    fresh: Vec<Record>,
    delivery: DeliveryReport,
    empty_summary_sent: bool,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Run one adapter's fetch under its budget, turning errors, timeouts and
/// panics into a [`FetchOutcome`].
pub async fn fetch_isolated(adapter: &dyn SourceAdapter, ctx: &AdapterContext) -> FetchOutcome {
    let guarded = AssertUnwindSafe(adapter.fetch(ctx)).catch_unwind();
    match tokio::time::timeout(ctx.budget, guarded).await {
        Err(_) => FetchOutcome::Failure(FetchFailure::TimedOut { budget: ctx.budget }),
        Ok(Err(panic)) => FetchOutcome::Failure(FetchFailure::Panicked(panic_message(panic.as_ref()))),
        Ok(Ok(Err(err))) => FetchOutcome::Failure(FetchFailure::Adapter(err)),
        Ok(Ok(Ok(records))) => FetchOutcome::Success(records),
    }
}

pub struct CyclePipeline {
    adapters: Vec<Box<dyn SourceAdapter>>,
    filter: RelevanceFilter,
    mirror: LocalMirror,
    remote: Option<Arc<dyn RemoteStore>>,
    remote_page_size: usize,
    batcher: NotificationBatcher,
    reports_root: Option<PathBuf>,
}

impl CyclePipeline {
    pub fn new(
        adapters: Vec<Box<dyn SourceAdapter>>,
        filter: RelevanceFilter,
        mirror: LocalMirror,
        batcher: NotificationBatcher,
    ) -> Self {
        Self {
            adapters,
            filter,
            mirror,
            remote: None,
            remote_page_size: DEFAULT_REMOTE_PAGE_SIZE,
            batcher,
            reports_root: None,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_remote_page_size(mut self, page_size: usize) -> Self {
        self.remote_page_size = page_size.max(1);
        self
    }

    /// Write `reports/<run_id>/cycle_summary.json` under `root` after each cycle.
    pub fn with_reports_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.reports_root = Some(root.into());
        self
    }

    pub async fn from_config(config: &SyncConfig, offline: bool) -> Result<Self> {
        let registry = SourceRegistry::from_workspace_root(&config.workspace_root).await?;
        let mut sources = registry.sources;
        for source in &mut sources {
            if source.user_agent.is_none() && source.kind != SourceKind::Internshala {
                source.user_agent = Some(config.user_agent.clone());
            }
        }

        let rules = RelevanceRules::from_workspace_root(&config.workspace_root).await?;
        let sink: Arc<dyn NotificationSink> = if offline {
            Arc::new(LogSink)
        } else {
            build_sink(config)?
        };

        let mut pipeline = Self::new(
            enabled_adapters(&sources),
            RelevanceFilter::new(&rules),
            LocalMirror::new(config.mirror_path()),
            NotificationBatcher::new(config.batch_size, sink),
        )
        .with_remote_page_size(config.remote_page_size);

        if offline {
            pipeline = pipeline.with_remote(Arc::new(MemoryRemoteStore::new()));
        } else if let Some(remote) = build_remote_store(config)? {
            pipeline = pipeline.with_remote(remote);
        }
        if config.reports_enabled {
            pipeline = pipeline.with_reports_root(config.workspace_root.clone());
        }

        info!(
            adapters = pipeline.adapters.len(),
            sink = pipeline.batcher.sink_name(),
            remote = pipeline.remote.as_ref().map(|r| r.name()).unwrap_or("none"),
            offline,
            "cycle pipeline configured"
        );
        Ok(pipeline)
    }

    pub fn adapter_count(&self) -> usize {
        self.adapters.len()
    }

    /// Hydrate the dedup tiers without running a cycle.
    pub async fn inspect_dedup(&self) -> Result<HydrationReport, CycleError> {
        let (_, report) = DedupStore::hydrate(self.mirror.clone(), self.remote.clone(), self.remote_page_size)
            .await
            .map_err(CycleError::LocalMirrorUnavailable)?;
        Ok(report)
    }

    /// One fetch → filter → dedup → notify pass. Adapter, remote and sink
    /// failures are logged and reflected in the summary. Errors are returned
    /// for configuration problems and for a panicking stage; in the latter
    /// case adapters are still torn down and the mirror flushed first.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary, CycleError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", %run_id);
        self.run_cycle_inner(run_id).instrument(span).await
    }

    async fn run_cycle_inner(&mut self, run_id: Uuid) -> Result<CycleSummary, CycleError> {
        let started_at = Utc::now();
        if self.adapters.is_empty() {
            return Err(CycleError::NoAdapters);
        }

        let (mut store, hydration) =
            DedupStore::hydrate(self.mirror.clone(), self.remote.clone(), self.remote_page_size)
                .await
                .map_err(CycleError::LocalMirrorUnavailable)?;

        let mut setup = Vec::with_capacity(self.adapters.len());
        for adapter in self.adapters.iter_mut() {
            let state = match AssertUnwindSafe(adapter.setup()).catch_unwind().await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(panic) => Err(format!("setup panicked: {}", panic_message(panic.as_ref()))),
            };
            if let Err(message) = &state {
                warn!(source_id = adapter.source_id(), error = %message, "adapter setup failed; skipping it this cycle");
            }
            setup.push(state);
        }

        let stages = AssertUnwindSafe(self.fetch_filter_notify(&setup, &mut store, run_id))
            .catch_unwind()
            .await;

        for (adapter, state) in self.adapters.iter_mut().zip(&setup) {
            if state.is_ok() && AssertUnwindSafe(adapter.teardown()).catch_unwind().await.is_err() {
                warn!(source_id = adapter.source_id(), "adapter teardown panicked");
            }
        }
        if let Err(err) = store.flush().await {
            warn!(error = %err, "final dedup mirror flush failed");
        }

        let stages = match stages {
            Ok(stages) => stages,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(error = %message, "cycle stage panicked after cleanup");
                return Err(CycleError::StagePanicked { run_id, message });
            }
        };

        let mut summary = CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            adapters_configured: self.adapters.len(),
            adapters_ready: setup.iter().filter(|s| s.is_ok()).count(),
            adapters_succeeded: stages
                .adapters
                .iter()
                .filter(|a| a.status == AdapterStatus::Succeeded)
                .count(),
            adapters: stages.adapters,
            fetched: stages.fetched,
            filter: stages.filter,
            already_seen: stages.already_seen,
            repeated_in_cycle: stages.repeated_in_cycle,
            fresh: stages.fresh.len(),
            delivery: stages.delivery,
            empty_summary_sent: stages.empty_summary_sent,
            hydration,
            remote_degraded: store.remote_degraded(),
            reports_dir: None,
        };

        if let Some(root) = &self.reports_root {
            match write_cycle_report(root, &mut summary, &stages.fresh).await {
                Ok(dir) => debug!(dir = %dir.display(), "cycle report written"),
                Err(err) => warn!(error = %format!("{err:#}"), "failed to write cycle report"),
            }
        }

        info!(
            fetched = summary.fetched,
            relevant = summary.filter.kept,
            already_seen = summary.already_seen,
            fresh = summary.fresh,
            batches_sent = summary.delivery.sent,
            batches_failed = summary.delivery.failed,
            remote_degraded = summary.remote_degraded,
            "cycle finished"
        );
        Ok(summary)
    }

    async fn fetch_filter_notify(
        &self,
        setup: &[Result<(), String>],
        store: &mut DedupStore,
        run_id: Uuid,
    ) -> StageOutput {
        let fetched_at = Utc::now();
        let fetches = self
            .adapters
            .iter()
            .zip(setup)
            .filter(|(_, state)| state.is_ok())
            .map(|(adapter, _)| {
                let ctx = AdapterContext {
                    run_id,
                    fetched_at,
                    budget: adapter.fetch_budget(),
                };
                async move { fetch_isolated(&**adapter, &ctx).await }
            });
        let mut outcomes = join_all(fetches).await.into_iter();

        let mut adapters = Vec::with_capacity(self.adapters.len());
        let mut merged = Vec::new();
        for (adapter, state) in self.adapters.iter().zip(setup) {
            let source_id = adapter.source_id().to_string();
            if let Err(message) = state {
                adapters.push(AdapterReport {
                    source_id,
                    status: AdapterStatus::SetupFailed,
                    records: 0,
                    error: Some(message.clone()),
                });
                continue;
            }
            let Some(outcome) = outcomes.next() else {
                continue;
            };
            match outcome {
                FetchOutcome::Success(records) => {
                    info!(%source_id, records = records.len(), "adapter fetched");
                    adapters.push(AdapterReport {
                        source_id,
                        status: AdapterStatus::Succeeded,
                        records: records.len(),
                        error: None,
                    });
                    merged.extend(records);
                }
                FetchOutcome::Failure(failure) => {
                    warn!(%source_id, error = %failure, "adapter fetch failed");
                    let status = match &failure {
                        FetchFailure::Adapter(_) => AdapterStatus::Failed,
                        FetchFailure::TimedOut { .. } => AdapterStatus::TimedOut,
                        FetchFailure::Panicked(_) => AdapterStatus::Panicked,
                    };
                    adapters.push(AdapterReport {
                        source_id,
                        status,
                        records: 0,
                        error: Some(failure.to_string()),
                    });
                }
            }
        }

        let fetched = merged.len();
        let (relevant, filter) = self.filter.apply(merged, Utc::now());
        debug!(?filter, "relevance filter applied");

        let mut in_cycle = HashSet::new();
        let mut fresh = Vec::new();
        let mut already_seen = 0usize;
        let mut repeated_in_cycle = 0usize;
        for record in relevant {
            if store.contains(record.identity()) {
                debug!(identity = %record.identity(), source = record.source_label(), "already reported");
                already_seen += 1;
            } else if !in_cycle.insert(record.identity().clone()) {
                debug!(identity = %record.identity(), source = record.source_label(), "repeated across sources this cycle");
                repeated_in_cycle += 1;
            } else {
                fresh.push(record);
            }
        }

        let (delivery, empty_summary_sent) = if fresh.is_empty() {
            let delivery = self.batcher.deliver_empty_summary().await;
            let sent = delivery.sent > 0;
            (delivery, sent)
        } else {
            let now = Utc::now();
            for record in &fresh {
                store.record(record.identity(), now).await;
            }
            (self.batcher.deliver(&fresh).await, false)
        };

        StageOutput {
            adapters,
            fetched,
            filter,
            already_seen,
            repeated_in_cycle,
            fresh,
            delivery,
            empty_summary_sent,
        }
    }
}

async fn write_cycle_report(root: &Path, summary: &mut CycleSummary, fresh: &[Record]) -> Result<PathBuf> {
    let dir = root.join("reports").join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    summary.reports_dir = Some(dir.display().to_string());

    let bytes = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": &*summary,
        "fresh": fresh,
    }))
    .context("serializing cycle summary")?;
    let path = dir.join("cycle_summary.json");
    if let Err(err) = fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
    {
        summary.reports_dir = None;
        return Err(err);
    }
    Ok(dir)
}

pub fn build_remote_store(config: &SyncConfig) -> Result<Option<Arc<dyn RemoteStore>>> {
    let Some(project_id) = &config.firestore_project_id else {
        info!("FIRESTORE_PROJECT_ID not set; remote dedup tier disabled");
        return Ok(None);
    };
    let mut firestore = FirestoreConfig::new(project_id.clone(), config.firestore_collection.clone());
    firestore.access_token = config.firestore_access_token.clone();
    let store = FirestoreStore::new(firestore).context("building firestore client")?;
    Ok(Some(Arc::new(store)))
}

pub fn build_sink(config: &SyncConfig) -> Result<Arc<dyn NotificationSink>> {
    match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) => {
            let sink = TelegramSink::new(TelegramConfig::new(token.clone(), chat_id.clone()))?;
            Ok(Arc::new(sink))
        }
        _ => {
            warn!("TELEGRAM_BOT_TOKEN or TELEGRAM_CHAT_ID missing; notifications go to the log");
            Ok(Arc::new(LogSink))
        }
    }
}

/// Cron job running one cycle per tick. Ticks wait for an in-flight cycle.
pub async fn build_scheduler(pipeline: Arc<Mutex<CyclePipeline>>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            let mut pipeline = pipeline.lock().await;
            match pipeline.run_cycle().await {
                Ok(summary) => info!(run_id = %summary.run_id, fresh = summary.fresh, "scheduled cycle complete"),
                Err(err) => warn!(error = %err, "scheduled cycle aborted"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn run_cycle_once_from_env(offline: bool) -> Result<CycleSummary> {
    let config = SyncConfig::from_env();
    let mut pipeline = CyclePipeline::from_config(&config, offline).await?;
    pipeline.run_cycle().await.context("running cycle")
}

#[cfg(test)]
mod tests {
    use super::*;
    use itif_core::RecordDraft;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn rules() -> RelevanceRules {
        RelevanceRules {
            version: 1,
            keywords: vec!["python".into(), "Machine Learning".into()],
            locations: Vec::new(),
            window_hours: 24,
            unknown_age: UnknownAgePolicy::Exclude,
        }
    }

    fn record(title: &str, description: &str, location: &str, posted_at: Option<DateTime<Utc>>) -> Record {
        Record::from_draft(
            RecordDraft {
                url: format!("https://jobs.example/{}", title.replace(' ', "-")),
                title: title.to_string(),
                description: description.to_string(),
                location: location.to_string(),
                source_label: "test".to_string(),
                posted_at,
                ..Default::default()
            },
            Utc::now(),
        )
        .expect("record")
    }

    #[test]
    fn keywords_match_title_or_description_case_insensitively() {
        let filter = RelevanceFilter::new(&rules());
        assert!(filter.matches_keywords(&record("PYTHON intern", "", "", None)));
        assert!(filter.matches_keywords(&record("Intern", "applied machine learning", "", None)));
        assert!(!filter.matches_keywords(&record("Sales intern", "cold calls", "", None)));
    }

    #[test]
    fn recency_window_boundary() {
        let filter = RelevanceFilter::new(&rules());
        let now = Utc::now();
        let stale = record("python a", "", "", Some(now - chrono::Duration::hours(24) - chrono::Duration::seconds(1)));
        let fresh = record("python b", "", "", Some(now - chrono::Duration::hours(23) - chrono::Duration::minutes(59)));
        let exact = record("python c", "", "", Some(now - chrono::Duration::hours(24)));
        let undated = record("python d", "", "", None);
        assert!(!filter.is_recent(&stale, now));
        assert!(filter.is_recent(&fresh, now));
        assert!(filter.is_recent(&exact, now));
        assert!(!filter.is_recent(&undated, now));

        let mut open = rules();
        open.unknown_age = UnknownAgePolicy::Include;
        assert!(RelevanceFilter::new(&open).is_recent(&undated, now));
    }

    #[test]
    fn location_allow_list_is_substring_and_optional() {
        let mut with_locations = rules();
        with_locations.locations = vec!["India".into()];
        let filter = RelevanceFilter::new(&with_locations);
        assert!(filter.matches_location(&record("python", "", "Bangalore, INDIA", None)));
        assert!(!filter.matches_location(&record("python", "", "Berlin", None)));
        assert!(RelevanceFilter::new(&rules()).matches_location(&record("python", "", "Berlin", None)));
    }

    #[test]
    fn apply_counts_each_stage() {
        let mut with_locations = rules();
        with_locations.locations = vec!["remote".into()];
        let filter = RelevanceFilter::new(&with_locations);
        let now = Utc::now();
        let recent = Some(now - chrono::Duration::hours(1));
        let records = vec![
            record("python one", "", "Remote", recent),
            record("sales", "", "Remote", recent),
            record("python two", "", "Berlin", recent),
            record("python three", "", "Remote", Some(now - chrono::Duration::days(3))),
            record("python four", "", "Remote", recent),
        ];
        let (kept, report) = filter.apply(records, now);
        assert_eq!(
            kept.iter().map(|r| r.title()).collect::<Vec<_>>(),
            vec!["python one", "python four"]
        );
        assert_eq!(
            report,
            FilterReport {
                input: 5,
                dropped_keyword: 1,
                dropped_location: 1,
                dropped_recency: 1,
                kept: 2,
            }
        );
    }

    #[tokio::test]
    async fn workspace_rule_and_source_files_parse() {
        let root = workspace_root();
        let rules = RelevanceRules::from_workspace_root(&root).await.expect("rules");
        assert!(!rules.keywords.is_empty());
        assert_eq!(rules.window_hours, 24);
        assert_eq!(rules.unknown_age, UnknownAgePolicy::Exclude);

        let registry = SourceRegistry::from_workspace_root(&root).await.expect("sources");
        assert!(registry.enabled().count() >= 1);
        let internshala = registry
            .sources
            .iter()
            .find(|s| s.kind == SourceKind::Internshala)
            .expect("internshala entry");
        assert!(!internshala.enabled);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_config_files_name_their_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = SourceRegistry::from_workspace_root(dir.path()).await.unwrap_err();
        assert!(format!("{err:#}").contains("sources.yaml"));

        let config = SyncConfig::for_workspace(dir.path());
        let err = CyclePipeline::from_config(&config, true).await.err().expect("no sources.yaml");
        assert!(format!("{err:#}").contains("sources.yaml"));

        fs::write(dir.path().join("sources.yaml"), "sources: []\n").await.expect("write");
        let err = CyclePipeline::from_config(&config, true).await.err().expect("no rules file");
        assert!(format!("{err:#}").contains("relevance.yaml"));
    }

    #[test]
    fn default_config_points_at_seen_urls_json() {
        let config = SyncConfig::for_workspace("/tmp/itif");
        assert_eq!(config.mirror_path(), PathBuf::from("/tmp/itif/seen_urls.json"));
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.sync_cron, "0 0 */5 * * *");
        assert!(!config.scheduler_enabled);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
