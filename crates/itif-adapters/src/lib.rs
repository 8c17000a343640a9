//! Source adapter contract + the RSS, JSON API and HTML adapters.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use futures::future::join_all;
use itif_core::{clean_text, Record, RecordDraft};
use itif_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, TokenBucketConfig};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "itif-adapters";

pub const WWR_FEED_URL: &str = "https://weworkremotely.com/categories/remote-programming-jobs.rss";
pub const REMOTEOK_API_URL: &str = "https://remoteok.com/api";
pub const REMOTEOK_JOB_BASE: &str = "https://remoteok.com/remote-jobs";
pub const REMOTIVE_API_URL: &str = "https://remotive.com/api/remote-jobs";
pub const INTERNSHALA_BASE_URL: &str = "https://internshala.com";
pub const INTERNSHALA_SEARCH_PATH: &str = "/internships/computer-science-internship";

pub const DEFAULT_FETCH_BUDGET: Duration = Duration::from_secs(120);

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Rss,
    WeWorkRemotely,
    RemoteOk,
    Remotive,
    Internshala,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedTarget {
    pub label: String,
    pub url: String,
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub feeds: Vec<FeedTarget>,
    /// Overrides the built-in endpoint of API and HTML sources.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_fetch_budget_secs")]
    pub fetch_budget_secs: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_pages() -> usize {
    3
}

fn default_max_retries() -> usize {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_fetch_budget_secs() -> u64 {
    DEFAULT_FETCH_BUDGET.as_secs()
}

impl SourceConfig {
    pub fn new(source_id: impl Into<String>, display_name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            source_id: source_id.into(),
            display_name: display_name.into(),
            enabled: true,
            kind,
            feeds: Vec::new(),
            endpoint: None,
            max_pages: default_max_pages(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            fetch_budget_secs: default_fetch_budget_secs(),
            user_agent: None,
        }
    }

    pub fn fetch_budget(&self) -> Duration {
        Duration::from_secs(self.fetch_budget_secs)
    }

    fn http_config(&self, accept: &str) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            user_agent: self.user_agent.clone(),
            accept: Some(accept.to_string()),
            concurrency: 4,
            backoff: BackoffPolicy::with_max_retries(self.max_retries),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub budget: Duration,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("setup failed for {source_id}: {message}")]
    Setup { source_id: String, message: String },
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("{0}")]
    Message(String),
    #[error("could not parse {what}: {message}")]
    Parse { what: String, message: String },
}

impl AdapterError {
    fn parse(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Parse {
            what: what.into(),
            message: err.to_string(),
        }
    }

    fn not_set_up(source_id: &str) -> Self {
        Self::Message(format!("{source_id}: fetch called before setup"))
    }
}

/// Why an adapter contributed nothing to a cycle.
#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("fetch exceeded its {budget:?} budget")]
    TimedOut { budget: Duration },
    #[error("fetch panicked: {0}")]
    Panicked(String),
}

#[derive(Debug)]
pub enum FetchOutcome {
    Success(Vec<Record>),
    Failure(FetchFailure),
}

impl FetchOutcome {
    pub fn records(&self) -> &[Record] {
        match self {
            Self::Success(records) => records,
            Self::Failure(_) => &[],
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn source_label(&self) -> &str;
    fn kind(&self) -> SourceKind;

    /// Upper bound on one `fetch` call; the orchestrator enforces it.
    fn fetch_budget(&self) -> Duration {
        DEFAULT_FETCH_BUDGET
    }

    /// Acquire per-run resources. Called at most once per cycle.
    async fn setup(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<Record>, AdapterError>;

    /// Release per-run resources. Runs whenever `setup` succeeded.
    async fn teardown(&mut self) {}
}

/// Build records from drafts: drafts without a link are skipped and only the
/// first occurrence of each identity is kept.
pub fn records_from_drafts(
    source_id: &str,
    drafts: Vec<RecordDraft>,
    ingested_at: DateTime<Utc>,
) -> Vec<Record> {
    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(drafts.len());
    for draft in drafts {
        match Record::from_draft(draft, ingested_at) {
            Ok(record) => {
                if seen.insert(record.identity().clone()) {
                    records.push(record);
                } else {
                    debug!(source_id, identity = %record.identity(), "dropping repeated posting within source");
                }
            }
            Err(err) => debug!(source_id, error = %err, "skipping unusable posting"),
        }
    }
    records
}

pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    clean_text(&text)
}

/// Remove the first `<ul>...</ul>` block, which WWR uses for job metadata.
pub fn strip_first_list(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let Some(start) = lower.find("<ul") else {
        return html.to_string();
    };
    match lower[start..].find("</ul>") {
        Some(end) => format!("{}{}", &html[..start], &html[start + end + "</ul>".len()..]),
        None => html.to_string(),
    }
}

/// "Role at Company"; with several " at " the first segment is the role and
/// the last is the company.
fn split_title_company(title: &str) -> Option<(String, String)> {
    let (role, _) = title.split_once(" at ")?;
    let (_, company) = title.rsplit_once(" at ")?;
    let (role, company) = (role.trim(), company.trim());
    if role.is_empty() || company.is_empty() {
        None
    } else {
        Some((role.to_string(), company.to_string()))
    }
}

/// RFC 3339, `%Y-%m-%dT%H:%M:%S%z`, or a naive timestamp taken as UTC.
pub fn parse_api_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Interpret listing ages such as "today", "3 days ago" or `2026-03-01`.
pub fn parse_relative_date(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = raw.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }
    let midnight = |dt: DateTime<Utc>| {
        dt.date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive))
    };

    if text.contains("today") || text.contains("just now") {
        return midnight(now);
    }
    if text.contains("yesterday") {
        return midnight(now - chrono::Duration::days(1));
    }

    let words = text.split_whitespace().collect::<Vec<_>>();
    for window in words.windows(3) {
        let [count, unit, ago] = window else { continue };
        if !ago.starts_with("ago") {
            continue;
        }
        let Ok(count) = count.trim_start_matches('+').parse::<i64>() else {
            continue;
        };
        let delta = match unit.trim_end_matches('s') {
            "minute" | "min" => chrono::Duration::minutes(count),
            "hour" | "hr" => chrono::Duration::hours(count),
            "day" => chrono::Duration::days(count),
            "week" => chrono::Duration::weeks(count),
            "month" => chrono::Duration::days(30 * count),
            _ => continue,
        };
        return Some(now - delta);
    }

    words.iter().find_map(|word| {
        NaiveDate::parse_from_str(word, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

async fn run_blocking<T, F>(what: &'static str, parse: F) -> Result<T, AdapterError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AdapterError> + Send + 'static,
{
    tokio::task::spawn_blocking(parse)
        .await
        .map_err(|e| AdapterError::Message(format!("{what} parse task failed: {e}")))?
}

fn build_fetcher(source_id: &str, config: HttpClientConfig) -> Result<HttpFetcher, AdapterError> {
    HttpFetcher::new(config).map_err(|e| AdapterError::Setup {
        source_id: source_id.to_string(),
        message: format!("{e:#}"),
    })
}

// ---------------------------------------------------------------------------
// Feeds

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFlavour {
    /// Unknown dates stay unknown.
    Generic,
    /// Unknown dates fall back to ingestion time; descriptions lose their
    /// leading metadata list.
    WeWorkRemotely,
}

/// Display name of a feed author.
///
/// feed-rs maps RSS `<author>` to a person named `author` with the element
/// text as the email, which may read `address (Name)`. `dc:creator` and Atom
/// authors carry a real name.
fn feed_author(person: &feed_rs::model::Person) -> Option<String> {
    let name = clean_text(&person.name);
    if !name.is_empty() && !name.eq_ignore_ascii_case("author") {
        return Some(name);
    }
    let text = clean_text(person.email.as_deref()?);
    let text = match (text.find('('), text.rfind(')')) {
        (Some(open), Some(close)) if open < close => clean_text(&text[open + 1..close]),
        _ => text,
    };
    (!text.is_empty()).then_some(text)
}

/// Parse one RSS/Atom document into drafts labelled with `label`.
pub fn parse_feed(
    bytes: &[u8],
    flavour: FeedFlavour,
    label: &str,
    now: DateTime<Utc>,
) -> Result<Vec<RecordDraft>, AdapterError> {
    let feed = feed_rs::parser::parse(bytes).map_err(|e| AdapterError::parse(format!("feed {label}"), e))?;

    Ok(feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let url = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))?;

            let raw_title = clean_text(&entry.title.map(|t| t.content).unwrap_or_default());
            if raw_title.is_empty() && flavour == FeedFlavour::WeWorkRemotely {
                return None;
            }
            let author = entry.authors.first().and_then(feed_author);

            let (title, organization) = match (flavour, author) {
                (FeedFlavour::Generic, Some(author)) => (raw_title, author),
                _ => split_title_company(&raw_title).unwrap_or((raw_title, String::new())),
            };

            let raw_description = entry
                .summary
                .map(|t| t.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .unwrap_or_default();
            let description = match flavour {
                FeedFlavour::Generic => html_to_text(&raw_description),
                FeedFlavour::WeWorkRemotely => html_to_text(&strip_first_list(&raw_description)),
            };

            let posted_at = entry.published.or(entry.updated);
            let posted_at = match flavour {
                FeedFlavour::Generic => posted_at,
                FeedFlavour::WeWorkRemotely => Some(posted_at.unwrap_or(now)),
            };

            let mut metadata = BTreeMap::new();
            if let Some(category) = entry.categories.first() {
                metadata.insert("category".to_string(), category.term.clone());
            }

            Some(RecordDraft {
                url,
                title,
                organization,
                location: itif_core::DEFAULT_LOCATION.to_string(),
                description,
                source_label: label.to_string(),
                posted_at,
                metadata,
            })
        })
        .collect())
}

/// Concatenate per-feed drafts in feed order. Fails only when every feed
/// failed; an empty but healthy feed is still a success.
fn merge_feed_results(
    source_id: &str,
    feeds: &[FeedTarget],
    results: Vec<Result<Vec<RecordDraft>, AdapterError>>,
) -> Result<Vec<RecordDraft>, AdapterError> {
    let mut drafts = Vec::new();
    let mut failures = 0usize;
    let mut last_error = None;
    for (target, result) in feeds.iter().zip(results) {
        match result {
            Ok(mut feed_drafts) => {
                debug!(source_id, feed = %target.label, entries = feed_drafts.len(), "parsed feed");
                drafts.append(&mut feed_drafts);
            }
            Err(err) => {
                warn!(source_id, feed = %target.label, error = %err, "feed fetch failed");
                failures += 1;
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) if failures == feeds.len() => Err(err),
        _ => Ok(drafts),
    }
}

/// Labelled feeds fetched concurrently and parsed with `feed-rs`.
pub struct FeedAdapter {
    config: SourceConfig,
    flavour: FeedFlavour,
    feeds: Vec<FeedTarget>,
    http: Option<HttpFetcher>,
}

impl FeedAdapter {
    pub fn new(config: SourceConfig, flavour: FeedFlavour) -> Self {
        let feeds = if config.feeds.is_empty() && flavour == FeedFlavour::WeWorkRemotely {
            vec![FeedTarget {
                label: config.display_name.clone(),
                url: config.endpoint.clone().unwrap_or_else(|| WWR_FEED_URL.to_string()),
            }]
        } else {
            config.feeds.clone()
        };
        Self {
            config,
            flavour,
            feeds,
            http: None,
        }
    }

    pub fn feeds(&self) -> &[FeedTarget] {
        &self.feeds
    }

    async fn fetch_one(
        &self,
        http: &HttpFetcher,
        target: &FeedTarget,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecordDraft>, AdapterError> {
        let resp = http.fetch_bytes(&target.url).await?;
        let flavour = self.flavour;
        let label = target.label.clone();
        run_blocking("feed", move || parse_feed(&resp.body, flavour, &label, now)).await
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn source_label(&self) -> &str {
        &self.config.display_name
    }

    fn kind(&self) -> SourceKind {
        match self.flavour {
            FeedFlavour::Generic => SourceKind::Rss,
            FeedFlavour::WeWorkRemotely => SourceKind::WeWorkRemotely,
        }
    }

    fn fetch_budget(&self) -> Duration {
        self.config.fetch_budget()
    }

    async fn setup(&mut self) -> Result<(), AdapterError> {
        if self.feeds.is_empty() {
            return Err(AdapterError::Setup {
                source_id: self.config.source_id.clone(),
                message: "no feeds configured".to_string(),
            });
        }
        let config = self
            .config
            .http_config("application/rss+xml, application/atom+xml, application/xml;q=0.9, */*;q=0.8");
        self.http = Some(build_fetcher(&self.config.source_id, config)?);
        Ok(())
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<Record>, AdapterError> {
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| AdapterError::not_set_up(&self.config.source_id))?;

        let results = join_all(
            self.feeds
                .iter()
                .map(|target| self.fetch_one(http, target, ctx.fetched_at)),
        )
        .await;

        let drafts = merge_feed_results(&self.config.source_id, &self.feeds, results)?;

        let records = records_from_drafts(&self.config.source_id, drafts, ctx.fetched_at);
        info!(source_id = %self.config.source_id, records = records.len(), "feed adapter finished");
        Ok(records)
    }

    async fn teardown(&mut self) {
        self.http = None;
    }
}

// ---------------------------------------------------------------------------
// JSON APIs

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonApi {
    RemoteOk,
    Remotive,
}

#[derive(Debug, Deserialize)]
struct RemoteOkJob {
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    position: Option<String>,
    #[serde(default)]
    company: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RemotiveResponse {
    #[serde(default)]
    jobs: Vec<RemotiveJob>,
}

#[derive(Debug, Deserialize)]
struct RemotiveJob {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    company_name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    publication_date: Option<String>,
    #[serde(default)]
    candidate_required_location: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    job_type: Option<String>,
    #[serde(default)]
    salary: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// RemoteOK returns a bare array whose first element is API metadata.
pub fn parse_remoteok(body: &[u8]) -> Result<Vec<RecordDraft>, AdapterError> {
    let items: Vec<JsonValue> = serde_json::from_slice(body).map_err(|e| AdapterError::parse("RemoteOK payload", e))?;

    Ok(items
        .into_iter()
        .skip(1)
        .filter_map(|value| match serde_json::from_value::<RemoteOkJob>(value) {
            Ok(job) => Some(job),
            Err(err) => {
                debug!(error = %err, "skipping malformed RemoteOK entry");
                None
            }
        })
        .filter_map(|job| {
            let title = non_empty(job.position)?;
            let organization = non_empty(job.company)?;
            let fallback_url = non_empty(job.url)?;
            let date = non_empty(job.date)?;

            let url = match non_empty(job.slug) {
                Some(slug) => format!("{REMOTEOK_JOB_BASE}/{slug}"),
                None => fallback_url,
            };

            let mut metadata = BTreeMap::new();
            if !job.tags.is_empty() {
                metadata.insert("tags".to_string(), job.tags.join(", "));
            }

            Some(RecordDraft {
                url,
                title,
                organization,
                location: job.location.unwrap_or_default(),
                description: html_to_text(job.description.as_deref().unwrap_or_default()),
                source_label: "RemoteOK".to_string(),
                posted_at: parse_api_timestamp(&date),
                metadata,
            })
        })
        .collect())
}

pub fn parse_remotive(body: &[u8]) -> Result<Vec<RecordDraft>, AdapterError> {
    let parsed: RemotiveResponse =
        serde_json::from_slice(body).map_err(|e| AdapterError::parse("Remotive payload", e))?;

    Ok(parsed
        .jobs
        .into_iter()
        .map(|job| {
            let location = non_empty(job.candidate_required_location)
                .filter(|loc| !loc.eq_ignore_ascii_case("anywhere"))
                .unwrap_or_else(|| itif_core::DEFAULT_LOCATION.to_string());

            let mut metadata = BTreeMap::new();
            if let Some(job_type) = non_empty(job.job_type) {
                metadata.insert("job_type".to_string(), job_type);
            }
            if let Some(salary) = non_empty(job.salary) {
                metadata.insert("salary".to_string(), salary);
            }

            RecordDraft {
                url: job.url.unwrap_or_default(),
                title: job.title.unwrap_or_default(),
                organization: job.company_name.unwrap_or_default(),
                location,
                description: html_to_text(job.description.as_deref().unwrap_or_default()),
                source_label: "Remotive".to_string(),
                posted_at: job.publication_date.as_deref().and_then(parse_api_timestamp),
                metadata,
            }
        })
        .collect())
}

/// Single-request JSON job board.
pub struct JsonApiAdapter {
    config: SourceConfig,
    api: JsonApi,
    http: Option<HttpFetcher>,
}

impl JsonApiAdapter {
    pub fn new(config: SourceConfig, api: JsonApi) -> Self {
        Self {
            config,
            api,
            http: None,
        }
    }

    fn endpoint(&self) -> String {
        self.config.endpoint.clone().unwrap_or_else(|| {
            match self.api {
                JsonApi::RemoteOk => REMOTEOK_API_URL,
                JsonApi::Remotive => REMOTIVE_API_URL,
            }
            .to_string()
        })
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        match self.api {
            JsonApi::RemoteOk => Vec::new(),
            JsonApi::Remotive => vec![
                ("limit", "100".to_string()),
                ("category", "software-dev".to_string()),
            ],
        }
    }
}

#[async_trait]
impl SourceAdapter for JsonApiAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn source_label(&self) -> &str {
        &self.config.display_name
    }

    fn kind(&self) -> SourceKind {
        match self.api {
            JsonApi::RemoteOk => SourceKind::RemoteOk,
            JsonApi::Remotive => SourceKind::Remotive,
        }
    }

    fn fetch_budget(&self) -> Duration {
        self.config.fetch_budget()
    }

    async fn setup(&mut self) -> Result<(), AdapterError> {
        let config = self.config.http_config("application/json");
        self.http = Some(build_fetcher(&self.config.source_id, config)?);
        Ok(())
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<Record>, AdapterError> {
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| AdapterError::not_set_up(&self.config.source_id))?;

        let resp = http.get(&self.endpoint(), &self.query(), None).await?;
        let api = self.api;
        let drafts = run_blocking("json", move || match api {
            JsonApi::RemoteOk => parse_remoteok(&resp.body),
            JsonApi::Remotive => parse_remotive(&resp.body),
        })
        .await?;

        let records = records_from_drafts(&self.config.source_id, drafts, ctx.fetched_at);
        info!(source_id = %self.config.source_id, records = records.len(), "api adapter finished");
        Ok(records)
    }

    async fn teardown(&mut self) {
        self.http = None;
    }
}

// ---------------------------------------------------------------------------
// Internshala

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn first_text(element: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    element
        .select(sel)
        .next()
        .map(|node| clean_text(&node.text().collect::<Vec<_>>().join(" ")))
        .filter(|text| !text.is_empty())
}

/// Parse one search page. An empty result means the listing ran out.
pub fn parse_internshala_page(
    html: &str,
    base_url: &str,
    now: DateTime<Utc>,
) -> Result<Vec<RecordDraft>, AdapterError> {
    let listing_sel = selector(".internship_meta")?;
    let title_sel = selector(".heading_4_5")?;
    let company_sel = selector(".heading_6")?;
    let location_sel = selector(".location_link")?;
    let link_sel = selector("a.view_detail_button")?;
    let posted_sel = selector(".posted_by_container")?;
    let detail_sel = selector(".item_body")?;

    let document = Html::parse_document(html);
    let base_url = base_url.trim_end_matches('/');

    Ok(document
        .select(&listing_sel)
        .filter_map(|listing| {
            let title = first_text(&listing, &title_sel)?;
            let href = listing
                .select(&link_sel)
                .next()
                .and_then(|a| a.value().attr("href"))?
                .trim()
                .to_string();
            let url = if href.starts_with("http") {
                href
            } else {
                format!("{base_url}{href}")
            };

            let posted_at = first_text(&listing, &posted_sel)
                .and_then(|text| parse_relative_date(&text, now))
                .unwrap_or(now);

            let details = listing
                .select(&detail_sel)
                .map(|node| clean_text(&node.text().collect::<Vec<_>>().join(" ")))
                .collect::<Vec<_>>();
            let duration = details.get(1).cloned().unwrap_or_else(|| "Not specified".to_string());
            let stipend = details.get(2).cloned().unwrap_or_else(|| "Not specified".to_string());

            let mut metadata = BTreeMap::new();
            metadata.insert("duration".to_string(), duration.clone());
            metadata.insert("stipend".to_string(), stipend.clone());

            Some(RecordDraft {
                url,
                title,
                organization: first_text(&listing, &company_sel).unwrap_or_default(),
                location: first_text(&listing, &location_sel).unwrap_or_default(),
                description: format!("Duration: {duration} Stipend: {stipend}"),
                source_label: "Internshala".to_string(),
                posted_at: Some(posted_at),
                metadata,
            })
        })
        .collect())
}

pub fn internshala_page_url(base_url: &str, page: usize) -> String {
    let search = format!("{}{INTERNSHALA_SEARCH_PATH}", base_url.trim_end_matches('/'));
    if page <= 1 {
        search
    } else {
        format!("{search}/page-{page}")
    }
}

/// Paged HTML scrape of the computer-science internship listing.
pub struct InternshalaAdapter {
    config: SourceConfig,
    page_pause: Duration,
    http: Option<HttpFetcher>,
}

impl InternshalaAdapter {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            page_pause: Duration::from_secs(1),
            http: None,
        }
    }

    pub fn with_page_pause(mut self, page_pause: Duration) -> Self {
        self.page_pause = page_pause;
        self
    }

    fn base_url(&self) -> String {
        self.config
            .endpoint
            .clone()
            .unwrap_or_else(|| INTERNSHALA_BASE_URL.to_string())
    }
}

#[async_trait]
impl SourceAdapter for InternshalaAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn source_label(&self) -> &str {
        &self.config.display_name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Internshala
    }

    fn fetch_budget(&self) -> Duration {
        self.config.fetch_budget()
    }

    async fn setup(&mut self) -> Result<(), AdapterError> {
        let mut config = self
            .config
            .http_config("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8");
        config.user_agent = Some(
            self.config
                .user_agent
                .clone()
                .unwrap_or_else(|| BROWSER_USER_AGENT.to_string()),
        );
        config.concurrency = 1;
        config.token_bucket = Some(TokenBucketConfig {
            capacity: 1,
            refill_every: self.page_pause,
        });
        self.http = Some(build_fetcher(&self.config.source_id, config)?);
        Ok(())
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<Record>, AdapterError> {
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| AdapterError::not_set_up(&self.config.source_id))?;
        let base_url = self.base_url();
        let max_pages = self.config.max_pages.max(1);

        let mut drafts = Vec::new();
        // Pages are spaced by the fetcher's token bucket (one per `page_pause`).
        for page in 1..=max_pages {
            let url = internshala_page_url(&base_url, page);
            let html = match http.fetch_bytes(&url).await {
                Ok(resp) => resp.text(),
                Err(err) => {
                    warn!(source_id = %self.config.source_id, page, error = %err, "listing page fetch failed");
                    continue;
                }
            };

            let page_base = base_url.clone();
            let now = ctx.fetched_at;
            let mut page_drafts =
                run_blocking("html", move || parse_internshala_page(&html, &page_base, now)).await?;
            if page_drafts.is_empty() {
                debug!(source_id = %self.config.source_id, page, "no more listings");
                break;
            }
            debug!(source_id = %self.config.source_id, page, listings = page_drafts.len(), "parsed listing page");
            drafts.append(&mut page_drafts);
        }

        let records = records_from_drafts(&self.config.source_id, drafts, ctx.fetched_at);
        info!(source_id = %self.config.source_id, records = records.len(), "html adapter finished");
        Ok(records)
    }

    async fn teardown(&mut self) {
        self.http = None;
    }
}

// ---------------------------------------------------------------------------
// Registry

pub fn adapter_for_source(config: &SourceConfig) -> Box<dyn SourceAdapter> {
    let config = config.clone();
    match config.kind {
        SourceKind::Rss => Box::new(FeedAdapter::new(config, FeedFlavour::Generic)),
        SourceKind::WeWorkRemotely => Box::new(FeedAdapter::new(config, FeedFlavour::WeWorkRemotely)),
        SourceKind::RemoteOk => Box::new(JsonApiAdapter::new(config, JsonApi::RemoteOk)),
        SourceKind::Remotive => Box::new(JsonApiAdapter::new(config, JsonApi::Remotive)),
        SourceKind::Internshala => Box::new(InternshalaAdapter::new(config)),
    }
}

pub fn enabled_adapters(configs: &[SourceConfig]) -> Vec<Box<dyn SourceAdapter>> {
    configs
        .iter()
        .filter(|config| config.enabled)
        .map(adapter_for_source)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn draft(url: &str, title: &str) -> RecordDraft {
        RecordDraft {
            url: url.to_string(),
            title: title.to_string(),
            source_label: "test".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn relative_dates_resolve_against_now() {
        let now = at("2026-03-10T15:30:00Z");
        assert_eq!(parse_relative_date("Today", now), Some(at("2026-03-10T00:00:00Z")));
        assert_eq!(parse_relative_date("Posted yesterday", now), Some(at("2026-03-09T00:00:00Z")));
        assert_eq!(parse_relative_date("3 days ago", now), Some(at("2026-03-07T15:30:00Z")));
        assert_eq!(parse_relative_date("1 week ago", now), Some(at("2026-03-03T15:30:00Z")));
        assert_eq!(parse_relative_date("2 months ago", now), Some(at("2026-01-09T15:30:00Z")));
        assert_eq!(parse_relative_date("5 hours ago", now), Some(at("2026-03-10T10:30:00Z")));
        assert_eq!(parse_relative_date("10 minutes ago", now), Some(at("2026-03-10T15:20:00Z")));
        assert_eq!(parse_relative_date("2026-02-01", now), Some(at("2026-02-01T00:00:00Z")));
        assert_eq!(parse_relative_date("sometime", now), None);
        assert_eq!(parse_relative_date("", now), None);
    }

    #[test]
    fn api_timestamps_accept_offsets_and_naive_values() {
        assert_eq!(
            parse_api_timestamp("2026-03-10T12:00:00+05:30"),
            Some(at("2026-03-10T06:30:00Z"))
        );
        assert_eq!(
            parse_api_timestamp("2026-03-10T12:00:00+0000"),
            Some(at("2026-03-10T12:00:00Z"))
        );
        assert_eq!(
            parse_api_timestamp("2026-03-10T12:00:00"),
            Some(at("2026-03-10T12:00:00Z"))
        );
        assert_eq!(parse_api_timestamp("not a date"), None);
    }

    #[test]
    fn title_company_split_requires_both_halves() {
        assert_eq!(
            split_title_company("Rust Intern at Acme"),
            Some(("Rust Intern".to_string(), "Acme".to_string()))
        );
        assert_eq!(
            split_title_company("Intern at Data at Scale at Acme"),
            Some(("Intern".to_string(), "Acme".to_string()))
        );
        assert_eq!(split_title_company("Rust Intern"), None);
        assert_eq!(split_title_company(" at Acme"), None);
    }

    #[test]
    fn wwr_metadata_list_is_stripped() {
        let html = "<UL><li>Region: Anywhere</li></UL><p>Write <b>Rust</b></p><ul><li>keep</li></ul>";
        assert_eq!(html_to_text(&strip_first_list(html)), "Write Rust keep");
        assert_eq!(strip_first_list("<p>no list</p>"), "<p>no list</p>");
    }

    #[test]
    fn records_from_drafts_skips_linkless_and_repeats() {
        let now = Utc::now();
        let records = records_from_drafts(
            "test",
            vec![
                draft("https://a.example/1", "first"),
                draft("", "no link"),
                draft("https://A.example/1/", "repeat"),
                draft("https://a.example/2", "second"),
            ],
            now,
        );
        let titles = records.iter().map(|r| r.title()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["first", "second"]);
    }

    #[test]
    fn internshala_page_urls() {
        assert_eq!(
            internshala_page_url("https://internshala.com/", 1),
            "https://internshala.com/internships/computer-science-internship"
        );
        assert_eq!(
            internshala_page_url("https://internshala.com", 3),
            "https://internshala.com/internships/computer-science-internship/page-3"
        );
    }

    #[test]
    fn registry_maps_kinds_and_skips_disabled_sources() {
        let mut internshala = SourceConfig::new("internshala", "Internshala", SourceKind::Internshala);
        internshala.enabled = false;
        let configs = vec![
            SourceConfig::new("wwr", "We Work Remotely", SourceKind::WeWorkRemotely),
            SourceConfig::new("remoteok", "RemoteOK", SourceKind::RemoteOk),
            SourceConfig::new("remotive", "Remotive", SourceKind::Remotive),
            internshala,
        ];
        let adapters = enabled_adapters(&configs);
        let kinds = adapters.iter().map(|a| a.kind()).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![SourceKind::WeWorkRemotely, SourceKind::RemoteOk, SourceKind::Remotive]
        );
        assert_eq!(adapters[0].source_label(), "We Work Remotely");
    }

    #[test]
    fn wwr_adapter_defaults_to_the_programming_feed() {
        let adapter = FeedAdapter::new(
            SourceConfig::new("wwr", "We Work Remotely", SourceKind::WeWorkRemotely),
            FeedFlavour::WeWorkRemotely,
        );
        assert_eq!(adapter.feeds().len(), 1);
        assert_eq!(adapter.feeds()[0].url, WWR_FEED_URL);
    }

    #[tokio::test]
    async fn fetch_before_setup_is_an_error_and_generic_feed_needs_targets() {
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
            budget: Duration::from_secs(5),
        };
        let adapter = JsonApiAdapter::new(
            SourceConfig::new("remotive", "Remotive", SourceKind::Remotive),
            JsonApi::Remotive,
        );
        assert!(matches!(adapter.fetch(&ctx).await, Err(AdapterError::Message(_))));

        let mut rss = FeedAdapter::new(SourceConfig::new("rss", "RSS", SourceKind::Rss), FeedFlavour::Generic);
        assert!(matches!(rss.setup().await, Err(AdapterError::Setup { .. })));
    }

    #[test]
    fn source_config_defaults_from_yaml() {
        let yaml = r#"
source_id: wwr
display_name: We Work Remotely
kind: weworkremotely
"#;
        let config: SourceConfig = serde_yaml::from_str(yaml).expect("yaml");
        assert!(config.enabled);
        assert_eq!(config.kind, SourceKind::WeWorkRemotely);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.fetch_budget(), Duration::from_secs(120));
    }

    #[test]
    fn one_empty_feed_keeps_the_source_healthy() {
        let feeds = vec![
            FeedTarget {
                label: "quiet".into(),
                url: "https://a.example/rss".into(),
            },
            FeedTarget {
                label: "down".into(),
                url: "https://b.example/rss".into(),
            },
        ];

        let partial = merge_feed_results(
            "rss",
            &feeds,
            vec![Ok(Vec::new()), Err(AdapterError::Message("503".into()))],
        );
        assert!(matches!(partial, Ok(ref drafts) if drafts.is_empty()));

        let mixed = merge_feed_results(
            "rss",
            &feeds,
            vec![
                Err(AdapterError::Message("timeout".into())),
                Ok(vec![draft("https://b.example/1", "Rust Intern")]),
            ],
        )
        .expect("one feed succeeded");
        assert_eq!(mixed.len(), 1);

        let all_down = merge_feed_results(
            "rss",
            &feeds,
            vec![
                Err(AdapterError::Message("timeout".into())),
                Err(AdapterError::Message("503".into())),
            ],
        );
        assert!(matches!(all_down, Err(AdapterError::Message(m)) if m == "503"));
    }

    #[test]
    fn rss_author_placeholder_falls_back_to_element_text() {
        let xml = br#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>t</title>
<item><title>Intern</title><link>https://x.example/1</link><author>ops@acme.example (Acme Ops)</author></item>
<item><title>Dev at Beta Co</title><link>https://x.example/2</link></item>
</channel></rss>"#;
        let drafts = parse_feed(xml, FeedFlavour::Generic, "t", Utc::now()).unwrap();
        assert_eq!(drafts[0].organization, "Acme Ops");
        assert_ne!(drafts[0].organization, "author");
        assert_eq!(drafts[1].title, "Dev");
        assert_eq!(drafts[1].organization, "Beta Co");
    }
}
