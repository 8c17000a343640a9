//! Dedup persistence tiers + HTTP fetch utilities for ITIF.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itif_core::{DedupEntry, Identity};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "itif-storage";

/// Encoded remote keys above this size are replaced by a digest.
pub const MAX_REMOTE_KEY_BYTES: usize = 1400;
pub const DEFAULT_REMOTE_PAGE_SIZE: usize = 1000;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Map an identity onto the remote tier's key alphabet `[A-Za-z0-9-_.~]`.
pub fn encode_remote_key(identity: &Identity) -> String {
    let encoded = identity
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();

    // Firestore rejects `.`, `..` and `__*__` document ids.
    let reserved = encoded == "." || encoded == ".." || (encoded.starts_with("__") && encoded.ends_with("__"));
    if encoded.len() > MAX_REMOTE_KEY_BYTES || reserved {
        sha256_hex(identity.as_str().as_bytes())
    } else {
        encoded
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remote dedup tier unavailable: {0}")]
    Remote(String),
    #[error("local mirror {}: {source}", .path.display())]
    LocalMirror {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("local mirror {} is not a valid snapshot: {source}", .path.display())]
    CorruptMirror {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// HTTP

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            accept: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// HTTP client owned by exactly one adapter (or tier). Retries only GETs.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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
        if let Some(accept) = &config.accept {
            let mut headers = HeaderMap::new();
            headers.insert(
                ACCEPT,
                HeaderValue::from_str(accept).context("invalid Accept header value")?,
            );
            builder = builder.default_headers(headers);
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.get(url, &[], None).await
    }

    /// Capped-retry GET with exponential backoff.
    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer_token: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", url);
        self.get_with_retries(url, query, bearer_token)
            .instrument(span)
            .await
    }

    async fn get_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer_token: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            let retry_allowed = attempt < self.backoff.max_retries;
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(ToString::to_string);
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && retry_allowed {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(status = status.as_u16(), attempt, ?delay, "retrying after http status");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && retry_allowed {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(error = %err, attempt, ?delay, "retrying after request error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Local mirror

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MirrorEntry {
    Bare(String),
    Full(DedupEntry),
}

/// Whole-file JSON snapshot of every known identity.
#[derive(Debug, Clone)]
pub struct LocalMirror {
    path: PathBuf,
}

impl LocalMirror {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty mirror.
    pub async fn load(&self) -> Result<Vec<DedupEntry>, StoreError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::LocalMirror {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<MirrorEntry> =
            serde_json::from_str(&text).map_err(|source| StoreError::CorruptMirror {
                path: self.path.clone(),
                source,
            })?;

        Ok(raw
            .into_iter()
            .filter_map(|entry| match entry {
                MirrorEntry::Bare(url) => Identity::normalize(&url).map(|id| DedupEntry::new(id, None)),
                MirrorEntry::Full(entry) => Some(entry),
            })
            .collect())
    }

    /// Replace the snapshot atomically via a sibling temp file and rename.
    pub async fn write_snapshot<'a>(
        &self,
        entries: impl IntoIterator<Item = &'a DedupEntry>,
    ) -> Result<(), StoreError> {
        let entries = entries.into_iter().collect::<Vec<_>>();
        let bytes = serde_json::to_vec_pretty(&entries).map_err(|source| StoreError::CorruptMirror {
            path: self.path.clone(),
            source,
        })?;
        self.replace_atomically(&bytes).await
    }

    /// Checks that the mirror location accepts writes without touching the snapshot.
    pub async fn check_writable(&self) -> Result<(), StoreError> {
        let temp_path = self.temp_path("check");
        self.ensure_parent().await?;
        fs::write(&temp_path, b"[]").await.map_err(|source| StoreError::LocalMirror {
            path: temp_path.clone(),
            source,
        })?;
        let _ = fs::remove_file(&temp_path).await;
        Ok(())
    }

    async fn ensure_parent(&self) -> Result<(), StoreError> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::LocalMirror {
                        path: parent.to_path_buf(),
                        source,
                    })
            }
            _ => Ok(()),
        }
    }

    fn temp_path(&self, tag: &str) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mirror".to_string());
        self.path
            .with_file_name(format!(".{file_name}.{tag}.{}.tmp", Uuid::new_v4()))
    }

    async fn replace_atomically(&self, bytes: &[u8]) -> Result<(), StoreError> {
        self.ensure_parent().await?;
        let temp_path = self.temp_path("write");
        let io_err = |path: &Path, source| StoreError::LocalMirror {
            path: path.to_path_buf(),
            source,
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| io_err(&temp_path, e))?;
        if let Err(err) = file.write_all(bytes).await {
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(&temp_path, err));
        }
        if let Err(err) = file.flush().await {
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(&temp_path, err));
        }
        drop(file);

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(io_err(&self.path, err))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Remote tier

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub key: String,
    /// Raw identity stored alongside the key, when the document carries one.
    pub identity: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub entries: Vec<RemoteEntry>,
    pub next_page_token: Option<String>,
}

/// Key-existence store keyed by [`encode_remote_key`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn name(&self) -> &str;

    async fn list_page(
        &self,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<RemotePage, StoreError>;

    /// Insert or merge one key; the store assigns the `seen_at` timestamp.
    async fn upsert(&self, key: &str, identity: &Identity) -> Result<(), StoreError>;
}

pub async fn list_all_remote(
    store: &dyn RemoteStore,
    page_size: usize,
) -> Result<Vec<RemoteEntry>, StoreError> {
    let page_size = page_size.max(1);
    let mut entries = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = store.list_page(page_size, token.as_deref()).await?;
        entries.extend(page.entries);
        match page.next_page_token {
            Some(next) if !next.is_empty() && Some(&next) != token.as_ref() => token = Some(next),
            _ => break,
        }
    }
    Ok(entries)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDocument {
    pub identity: String,
    pub seen_at: DateTime<Utc>,
}

/// In-process remote tier used by offline runs and tests.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    docs: Mutex<BTreeMap<String, MemoryDocument>>,
    unavailable: AtomicBool,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_identities<'a>(identities: impl IntoIterator<Item = &'a Identity>) -> Self {
        let store = Self::new();
        for identity in identities {
            let _ = store.upsert(&encode_remote_key(identity), identity).await;
        }
        store
    }

    /// Makes every call fail with [`StoreError::Remote`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn keys(&self) -> Vec<String> {
        self.docs.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.docs.lock().await.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Remote("memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_page(
        &self,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<RemotePage, StoreError> {
        self.check_available()?;
        let docs = self.docs.lock().await;
        let mut entries = docs
            .iter()
            .filter(|(key, _)| page_token.map_or(true, |token| key.as_str() > token))
            .take(page_size.max(1) + 1)
            .map(|(key, doc)| RemoteEntry {
                key: key.clone(),
                identity: Some(doc.identity.clone()),
            })
            .collect::<Vec<_>>();

        let next_page_token = if entries.len() > page_size.max(1) {
            entries.truncate(page_size.max(1));
            entries.last().map(|e| e.key.clone())
        } else {
            None
        };
        Ok(RemotePage {
            entries,
            next_page_token,
        })
    }

    async fn upsert(&self, key: &str, identity: &Identity) -> Result<(), StoreError> {
        self.check_available()?;
        self.docs.lock().await.insert(
            key.to_string(),
            MemoryDocument {
                identity: identity.as_str().to_string(),
                seen_at: Utc::now(),
            },
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub database: String,
    pub collection: String,
    pub access_token: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
}

impl FirestoreConfig {
    pub fn new(project_id: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: "(default)".to_string(),
            collection: collection.into(),
            access_token: None,
            base_url: "https://firestore.googleapis.com/v1".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<FirestoreDocument>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FirestoreDocument {
    name: String,
    #[serde(default)]
    fields: BTreeMap<String, FirestoreValue>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct FirestoreValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    string_value: Option<String>,
}

/// Firestore documents REST API as the remote tier.
#[derive(Debug)]
pub struct FirestoreStore {
    config: FirestoreConfig,
    http: HttpFetcher,
}

impl FirestoreStore {
    pub fn new(config: FirestoreConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            accept: Some("application/json".to_string()),
            concurrency: 1,
            ..Default::default()
        })?;
        Ok(Self { config, http })
    }

    fn database_path(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.config.project_id, self.config.database
        )
    }

    fn document_name(&self, key: &str) -> String {
        format!("{}/{}/{}", self.database_path(), self.config.collection, key)
    }

    fn commit_body(&self, key: &str, identity: &Identity) -> serde_json::Value {
        json!({
            "writes": [{
                "update": {
                    "name": self.document_name(key),
                    "fields": { "url": { "stringValue": identity.as_str() } }
                },
                "updateMask": { "fieldPaths": ["url"] },
                "updateTransforms": [{
                    "fieldPath": "seen_at",
                    "setToServerValue": "REQUEST_TIME"
                }]
            }]
        })
    }
}

fn parse_list_response(body: &[u8]) -> Result<RemotePage, StoreError> {
    let parsed: ListDocumentsResponse = serde_json::from_slice(body)
        .map_err(|e| StoreError::Remote(format!("invalid listDocuments payload: {e}")))?;
    let entries = parsed
        .documents
        .into_iter()
        .map(|doc| RemoteEntry {
            key: doc
                .name
                .rsplit('/')
                .next()
                .unwrap_or(doc.name.as_str())
                .to_string(),
            identity: doc.fields.get("url").and_then(|v| v.string_value.clone()),
        })
        .collect();
    Ok(RemotePage {
        entries,
        next_page_token: parsed.next_page_token.filter(|t| !t.is_empty()),
    })
}

#[async_trait]
impl RemoteStore for FirestoreStore {
    fn name(&self) -> &str {
        "firestore"
    }

    async fn list_page(
        &self,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<RemotePage, StoreError> {
        let url = format!(
            "{}/{}/{}",
            self.config.base_url,
            self.database_path(),
            self.config.collection
        );
        let mut query = vec![
            ("pageSize", page_size.to_string()),
            ("mask.fieldPaths", "url".to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let resp = self
            .http
            .get(&url, &query, self.config.access_token.as_deref())
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?;
        parse_list_response(&resp.body)
    }

    async fn upsert(&self, key: &str, identity: &Identity) -> Result<(), StoreError> {
        let url = format!("{}/{}:commit", self.config.base_url, self.database_path());
        let mut request = self
            .http
            .client()
            .post(&url)
            .json(&self.commit_body(key, identity));
        if let Some(token) = &self.config.access_token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Remote(format!("commit returned {status}: {body}")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dedup store

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HydrationReport {
    pub local_entries: usize,
    pub remote_entries: Option<usize>,
    pub merged_entries: usize,
    pub local_error: Option<String>,
    pub remote_error: Option<String>,
}

/// Already-reported identities for one cycle: the union of both tiers,
/// written back to both on every addition.
pub struct DedupStore {
    entries: BTreeMap<Identity, DedupEntry>,
    mirror: LocalMirror,
    remote: Option<Arc<dyn RemoteStore>>,
    remote_degraded: bool,
    mirror_write_failures: usize,
}

impl std::fmt::Debug for DedupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupStore")
            .field("entries", &self.entries.len())
            .field("mirror", &self.mirror.path())
            .field("remote", &self.remote.as_ref().map(|r| r.name().to_string()))
            .field("remote_degraded", &self.remote_degraded)
            .finish()
    }
}

impl DedupStore {
    /// Empty store with no remote tier; mainly useful in tests.
    pub fn empty(mirror: LocalMirror) -> Self {
        Self {
            entries: BTreeMap::new(),
            mirror,
            remote: None,
            remote_degraded: false,
            mirror_write_failures: 0,
        }
    }

    /// Load both tiers and union them.
    ///
    /// Remote failures degrade to local-only. A local mirror that can be
    /// neither read nor written is the only error returned.
    pub async fn hydrate(
        mirror: LocalMirror,
        remote: Option<Arc<dyn RemoteStore>>,
        page_size: usize,
    ) -> Result<(Self, HydrationReport), StoreError> {
        let mut report = HydrationReport::default();
        let mut store = Self::empty(mirror);
        store.remote = remote;

        match store.mirror.load().await {
            Ok(local) => {
                report.local_entries = local.len();
                for entry in local {
                    store.merge_entry(entry);
                }
            }
            Err(err) => {
                warn!(path = %store.mirror.path().display(), error = %err, "local dedup mirror unreadable; starting with empty local view");
                store.mirror.check_writable().await?;
                report.local_error = Some(err.to_string());
            }
        }

        if let Some(remote) = store.remote.clone() {
            match list_all_remote(remote.as_ref(), page_size).await {
                Ok(remote_entries) => {
                    report.remote_entries = Some(remote_entries.len());
                    let before = store.entries.len();
                    for entry in remote_entries {
                        let raw = entry.identity.unwrap_or(entry.key);
                        let identity = Identity::normalize(&raw).unwrap_or_else(|| Identity::from_stored(raw));
                        store.merge_entry(DedupEntry::new(identity, None));
                    }
                    let added = store.entries.len() - before;
                    if added > 0 && report.local_error.is_none() {
                        store.write_mirror().await;
                    }
                }
                Err(err) => {
                    warn!(store = remote.name(), error = %err, "remote dedup tier unavailable; continuing with local mirror only");
                    store.remote_degraded = true;
                    report.remote_error = Some(err.to_string());
                }
            }
        }

        report.merged_entries = store.entries.len();
        info!(
            local = report.local_entries,
            remote = ?report.remote_entries,
            merged = report.merged_entries,
            "dedup store hydrated"
        );
        Ok((store, report))
    }

    fn merge_entry(&mut self, entry: DedupEntry) {
        match self.entries.get_mut(&entry.identity) {
            Some(existing) => existing.merge(&entry),
            None => {
                self.entries.insert(entry.identity.clone(), entry);
            }
        }
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &DedupEntry> {
        self.entries.values()
    }

    pub fn remote_degraded(&self) -> bool {
        self.remote_degraded
    }

    pub fn mirror_write_failures(&self) -> usize {
        self.mirror_write_failures
    }

    /// Mark an identity as reported. Returns `false` if it was already known,
    /// in which case neither tier is touched. The remote tier is skipped once
    /// it has failed in this cycle.
    pub async fn record(&mut self, identity: &Identity, now: DateTime<Utc>) -> bool {
        if self.entries.contains_key(identity) {
            return false;
        }
        self.entries
            .insert(identity.clone(), DedupEntry::new(identity.clone(), Some(now)));

        // A degraded remote is not written again this cycle.
        match self.remote.clone() {
            Some(remote) if !self.remote_degraded => {
                let key = encode_remote_key(identity);
                if let Err(err) = remote.upsert(&key, identity).await {
                    warn!(store = remote.name(), %identity, error = %err, "remote dedup write failed; local mirror only for the rest of the cycle");
                    self.remote_degraded = true;
                }
            }
            Some(remote) => {
                debug!(store = remote.name(), %identity, "remote tier degraded; skipping write");
            }
            None => {}
        }

        self.write_mirror().await;
        true
    }

    /// Rewrite the local mirror snapshot.
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        let result = self.mirror.write_snapshot(self.entries.values()).await;
        if result.is_err() {
            self.mirror_write_failures += 1;
        }
        result
    }

    async fn write_mirror(&mut self) {
        if let Err(err) = self.flush().await {
            warn!(path = %self.mirror.path().display(), error = %err, "failed to rewrite local dedup mirror");
        }
    }
}
