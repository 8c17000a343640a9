//! Core posting model and identity rules for ITIF.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "itif-core";

pub const MAX_METADATA_ENTRIES: usize = 16;
pub const MAX_METADATA_VALUE_CHARS: usize = 512;

pub const UNKNOWN_ORGANIZATION: &str = "Unknown Company";
pub const DEFAULT_LOCATION: &str = "Remote";

/// Normalized source URL; the only equality and dedup key of a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Normalizes a raw link into an identity. Returns `None` for blank input.
    ///
    /// Absolute http(s) URLs get a lowercased scheme and host, no default port,
    /// no fragment, no trailing slash on non-root paths, no `utm_*` parameters
    /// and sorted query pairs. Path and query values keep their case. Anything
    /// that does not parse as such a URL is used verbatim after trimming.
    pub fn normalize(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        let mut url = match Url::parse(trimmed) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => url,
            _ => return Some(Self(trimmed.to_string())),
        };

        url.set_fragment(None);

        let mut pairs = url
            .query_pairs()
            .filter(|(key, _)| !key.starts_with("utm_"))
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect::<Vec<_>>();
        if pairs.is_empty() {
            url.set_query(None);
        } else {
            pairs.sort();
            url.query_pairs_mut().clear().extend_pairs(pairs.iter());
        }

        let path = url.path().to_string();
        if path.len() > 1 && path.ends_with('/') {
            url.set_path(path.trim_end_matches('/'));
        }

        Some(Self(url.to_string()))
    }

    /// Wraps a value that was normalized before it was persisted.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Collapse runs of whitespace and drop control characters.
pub fn clean_text(input: &str) -> String {
    input
        .split_whitespace()
        .map(|word| word.chars().filter(|c| !c.is_control()).collect::<String>())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record from {source_label} has no link")]
    MissingUrl { source_label: String },
}

/// Raw handoff contract from adapters into the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub url: String,
    pub title: String,
    pub organization: String,
    pub location: String,
    pub description: String,
    pub source_label: String,
    pub posted_at: Option<DateTime<Utc>>,
    /// Source-specific extras copied onto the record, subject to its bounds.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A normalized posting. Immutable after construction apart from its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    identity: Identity,
    /// Link as the source published it; `identity` is only for dedup.
    #[serde(default)]
    url: String,
    title: String,
    organization: String,
    location: String,
    description: String,
    source_label: String,
    posted_at: Option<DateTime<Utc>>,
    ingested_at: DateTime<Utc>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl Record {
    pub fn from_draft(draft: RecordDraft, ingested_at: DateTime<Utc>) -> Result<Self, RecordError> {
        let identity = Identity::normalize(&draft.url).ok_or_else(|| RecordError::MissingUrl {
            source_label: draft.source_label.clone(),
        })?;

        let organization = clean_text(&draft.organization);
        let location = clean_text(&draft.location);

        let mut record = Self {
            identity,
            url: draft.url.trim().to_string(),
            title: clean_text(&draft.title),
            organization: if organization.is_empty() {
                UNKNOWN_ORGANIZATION.to_string()
            } else {
                organization
            },
            location: if location.is_empty() {
                DEFAULT_LOCATION.to_string()
            } else {
                location
            },
            description: clean_text(&draft.description),
            source_label: draft.source_label,
            posted_at: draft.posted_at,
            ingested_at,
            metadata: BTreeMap::new(),
        };
        for (key, value) in draft.metadata {
            record.insert_metadata(key, value);
        }
        Ok(record)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The source's own link, falling back to the identity for records
    /// persisted before it was kept.
    pub fn url(&self) -> &str {
        if self.url.is_empty() {
            self.identity.as_str()
        } else {
            &self.url
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn source_label(&self) -> &str {
        &self.source_label
    }

    /// Timestamp reported by the source, if it was present and parsed.
    pub fn posted_at(&self) -> Option<DateTime<Utc>> {
        self.posted_at
    }

    pub fn ingested_at(&self) -> DateTime<Utc> {
        self.ingested_at
    }

    pub fn posted_or_ingested(&self) -> DateTime<Utc> {
        self.posted_at.unwrap_or(self.ingested_at)
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Attach a side-channel value. Refused once the map is full; long values
    /// are cut to [`MAX_METADATA_VALUE_CHARS`].
    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl AsRef<str>) -> bool {
        let key = key.into();
        if !self.metadata.contains_key(&key) && self.metadata.len() >= MAX_METADATA_ENTRIES {
            return false;
        }
        let value = value
            .as_ref()
            .chars()
            .take(MAX_METADATA_VALUE_CHARS)
            .collect::<String>();
        self.metadata.insert(key, value);
        true
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for Record {}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

/// One already-reported identity. `first_seen` is unknown for entries
/// hydrated from tiers that do not carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub identity: Identity,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
}

impl DedupEntry {
    pub fn new(identity: Identity, first_seen: Option<DateTime<Utc>>) -> Self {
        Self {
            identity,
            first_seen,
        }
    }

    /// Union rule: keep the earliest known first-seen time.
    pub fn merge(&mut self, other: &DedupEntry) {
        self.first_seen = match (self.first_seen, other.first_seen) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}
