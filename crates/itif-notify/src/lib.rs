//! Notification sinks and the fixed-size batcher that feeds them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use itif_core::Record;
use itif_storage::{HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "itif-notify";

pub const DEFAULT_BATCH_SIZE: usize = 5;

pub const BATCH_HEADER: &str = "🎯 *New IT Internships Found!* 🎯";
pub const BATCH_FOOTER: &str = "_🔔 Daily update: Check back soon for more opportunities!_";
pub const EMPTY_SUMMARY: &str = "📅 *Daily Summary: No new IT internships found today!* 📅";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Transport(String),
    #[error("sink rejected message ({status}): {description}")]
    Rejected { status: u16, description: String },
}

/// Destination for rendered payloads; one call per message.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, text: &str) -> Result<(), SinkError>;
}

/// Escape characters that legacy Telegram Markdown treats as entity markers.
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub fn render_record(record: &Record, index: usize) -> String {
    let mut lines = vec![
        format!("{index}. *{}*", escape_markdown(record.title())),
        format!("🏢 *Company:* {}", escape_markdown(record.organization())),
        format!("📍 *Location:* {}", escape_markdown(record.location())),
    ];
    if let Some(posted_at) = record.posted_at() {
        lines.push(format!("📅 *Posted:* {}", posted_at.format("%Y-%m-%d")));
    }
    lines.push(format!("🔗 [Apply Here]({})", record.url()));
    lines.join("\n")
}

/// One message for one chunk; numbering starts at 1.
pub fn render_batch(records: &[Record]) -> String {
    let mut message = format!("{BATCH_HEADER}\n\n");
    for (i, record) in records.iter().enumerate() {
        message.push_str(&render_record(record, i + 1));
        message.push_str("\n\n");
    }
    message.push_str(BATCH_FOOTER);
    message
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub batch_sizes: Vec<usize>,
    pub sent: usize,
    pub failed: usize,
}

pub struct NotificationBatcher {
    batch_size: usize,
    sink: Arc<dyn NotificationSink>,
}

impl NotificationBatcher {
    pub fn new(batch_size: usize, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            batch_size: batch_size.max(1),
            sink,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    /// Send `records` in order, `batch_size` per message. A failed batch is
    /// logged and the remaining batches are still sent.
    pub async fn deliver(&self, records: &[Record]) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for (index, chunk) in records.chunks(self.batch_size).enumerate() {
            report.batch_sizes.push(chunk.len());
            match self.sink.send(&render_batch(chunk)).await {
                Ok(()) => {
                    report.sent += 1;
                    info!(sink = self.sink.name(), batch = index + 1, records = chunk.len(), "batch delivered");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(sink = self.sink.name(), batch = index + 1, records = chunk.len(), error = %err, "batch delivery failed");
                }
            }
        }
        report
    }

    pub async fn deliver_empty_summary(&self) -> DeliveryReport {
        match self.sink.send(EMPTY_SUMMARY).await {
            Ok(()) => {
                info!(sink = self.sink.name(), "empty summary delivered");
                DeliveryReport {
                    batch_sizes: Vec::new(),
                    sent: 1,
                    failed: 0,
                }
            }
            Err(err) => {
                warn!(sink = self.sink.name(), error = %err, "empty summary delivery failed");
                DeliveryReport {
                    batch_sizes: Vec::new(),
                    sent: 0,
                    failed: 1,
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: String,
    pub timeout: Duration,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            api_base: "https://api.telegram.org".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Bot API `sendMessage` with Markdown parsing and link previews off.
#[derive(Debug)]
pub struct TelegramSink {
    config: TelegramConfig,
    http: HttpFetcher,
}

impl TelegramSink {
    pub fn new(config: TelegramConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            concurrency: 1,
            ..Default::default()
        })
        .context("building telegram client")?;
        Ok(Self { config, http })
    }

    fn payload(&self, text: &str) -> serde_json::Value {
        json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        })
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, text: &str) -> Result<(), SinkError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        );
        let resp = self
            .http
            .client()
            .post(&url)
            .json(&self.payload(text))
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.without_url().to_string()))?;

        let status = resp.status();
        let body = resp.bytes().await.unwrap_or_default();
        let parsed = serde_json::from_slice::<TelegramResponse>(&body).ok();
        match parsed {
            Some(TelegramResponse { ok: true, .. }) if status.is_success() => Ok(()),
            other => Err(SinkError::Rejected {
                status: status.as_u16(),
                description: other
                    .and_then(|r| r.description)
                    .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned()),
            }),
        }
    }
}

/// Writes payloads to the log; used offline and when no bot is configured.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, text: &str) -> Result<(), SinkError> {
        info!(target: "itif::notify", "{text}");
        Ok(())
    }
}

/// Keeps every payload in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, text: &str) -> Result<(), SinkError> {
        self.messages.lock().await.push(text.to_string());
        Ok(())
    }
}
