use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::{EventKind, PipelineEvent, Subscriber};
use crate::config::NotificationsConfig;
use crate::error::{Result, TabsyncError};

/// Writes each event to the log
pub struct LogSubscriber;

#[async_trait]
impl Subscriber for LogSubscriber {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &PipelineEvent) -> Result<()> {
        match event.event {
            EventKind::Ingested => log::info!(
                "event: ingested {} ({} rows, hash {}{})",
                event.file_id,
                event.row_count.unwrap_or(0),
                event.hash,
                if event.already_committed { ", already committed" } else { "" }
            ),
            EventKind::Failed => log::error!(
                "event: failed {} ({}): {}",
                event.file_id,
                event.error_kind.as_deref().unwrap_or("unknown"),
                event.error.as_deref().unwrap_or("")
            ),
        }
        Ok(())
    }
}

/// Appends one JSON object per line to a file that downstream jobs tail.
pub struct JsonlSubscriber {
    path: PathBuf,
}

impl JsonlSubscriber {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Subscriber for JsonlSubscriber {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn deliver(&self, event: &PipelineEvent) -> Result<()> {
        let mut line = event.to_json_line()?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// POSTs each event as JSON. Network errors, 429 and 5xx are retried with
/// exponential backoff; other statuses are rejected immediately.
pub struct WebhookSubscriber {
    client: Client,
    url: String,
    max_attempts: u32,
    backoff: Duration,
}

enum Delivery {
    Done,
    Retry(String),
    Reject(String),
}

impl WebhookSubscriber {
    pub fn new(url: impl Into<String>, timeout: Duration, max_attempts: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TabsyncError::Config(format!("cannot build webhook client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            max_attempts: max_attempts.max(1),
            backoff: Duration::from_millis(500),
        })
    }

    pub fn from_config(config: &NotificationsConfig) -> Result<Option<Self>> {
        match &config.webhook_url {
            None => Ok(None),
            Some(url) => Ok(Some(Self::new(
                url.clone(),
                Duration::from_millis(config.webhook_timeout_ms),
                config.webhook_max_attempts,
            )?)),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn post(&self, event: &PipelineEvent) -> Delivery {
        let response = match self.client.post(&self.url).json(event).send().await {
            Ok(r) => r,
            Err(e) => return Delivery::Retry(format!("network error: {}", e)),
        };
        let status = response.status();
        if status.is_success() {
            Delivery::Done
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Delivery::Retry(format!("webhook returned {}", status))
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            Delivery::Reject(format!("webhook returned {}: {}", status, body))
        }
    }
}

#[async_trait]
impl Subscriber for WebhookSubscriber {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, event: &PipelineEvent) -> Result<()> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match self.post(event).await {
                Delivery::Done => {
                    log::debug!("webhook: delivered {} (attempt {})", event.event_id, attempt);
                    return Ok(());
                }
                Delivery::Reject(reason) => return Err(TabsyncError::Notification(reason)),
                Delivery::Retry(reason) if attempt < self.max_attempts => {
                    log::warn!("webhook: retry {}/{} after error: {}", attempt, self.max_attempts, reason);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Delivery::Retry(reason) => {
                    return Err(TabsyncError::Notification(format!(
                        "gave up after {} attempts: {}",
                        attempt, reason
                    )))
                }
            }
        }
    }
}
