//! Downstream notifications.
//!
//! The coordinator publishes one [`PipelineEvent`] per file outcome on an
//! [`EventBus`]. Each subscriber owns an unbounded channel, so a slow consumer
//! never causes another to miss events. Delivery is at-least-once: the same hash
//! can be announced more than once (re-drops of a committed file, restarts), and
//! consumers are expected to key their work on `hash`.

pub mod subscribers;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::NotificationsConfig;
use crate::error::{Result, TabsyncError};

pub use subscribers::{JsonlSubscriber, LogSubscriber, WebhookSubscriber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Ingested,
    Failed,
}

/// Wire shape of a notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub event_id: Uuid,
    pub event: EventKind,
    /// Path of the file as it was observed in the watch directory
    pub file_id: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the file version had been synced before and nothing was written
    #[serde(default)]
    pub already_committed: bool,
    pub at: DateTime<Utc>,
}

impl PipelineEvent {
    pub fn ingested(path: &Path, hash: &str, row_count: u64, already_committed: bool) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event: EventKind::Ingested,
            file_id: path.to_string_lossy().to_string(),
            hash: hash.to_string(),
            row_count: Some(row_count),
            error_kind: None,
            error: None,
            already_committed,
            at: Utc::now(),
        }
    }

    pub fn failed(path: &Path, hash: &str, err: &TabsyncError) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event: EventKind::Failed,
            file_id: path.to_string_lossy().to_string(),
            hash: hash.to_string(),
            row_count: None,
            error_kind: Some(err.kind().to_string()),
            error: Some(err.to_string()),
            already_committed: false,
            at: Utc::now(),
        }
    }

    pub fn to_json_line(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| TabsyncError::Notification(e.to_string()))
    }
}

/// Fan-out of pipeline events to any number of subscribers.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<PipelineEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. It receives every event published from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PipelineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut senders) = self.senders.lock() {
            senders.push(tx);
        }
        rx
    }

    /// Send to every live subscriber; dropped receivers are forgotten. Returns the
    /// number of subscribers the event was handed to.
    pub fn publish(&self, event: PipelineEvent) -> usize {
        let Ok(mut senders) = self.senders.lock() else {
            return 0;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        senders.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// A downstream collaborator (insight generator, dashboard refresher)
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &PipelineEvent) -> Result<()>;
}

/// Pump events from `rx` into `subscriber` until the bus is dropped.
/// A failed delivery is logged and the pump moves on to the next event.
pub fn spawn_subscriber(
    mut rx: mpsc::UnboundedReceiver<PipelineEvent>,
    subscriber: Arc<dyn Subscriber>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = subscriber.deliver(&event).await {
                log::error!(
                    "notify: {} could not deliver {:?} for {}: {}",
                    subscriber.name(),
                    event.event,
                    event.hash,
                    e
                );
            }
        }
        log::debug!("notify: {} stopped", subscriber.name());
    })
}

/// Attach the subscribers enabled in `[notifications]`: the log always, the JSONL
/// event log and the webhook when configured.
pub fn spawn_configured(config: &NotificationsConfig, bus: &EventBus) -> Result<Vec<JoinHandle<()>>> {
    let mut subscribers: Vec<Arc<dyn Subscriber>> = vec![Arc::new(LogSubscriber)];
    if let Some(path) = &config.event_log {
        log::info!("notify: appending events to {}", path.display());
        subscribers.push(Arc::new(JsonlSubscriber::new(path)));
    }
    if let Some(webhook) = WebhookSubscriber::from_config(config)? {
        log::info!("notify: posting events to webhook");
        subscribers.push(Arc::new(webhook));
    }
    Ok(subscribers
        .into_iter()
        .map(|s| spawn_subscriber(bus.subscribe(), s))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseError;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_event_wire_shape() {
        let ev = PipelineEvent::ingested(Path::new("drop/products.csv"), "abc", 3, false);
        let json: serde_json::Value = serde_json::from_str(&ev.to_json_line().unwrap()).unwrap();
        assert_eq!(json["event"], "ingested");
        assert_eq!(json["file_id"], "drop/products.csv");
        assert_eq!(json["row_count"], 3);
        assert!(json.get("error").is_none());

        let err = TabsyncError::from(ParseError::Empty);
        let failed = PipelineEvent::failed(Path::new("drop/empty.csv"), "def", &err);
        let json: serde_json::Value = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["event"], "failed");
        assert_eq!(json["error_kind"], "ErrEmpty");
        assert!(json.get("row_count").is_none());

        let back: PipelineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, failed);
    }

    #[tokio::test]
    async fn test_bus_fans_out_and_forgets_dropped() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let b = bus.subscribe();
        drop(b);

        let ev = PipelineEvent::ingested(&PathBuf::from("x.csv"), "h", 1, false);
        assert_eq!(bus.publish(ev.clone()), 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(a.recv().await.unwrap(), ev);
    }

    struct Counting {
        seen: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl Subscriber for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn deliver(&self, _event: &PipelineEvent) -> Result<()> {
            let n = self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(TabsyncError::Notification("down".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pump_survives_delivery_error() {
        let bus = EventBus::new();
        let sub = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            fail_first: true,
        });
        let handle = spawn_subscriber(bus.subscribe(), sub.clone());

        bus.publish(PipelineEvent::ingested(Path::new("a.csv"), "h1", 1, false));
        bus.publish(PipelineEvent::ingested(Path::new("b.csv"), "h2", 2, false));
        drop(bus);
        handle.await.unwrap();
        assert_eq!(sub.seen.load(Ordering::SeqCst), 2);
    }
}
