use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A state change worth telling subscribers about
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub tenant_id: Uuid,
    pub entity_type: String,
    pub action: String,
    pub entity_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(tenant_id: Uuid, entity_type: &str, action: &str, entity_id: Uuid) -> Self {
        Self {
            tenant_id,
            entity_type: entity_type.to_string(),
            action: action.to_string(),
            entity_id,
            payload: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Best-effort change sink. Callers go through [`notify_quietly`] so a failing
/// sink never fails the operation that produced the change.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn notify(&self, event: ChangeEvent) -> anyhow::Result<()>;
}

pub async fn notify_quietly(notifier: &dyn ChangeNotifier, event: ChangeEvent) {
    let entity_type = event.entity_type.clone();
    let action = event.action.clone();
    let entity_id = event.entity_id;

    if let Err(e) = notifier.notify(event).await {
        tracing::warn!(
            entity_type = %entity_type,
            action = %action,
            entity_id = %entity_id,
            error = %e,
            "Change notification failed"
        );
    }
}

pub struct NoopNotifier;

#[async_trait]
impl ChangeNotifier for NoopNotifier {
    async fn notify(&self, _event: ChangeEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fans change events out to in-process subscribers (websocket sessions)
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<ChangeEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl ChangeNotifier for BroadcastNotifier {
    async fn notify(&self, event: ChangeEvent) -> anyhow::Result<()> {
        // No subscribers is not a failure.
        let _ = self.sender.send(event);
        Ok(())
    }
}
