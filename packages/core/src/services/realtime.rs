//! Real-Time Notification Boundary
//!
//! The engine only ever calls a [`RealtimeNotifier`] from a post-commit
//! callback. Connection handling and message framing belong to the transport
//! behind the trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

/// Broadcast channel capacity for real-time messages
const REALTIME_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeAction {
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
}

/// One committed record change as seen by collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeMessage {
    pub action: RealtimeAction,
    pub table_id: String,
    pub record_id: String,
    pub fields: Map<String, Value>,
}

#[async_trait]
pub trait RealtimeNotifier: Send + Sync {
    async fn broadcast_record_created(
        &self,
        table_id: &str,
        record_id: &str,
        fields: Map<String, Value>,
    ) -> anyhow::Result<()>;

    async fn broadcast_record_updated(
        &self,
        table_id: &str,
        record_id: &str,
        fields: Map<String, Value>,
    ) -> anyhow::Result<()>;

    async fn broadcast_record_deleted(&self, table_id: &str, record_id: &str) -> anyhow::Result<()>;
}

/// In-process notifier fanning messages out over a broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<RealtimeMessage>,
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        Self::with_capacity(REALTIME_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeMessage> {
        self.tx.subscribe()
    }

    fn send(&self, message: RealtimeMessage) {
        // No receivers is not an error: nobody is watching this table
        if self.tx.send(message).is_err() {
            tracing::trace!("Real-time message dropped, no subscribers");
        }
    }
}

#[async_trait]
impl RealtimeNotifier for BroadcastNotifier {
    async fn broadcast_record_created(
        &self,
        table_id: &str,
        record_id: &str,
        fields: Map<String, Value>,
    ) -> anyhow::Result<()> {
        self.send(RealtimeMessage {
            action: RealtimeAction::RecordCreated,
            table_id: table_id.to_string(),
            record_id: record_id.to_string(),
            fields,
        });
        Ok(())
    }

    async fn broadcast_record_updated(
        &self,
        table_id: &str,
        record_id: &str,
        fields: Map<String, Value>,
    ) -> anyhow::Result<()> {
        self.send(RealtimeMessage {
            action: RealtimeAction::RecordUpdated,
            table_id: table_id.to_string(),
            record_id: record_id.to_string(),
            fields,
        });
        Ok(())
    }

    async fn broadcast_record_deleted(&self, table_id: &str, record_id: &str) -> anyhow::Result<()> {
        self.send(RealtimeMessage {
            action: RealtimeAction::RecordDeleted,
            table_id: table_id.to_string(),
            record_id: record_id.to_string(),
            fields: Map::new(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribers_receive_messages() {
        let notifier = BroadcastNotifier::new();
        let mut rx = notifier.subscribe();

        let mut fields = Map::new();
        fields.insert("a".into(), json!(5));
        notifier.broadcast_record_updated("t1", "r1", fields).await.unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.action, RealtimeAction::RecordUpdated);
        assert_eq!(message.record_id, "r1");
        assert_eq!(message.fields["a"], 5);
    }

    #[tokio::test]
    async fn test_no_subscribers_is_ok() {
        let notifier = BroadcastNotifier::new();
        assert!(notifier.broadcast_record_deleted("t1", "r1").await.is_ok());
    }

    #[test]
    fn test_message_serialization() {
        let message = RealtimeMessage {
            action: RealtimeAction::RecordCreated,
            table_id: "t1".into(),
            record_id: "r1".into(),
            fields: Map::new(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["action"], "record_created");
        assert_eq!(value["recordId"], "r1");
    }
}
