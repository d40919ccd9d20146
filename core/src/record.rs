use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{CollectionId, RecordId};

/// Origin of a message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SenderKind {
    User,
    SystemAgent,
}

/// Delivery lifecycle of a message record. `Pending` records carry a
/// client-assigned temporary id until the authoritative write lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: RecordId,
    pub collection_id: CollectionId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub sender_kind: SenderKind,
    pub status: DeliveryStatus,
}

impl Message {
    /// Build the optimistic copy of an outbound message. The temporary id is
    /// replaced with the authoritative one at confirmation; the `tmp-` prefix
    /// is a readable marker only and never drives reconciliation.
    pub fn pending(collection_id: impl Into<CollectionId>, content: impl Into<String>) -> Self {
        Self {
            id: RecordId::from(format!("tmp-{}", Uuid::new_v4().simple())),
            collection_id: collection_id.into(),
            content: content.into(),
            created_at: Utc::now(),
            sender_kind: SenderKind::User,
            status: DeliveryStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_message_carries_temporary_identity() {
        let message = Message::pending("conversation-1", "Hola");

        assert!(message.id.as_str().starts_with("tmp-"));
        assert_eq!(message.status, DeliveryStatus::Pending);
        assert_eq!(message.sender_kind, SenderKind::User);
        assert_eq!(message.collection_id.as_str(), "conversation-1");
    }

    #[test]
    fn message_serializes_with_camel_case_fields() {
        let message = Message {
            id: RecordId::from("m1"),
            collection_id: CollectionId::from("c1"),
            content: "Hola".into(),
            created_at: Utc::now(),
            sender_kind: SenderKind::SystemAgent,
            status: DeliveryStatus::Confirmed,
        };

        let json = serde_json::to_value(&message).expect("message serializes");
        assert_eq!(json["collectionId"], "c1");
        assert_eq!(json["senderKind"], "system-agent");
        assert_eq!(json["status"], "confirmed");
        assert!(json["createdAt"].is_string());
    }
}
