use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    cache::SyncCache,
    ids::CollectionId,
    record::{DeliveryStatus, Message},
    window::RecentlySentWindow,
};

/// Collection kind under which conversations keep their message sequences.
pub const MESSAGE_COLLECTION_KIND: &str = "messages";

/// The authoritative write backend. `create` persists the message and returns
/// the server's copy, carrying the assigned id.
#[async_trait]
pub trait RecordWriter: Send + Sync {
    async fn create(&self, collection_id: &CollectionId, content: &str) -> Result<Message>;
}

pub type RecordWriterRef = Arc<dyn RecordWriter>;

/// Send path for outbound messages, reconciling three copies of each write:
/// the optimistic local record, the write acknowledgement, and the push echo.
///
/// Per message: a `pending` record with a temporary id is merged into the
/// cached collection immediately, then either swapped for the server's
/// confirmed copy (identity change, not an append) or marked `failed` in
/// place. Push-delivered records pass through the recently-sent window first
/// so the echo of our own write never lands twice.
pub struct Outbox {
    cache: Arc<SyncCache>,
    writer: RecordWriterRef,
    window: RecentlySentWindow,
}

impl Outbox {
    pub fn new(cache: Arc<SyncCache>, writer: RecordWriterRef) -> Self {
        let window = RecentlySentWindow::new(
            cache.config().recently_sent_ttl(),
            cache.config().recently_sent_capacity,
            cache.clock(),
        );
        Self {
            cache,
            writer,
            window,
        }
    }

    /// Send `content` to `collection_id` and return the terminal record:
    /// confirmed on success, failed in place on write failure. Write failure
    /// is data, not an error; the record stays visible so callers can offer a
    /// retry.
    pub async fn send_message(
        &self,
        collection_id: impl Into<CollectionId>,
        content: impl Into<String>,
    ) -> Message {
        let collection_id = collection_id.into();
        let content = content.into();
        let optimistic = Message::pending(collection_id.clone(), content.clone());

        self.cache.metrics().record_send();
        // Window first: an echo can race in before the write acknowledges.
        self.window.record_sent(optimistic.clone());
        self.cache
            .apply_records(
                MESSAGE_COLLECTION_KIND,
                collection_id.clone(),
                vec![optimistic.clone()],
            )
            .await;

        match self.writer.create(&collection_id, &content).await {
            Ok(confirmed) => {
                self.cache
                    .replace_record(
                        MESSAGE_COLLECTION_KIND,
                        collection_id.clone(),
                        &optimistic.id,
                        confirmed.clone(),
                    )
                    .await;
                debug!(
                    collection_id = %collection_id,
                    record_id = %confirmed.id,
                    "message confirmed",
                );
                confirmed
            }
            Err(err) => {
                self.cache.metrics().record_send_failure();
                warn!(
                    collection_id = %collection_id,
                    record_id = %optimistic.id,
                    error = %err,
                    "message write failed; marking the record failed",
                );
                let mut failed = optimistic;
                failed.status = DeliveryStatus::Failed;
                self.cache
                    .apply_records(MESSAGE_COLLECTION_KIND, collection_id, vec![failed.clone()])
                    .await;
                failed
            }
        }
    }

    /// Ingestion hook for push-delivered records. Echoes of our own recent
    /// sends are dropped; everything else joins the pending batch for the
    /// record's collection.
    pub fn on_remote_record(&self, record: Message) {
        if self
            .window
            .suppresses(&record, self.cache.config().collision_window())
        {
            self.cache.metrics().record_suppressed_duplicate();
            debug!(
                collection_id = %record.collection_id,
                record_id = %record.id,
                "suppressed push echo of a recent send",
            );
            return;
        }

        let collection_id = record.collection_id.clone();
        self.cache
            .enqueue(MESSAGE_COLLECTION_KIND, collection_id, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::SyncCacheBuilder, record::SenderKind};
    use anyhow::anyhow;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::sleep;

    struct ConfirmingWriter {
        server_id: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl RecordWriter for ConfirmingWriter {
        async fn create(&self, collection_id: &CollectionId, content: &str) -> Result<Message> {
            sleep(self.delay).await;
            Ok(Message {
                id: self.server_id.into(),
                collection_id: collection_id.clone(),
                content: content.to_owned(),
                created_at: Utc::now(),
                sender_kind: SenderKind::User,
                status: DeliveryStatus::Confirmed,
            })
        }
    }

    struct FailingWriter;

    #[async_trait]
    impl RecordWriter for FailingWriter {
        async fn create(&self, _collection_id: &CollectionId, _content: &str) -> Result<Message> {
            Err(anyhow!("backend unavailable"))
        }
    }

    #[tokio::test]
    async fn confirmed_send_ends_with_one_record_under_the_server_id() {
        let cache = SyncCacheBuilder::new().build();
        let outbox = Outbox::new(
            cache.clone(),
            Arc::new(ConfirmingWriter {
                server_id: "server-1",
                delay: Duration::from_millis(10),
            }),
        );

        let confirmed = outbox.send_message("c1", "Hola").await;

        assert_eq!(confirmed.id.as_str(), "server-1");
        assert_eq!(confirmed.status, DeliveryStatus::Confirmed);

        let records = cache.get(MESSAGE_COLLECTION_KIND, "c1").expect("entry");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id.as_str(), "server-1");
        assert_eq!(records[0].content, "Hola");
        assert_eq!(cache.metrics().sends(), 1);
    }

    #[tokio::test]
    async fn push_echo_arriving_before_the_confirm_is_suppressed() {
        let cache = SyncCacheBuilder::new().build();
        let outbox = Arc::new(Outbox::new(
            cache.clone(),
            Arc::new(ConfirmingWriter {
                server_id: "server-1",
                delay: Duration::from_millis(80),
            }),
        ));

        let send = {
            let outbox = outbox.clone();
            tokio::spawn(async move { outbox.send_message("c1", "Hola").await })
        };
        sleep(Duration::from_millis(20)).await;

        // The push channel delivers the same write first, under its server id.
        outbox.on_remote_record(Message {
            id: "server-1".into(),
            collection_id: "c1".into(),
            content: "Hola".into(),
            created_at: Utc::now(),
            sender_kind: SenderKind::User,
            status: DeliveryStatus::Confirmed,
        });

        let confirmed = send.await.expect("send completes");
        assert_eq!(confirmed.id.as_str(), "server-1");

        cache.flush_now().await;
        let records = cache.get(MESSAGE_COLLECTION_KIND, "c1").expect("entry");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id.as_str(), "server-1");
        assert_eq!(cache.metrics().suppressed_duplicates(), 1);
    }

    #[tokio::test]
    async fn failed_write_marks_the_record_failed_in_place() {
        let cache = SyncCacheBuilder::new().build();
        let outbox = Outbox::new(cache.clone(), Arc::new(FailingWriter));

        let failed = outbox.send_message("c1", "Hola").await;

        assert!(failed.id.as_str().starts_with("tmp-"));
        assert_eq!(failed.status, DeliveryStatus::Failed);

        let records = cache.get(MESSAGE_COLLECTION_KIND, "c1").expect("entry");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, failed.id);
        assert_eq!(records[0].status, DeliveryStatus::Failed);
        assert_eq!(cache.metrics().send_failures(), 1);
    }

    #[tokio::test]
    async fn foreign_push_records_join_the_pending_batch() {
        let cache = SyncCacheBuilder::new()
            .with_flush_interval(Duration::from_secs(60))
            .build();
        let outbox = Outbox::new(
            cache.clone(),
            Arc::new(ConfirmingWriter {
                server_id: "server-1",
                delay: Duration::from_millis(5),
            }),
        );
        outbox.send_message("c1", "Hola").await;

        // Same content but a different sender is not an echo of our send.
        outbox.on_remote_record(Message {
            id: "server-2".into(),
            collection_id: "c1".into(),
            content: "Hola".into(),
            created_at: Utc::now(),
            sender_kind: SenderKind::SystemAgent,
            status: DeliveryStatus::Confirmed,
        });

        assert_eq!(cache.pending_len(MESSAGE_COLLECTION_KIND, "c1"), 1);
        cache.flush_now().await;

        let records = cache.get(MESSAGE_COLLECTION_KIND, "c1").expect("entry");
        assert_eq!(records.len(), 2);
        assert_eq!(cache.metrics().suppressed_duplicates(), 0);
    }
}
