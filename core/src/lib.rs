pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod hub;
pub mod ids;
pub mod lock;
pub mod merge;
pub mod outbox;
pub mod record;
pub mod snapshot;
pub mod store;
pub mod window;

pub use cache::{SyncCache, SyncCacheBuilder, SyncMetrics, SyncMetricsSnapshot, SyncResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use hub::ChangeEvent;
pub use ids::{CacheKey, CollectionId, CollectionKind, RecordId};
pub use outbox::{Outbox, RecordWriter, RecordWriterRef, MESSAGE_COLLECTION_KIND};
pub use record::{DeliveryStatus, Message, SenderKind};
pub use snapshot::{CacheSnapshot, JsonFileSnapshotStore, SnapshotStore, SnapshotStoreRef};
