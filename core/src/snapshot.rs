use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
    ids::{CollectionId, CollectionKind},
    record::Message,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub kind: CollectionKind,
    pub id: CollectionId,
    pub records: Vec<Message>,
}

/// Point-in-time dump of the live cache contents. Written only on explicit
/// request and read only as a cold-start seed; it is never consulted to
/// answer a `get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    pub captured_at: DateTime<Utc>,
    pub entries: Vec<SnapshotEntry>,
}

impl CacheSnapshot {
    pub fn new(entries: Vec<SnapshotEntry>) -> Self {
        Self {
            captured_at: Utc::now(),
            entries,
        }
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn persist(&self, snapshot: &CacheSnapshot) -> Result<()>;
    async fn load(&self) -> Result<Option<CacheSnapshot>>;
}

pub type SnapshotStoreRef = Arc<dyn SnapshotStore>;

/// Snapshot store backed by a single pretty-printed JSON file. Writes go to a
/// sibling temp file first and are renamed into place, so a crash mid-write
/// never truncates the previous snapshot.
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    async fn persist(&self, snapshot: &CacheSnapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot).context("failed to serialize snapshot")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create snapshot directory {parent:?}"))?;
        }

        let staging = self.path.with_extension("tmp");
        fs::write(&staging, &json)
            .await
            .with_context(|| format!("failed to write snapshot staging file {staging:?}"))?;
        fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("failed to move snapshot into place at {:?}", self.path))?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<CacheSnapshot>> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read snapshot file {:?}", self.path));
            }
        };
        let snapshot = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse snapshot file {:?}", self.path))?;
        Ok(Some(snapshot))
    }
}
