//! Persistence of registration rows.
//!
//! The registry only needs a narrow table: one row per registered peer,
//! upserted on every registration tick. [`RecordStore`] is the seam; the
//! in-memory [`MemoryRecordStore`] backs tests and single-process setups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Table holding [`RegisterRecord`] rows.
pub const REGISTER_RECORD_TABLE: &str = "core_register_record";

/// One registered peer as persisted by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRecord {
    /// Row identifier, assigned on first insert.
    pub id: u64,
    /// Application peer identifier (unique).
    pub peer_id: String,
    /// Application peer name.
    pub peer_name: String,
    /// Identity of the node hosting the peer.
    pub local_network_id: String,
    /// Record version.
    pub version: String,
    /// JSON encoded end stations.
    pub end_station: String,
    /// Hex encoded signature of the last published record.
    pub signature: String,
    /// First insert time.
    pub created_at: DateTime<Utc>,
    /// Last upsert time.
    pub updated_at: DateTime<Utc>,
}

/// Storage seam for registration rows.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Create or update the schema. Must run before any other call.
    async fn auto_migrate(&self) -> Result<()>;

    /// Insert `record`, or update the row with the same `peer_id`.
    /// The row id and creation time of an existing row are preserved.
    async fn upsert(&self, record: RegisterRecord) -> Result<RegisterRecord>;

    /// Look up the row for `peer_id`.
    async fn find_by_peer_id(&self, peer_id: &str) -> Result<Option<RegisterRecord>>;
}

/// In-memory [`RecordStore`].
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    migrated: AtomicBool,
    next_id: AtomicU64,
    rows: RwLock<HashMap<String, RegisterRecord>>,
}

impl MemoryRecordStore {
    /// Empty, unmigrated store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Whether the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn ensure_migrated(&self) -> Result<()> {
        if self.migrated.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::store(format!("table {REGISTER_RECORD_TABLE} does not exist")))
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn auto_migrate(&self) -> Result<()> {
        if !self.migrated.swap(true, Ordering::AcqRel) {
            debug!(table = REGISTER_RECORD_TABLE, "created table");
        }
        Ok(())
    }

    async fn upsert(&self, mut record: RegisterRecord) -> Result<RegisterRecord> {
        self.ensure_migrated()?;
        if record.peer_id.is_empty() {
            return Err(Error::validation("register record needs a peer id"));
        }

        let now = Utc::now();
        let mut rows = self.rows.write();
        match rows.get(&record.peer_id) {
            Some(existing) => {
                record.id = existing.id;
                record.created_at = existing.created_at;
            }
            None => {
                record.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                record.created_at = now;
            }
        }
        record.updated_at = now;
        rows.insert(record.peer_id.clone(), record.clone());
        Ok(record)
    }

    async fn find_by_peer_id(&self, peer_id: &str) -> Result<Option<RegisterRecord>> {
        self.ensure_migrated()?;
        Ok(self.rows.read().get(peer_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(peer_id: &str, name: &str) -> RegisterRecord {
        RegisterRecord {
            id: 0,
            peer_id: peer_id.into(),
            peer_name: name.into(),
            local_network_id: "node".into(),
            version: "1.0".into(),
            end_station: "{}".into(),
            signature: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn requires_migration() {
        let store = MemoryRecordStore::new();
        assert!(matches!(store.upsert(row("p1", "a")).await, Err(Error::Store(_))));
        store.auto_migrate().await.unwrap();
        store.auto_migrate().await.unwrap();
        assert!(store.upsert(row("p1", "a")).await.is_ok());
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_peer_id() {
        let store = MemoryRecordStore::new();
        store.auto_migrate().await.unwrap();

        let first = store.upsert(row("p1", "alice")).await.unwrap();
        let second = store.upsert(row("p1", "alice-renamed")).await.unwrap();
        let other = store.upsert(row("p2", "bob")).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_ne!(first.id, other.id);

        let found = store.find_by_peer_id("p1").await.unwrap().unwrap();
        assert_eq!(found.peer_name, "alice-renamed");
        assert!(store.find_by_peer_id("missing").await.unwrap().is_none());
    }
}
