//! Repository layer
//!
//! The only surface business code touches for offline-mutable
//! entities. Reads are pure local-store reads and never block on the
//! network; writes apply optimistically to the cached row and append a
//! queue entry in the same store transaction.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use log::{info, warn};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{EntityDef, EntityKind, EntityRecord, MutationEntry, MutationOp};
use crate::queue::MutationQueue;
use crate::storage::SyncStore;
use crate::transport::RemoteRecord;

/// Per-entity CRUD over the local store.
///
/// Write methods (`create`, `update`, `soft_delete`) pair the row
/// change with a mutation queue entry atomically. The `*_from_server`
/// and `mark_synced` methods are the sync-only path: they are called
/// by the engine during pull and never enqueue anything, otherwise a
/// pull would generate a spurious push.
pub struct Repository {
    store: Arc<dyn SyncStore>,
    queue: MutationQueue,
    def: EntityDef,
}

impl Repository {
    /// Create a repository for one offline-mutable entity.
    ///
    /// Refuses server-authoritative entities; those go through the
    /// cache service, which has no queue.
    pub fn new(store: Arc<dyn SyncStore>, def: EntityDef) -> Result<Self> {
        if def.kind != EntityKind::OfflineMutable {
            bail!(
                "Entity {:?} is server-authoritative; use CacheService instead",
                def.name
            );
        }
        Ok(Self {
            queue: MutationQueue::new(store.clone()),
            store,
            def,
        })
    }

    pub fn entity(&self) -> &str {
        &self.def.name
    }

    // === Reads (local only, never touch the network) ===

    pub fn get(&self, id: &str) -> Result<Option<EntityRecord>> {
        self.store.get_record(&self.def.name, id)
    }

    /// All active records, ordered by id
    pub fn list_active(&self) -> Result<Vec<EntityRecord>> {
        self.store.list_records(&self.def.name, false)
    }

    /// All records including soft-deleted ones
    pub fn list_all(&self) -> Result<Vec<EntityRecord>> {
        self.store.list_records(&self.def.name, true)
    }

    /// Active records whose business field equals the given value
    pub fn find_by_field(&self, field: &str, value: &Value) -> Result<Vec<EntityRecord>> {
        Ok(self
            .list_active()?
            .into_iter()
            .filter(|r| r.data.get(field) == Some(value))
            .collect())
    }

    pub fn count(&self) -> Result<usize> {
        self.store.count_records(&self.def.name)
    }

    // === Offline-mutable writes ===

    /// Create a record locally and queue it for push.
    ///
    /// The id is generated client-side so the record exists before the
    /// server ever hears about it.
    pub fn create(&self, data: Value) -> Result<EntityRecord> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let record = EntityRecord::new_local(id.clone(), data.clone(), now);
        let entry = MutationEntry::new(&self.def.name, &id, MutationOp::Create, data, now);
        self.store
            .apply_local_write(&self.def.name, record.clone(), entry)?;
        Ok(record)
    }

    /// Overwrite a record's business fields locally and queue the
    /// update for push
    pub fn update(&self, id: &str, data: Value) -> Result<EntityRecord> {
        let now = Utc::now();
        let mut record = self
            .get(id)?
            .with_context(|| format!("No {} record with id {id:?}", self.def.name))?;
        record.data = data.clone();
        record.updated_at = now;
        record.synced_at = None; // locally owned until the push confirms
        let entry = MutationEntry::new(&self.def.name, id, MutationOp::Update, data, now);
        self.store
            .apply_local_write(&self.def.name, record.clone(), entry)?;
        Ok(record)
    }

    /// Soft-delete a record locally and queue the delete for push.
    ///
    /// Earlier pending entries for the record are collapsed first so
    /// only the delete goes over the wire.
    pub fn soft_delete(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        let mut record = self
            .get(id)?
            .with_context(|| format!("No {} record with id {id:?}", self.def.name))?;
        self.queue.collapse_superseded(&self.def.name, id)?;
        record.is_active = false;
        record.updated_at = now;
        record.synced_at = None;
        let entry = MutationEntry::new(
            &self.def.name,
            id,
            MutationOp::Delete,
            record.data.clone(),
            now,
        );
        self.store.apply_local_write(&self.def.name, record, entry)?;
        Ok(())
    }

    // === Sync-only methods (engine during pull; never enqueue) ===

    /// Overwrite the cached row with the server version
    pub fn upsert_from_server(&self, remote: RemoteRecord) -> Result<()> {
        let record = remote.into_record(Utc::now());
        self.store.upsert_record(&self.def.name, record)
    }

    pub fn batch_upsert_from_server(&self, remotes: Vec<RemoteRecord>) -> Result<usize> {
        let count = remotes.len();
        for remote in remotes {
            self.upsert_from_server(remote)?;
        }
        Ok(count)
    }

    /// Stamp a row as server-confirmed
    pub fn mark_synced(&self, id: &str) -> Result<()> {
        self.store.mark_record_synced(&self.def.name, id, Utc::now())
    }

    /// Drop every cached row for this entity (full re-sync)
    pub fn delete_all(&self) -> Result<()> {
        self.store.replace_all_records(&self.def.name, Vec::new())
    }

    // === Crash repair ===

    /// Re-enqueue a synthetic update for any locally owned row that
    /// lost its queue entry (e.g. a crash between effects before the
    /// write path was transactional, or a manually pruned queue).
    /// Returns how many rows were repaired.
    pub fn repair_orphans(&self) -> Result<usize> {
        let mut repaired = 0;
        for record in self.list_all()? {
            if record.synced_at.is_some() {
                continue;
            }
            if self.queue.has_unresolved(&self.def.name, &record.id)? {
                continue;
            }
            warn!(
                "Row {}/{} is locally owned but has no queue entry; re-enqueuing",
                self.def.name, record.id
            );
            let op = if record.is_active {
                MutationOp::Update
            } else {
                MutationOp::Delete
            };
            self.queue
                .enqueue(&self.def.name, &record.id, op, record.data.clone())?;
            repaired += 1;
        }
        if repaired > 0 {
            info!("Repaired {repaired} orphaned {} rows", self.def.name);
        }
        Ok(repaired)
    }
}
