//! In-memory storage implementation
//!
//! Used by tests and as a reference implementation of the store
//! contract. RwLock'd maps; the write lock spans the whole
//! `apply_local_write` pair, which is what makes it atomic here.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::traits::SyncStore;
use crate::models::{EntityRecord, MutationEntry, MutationStatus, SyncMeta};

/// In-memory implementation of [`SyncStore`]
pub struct InMemorySyncStore {
    /// entity name -> id -> row
    records: RwLock<HashMap<String, HashMap<String, EntityRecord>>>,
    /// append-ordered queue entries
    mutations: RwLock<Vec<MutationEntry>>,
    /// entity name -> sync metadata
    meta: RwLock<HashMap<String, SyncMeta>>,
}

impl InMemorySyncStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            mutations: RwLock::new(Vec::new()),
            meta: RwLock::new(HashMap::new()),
        }
    }

    fn sorted_by_creation(mut entries: Vec<MutationEntry>) -> Vec<MutationEntry> {
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        entries
    }
}

impl Default for InMemorySyncStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStore for InMemorySyncStore {
    fn get_record(&self, entity: &str, id: &str) -> Result<Option<EntityRecord>> {
        let records = self.records.read().unwrap();
        Ok(records.get(entity).and_then(|m| m.get(id)).cloned())
    }

    fn list_records(&self, entity: &str, include_inactive: bool) -> Result<Vec<EntityRecord>> {
        let records = self.records.read().unwrap();
        let mut rows: Vec<EntityRecord> = records
            .get(entity)
            .map(|m| {
                m.values()
                    .filter(|r| include_inactive || r.is_active)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    fn upsert_record(&self, entity: &str, record: EntityRecord) -> Result<()> {
        let mut records = self.records.write().unwrap();
        records
            .entry(entity.to_string())
            .or_default()
            .insert(record.id.clone(), record);
        Ok(())
    }

    fn mark_record_synced(&self, entity: &str, id: &str, synced_at: DateTime<Utc>) -> Result<()> {
        let mut records = self.records.write().unwrap();
        if let Some(row) = records.get_mut(entity).and_then(|m| m.get_mut(id)) {
            row.synced_at = Some(synced_at);
        }
        Ok(())
    }

    fn replace_all_records(&self, entity: &str, new_records: Vec<EntityRecord>) -> Result<()> {
        let mut records = self.records.write().unwrap();
        let table = records.entry(entity.to_string()).or_default();
        table.clear();
        for record in new_records {
            table.insert(record.id.clone(), record);
        }
        Ok(())
    }

    fn count_records(&self, entity: &str) -> Result<usize> {
        let records = self.records.read().unwrap();
        Ok(records
            .get(entity)
            .map(|m| m.values().filter(|r| r.is_active).count())
            .unwrap_or(0))
    }

    fn apply_local_write(
        &self,
        entity: &str,
        record: EntityRecord,
        entry: MutationEntry,
    ) -> Result<()> {
        let mut records = self.records.write().unwrap();
        let mut mutations = self.mutations.write().unwrap();
        records
            .entry(entity.to_string())
            .or_default()
            .insert(record.id.clone(), record);
        mutations.push(entry);
        Ok(())
    }

    fn insert_mutation(&self, entry: MutationEntry) -> Result<()> {
        self.mutations.write().unwrap().push(entry);
        Ok(())
    }

    fn get_mutation(&self, id: &str) -> Result<Option<MutationEntry>> {
        let mutations = self.mutations.read().unwrap();
        Ok(mutations.iter().find(|e| e.id == id).cloned())
    }

    fn pending_mutations(&self, entity: Option<&str>) -> Result<Vec<MutationEntry>> {
        let mutations = self.mutations.read().unwrap();
        let entries = mutations
            .iter()
            .filter(|e| e.status == MutationStatus::Pending)
            .filter(|e| entity.is_none_or(|name| e.entity == name))
            .cloned()
            .collect();
        Ok(Self::sorted_by_creation(entries))
    }

    fn mutations_in_status(&self, status: MutationStatus) -> Result<Vec<MutationEntry>> {
        let mutations = self.mutations.read().unwrap();
        let entries = mutations.iter().filter(|e| e.status == status).cloned().collect();
        Ok(Self::sorted_by_creation(entries))
    }

    fn mutations_for_record(&self, entity: &str, entity_id: &str) -> Result<Vec<MutationEntry>> {
        let mutations = self.mutations.read().unwrap();
        let entries = mutations
            .iter()
            .filter(|e| e.entity == entity && e.entity_id == entity_id)
            .cloned()
            .collect();
        Ok(Self::sorted_by_creation(entries))
    }

    fn update_mutation(&self, entry: &MutationEntry) -> Result<()> {
        let mut mutations = self.mutations.write().unwrap();
        if let Some(existing) = mutations.iter_mut().find(|e| e.id == entry.id) {
            existing.status = entry.status;
            existing.attempts = entry.attempts;
            existing.last_attempt_at = entry.last_attempt_at;
            existing.error_message = entry.error_message.clone();
            existing.rejected = entry.rejected;
        }
        Ok(())
    }

    fn purge_done_mutations(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut mutations = self.mutations.write().unwrap();
        let len = mutations.len();
        mutations.retain(|e| !(e.status == MutationStatus::Done && e.created_at < before));
        Ok(len - mutations.len())
    }

    fn sync_meta(&self, entity: &str) -> Result<Option<SyncMeta>> {
        Ok(self.meta.read().unwrap().get(entity).cloned())
    }

    fn save_sync_meta(&self, meta: SyncMeta) -> Result<()> {
        self.meta
            .write()
            .unwrap()
            .insert(meta.entity.clone(), meta);
        Ok(())
    }

    fn seed_sync_meta(&self, entity: &str) -> Result<()> {
        self.meta
            .write()
            .unwrap()
            .entry(entity.to_string())
            .or_insert_with(|| SyncMeta::new(entity));
        Ok(())
    }
}
