//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{EntityRecord, MutationEntry, MutationStatus, SyncMeta};

/// Trait for the local store backing the sync core.
///
/// Abstracts over the sqlite store and the in-memory store used in
/// tests. Covers the three persisted surfaces: cached entity rows,
/// the mutation queue, and per-entity sync metadata. Implementations
/// must make [`apply_local_write`](SyncStore::apply_local_write)
/// atomic: the row write and the queue insert land together or not at
/// all.
pub trait SyncStore: Send + Sync {
    // === Cached entity rows ===

    /// Get one cached row by id
    fn get_record(&self, entity: &str, id: &str) -> Result<Option<EntityRecord>>;

    /// List cached rows for an entity, ordered by id.
    /// Inactive (soft-deleted) rows are included only when asked for.
    fn list_records(&self, entity: &str, include_inactive: bool) -> Result<Vec<EntityRecord>>;

    /// Insert or overwrite a cached row
    fn upsert_record(&self, entity: &str, record: EntityRecord) -> Result<()>;

    /// Stamp a row as confirmed by the server. No-op if the row is gone.
    fn mark_record_synced(&self, entity: &str, id: &str, synced_at: DateTime<Utc>) -> Result<()>;

    /// Replace every cached row for an entity with the given set
    /// (wholesale refresh for server-authoritative entities)
    fn replace_all_records(&self, entity: &str, records: Vec<EntityRecord>) -> Result<()>;

    /// Count cached rows, active only
    fn count_records(&self, entity: &str) -> Result<usize>;

    // === Combined atomic write ===

    /// Apply an optimistic local write: upsert the row and append the
    /// queue entry in a single transaction
    fn apply_local_write(
        &self,
        entity: &str,
        record: EntityRecord,
        entry: MutationEntry,
    ) -> Result<()>;

    // === Mutation queue ===

    /// Append a queue entry
    fn insert_mutation(&self, entry: MutationEntry) -> Result<()>;

    /// Get one queue entry by id
    fn get_mutation(&self, id: &str) -> Result<Option<MutationEntry>>;

    /// All pending entries ordered by creation time, optionally for one
    /// entity
    fn pending_mutations(&self, entity: Option<&str>) -> Result<Vec<MutationEntry>>;

    /// All entries currently in the given status, ordered by creation
    /// time
    fn mutations_in_status(&self, status: MutationStatus) -> Result<Vec<MutationEntry>>;

    /// All entries for one record ordered by creation time
    fn mutations_for_record(&self, entity: &str, entity_id: &str) -> Result<Vec<MutationEntry>>;

    /// Persist the mutable fields of an entry (status, attempts,
    /// last_attempt_at, error_message, rejected). Everything else is
    /// immutable.
    fn update_mutation(&self, entry: &MutationEntry) -> Result<()>;

    /// Delete done entries created before the given instant; returns
    /// how many were removed
    fn purge_done_mutations(&self, before: DateTime<Utc>) -> Result<usize>;

    // === Sync metadata ===

    /// Get the sync metadata row for an entity
    fn sync_meta(&self, entity: &str) -> Result<Option<SyncMeta>>;

    /// Insert or overwrite an entity's sync metadata
    fn save_sync_meta(&self, meta: SyncMeta) -> Result<()>;

    /// Insert an idle metadata row for an entity if none exists yet
    fn seed_sync_meta(&self, entity: &str) -> Result<()>;
}
