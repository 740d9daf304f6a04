//! Durable mutation queue
//!
//! An ordered log of local writes awaiting propagation to the server.
//! The queue owns the per-entry state machine; the engine drives it
//! from scheduler ticks rather than timer callbacks, so backoff and
//! crash recovery stay testable.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;

use crate::config::SyncSettings;
use crate::engine::timing::retry_eligible;
use crate::models::{MutationEntry, MutationOp, MutationStatus};
use crate::storage::SyncStore;

/// Durable, ordered record of pending local writes
#[derive(Clone)]
pub struct MutationQueue {
    store: Arc<dyn SyncStore>,
}

impl MutationQueue {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// Append a new pending entry.
    ///
    /// A `delete` first collapses earlier pending entries for the same
    /// record: there is no point pushing a create or update for a row
    /// the server is about to be told to remove.
    pub fn enqueue(
        &self,
        entity: &str,
        entity_id: &str,
        op: MutationOp,
        payload: Value,
    ) -> Result<MutationEntry> {
        if op == MutationOp::Delete {
            self.collapse_superseded(entity, entity_id)?;
        }
        let entry = MutationEntry::new(entity, entity_id, op, payload, Utc::now());
        debug!(
            "Enqueued {} for {}/{} (entry {})",
            op.as_str(),
            entity,
            entity_id,
            entry.id
        );
        self.store.insert_mutation(entry.clone())?;
        Ok(entry)
    }

    /// Mark still-pending create/update entries for a record as done
    /// without pushing them; returns how many were superseded.
    ///
    /// Called before enqueuing a delete for the record. Entries already
    /// in `syncing` are in flight and left alone.
    pub fn collapse_superseded(&self, entity: &str, entity_id: &str) -> Result<usize> {
        let mut collapsed = 0;
        for mut entry in self.store.mutations_for_record(entity, entity_id)? {
            let moot = matches!(entry.status, MutationStatus::Pending | MutationStatus::Failed)
                && matches!(entry.op, MutationOp::Create | MutationOp::Update);
            if moot {
                entry.status = MutationStatus::Done;
                self.store.update_mutation(&entry)?;
                collapsed += 1;
            }
        }
        if collapsed > 0 {
            info!("Collapsed {collapsed} superseded entries for {entity}/{entity_id}");
        }
        Ok(collapsed)
    }

    /// All pending entries in creation order, optionally for one entity
    pub fn drain(&self, entity: Option<&str>) -> Result<Vec<MutationEntry>> {
        self.store.pending_mutations(entity)
    }

    /// Transition an entry to `syncing` and count the push attempt
    pub fn mark_syncing(&self, id: &str) -> Result<MutationEntry> {
        self.transition(id, |entry, now| {
            entry.status = MutationStatus::Syncing;
            entry.attempts += 1;
            entry.last_attempt_at = Some(now);
        })
    }

    /// Transition an entry to `done` after the server confirmed it
    pub fn mark_done(&self, id: &str) -> Result<MutationEntry> {
        self.transition(id, |entry, _| {
            entry.status = MutationStatus::Done;
            entry.error_message = None;
        })
    }

    /// Record a transient failure; the entry becomes eligible for
    /// retry once its backoff elapses
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<MutationEntry> {
        warn!("Mutation {id} failed (will retry after backoff): {error}");
        self.transition(id, |entry, _| {
            entry.status = MutationStatus::Failed;
            entry.error_message = Some(error.to_string());
        })
    }

    /// Record a definitive server rejection. The entry stays `failed`
    /// forever and shows up in [`needs_attention`](Self::needs_attention);
    /// it is never auto-retried. The `rejected` flag distinguishes it
    /// from an entry that merely ran out of retries.
    pub fn mark_rejected(&self, id: &str, error: &str) -> Result<MutationEntry> {
        warn!("Mutation {id} rejected by server (needs manual resolution): {error}");
        self.transition(id, |entry, _| {
            entry.status = MutationStatus::Failed;
            entry.rejected = true;
            entry.error_message = Some(error.to_string());
        })
    }

    /// Scheduler tick: move failed entries whose backoff has elapsed
    /// back to pending. Rejected entries and entries past the attempt
    /// limit stay failed. Returns how many entries were released.
    pub fn release_retryable(&self, now: DateTime<Utc>, settings: &SyncSettings) -> Result<usize> {
        let mut released = 0;
        for mut entry in self.store.mutations_in_status(MutationStatus::Failed)? {
            if entry.rejected || entry.attempts > settings.max_attempts {
                continue;
            }
            if retry_eligible(
                entry.last_attempt_at,
                entry.attempts,
                now,
                settings.backoff_base(),
                settings.backoff_cap(),
            ) {
                entry.status = MutationStatus::Pending;
                self.store.update_mutation(&entry)?;
                released += 1;
            }
        }
        if released > 0 {
            debug!("Released {released} failed entries for retry");
        }
        Ok(released)
    }

    /// Entries that permanently failed and await manual resolution.
    /// Each entry's `rejected` flag tells the caller whether the server
    /// refused it or its retries ran out.
    pub fn needs_attention(&self, settings: &SyncSettings) -> Result<Vec<MutationEntry>> {
        let failed = self.store.mutations_in_status(MutationStatus::Failed)?;
        Ok(failed
            .into_iter()
            .filter(|e| e.needs_attention(settings.max_attempts))
            .collect())
    }

    /// Whether a record still has an unconfirmed entry in the queue
    pub fn has_unresolved(&self, entity: &str, entity_id: &str) -> Result<bool> {
        let entries = self.store.mutations_for_record(entity, entity_id)?;
        Ok(entries.iter().any(|e| e.is_unresolved()))
    }

    /// Drop done entries older than the retention window; returns how
    /// many were purged
    pub fn purge_done(&self, settings: &SyncSettings) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(settings.retention_days);
        let purged = self.store.purge_done_mutations(cutoff)?;
        if purged > 0 {
            info!("Purged {purged} done queue entries older than {} days", settings.retention_days);
        }
        Ok(purged)
    }

    fn transition(
        &self,
        id: &str,
        apply: impl FnOnce(&mut MutationEntry, DateTime<Utc>),
    ) -> Result<MutationEntry> {
        let mut entry = self
            .store
            .get_mutation(id)?
            .ok_or_else(|| anyhow::anyhow!("No queue entry with id {id:?}"))?;
        apply(&mut entry, Utc::now());
        self.store.update_mutation(&entry)?;
        Ok(entry)
    }
}
