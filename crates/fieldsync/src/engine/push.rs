//! Push phase: drain the mutation queue to the server

use anyhow::Result;
use chrono::Utc;
use log::{debug, warn};

use super::SyncEngine;
use crate::models::{EntityDef, MutationEntry};
use crate::repo::Repository;

/// Push results for one entity
#[derive(Debug, Default)]
pub struct EntityPushStats {
    /// Entries confirmed by the server
    pub pushed: usize,
    /// Entries that failed transiently (will retry after backoff)
    pub failed: usize,
    /// Entries rejected permanently (need manual resolution)
    pub rejected: usize,
}

impl SyncEngine {
    /// Push pending entries for one entity.
    ///
    /// Entries are grouped into per-record chains and sent strictly in
    /// creation order within each chain, waiting for each response
    /// before sending the next. A failure stops only the chain it
    /// happened in; other records' entries still go out.
    pub(super) fn push_entity(&self, def: &EntityDef) -> Result<EntityPushStats> {
        let mut stats = EntityPushStats::default();

        self.queue().release_retryable(Utc::now(), self.settings())?;
        let pending = self.queue().drain(Some(&def.name))?;
        if pending.is_empty() {
            return Ok(stats);
        }
        debug!("Pushing {} entries for {}", pending.len(), def.name);

        let repo = Repository::new(self.store.clone(), def.clone())?;
        for (record_id, chain) in chains_by_record(pending) {
            self.push_chain(def, &repo, &record_id, chain, &mut stats)?;
        }
        Ok(stats)
    }

    fn push_chain(
        &self,
        def: &EntityDef,
        repo: &Repository,
        record_id: &str,
        chain: Vec<MutationEntry>,
        stats: &mut EntityPushStats,
    ) -> Result<()> {
        for entry in chain {
            self.queue().mark_syncing(&entry.id)?;
            match self.transport.push_mutation(&def.endpoint, &entry) {
                Ok(()) => {
                    self.queue().mark_done(&entry.id)?;
                    stats.pushed += 1;
                    // The row becomes server-owned only once nothing
                    // else is queued for it; a later local edit must
                    // keep the row locally owned.
                    if !self.queue().has_unresolved(&def.name, record_id)? {
                        repo.mark_synced(record_id)?;
                    }
                }
                Err(e) if e.is_transient() => {
                    self.queue().mark_failed(&entry.id, &e.to_string())?;
                    stats.failed += 1;
                    // Later entries for this record must wait to keep
                    // the chain ordered
                    break;
                }
                Err(e) => {
                    self.queue().mark_rejected(&entry.id, &e.to_string())?;
                    stats.rejected += 1;
                    warn!(
                        "Server rejected {} for {}/{}; chain halted for manual resolution",
                        entry.op.as_str(),
                        def.name,
                        record_id
                    );
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Group entries into per-record chains, preserving creation order
/// within each chain and first-seen order across chains
fn chains_by_record(entries: Vec<MutationEntry>) -> Vec<(String, Vec<MutationEntry>)> {
    let mut chains: Vec<(String, Vec<MutationEntry>)> = Vec::new();
    for entry in entries {
        match chains.iter_mut().find(|(id, _)| *id == entry.entity_id) {
            Some((_, chain)) => chain.push(entry),
            None => chains.push((entry.entity_id.clone(), vec![entry])),
        }
    }
    chains
}
