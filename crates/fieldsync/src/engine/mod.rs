//! Sync engine: push and pull orchestration
//!
//! One engine instance exists per authenticated session; collaborators
//! receive it by reference. A pass drains the mutation queue (push),
//! then applies incremental server deltas per entity (pull), then
//! refreshes server-authoritative caches. Both phases are gated on
//! connectivity and coalesced behind a single in-flight guard.

mod pull;
mod push;
pub mod timing;

pub use pull::EntityPullStats;
pub use push::EntityPushStats;
pub use timing::{backoff_delay, cooldown_elapsed, retry_eligible};

use anyhow::Result;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cache;
use crate::config::SyncSettings;
use crate::connectivity::Connectivity;
use crate::models::{EntityRegistry, MutationOp, MutationStatus, SyncStatus};
use crate::queue::MutationQueue;
use crate::repo::Repository;
use crate::storage::SyncStore;
use crate::transport::ApiTransport;

/// What happened when a sync pass was requested
#[derive(Debug)]
pub enum SyncOutcome {
    /// The pass ran; per-entity results inside
    Completed(SyncReport),
    /// Device is offline; nothing was attempted
    Offline,
    /// Another pass is still running; this trigger was dropped, not
    /// queued. Re-trigger after the current pass if still needed.
    AlreadyRunning,
}

/// Results of one full push+pull pass
#[derive(Debug, Default)]
pub struct SyncReport {
    pub entities: Vec<EntitySyncReport>,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn total_pushed(&self) -> usize {
        self.entities.iter().map(|e| e.push.pushed).sum()
    }

    pub fn total_pulled(&self) -> usize {
        self.entities.iter().map(|e| e.pull.pulled).sum()
    }

    pub fn total_conflicts_suppressed(&self) -> usize {
        self.entities.iter().map(|e| e.pull.conflicts_suppressed).sum()
    }

    pub fn entity(&self, name: &str) -> Option<&EntitySyncReport> {
        self.entities.iter().find(|e| e.entity == name)
    }
}

/// Per-entity slice of a sync report
#[derive(Debug, Default)]
pub struct EntitySyncReport {
    pub entity: String,
    pub push: EntityPushStats,
    pub pull: EntityPullStats,
}

/// Statistics from startup recovery of interrupted pushes
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Entries confirmed already applied server-side
    pub confirmed: usize,
    /// Entries returned to pending for re-push
    pub requeued: usize,
    /// Entries left in `syncing` because the server could not be asked
    pub deferred: usize,
}

/// Orchestrates push and pull for one authenticated session
pub struct SyncEngine {
    store: Arc<dyn SyncStore>,
    transport: Arc<dyn ApiTransport>,
    connectivity: Arc<dyn Connectivity>,
    registry: EntityRegistry,
    settings: SyncSettings,
    queue: MutationQueue,
    /// Session identity the engine syncs on behalf of; fixed at
    /// construction
    technician_id: String,
    in_flight: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn SyncStore>,
        transport: Arc<dyn ApiTransport>,
        connectivity: Arc<dyn Connectivity>,
        registry: EntityRegistry,
        settings: SyncSettings,
        technician_id: impl Into<String>,
    ) -> Result<Self> {
        // Every known entity gets a sync_meta row up front so pulls
        // always have a defined starting cursor.
        for def in registry.iter() {
            store.seed_sync_meta(&def.name)?;
        }
        Ok(Self {
            queue: MutationQueue::new(store.clone()),
            store,
            transport,
            connectivity,
            registry,
            settings,
            technician_id: technician_id.into(),
            in_flight: AtomicBool::new(false),
        })
    }

    pub fn technician_id(&self) -> &str {
        &self.technician_id
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Run one full push+pull pass.
    ///
    /// Refuses to run while offline and coalesces overlapping triggers:
    /// a second trigger while a pass is in flight is dropped.
    pub fn run_pass(&self) -> Result<SyncOutcome> {
        if !self.connectivity.is_online() {
            debug!("Sync pass skipped: offline");
            return Ok(SyncOutcome::Offline);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync pass skipped: already running");
            return Ok(SyncOutcome::AlreadyRunning);
        }

        let result = self.run_locked();
        self.in_flight.store(false, Ordering::SeqCst);
        result.map(SyncOutcome::Completed)
    }

    /// Trigger for the offline-to-online transition event
    pub fn handle_online_transition(&self) -> Result<SyncOutcome> {
        info!("Connectivity regained; starting sync pass");
        self.run_pass()
    }

    fn run_locked(&self) -> Result<SyncReport> {
        let start = std::time::Instant::now();
        info!("Starting sync pass for technician {}", self.technician_id);

        let recovery = self.recover_interrupted()?;
        if recovery != RecoveryStats::default() {
            info!(
                "Recovered interrupted pushes: {} confirmed, {} requeued, {} deferred",
                recovery.confirmed, recovery.requeued, recovery.deferred
            );
        }

        let mut report = SyncReport::default();
        for def in self.registry.offline_mutable() {
            let repo = Repository::new(self.store.clone(), def.clone())?;
            repo.repair_orphans()?;

            let push = self.push_entity(def)?;
            let pull = self.pull_entity(def)?;
            report.entities.push(EntitySyncReport {
                entity: def.name.clone(),
                push,
                pull,
            });
        }

        // Server-authoritative entities refresh wholesale; they have
        // no queue and no incremental cursor.
        for def in self.registry.server_authoritative() {
            let mut entry = EntitySyncReport {
                entity: def.name.clone(),
                ..Default::default()
            };
            match cache::refresh_entity(self.store.as_ref(), self.transport.as_ref(), def, &self.settings) {
                Ok(count) => entry.pull.pulled = count,
                Err(e) => {
                    warn!("Cache refresh for {} failed: {e}", def.name);
                    entry.pull.error = Some(e.to_string());
                }
            }
            report.entities.push(entry);
        }

        self.queue.purge_done(&self.settings)?;

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Sync pass done in {}ms: {} pushed, {} pulled, {} conflicts suppressed",
            report.duration_ms,
            report.total_pushed(),
            report.total_pulled(),
            report.total_conflicts_suppressed()
        );
        Ok(report)
    }

    /// Revalidate entries left in `syncing` by an aborted pass.
    ///
    /// Such an entry is possibly applied: the push may have reached the
    /// server before the abort. For a `create` the server is asked
    /// whether the record exists before deciding, so a crash mid-push
    /// cannot produce a duplicate server-side create. Updates and
    /// deletes re-push as-is; PATCH/DELETE by id are idempotent.
    pub fn recover_interrupted(&self) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        for mut entry in self.store.mutations_in_status(MutationStatus::Syncing)? {
            let Some(def) = self.registry.get(&entry.entity) else {
                warn!("Interrupted entry {} references unknown entity {}", entry.id, entry.entity);
                continue;
            };
            match entry.op {
                MutationOp::Create => {
                    match self.transport.fetch_record(&def.endpoint, &entry.entity_id) {
                        Ok(Some(_)) => {
                            debug!(
                                "Create {} for {}/{} already applied; confirming",
                                entry.id, entry.entity, entry.entity_id
                            );
                            entry.status = MutationStatus::Done;
                            self.store.update_mutation(&entry)?;
                            if !self.queue.has_unresolved(&entry.entity, &entry.entity_id)? {
                                self.store.mark_record_synced(
                                    &entry.entity,
                                    &entry.entity_id,
                                    chrono::Utc::now(),
                                )?;
                            }
                            stats.confirmed += 1;
                        }
                        Ok(None) => {
                            entry.status = MutationStatus::Pending;
                            self.store.update_mutation(&entry)?;
                            stats.requeued += 1;
                        }
                        Err(e) => {
                            // Can't tell; leave it for the next pass
                            warn!("Could not revalidate entry {}: {e}", entry.id);
                            stats.deferred += 1;
                        }
                    }
                }
                MutationOp::Update | MutationOp::Delete => {
                    entry.status = MutationStatus::Pending;
                    self.store.update_mutation(&entry)?;
                    stats.requeued += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Per-entity sync status summary for UI staleness indicators
    pub fn entity_status(&self, entity: &str) -> Result<Option<SyncStatus>> {
        Ok(self.store.sync_meta(entity)?.map(|m| m.sync_status))
    }
}

#[cfg(test)]
pub(crate) mod test_support;
