//! Pull phase: apply incremental server deltas to the local cache

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use super::SyncEngine;
use crate::models::{EntityDef, SyncStatus};
use crate::repo::Repository;

/// Pull results for one entity
#[derive(Debug, Default)]
pub struct EntityPullStats {
    /// Server records applied to the local cache
    pub pulled: usize,
    /// Server records dropped because the local copy has unsynced edits
    pub conflicts_suppressed: usize,
    /// Pages fetched
    pub pages: usize,
    /// Transport failure, if the pull aborted early
    pub error: Option<String>,
}

impl SyncEngine {
    /// Pull server changes for one entity since its cursor.
    ///
    /// The cursor only advances to the maximum `updated_at` observed in
    /// the fetched records, and only once pagination completes, so an
    /// aborted pull re-fetches rather than skips. A transport failure
    /// is recorded on the entity's metadata and in the returned stats
    /// instead of propagating, so one entity's bad endpoint cannot
    /// block the rest of the pass.
    pub(super) fn pull_entity(&self, def: &EntityDef) -> Result<EntityPullStats> {
        let mut stats = EntityPullStats::default();
        let mut meta = self
            .store
            .sync_meta(&def.name)?
            .with_context(|| format!("No sync metadata for entity {:?}", def.name))?;
        let since = meta.last_sync_at;
        let mut cursor = meta.last_cursor.clone();

        meta.sync_status = SyncStatus::Syncing;
        self.store.save_sync_meta(meta.clone())?;

        let repo = Repository::new(self.store.clone(), def.clone())?;
        let mut max_updated: Option<DateTime<Utc>> = None;
        loop {
            if stats.pages >= self.settings.max_pull_pages {
                warn!(
                    "Pull for {} hit the {}-page cap; continuation saved for the next pass",
                    def.name, self.settings.max_pull_pages
                );
                meta.last_cursor = cursor;
                meta.sync_status = SyncStatus::Idle;
                self.store.save_sync_meta(meta)?;
                return Ok(stats);
            }

            let page = match self.transport.list_changes(
                &def.endpoint,
                since,
                cursor.as_deref(),
                self.settings.page_size,
            ) {
                Ok(page) => page,
                Err(e) => {
                    warn!("Pull for {} failed: {e}", def.name);
                    meta.last_cursor = cursor;
                    meta.sync_status = SyncStatus::Error;
                    self.store.save_sync_meta(meta)?;
                    stats.error = Some(e.to_string());
                    return Ok(stats);
                }
            };
            stats.pages += 1;

            let mut applicable = Vec::new();
            for remote in page.records {
                max_updated = Some(match max_updated {
                    Some(seen) => seen.max(remote.updated_at),
                    None => remote.updated_at,
                });
                match repo.get(&remote.id)? {
                    // Unsynced local edits own the row; the server
                    // version is dropped and will be reconciled when
                    // the queued push lands.
                    Some(local) if local.is_locally_owned() => {
                        info!(
                            "Server change for {}/{} suppressed: local copy has unsynced edits",
                            def.name, remote.id
                        );
                        stats.conflicts_suppressed += 1;
                    }
                    _ => applicable.push(remote),
                }
            }
            stats.pulled += repo.batch_upsert_from_server(applicable)?;

            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
            // Persist the continuation so an aborted pass resumes
            // instead of restarting from the cursor
            meta.last_cursor = cursor.clone();
            self.store.save_sync_meta(meta.clone())?;
        }

        self.store.save_sync_meta(meta.advanced(max_updated))?;
        debug!(
            "Pulled {} records for {} over {} pages ({} conflicts suppressed)",
            stats.pulled, def.name, stats.pages, stats.conflicts_suppressed
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::ScriptedTransport;
    use super::*;
    use crate::config::SyncSettings;
    use crate::connectivity::SharedConnectivity;
    use crate::models::{EntityRecord, EntityRegistry};
    use crate::storage::{InMemorySyncStore, SyncStore};
    use crate::transport::{ChangePage, TransportError};

    use chrono::Duration;
    use serde_json::json;
    use std::sync::Arc;

    fn setup(
        settings: SyncSettings,
    ) -> (SyncEngine, Arc<InMemorySyncStore>, Arc<ScriptedTransport>) {
        let store = Arc::new(InMemorySyncStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let registry =
            EntityRegistry::new(vec![crate::models::EntityDef::offline_mutable("clients", "clients")]);
        let engine = SyncEngine::new(
            store.clone(),
            transport.clone(),
            Arc::new(SharedConnectivity::new(true)),
            registry,
            settings,
            "tech-1",
        )
        .unwrap();
        (engine, store, transport)
    }

    fn def() -> EntityDef {
        crate::models::EntityDef::offline_mutable("clients", "clients")
    }

    #[test]
    fn test_pull_inserts_server_records() {
        let (engine, store, transport) = setup(SyncSettings::default());
        let t = Utc::now();
        transport.seed_server_record("clients", "c1", json!({"name": "A"}), t);
        transport.seed_server_record("clients", "c2", json!({"name": "B"}), t + Duration::minutes(1));

        let stats = engine.pull_entity(&def()).unwrap();
        assert_eq!(stats.pulled, 2);
        assert_eq!(stats.conflicts_suppressed, 0);

        let row = store.get_record("clients", "c1").unwrap().unwrap();
        assert!(row.synced_at.is_some());
        assert_eq!(row.field_str("name"), Some("A"));
    }

    #[test]
    fn test_cursor_advances_to_max_updated_at_not_now() {
        let (engine, store, transport) = setup(SyncSettings::default());
        // Server timestamps an hour in the past; the cursor must land
        // there, not at the local clock
        let t = Utc::now() - Duration::hours(1);
        transport.seed_server_record("clients", "c1", json!({}), t);

        engine.pull_entity(&def()).unwrap();
        let meta = store.sync_meta("clients").unwrap().unwrap();
        assert_eq!(meta.last_sync_at, Some(t));
        assert_eq!(meta.sync_status, SyncStatus::Idle);
        assert!(meta.last_cursor.is_none());
    }

    #[test]
    fn test_second_pull_is_incremental() {
        let (engine, _, transport) = setup(SyncSettings::default());
        let t = Utc::now();
        transport.seed_server_record("clients", "c1", json!({"v": 1}), t);

        assert_eq!(engine.pull_entity(&def()).unwrap().pulled, 1);
        // Nothing changed server-side, so the next pull applies nothing
        assert_eq!(engine.pull_entity(&def()).unwrap().pulled, 0);

        // A later server edit comes through
        transport.seed_server_record("clients", "c1", json!({"v": 2}), t + Duration::minutes(5));
        assert_eq!(engine.pull_entity(&def()).unwrap().pulled, 1);
    }

    #[test]
    fn test_local_edits_win_over_server_changes() {
        let (engine, store, transport) = setup(SyncSettings::default());
        let now = Utc::now();

        // Local row with unsynced edits
        store
            .upsert_record(
                "clients",
                EntityRecord::new_local("c1", json!({"name": "local edit"}), now),
            )
            .unwrap();
        transport.seed_server_record("clients", "c1", json!({"name": "server version"}), now);

        let stats = engine.pull_entity(&def()).unwrap();
        assert_eq!(stats.conflicts_suppressed, 1);
        assert_eq!(stats.pulled, 0);

        let row = store.get_record("clients", "c1").unwrap().unwrap();
        assert_eq!(row.field_str("name"), Some("local edit"));
        assert!(row.is_locally_owned());

        // The suppressed record still moves the cursor; it was observed
        let meta = store.sync_meta("clients").unwrap().unwrap();
        assert_eq!(meta.last_sync_at, Some(now));
    }

    #[test]
    fn test_server_owned_rows_are_overwritten() {
        let (engine, store, transport) = setup(SyncSettings::default());
        let t = Utc::now();
        transport.seed_server_record("clients", "c1", json!({"v": 1}), t);
        engine.pull_entity(&def()).unwrap();

        transport.seed_server_record("clients", "c1", json!({"v": 2}), t + Duration::minutes(1));
        let stats = engine.pull_entity(&def()).unwrap();
        assert_eq!(stats.pulled, 1);
        let row = store.get_record("clients", "c1").unwrap().unwrap();
        assert_eq!(row.data["v"], 2);
    }

    #[test]
    fn test_pagination_fetches_all_pages() {
        let (engine, store, transport) = setup(SyncSettings {
            page_size: 2,
            ..SyncSettings::default()
        });
        let t = Utc::now();
        for i in 0..5 {
            transport.seed_server_record(
                "clients",
                &format!("c{i}"),
                json!({"i": i}),
                t + Duration::seconds(i),
            );
        }

        let stats = engine.pull_entity(&def()).unwrap();
        assert_eq!(stats.pulled, 5);
        assert_eq!(stats.pages, 3);
        assert_eq!(store.count_records("clients").unwrap(), 5);

        let meta = store.sync_meta("clients").unwrap().unwrap();
        assert_eq!(meta.last_sync_at, Some(t + Duration::seconds(4)));
        assert!(meta.last_cursor.is_none());
    }

    #[test]
    fn test_page_cap_stops_runaway_pagination() {
        let (engine, store, transport) = setup(SyncSettings {
            max_pull_pages: 3,
            ..SyncSettings::default()
        });
        // A misbehaving server that always hands back a continuation
        let t = Utc::now();
        let page = || {
            Ok(ChangePage {
                records: vec![serde_json::from_value(json!({
                    "id": "c1",
                    "createdAt": t.to_rfc3339(),
                    "updatedAt": t.to_rfc3339(),
                }))
                .unwrap()],
                next_cursor: Some("again".into()),
            })
        };
        transport.script_list_results(vec![page(), page(), page(), page()]);

        let stats = engine.pull_entity(&def()).unwrap();
        assert_eq!(stats.pages, 3);

        // The continuation survives for the next pass and the cursor
        // did not advance
        let meta = store.sync_meta("clients").unwrap().unwrap();
        assert_eq!(meta.last_cursor.as_deref(), Some("again"));
        assert!(meta.last_sync_at.is_none());
        assert_eq!(meta.sync_status, SyncStatus::Idle);
    }

    #[test]
    fn test_transport_failure_is_recorded_not_fatal() {
        let (engine, store, transport) = setup(SyncSettings::default());
        transport.script_list_results(vec![Err(TransportError::Transient("503".into()))]);

        let stats = engine.pull_entity(&def()).unwrap();
        assert_eq!(stats.pulled, 0);
        assert!(stats.error.is_some());

        let meta = store.sync_meta("clients").unwrap().unwrap();
        assert_eq!(meta.sync_status, SyncStatus::Error);
        assert!(meta.last_sync_at.is_none());

        // The entity recovers on the next pass
        let t = Utc::now();
        transport.seed_server_record("clients", "c1", json!({}), t);
        let stats = engine.pull_entity(&def()).unwrap();
        assert_eq!(stats.pulled, 1);
        assert_eq!(
            store.sync_meta("clients").unwrap().unwrap().sync_status,
            SyncStatus::Idle
        );
    }

    #[test]
    fn test_failure_mid_pagination_keeps_continuation() {
        let (engine, store, transport) = setup(SyncSettings::default());
        let t = Utc::now();
        transport.script_list_results(vec![
            Ok(ChangePage {
                records: vec![serde_json::from_value(json!({
                    "id": "c1",
                    "createdAt": t.to_rfc3339(),
                    "updatedAt": t.to_rfc3339(),
                }))
                .unwrap()],
                next_cursor: Some("p2".into()),
            }),
            Err(TransportError::Transient("reset".into())),
        ]);

        let stats = engine.pull_entity(&def()).unwrap();
        assert_eq!(stats.pulled, 1);
        assert!(stats.error.is_some());

        let meta = store.sync_meta("clients").unwrap().unwrap();
        assert_eq!(meta.last_cursor.as_deref(), Some("p2"));
        // Incomplete pass must not advance the incremental cursor
        assert!(meta.last_sync_at.is_none());
    }
}
