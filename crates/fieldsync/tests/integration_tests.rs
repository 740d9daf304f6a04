//! Integration tests for the fieldsync crate
//!
//! These tests verify the complete offline-write, reconnect, push and
//! pull flow against a fake server.

use chrono::{DateTime, Duration, Utc};
use fieldsync::{
    ApiTransport, ChangePage, EntityDef, EntityRegistry, MutationEntry, MutationOp,
    RemoteRecord, Repository, SharedConnectivity, SqliteSyncStore, SyncEngine, SyncOutcome,
    SyncSettings, SyncStore, TransportError,
};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Fake server: holds per-endpoint record sets, records every push,
/// and can be told to fail the next N pushes.
#[derive(Default)]
struct FakeServer {
    records: Mutex<HashMap<String, Vec<RemoteRecord>>>,
    pushes: Mutex<Vec<MutationEntry>>,
    push_failures: Mutex<VecDeque<TransportError>>,
}

impl FakeServer {
    fn new() -> Self {
        Self::default()
    }

    fn seed(&self, endpoint: &str, id: &str, data: Value, updated_at: DateTime<Utc>) {
        let record = RemoteRecord {
            id: id.to_string(),
            created_at: updated_at,
            updated_at,
            is_active: true,
            data,
        };
        let mut records = self.records.lock().unwrap();
        let set = records.entry(endpoint.to_string()).or_default();
        set.retain(|r| r.id != id);
        set.push(record);
    }

    fn fail_next_pushes(&self, failures: Vec<TransportError>) {
        self.push_failures.lock().unwrap().extend(failures);
    }

    fn pushes(&self) -> Vec<MutationEntry> {
        self.pushes.lock().unwrap().clone()
    }

    /// Apply a confirmed push to the server-side record set, the way a
    /// real backend would
    fn apply(&self, endpoint: &str, entry: &MutationEntry) {
        let mut records = self.records.lock().unwrap();
        let set = records.entry(endpoint.to_string()).or_default();
        match entry.op {
            MutationOp::Delete => set.retain(|r| r.id != entry.entity_id),
            MutationOp::Create | MutationOp::Update => {
                let now = Utc::now();
                set.retain(|r| r.id != entry.entity_id);
                set.push(RemoteRecord {
                    id: entry.entity_id.clone(),
                    created_at: entry.created_at,
                    updated_at: now,
                    is_active: true,
                    data: entry.payload.clone(),
                });
            }
        }
    }
}

impl ApiTransport for FakeServer {
    fn list_changes(
        &self,
        endpoint: &str,
        updated_since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<ChangePage, TransportError> {
        let records = self.records.lock().unwrap();
        let mut changed: Vec<RemoteRecord> = records
            .get(endpoint)
            .map(|set| {
                set.iter()
                    .filter(|r| updated_since.is_none_or(|since| r.updated_at > since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        changed.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));

        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let total = changed.len();
        let page: Vec<RemoteRecord> = changed.into_iter().skip(offset).take(page_size).collect();
        let next_cursor = if offset + page.len() < total {
            Some((offset + page.len()).to_string())
        } else {
            None
        };
        Ok(ChangePage {
            records: page,
            next_cursor,
        })
    }

    fn fetch_record(
        &self,
        endpoint: &str,
        id: &str,
    ) -> Result<Option<RemoteRecord>, TransportError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .get(endpoint)
            .and_then(|set| set.iter().find(|r| r.id == id).cloned()))
    }

    fn push_mutation(&self, endpoint: &str, entry: &MutationEntry) -> Result<(), TransportError> {
        self.pushes.lock().unwrap().push(entry.clone());
        if let Some(failure) = self.push_failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        self.apply(endpoint, entry);
        Ok(())
    }

    fn write_through(
        &self,
        endpoint: &str,
        id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord, TransportError> {
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        let set = records.entry(endpoint.to_string()).or_default();
        set.retain(|r| r.id != id);
        let record = RemoteRecord {
            id: id.to_string(),
            created_at: now,
            updated_at: now,
            is_active: true,
            data: payload.clone(),
        };
        set.push(record.clone());
        Ok(record)
    }
}

struct Harness {
    engine: SyncEngine,
    store: Arc<SqliteSyncStore>,
    server: Arc<FakeServer>,
    connectivity: Arc<SharedConnectivity>,
    repo: Repository,
    _dir: TempDir,
}

fn harness(online: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let def = EntityDef::offline_mutable("clients", "clients");
    let registry = EntityRegistry::new(vec![def.clone()]);
    let store = Arc::new(SqliteSyncStore::open(dir.path().join("sync.db"), &registry).unwrap());
    let server = Arc::new(FakeServer::new());
    let connectivity = Arc::new(SharedConnectivity::new(online));
    let engine = SyncEngine::new(
        store.clone(),
        server.clone(),
        connectivity.clone(),
        registry,
        SyncSettings {
            backoff_base_ms: 0, // no waiting between retries in tests
            ..SyncSettings::default()
        },
        "tech-1",
    )
    .unwrap();
    let repo = Repository::new(store.clone(), def).unwrap();
    Harness {
        engine,
        store,
        server,
        connectivity,
        repo,
        _dir: dir,
    }
}

fn completed(outcome: SyncOutcome) -> fieldsync::SyncReport {
    match outcome {
        SyncOutcome::Completed(report) => report,
        other => panic!("expected a completed pass, got {other:?}"),
    }
}

#[test]
fn test_offline_create_syncs_on_reconnect() {
    let h = harness(false);

    // Offline: the write lands locally and reads see it immediately
    let record = h.repo.create(json!({"name": "Acme Plumbing"})).unwrap();
    assert!(record.is_locally_owned());
    assert_eq!(h.repo.list_active().unwrap().len(), 1);

    // A sync trigger while offline is a no-op
    assert!(matches!(h.engine.run_pass().unwrap(), SyncOutcome::Offline));
    assert!(h.server.pushes().is_empty());

    // Back online: the transition trigger pushes the queued create
    h.connectivity.set_online(true);
    let report = completed(h.engine.handle_online_transition().unwrap());
    assert_eq!(report.total_pushed(), 1);

    let row = h.store.get_record("clients", &record.id).unwrap().unwrap();
    assert!(row.synced_at.is_some());
    assert!(h.store.pending_mutations(None).unwrap().is_empty());

    // The server got the client-generated id
    assert_eq!(h.server.pushes()[0].entity_id, record.id);
}

#[test]
fn test_local_edit_wins_over_concurrent_server_change() {
    let h = harness(true);

    // A record both sides know about
    let t0 = Utc::now() - Duration::hours(1);
    h.server.seed("clients", "c1", json!({"phone": "555-0100"}), t0);
    completed(h.engine.run_pass().unwrap());

    // Edited locally while the server also changed it
    h.repo.update("c1", json!({"phone": "555-0199"})).unwrap();
    h.server
        .seed("clients", "c1", json!({"phone": "555-0111"}), Utc::now());

    let report = completed(h.engine.run_pass().unwrap());

    // The push sent the local edit; the conflicting server version was
    // dropped, not treated as an error
    let entity = report.entity("clients").unwrap();
    assert_eq!(entity.push.pushed, 1);
    assert!(entity.pull.error.is_none());

    let row = h.store.get_record("clients", "c1").unwrap().unwrap();
    assert_eq!(row.field_str("phone"), Some("555-0199"));
}

#[test]
fn test_pull_suppresses_server_change_for_dirty_row() {
    let h = harness(true);
    let t0 = Utc::now() - Duration::hours(1);
    h.server.seed("clients", "c1", json!({"name": "old"}), t0);
    completed(h.engine.run_pass().unwrap());

    // Go offline, edit locally, and let the server change too
    h.connectivity.set_online(false);
    h.repo.update("c1", json!({"name": "local"})).unwrap();
    h.server.seed("clients", "c1", json!({"name": "server"}), Utc::now());

    // Reconnect but make the push fail, so the row stays dirty while
    // the pull runs
    h.connectivity.set_online(true);
    h.server
        .fail_next_pushes(vec![TransportError::Transient("timeout".into())]);
    let report = completed(h.engine.run_pass().unwrap());

    assert_eq!(report.total_conflicts_suppressed(), 1);
    let row = h.store.get_record("clients", "c1").unwrap().unwrap();
    assert_eq!(row.field_str("name"), Some("local"));
    assert!(row.is_locally_owned());
}

#[test]
fn test_transient_failures_then_success() {
    let h = harness(true);
    let record = h.repo.create(json!({"name": "Acme"})).unwrap();

    h.server.fail_next_pushes(vec![
        TransportError::Transient("reset".into()),
        TransportError::Transient("reset".into()),
        TransportError::Transient("reset".into()),
    ]);

    // Three failing passes, then one that lands
    for _ in 0..3 {
        let report = completed(h.engine.run_pass().unwrap());
        assert_eq!(report.total_pushed(), 0);
    }
    let report = completed(h.engine.run_pass().unwrap());
    assert_eq!(report.total_pushed(), 1);

    let entries = h
        .store
        .mutations_for_record("clients", &record.id)
        .unwrap();
    assert_eq!(entries[0].attempts, 4);
    assert!(h.store.get_record("clients", &record.id).unwrap().unwrap().synced_at.is_some());
}

#[test]
fn test_rejected_push_needs_manual_attention() {
    let h = harness(true);
    h.repo.create(json!({"name": ""})).unwrap();

    h.server.fail_next_pushes(vec![TransportError::Rejected {
        status: 422,
        message: "name must not be empty".into(),
    }]);
    completed(h.engine.run_pass().unwrap());

    // Further passes leave it alone
    let before = h.server.pushes().len();
    completed(h.engine.run_pass().unwrap());
    assert_eq!(h.server.pushes().len(), before);

    let attention = h.engine.queue().needs_attention(h.engine.settings()).unwrap();
    assert_eq!(attention.len(), 1);
    assert!(attention[0].rejected);
    assert_eq!(
        attention[0].error_message.as_deref(),
        Some("server rejected the request (422): name must not be empty")
    );
}

#[test]
fn test_offline_delete_collapses_earlier_writes() {
    let h = harness(false);
    let record = h.repo.create(json!({"name": "v1"})).unwrap();
    h.repo.update(&record.id, json!({"name": "v2"})).unwrap();
    h.repo.soft_delete(&record.id).unwrap();

    h.connectivity.set_online(true);
    completed(h.engine.run_pass().unwrap());

    // Only the delete went over the wire
    let pushes = h.server.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].op, MutationOp::Delete);
    assert!(
        h.server
            .fetch_record("clients", &record.id)
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_double_pull_is_idempotent() {
    let h = harness(true);
    let t = Utc::now() - Duration::minutes(10);
    h.server.seed("clients", "c1", json!({"name": "A"}), t);
    h.server.seed("clients", "c2", json!({"name": "B"}), t + Duration::minutes(1));

    let first = completed(h.engine.run_pass().unwrap());
    assert_eq!(first.total_pulled(), 2);

    // Nothing changed server-side; a second pass applies nothing and
    // the local set is unchanged
    let second = completed(h.engine.run_pass().unwrap());
    assert_eq!(second.total_pulled(), 0);
    assert_eq!(h.store.count_records("clients").unwrap(), 2);
}

#[test]
fn test_cursor_tracks_server_timestamps() {
    let h = harness(true);
    let t = Utc::now() - Duration::hours(2);
    h.server.seed("clients", "c1", json!({}), t);
    completed(h.engine.run_pass().unwrap());

    // The cursor is the server's timestamp, not the device clock, so a
    // server write dated between the two is still picked up
    let meta = h.store.sync_meta("clients").unwrap().unwrap();
    assert_eq!(meta.last_sync_at, Some(t));

    h.server
        .seed("clients", "c2", json!({}), t + Duration::minutes(30));
    let report = completed(h.engine.run_pass().unwrap());
    assert_eq!(report.total_pulled(), 1);
}

#[test]
fn test_interrupted_create_recovers_without_duplicate() {
    let h = harness(true);

    // Simulate a crash mid-push: row written, entry left in syncing,
    // and the push had in fact reached the server
    let now = Utc::now();
    let record = fieldsync::EntityRecord::new_local("c1", json!({"name": "A"}), now);
    let mut entry = MutationEntry::new("clients", "c1", MutationOp::Create, json!({"name": "A"}), now);
    entry.status = fieldsync::MutationStatus::Syncing;
    h.store.apply_local_write("clients", record, entry).unwrap();
    h.server.seed("clients", "c1", json!({"name": "A"}), now);

    completed(h.engine.run_pass().unwrap());

    // Recovery confirmed the create instead of re-posting it
    assert!(h.server.pushes().is_empty());
    let row = h.store.get_record("clients", "c1").unwrap().unwrap();
    assert!(row.synced_at.is_some());
}

#[test]
fn test_queue_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sync.db");
    let def = EntityDef::offline_mutable("clients", "clients");
    let registry = EntityRegistry::new(vec![def.clone()]);

    let record_id = {
        let store = Arc::new(SqliteSyncStore::open(&path, &registry).unwrap());
        let repo = Repository::new(store, def.clone()).unwrap();
        repo.create(json!({"name": "Acme"})).unwrap().id
    };

    // A fresh process sees the row and the pending entry
    let store = Arc::new(SqliteSyncStore::open(&path, &registry).unwrap());
    let row = store.get_record("clients", &record_id).unwrap().unwrap();
    assert!(row.is_locally_owned());
    let pending = store.pending_mutations(Some("clients")).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].op, MutationOp::Create);
}

#[test]
fn test_overlapping_triggers_coalesce() {
    let h = harness(true);
    h.repo.create(json!({"name": "Acme"})).unwrap();

    // The trait object is Sync; a second thread triggering mid-pass
    // must get AlreadyRunning or a completed pass, never a panic
    let engine = Arc::new(h.engine);
    let e2 = engine.clone();
    let handle = std::thread::spawn(move || e2.run_pass().unwrap());
    let a = engine.run_pass().unwrap();
    let b = handle.join().unwrap();

    let ran: usize = [&a, &b]
        .iter()
        .filter(|o| matches!(o, SyncOutcome::Completed(_)))
        .count();
    assert!(ran >= 1);
    // Whatever the interleaving, the queue ends up drained
    completed(engine.run_pass().unwrap());
    assert!(h.store.pending_mutations(None).unwrap().is_empty());
}
