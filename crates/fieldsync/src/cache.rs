//! Cache-aside service for server-authoritative entities
//!
//! Some entities must never be mutated on the device (billing charges
//! from the payment provider, for example). They are cached locally so
//! reads work offline, refreshed wholesale from the server, and written
//! only through the server while online. There is no mutation queue for
//! them: a write that cannot reach the server fails immediately instead
//! of queuing.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::Value;
use std::sync::Arc;

use crate::config::SyncSettings;
use crate::connectivity::Connectivity;
use crate::models::{EntityDef, EntityKind, EntityRecord, SyncStatus};
use crate::storage::SyncStore;
use crate::transport::{ApiTransport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Writes to server-authoritative entities require connectivity
    #[error("device is offline; this write cannot be queued")]
    Offline,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
    #[error("entity {0:?} is offline-mutable; use its Repository instead")]
    WrongKind(String),
}

/// Replace the local cache for one server-authoritative entity with the
/// server's current state. Returns how many records were cached.
///
/// Fetches the full set (no incremental cursor) and swaps it in as one
/// store write, so readers never observe a half-refreshed cache.
pub fn refresh_entity(
    store: &dyn SyncStore,
    transport: &dyn ApiTransport,
    def: &EntityDef,
    settings: &SyncSettings,
) -> Result<usize, CacheError> {
    let mut records: Vec<EntityRecord> = Vec::new();
    let mut cursor: Option<String> = None;
    let now = Utc::now();

    for _ in 0..settings.max_pull_pages {
        let page = match transport.list_changes(&def.endpoint, None, cursor.as_deref(), settings.page_size) {
            Ok(page) => page,
            Err(e) => {
                if let Some(mut meta) = store.sync_meta(&def.name)? {
                    meta.sync_status = SyncStatus::Error;
                    store.save_sync_meta(meta)?;
                }
                return Err(e.into());
            }
        };
        records.extend(page.records.into_iter().map(|r| r.into_record(now)));
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }
    if cursor.is_some() {
        warn!(
            "Refresh for {} stopped at the {}-page cap; cache holds a truncated set",
            def.name, settings.max_pull_pages
        );
    }

    let count = records.len();
    store.replace_all_records(&def.name, records)?;
    if let Some(mut meta) = store.sync_meta(&def.name)? {
        // last_sync_at doubles as the staleness marker shown to users;
        // a wholesale refresh is anchored to the refresh instant
        meta.last_sync_at = Some(now);
        meta.last_cursor = None;
        meta.sync_status = SyncStatus::Idle;
        store.save_sync_meta(meta)?;
    }
    info!("Refreshed {count} cached {} records", def.name);
    Ok(count)
}

/// Read-through view of one server-authoritative entity.
///
/// Reads come from the local cache and carry a staleness timestamp;
/// writes go straight to the server and update the cache from the
/// response.
pub struct CacheService {
    store: Arc<dyn SyncStore>,
    transport: Arc<dyn ApiTransport>,
    connectivity: Arc<dyn Connectivity>,
    settings: SyncSettings,
    def: EntityDef,
}

impl CacheService {
    pub fn new(
        store: Arc<dyn SyncStore>,
        transport: Arc<dyn ApiTransport>,
        connectivity: Arc<dyn Connectivity>,
        settings: SyncSettings,
        def: EntityDef,
    ) -> Result<Self, CacheError> {
        if def.kind != EntityKind::ServerAuthoritative {
            return Err(CacheError::WrongKind(def.name.clone()));
        }
        store.seed_sync_meta(&def.name)?;
        Ok(Self {
            store,
            transport,
            connectivity,
            settings,
            def,
        })
    }

    pub fn entity(&self) -> &str {
        &self.def.name
    }

    /// Pull the server's current state into the cache
    pub fn refresh(&self) -> Result<usize, CacheError> {
        if !self.connectivity.is_online() {
            return Err(CacheError::Offline);
        }
        refresh_entity(
            self.store.as_ref(),
            self.transport.as_ref(),
            &self.def,
            &self.settings,
        )
    }

    /// Cached records plus when they were last refreshed, `None` if the
    /// cache has never been filled. Works offline.
    pub fn read(&self) -> Result<(Vec<EntityRecord>, Option<DateTime<Utc>>), CacheError> {
        let records = self.store.list_records(&self.def.name, false)?;
        let refreshed_at = self
            .store
            .sync_meta(&self.def.name)?
            .and_then(|m| m.last_sync_at);
        Ok((records, refreshed_at))
    }

    pub fn get(&self, id: &str) -> Result<Option<EntityRecord>, CacheError> {
        Ok(self.store.get_record(&self.def.name, id)?)
    }

    /// Write through to the server and cache the confirmed result.
    ///
    /// Fails fast when offline; there is deliberately no queue behind
    /// this path.
    pub fn write_through(&self, id: &str, payload: &Value) -> Result<EntityRecord, CacheError> {
        if !self.connectivity.is_online() {
            return Err(CacheError::Offline);
        }
        let remote = self.transport.write_through(&self.def.endpoint, id, payload)?;
        let record = remote.into_record(Utc::now());
        self.store.upsert_record(&self.def.name, record.clone())?;
        Ok(record)
    }
}
