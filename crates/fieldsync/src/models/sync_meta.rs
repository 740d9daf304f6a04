//! Per-entity sync cursor and status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pull state for one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(SyncStatus::Idle),
            "syncing" => Some(SyncStatus::Syncing),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// Tracks pull progress for one entity.
///
/// One row per entity, seeded at schema creation so every pull has a
/// defined starting cursor. `last_sync_at` is the incremental cursor:
/// the next pull requests records with `updated_at` strictly greater.
/// `last_cursor` is a server-provided continuation token persisted
/// mid-pass so an aborted multi-page pull can resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub entity: String,
    /// Maximum server `updated_at` seen across completed pulls; `None`
    /// before the first successful pull
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Opaque continuation token for a pull left mid-pagination
    pub last_cursor: Option<String>,
    pub sync_status: SyncStatus,
}

impl SyncMeta {
    /// Fresh metadata for an entity that has never pulled
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            last_sync_at: None,
            last_cursor: None,
            sync_status: SyncStatus::Idle,
        }
    }

    /// Advance the cursor after a completed pull pass.
    ///
    /// The cursor moves to the maximum `updated_at` observed among the
    /// pulled records, never to the local clock, so late-arriving
    /// server writes with earlier timestamps are not skipped.
    pub fn advanced(mut self, max_updated_at: Option<DateTime<Utc>>) -> Self {
        if let Some(ts) = max_updated_at {
            self.last_sync_at = match self.last_sync_at {
                Some(prev) if prev > ts => Some(prev),
                _ => Some(ts),
            };
        }
        self.last_cursor = None;
        self.sync_status = SyncStatus::Idle;
        self
    }
}
