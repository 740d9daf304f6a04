//! Mutation queue entry model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The kind of write recorded in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Create => "create",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(MutationOp::Create),
            "update" => Some(MutationOp::Update),
            "delete" => Some(MutationOp::Delete),
            _ => None,
        }
    }
}

/// Lifecycle state of a queue entry
///
/// `Pending → Syncing → Done` on success, `Pending → Syncing → Failed`
/// on error. A `Failed` entry returns to `Pending` once its backoff
/// elapses, unless its attempt count is past the configured maximum or
/// the server rejected it outright, in which case it stays `Failed`
/// and is surfaced for manual attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Syncing,
    Failed,
    Done,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Syncing => "syncing",
            MutationStatus::Failed => "failed",
            MutationStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MutationStatus::Pending),
            "syncing" => Some(MutationStatus::Syncing),
            "failed" => Some(MutationStatus::Failed),
            "done" => Some(MutationStatus::Done),
            _ => None,
        }
    }
}

/// A durable record of one local write awaiting server confirmation.
///
/// Entries are immutable once created except for `status`, `attempts`,
/// `last_attempt_at`, `error_message` and `rejected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEntry {
    /// Client-generated id, unique across the queue
    pub id: String,
    /// Logical entity name (e.g. "clients", "catalog_items")
    pub entity: String,
    /// Primary key of the affected record
    pub entity_id: String,
    pub op: MutationOp,
    /// Snapshot of the business fields to apply
    pub payload: Value,
    pub status: MutationStatus,
    /// Count of push attempts made so far
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Last failure reason, if any
    pub error_message: Option<String>,
    /// Set when the server definitively refused this entry. A rejected
    /// entry is never auto-retried, regardless of its attempt count;
    /// retries-exhausted entries keep this false so callers can tell
    /// the two apart.
    #[serde(default)]
    pub rejected: bool,
}

impl MutationEntry {
    /// Create a new pending entry with a fresh client-side id
    pub fn new(
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        op: MutationOp,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity: entity.into(),
            entity_id: entity_id.into(),
            op,
            payload,
            status: MutationStatus::Pending,
            attempts: 0,
            created_at: now,
            last_attempt_at: None,
            error_message: None,
            rejected: false,
        }
    }

    /// Whether this entry is in flight or awaiting push
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self.status,
            MutationStatus::Pending | MutationStatus::Syncing | MutationStatus::Failed
        )
    }

    /// Whether this entry has permanently failed and needs manual
    /// resolution (never auto-retried again), either because the
    /// server rejected it or because its retries are exhausted
    pub fn needs_attention(&self, max_attempts: u32) -> bool {
        self.status == MutationStatus::Failed && (self.rejected || self.attempts > max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_entry_is_pending() {
        let e = MutationEntry::new("clients", "c1", MutationOp::Create, json!({}), Utc::now());
        assert_eq!(e.status, MutationStatus::Pending);
        assert_eq!(e.attempts, 0);
        assert!(e.last_attempt_at.is_none());
        assert!(e.is_unresolved());
    }

    #[test]
    fn test_unique_ids() {
        let now = Utc::now();
        let a = MutationEntry::new("clients", "c1", MutationOp::Update, json!({}), now);
        let b = MutationEntry::new("clients", "c1", MutationOp::Update, json!({}), now);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_needs_attention() {
        let mut e = MutationEntry::new("clients", "c1", MutationOp::Update, json!({}), Utc::now());
        e.status = MutationStatus::Failed;
        e.attempts = 3;
        assert!(!e.needs_attention(5));
        e.attempts = 6;
        assert!(e.needs_attention(5));
    }

    #[test]
    fn test_rejected_needs_attention_regardless_of_attempts() {
        let mut e = MutationEntry::new("clients", "c1", MutationOp::Update, json!({}), Utc::now());
        e.status = MutationStatus::Failed;
        e.attempts = 1;
        e.rejected = true;
        assert!(e.needs_attention(5));
    }

    #[test]
    fn test_status_round_trip() {
        for s in ["pending", "syncing", "failed", "done"] {
            assert_eq!(MutationStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(MutationStatus::parse("bogus").is_none());
    }
}
