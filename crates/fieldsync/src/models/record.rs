//! Cached entity row

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A locally cached row for one business entity record.
///
/// Business fields travel as a JSON object in `data`; the engine only
/// interprets the envelope columns. `synced_at` is the ownership tag:
/// `None` means the row is locally owned (a mutation for it is pending
/// or in flight) and a pull must not overwrite it; `Some(ts)` means the
/// server confirmed this state at `ts` and the server version wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Primary key of the record (server id, or client-generated for
    /// records created offline)
    pub id: String,
    /// Business fields as a JSON object
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the server last confirmed this row, `None` while a local
    /// mutation is unconfirmed
    pub synced_at: Option<DateTime<Utc>>,
    /// Soft-delete flag; deleted rows stay cached as inactive
    pub is_active: bool,
}

impl EntityRecord {
    /// Create a locally owned row for a record written while offline
    pub fn new_local(id: impl Into<String>, data: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            data,
            created_at: now,
            updated_at: now,
            synced_at: None,
            is_active: true,
        }
    }

    /// Whether this row is locally owned (unconfirmed local mutation)
    pub fn is_locally_owned(&self) -> bool {
        self.synced_at.is_none()
    }

    /// Read a string business field, if present
    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }
}
