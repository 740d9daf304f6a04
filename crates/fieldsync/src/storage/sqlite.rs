//! SQLite-backed local store
//!
//! Holds one table per registered entity plus the two control tables
//! (`mutations_queue`, `sync_meta`). Entity tables share a generic
//! shape: the business fields live in a JSON `data` column, the
//! envelope columns are what the sync protocol reads.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use rusqlite_migration::{M, Migrations};

use super::traits::SyncStore;
use crate::models::{
    EntityRecord, EntityRegistry, MutationEntry, MutationOp, MutationStatus, SyncMeta, SyncStatus,
};

/// Database migrations
///
/// Each migration is applied in order inside its own transaction. The
/// user_version pragma tracks which migrations have been applied. A
/// failed migration aborts [`SqliteSyncStore::open`]; the store must
/// not be used in a partially migrated state.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: control tables
        M::up(
            r#"
            -- Durable log of local writes awaiting push
            CREATE TABLE mutations_queue (
                id TEXT PRIMARY KEY,
                entity TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                op TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_attempt_at TEXT,
                error_message TEXT,
                rejected INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_mutations_status ON mutations_queue(status, created_at ASC);
            CREATE INDEX idx_mutations_record ON mutations_queue(entity, entity_id, created_at ASC);

            -- Pull cursor and status, one row per entity
            CREATE TABLE sync_meta (
                entity TEXT PRIMARY KEY,
                last_sync_at TEXT,
                last_cursor TEXT,
                sync_status TEXT NOT NULL DEFAULT 'idle'
            );
            "#,
        ),
    ])
}

/// SQLite-backed implementation of [`SyncStore`]
pub struct SqliteSyncStore {
    conn: Mutex<Connection>,
}

impl SqliteSyncStore {
    /// Open (or create) the store at `db_path` and bring the schema up
    /// to date.
    ///
    /// Runs pending migrations, creates a table for every registered
    /// entity, and seeds a `sync_meta` row per entity so pulls always
    /// have a defined starting cursor. Returns an error if migration
    /// fails; callers must treat that as unrecoverable.
    pub fn open(db_path: impl AsRef<Path>, registry: &EntityRegistry) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL allows concurrent readers during writes and improves
        // crash recovery; NORMAL sync is safe in WAL mode.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_entity_tables(registry)?;
        Ok(store)
    }

    /// Create missing entity tables and seed their sync metadata
    fn ensure_entity_tables(&self, registry: &EntityRegistry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        for def in registry.iter() {
            let table = entity_table(&def.name)?;
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    data TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    synced_at TEXT,
                    is_active INTEGER NOT NULL DEFAULT 1
                );
                "#
            ))?;
            conn.execute(
                "INSERT OR IGNORE INTO sync_meta (entity, sync_status) VALUES (?1, 'idle')",
                params![def.name],
            )?;
        }
        Ok(())
    }
}

/// Map an entity name to its table name, refusing anything that cannot
/// be safely interpolated into DDL
fn entity_table(entity: &str) -> Result<String> {
    if entity.is_empty()
        || !entity
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        bail!("Invalid entity name: {entity:?}");
    }
    Ok(format!("entity_{entity}"))
}

fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_sql(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in store: {s:?}"))?
        .with_timezone(&Utc))
}

fn record_from_row(row: &rusqlite::Row<'_>) -> Result<EntityRecord> {
    let data: String = row.get("data")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let synced_at: Option<String> = row.get("synced_at")?;
    Ok(EntityRecord {
        id: row.get("id")?,
        data: serde_json::from_str(&data).context("Corrupt record data")?,
        created_at: ts_from_sql(&created_at)?,
        updated_at: ts_from_sql(&updated_at)?,
        synced_at: synced_at.as_deref().map(ts_from_sql).transpose()?,
        is_active: row.get::<_, i64>("is_active")? != 0,
    })
}

fn mutation_from_row(row: &rusqlite::Row<'_>) -> Result<MutationEntry> {
    let op: String = row.get("op")?;
    let status: String = row.get("status")?;
    let payload: String = row.get("payload")?;
    let created_at: String = row.get("created_at")?;
    let last_attempt_at: Option<String> = row.get("last_attempt_at")?;
    Ok(MutationEntry {
        id: row.get("id")?,
        entity: row.get("entity")?,
        entity_id: row.get("entity_id")?,
        op: MutationOp::parse(&op).with_context(|| format!("Unknown mutation op: {op:?}"))?,
        payload: serde_json::from_str(&payload).context("Corrupt mutation payload")?,
        status: MutationStatus::parse(&status)
            .with_context(|| format!("Unknown mutation status: {status:?}"))?,
        attempts: row.get::<_, i64>("attempts")? as u32,
        created_at: ts_from_sql(&created_at)?,
        last_attempt_at: last_attempt_at.as_deref().map(ts_from_sql).transpose()?,
        error_message: row.get("error_message")?,
        rejected: row.get::<_, i64>("rejected")? != 0,
    })
}

fn meta_from_row(row: &rusqlite::Row<'_>) -> Result<SyncMeta> {
    let status: String = row.get("sync_status")?;
    let last_sync_at: Option<String> = row.get("last_sync_at")?;
    Ok(SyncMeta {
        entity: row.get("entity")?,
        last_sync_at: last_sync_at.as_deref().map(ts_from_sql).transpose()?,
        last_cursor: row.get("last_cursor")?,
        sync_status: SyncStatus::parse(&status)
            .with_context(|| format!("Unknown sync status: {status:?}"))?,
    })
}

fn upsert_record_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {table} (id, data, created_at, updated_at, synced_at, is_active)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(id) DO UPDATE SET
            data = excluded.data,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            synced_at = excluded.synced_at,
            is_active = excluded.is_active
        "#
    )
}

fn bind_upsert_record(
    conn: &Connection,
    table: &str,
    record: &EntityRecord,
) -> Result<()> {
    conn.execute(
        &upsert_record_sql(table),
        params![
            record.id,
            serde_json::to_string(&record.data)?,
            ts_to_sql(record.created_at),
            ts_to_sql(record.updated_at),
            record.synced_at.map(ts_to_sql),
            record.is_active as i64,
        ],
    )?;
    Ok(())
}

fn bind_insert_mutation(conn: &Connection, entry: &MutationEntry) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO mutations_queue
            (id, entity, entity_id, op, payload, status, attempts,
             created_at, last_attempt_at, error_message, rejected)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            entry.id,
            entry.entity,
            entry.entity_id,
            entry.op.as_str(),
            serde_json::to_string(&entry.payload)?,
            entry.status.as_str(),
            entry.attempts as i64,
            ts_to_sql(entry.created_at),
            entry.last_attempt_at.map(ts_to_sql),
            entry.error_message,
            entry.rejected as i64,
        ],
    )?;
    Ok(())
}

const MUTATION_COLS: &str =
    "id, entity, entity_id, op, payload, status, attempts, created_at, last_attempt_at, error_message, rejected";

impl SyncStore for SqliteSyncStore {
    fn get_record(&self, entity: &str, id: &str) -> Result<Option<EntityRecord>> {
        let table = entity_table(entity)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, data, created_at, updated_at, synced_at, is_active FROM {table} WHERE id = ?1"
        ))?;
        let row = stmt
            .query_row(params![id], |row| {
                Ok(record_from_row(row))
            })
            .optional()?;
        row.transpose()
    }

    fn list_records(&self, entity: &str, include_inactive: bool) -> Result<Vec<EntityRecord>> {
        let table = entity_table(entity)?;
        let filter = if include_inactive { "" } else { "WHERE is_active = 1" };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, data, created_at, updated_at, synced_at, is_active
             FROM {table} {filter} ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([], |row| Ok(record_from_row(row)))?;
        rows.map(|r| r?).collect()
    }

    fn upsert_record(&self, entity: &str, record: EntityRecord) -> Result<()> {
        let table = entity_table(entity)?;
        let conn = self.conn.lock().unwrap();
        bind_upsert_record(&conn, &table, &record)
    }

    fn mark_record_synced(&self, entity: &str, id: &str, synced_at: DateTime<Utc>) -> Result<()> {
        let table = entity_table(entity)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("UPDATE {table} SET synced_at = ?1 WHERE id = ?2"),
            params![ts_to_sql(synced_at), id],
        )?;
        Ok(())
    }

    fn replace_all_records(&self, entity: &str, records: Vec<EntityRecord>) -> Result<()> {
        let table = entity_table(entity)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {table}"), [])?;
        for record in &records {
            bind_upsert_record(&tx, &table, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn count_records(&self, entity: &str) -> Result<usize> {
        let table = entity_table(entity)?;
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE is_active = 1"),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn apply_local_write(
        &self,
        entity: &str,
        record: EntityRecord,
        entry: MutationEntry,
    ) -> Result<()> {
        let table = entity_table(entity)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        bind_upsert_record(&tx, &table, &record)?;
        bind_insert_mutation(&tx, &entry)?;
        tx.commit()?;
        Ok(())
    }

    fn insert_mutation(&self, entry: MutationEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        bind_insert_mutation(&conn, &entry)
    }

    fn get_mutation(&self, id: &str) -> Result<Option<MutationEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MUTATION_COLS} FROM mutations_queue WHERE id = ?1"
        ))?;
        let row = stmt
            .query_row(params![id], |row| Ok(mutation_from_row(row)))
            .optional()?;
        row.transpose()
    }

    fn pending_mutations(&self, entity: Option<&str>) -> Result<Vec<MutationEntry>> {
        let conn = self.conn.lock().unwrap();
        match entity {
            Some(entity) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MUTATION_COLS} FROM mutations_queue
                     WHERE status = 'pending' AND entity = ?1
                     ORDER BY created_at ASC, id ASC"
                ))?;
                let rows = stmt.query_map(params![entity], |row| Ok(mutation_from_row(row)))?;
                rows.map(|r| r?).collect()
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MUTATION_COLS} FROM mutations_queue
                     WHERE status = 'pending'
                     ORDER BY created_at ASC, id ASC"
                ))?;
                let rows = stmt.query_map([], |row| Ok(mutation_from_row(row)))?;
                rows.map(|r| r?).collect()
            }
        }
    }

    fn mutations_in_status(&self, status: MutationStatus) -> Result<Vec<MutationEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MUTATION_COLS} FROM mutations_queue
             WHERE status = ?1 ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], |row| Ok(mutation_from_row(row)))?;
        rows.map(|r| r?).collect()
    }

    fn mutations_for_record(&self, entity: &str, entity_id: &str) -> Result<Vec<MutationEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MUTATION_COLS} FROM mutations_queue
             WHERE entity = ?1 AND entity_id = ?2
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![entity, entity_id], |row| Ok(mutation_from_row(row)))?;
        rows.map(|r| r?).collect()
    }

    fn update_mutation(&self, entry: &MutationEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        // Only the mutable fields; the rest of the entry is immutable
        // once created.
        conn.execute(
            r#"
            UPDATE mutations_queue
            SET status = ?1, attempts = ?2, last_attempt_at = ?3,
                error_message = ?4, rejected = ?5
            WHERE id = ?6
            "#,
            params![
                entry.status.as_str(),
                entry.attempts as i64,
                entry.last_attempt_at.map(ts_to_sql),
                entry.error_message,
                entry.rejected as i64,
                entry.id,
            ],
        )?;
        Ok(())
    }

    fn purge_done_mutations(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM mutations_queue WHERE status = 'done' AND created_at < ?1",
            params![ts_to_sql(before)],
        )?;
        Ok(removed)
    }

    fn sync_meta(&self, entity: &str) -> Result<Option<SyncMeta>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT entity, last_sync_at, last_cursor, sync_status FROM sync_meta WHERE entity = ?1",
        )?;
        let row = stmt
            .query_row(params![entity], |row| Ok(meta_from_row(row)))
            .optional()?;
        row.transpose()
    }

    fn save_sync_meta(&self, meta: SyncMeta) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO sync_meta (entity, last_sync_at, last_cursor, sync_status)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(entity) DO UPDATE SET
                last_sync_at = excluded.last_sync_at,
                last_cursor = excluded.last_cursor,
                sync_status = excluded.sync_status
            "#,
            params![
                meta.entity,
                meta.last_sync_at.map(ts_to_sql),
                meta.last_cursor,
                meta.sync_status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn seed_sync_meta(&self, entity: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO sync_meta (entity, sync_status) VALUES (?1, 'idle')",
            params![entity],
        )?;
        Ok(())
    }

}
