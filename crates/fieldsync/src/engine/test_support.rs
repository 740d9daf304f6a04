//! Scriptable in-memory transport for engine tests

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::models::MutationEntry;
use crate::transport::{ApiTransport, ChangePage, RemoteRecord, TransportError};

/// Fake server: seeded records answer fetches and pulls, every call is
/// recorded, and per-call results can be scripted to force failures.
/// Scripted results are consumed front to back; once exhausted, calls
/// fall back to the seeded state (success).
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    server: Mutex<HashMap<String, Vec<RemoteRecord>>>,
    pushes: Mutex<Vec<MutationEntry>>,
    fetches: Mutex<Vec<(String, String)>>,
    push_script: Mutex<VecDeque<Result<(), TransportError>>>,
    list_script: Mutex<VecDeque<Result<ChangePage, TransportError>>>,
    fetch_script: Mutex<VecDeque<Result<Option<RemoteRecord>, TransportError>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record to the fake server's state
    pub fn seed_server_record(
        &self,
        endpoint: &str,
        id: &str,
        data: Value,
        updated_at: DateTime<Utc>,
    ) {
        let record = RemoteRecord {
            id: id.to_string(),
            created_at: updated_at,
            updated_at,
            is_active: true,
            data,
        };
        let mut server = self.server.lock().unwrap();
        let records = server.entry(endpoint.to_string()).or_default();
        records.retain(|r| r.id != id);
        records.push(record);
    }

    pub fn script_push_results(&self, results: Vec<Result<(), TransportError>>) {
        self.push_script.lock().unwrap().extend(results);
    }

    pub fn script_list_results(&self, results: Vec<Result<ChangePage, TransportError>>) {
        self.list_script.lock().unwrap().extend(results);
    }

    pub fn script_fetch_results(
        &self,
        results: Vec<Result<Option<RemoteRecord>, TransportError>>,
    ) {
        self.fetch_script.lock().unwrap().extend(results);
    }

    /// Entries pushed so far, in call order
    pub fn pushes(&self) -> Vec<MutationEntry> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn clear_pushes(&self) {
        self.pushes.lock().unwrap().clear();
    }

    /// (endpoint, id) pairs fetched so far, in call order
    pub fn fetches(&self) -> Vec<(String, String)> {
        self.fetches.lock().unwrap().clone()
    }
}

impl ApiTransport for ScriptedTransport {
    fn list_changes(
        &self,
        endpoint: &str,
        updated_since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<ChangePage, TransportError> {
        if let Some(result) = self.list_script.lock().unwrap().pop_front() {
            return result;
        }

        let server = self.server.lock().unwrap();
        let mut changed: Vec<RemoteRecord> = server
            .get(endpoint)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| updated_since.is_none_or(|since| r.updated_at > since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        changed.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));

        // The continuation token is a plain offset into the sorted set
        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let remaining = changed.len().saturating_sub(offset);
        let records: Vec<RemoteRecord> =
            changed.into_iter().skip(offset).take(page_size).collect();
        let next_cursor = if remaining > records.len() {
            Some((offset + records.len()).to_string())
        } else {
            None
        };
        Ok(ChangePage {
            records,
            next_cursor,
        })
    }

    fn fetch_record(
        &self,
        endpoint: &str,
        id: &str,
    ) -> Result<Option<RemoteRecord>, TransportError> {
        self.fetches
            .lock()
            .unwrap()
            .push((endpoint.to_string(), id.to_string()));
        if let Some(result) = self.fetch_script.lock().unwrap().pop_front() {
            return result;
        }
        let server = self.server.lock().unwrap();
        Ok(server
            .get(endpoint)
            .and_then(|records| records.iter().find(|r| r.id == id).cloned()))
    }

    fn push_mutation(&self, _endpoint: &str, entry: &MutationEntry) -> Result<(), TransportError> {
        self.pushes.lock().unwrap().push(entry.clone());
        self.push_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    fn write_through(
        &self,
        endpoint: &str,
        id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord, TransportError> {
        let now = Utc::now();
        let mut server = self.server.lock().unwrap();
        let records = server.entry(endpoint.to_string()).or_default();
        let record = match records.iter_mut().find(|r| r.id == id) {
            Some(existing) => {
                if let (Some(data), Some(patch)) =
                    (existing.data.as_object_mut(), payload.as_object())
                {
                    for (k, v) in patch {
                        data.insert(k.clone(), v.clone());
                    }
                }
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let record = RemoteRecord {
                    id: id.to_string(),
                    created_at: now,
                    updated_at: now,
                    is_active: true,
                    data: payload.clone(),
                };
                records.push(record.clone());
                record
            }
        };
        Ok(record)
    }
}
