//! Configuration for the sync core
//!
//! Supports loading API credentials from (in order of priority):
//! 1. JSON file (~/.config/fieldsync/api-credentials.json)
//! 2. Runtime environment variables (fallback)
//!
//! Tuning knobs for the engine live in [`SyncSettings`], loadable from
//! the optional sync.json file and falling back to defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Credentials filename in the fieldsync config directory
const CREDENTIALS_FILE: &str = "api-credentials.json";

/// Settings filename in the fieldsync config directory
const SETTINGS_FILE: &str = "sync.json";

/// Server connection settings for the sync transport.
///
/// The bearer token here is the injected per-request token; refreshing
/// it belongs to the auth collaborator, not to this crate.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiCredentials {
    /// Base URL of the server of record (e.g. "https://api.example.com/v1")
    pub base_url: String,
    pub token: String,
}

impl ApiCredentials {
    /// Load credentials from the config file, falling back to
    /// environment variables
    pub fn load() -> Result<Self> {
        if config::config_exists(CREDENTIALS_FILE) {
            return config::load_json(CREDENTIALS_FILE);
        }
        Self::from_env()
    }

    /// Load credentials from environment variables
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("FIELDSYNC_API_URL")
            .context("FIELDSYNC_API_URL environment variable not set")?;
        let token = std::env::var("FIELDSYNC_API_TOKEN")
            .context("FIELDSYNC_API_TOKEN environment variable not set")?;
        Ok(Self { base_url, token })
    }

    /// Parse credentials from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse credentials JSON")
    }

    /// Check if credentials are available (file or env vars)
    pub fn is_available() -> bool {
        config::config_exists(CREDENTIALS_FILE)
            || (std::env::var("FIELDSYNC_API_URL").is_ok()
                && std::env::var("FIELDSYNC_API_TOKEN").is_ok())
    }
}

/// Tuning knobs for the sync engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Base delay for push retry backoff, in milliseconds
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay, in milliseconds
    pub backoff_cap_ms: u64,
    /// Push attempts after which a failed entry stops auto-retrying
    pub max_attempts: u32,
    /// Records requested per pull page
    pub page_size: usize,
    /// Hard cap on pages fetched per entity per pass, against a
    /// misbehaving server that keeps returning continuation tokens
    pub max_pull_pages: usize,
    /// How long done queue entries are kept before being purged, in days
    pub retention_days: i64,
    /// Minimum seconds between periodic-timer sync passes
    pub cooldown_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
            max_attempts: 5,
            page_size: 100,
            max_pull_pages: 50,
            retention_days: 7,
            cooldown_secs: 30,
        }
    }
}

impl SyncSettings {
    /// Load settings from the config file, or defaults if absent
    pub fn load() -> Result<Self> {
        if config::config_exists(SETTINGS_FILE) {
            return config::load_json(SETTINGS_FILE);
        }
        Ok(Self::default())
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}
