//! Fieldsync - offline-first sync core for field-service clients
//!
//! This crate provides the platform-independent sync machinery:
//! - Domain models (EntityRecord, MutationEntry, SyncMeta)
//! - Storage trait abstractions over an embedded sqlite store
//! - Repositories for offline-mutable entities (local reads, queued writes)
//! - A durable mutation queue with retry backoff and crash recovery
//! - A push/pull sync engine driven by connectivity and scheduler events
//! - A cache-aside service for server-authoritative entities
//!
//! This crate has zero UI dependencies; the host application supplies
//! connectivity signals, credentials and the entity registry.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod models;
pub mod queue;
pub mod repo;
pub mod storage;
pub mod transport;

pub use cache::{CacheError, CacheService};
pub use config::{ApiCredentials, SyncSettings};
pub use connectivity::{Connectivity, SharedConnectivity};
pub use engine::{
    // Pass execution
    EntityPullStats, EntityPushStats, EntitySyncReport, RecoveryStats, SyncEngine, SyncOutcome,
    SyncReport,
    // Sync timing (for host scheduler cooldown management)
    backoff_delay, cooldown_elapsed, retry_eligible,
};
pub use models::{
    EntityDef, EntityKind, EntityRecord, EntityRegistry, MutationEntry, MutationOp,
    MutationStatus, SyncMeta, SyncStatus,
};
pub use queue::MutationQueue;
pub use repo::Repository;
pub use storage::{InMemorySyncStore, SqliteSyncStore, SyncStore};
pub use transport::{
    ApiTransport, ChangePage, HttpTransport, RemoteRecord, StaticTokenProvider, TokenProvider,
    TransportError,
};
