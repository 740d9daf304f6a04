//! Storage traits and implementations
//!
//! The trait-based design allows swapping between the sqlite store and
//! an in-memory store for tests. All repository, queue and engine code
//! talks to [`SyncStore`] only.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemorySyncStore;
pub use sqlite::SqliteSyncStore;
pub use traits::SyncStore;
