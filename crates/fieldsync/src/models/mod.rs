//! Domain models for the sync core
//!
//! The engine is generic over business entities: a record carries its
//! business fields as JSON plus the id/timestamp/ownership columns the
//! sync protocol needs. Entity names and endpoints come from the
//! [`EntityRegistry`].

mod entity;
mod mutation;
mod record;
mod sync_meta;

pub use entity::{EntityDef, EntityKind, EntityRegistry};
pub use mutation::{MutationEntry, MutationOp, MutationStatus};
pub use record::EntityRecord;
pub use sync_meta::{SyncMeta, SyncStatus};
