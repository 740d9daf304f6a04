//! Entity registry: the mapping the engine is generic over

/// How writes to an entity are allowed to happen on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// Editable offline; writes are queued and pushed later
    OfflineMutable,
    /// Only the server may mutate it (e.g. billing charges from a
    /// payment provider); cached locally for offline viewing only
    ServerAuthoritative,
}

/// Declares one entity the engine synchronizes: its logical name,
/// table shape identity, and the server endpoint path it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    /// Logical name, also the local table suffix (e.g. "clients")
    pub name: String,
    /// Server endpoint path relative to the API base (e.g. "clients")
    pub endpoint: String,
    pub kind: EntityKind,
}

impl EntityDef {
    pub fn offline_mutable(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            kind: EntityKind::OfflineMutable,
        }
    }

    pub fn server_authoritative(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            kind: EntityKind::ServerAuthoritative,
        }
    }
}

/// The set of entities known to one engine instance.
///
/// The engine hard-codes nothing about business fields; everything it
/// needs per entity lives here.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    defs: Vec<EntityDef>,
}

impl EntityRegistry {
    pub fn new(defs: Vec<EntityDef>) -> Self {
        Self { defs }
    }

    pub fn get(&self, name: &str) -> Option<&EntityDef> {
        self.defs.iter().find(|d| d.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityDef> {
        self.defs.iter()
    }

    /// Entities whose writes flow through the mutation queue
    pub fn offline_mutable(&self) -> impl Iterator<Item = &EntityDef> {
        self.defs.iter().filter(|d| d.kind == EntityKind::OfflineMutable)
    }

    /// Entities cached read-only (refreshed wholesale from the server)
    pub fn server_authoritative(&self) -> impl Iterator<Item = &EntityDef> {
        self.defs
            .iter()
            .filter(|d| d.kind == EntityKind::ServerAuthoritative)
    }

    pub fn names(&self) -> Vec<&str> {
        self.defs.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}
