//! Connectivity collaborator
//!
//! The device network-status API is owned externally; the engine only
//! needs a yes/no answer plus a place for the platform layer to report
//! transitions.

use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the device currently has network connectivity
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity state fed by an external monitor.
///
/// The platform layer calls [`set_online`](SharedConnectivity::set_online)
/// from its network-status callback; the engine reads it before every
/// pass. Also used directly by tests to simulate going on/offline.
pub struct SharedConnectivity {
    online: AtomicBool,
}

impl SharedConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    /// Update the connectivity state. Returns the previous state so a
    /// caller can detect the offline-to-online transition and trigger
    /// a sync pass.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }
}

impl Connectivity for SharedConnectivity {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
