//! Cache-level change events.
//!
//! The cache broadcasts a closed set of event kinds; queries and the
//! client bridge subscribe and react differentially. Consumers that
//! debounce (e.g. unread counters) use [`ChangeSource`] to distinguish
//! a burst of interpreter-driven patch updates from a direct local
//! assignment.

use confab_shared::ids::{EntityId, EntityKind};

/// Where a property change originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// A direct assignment by local SDK code.
    Local,
    /// The patch interpreter, applying a server push.
    RemotePatch,
}

/// One mutation of the entity cache.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Added {
        kind: EntityKind,
        id: EntityId,
    },
    Removed {
        kind: EntityKind,
        id: EntityId,
    },
    Changed {
        kind: EntityKind,
        id: EntityId,
        /// Top-level property names that changed, in order.
        properties: Vec<String>,
        source: ChangeSource,
    },
    /// A temporary id was reconciled to its server-assigned id.
    IdReassigned {
        kind: EntityKind,
        old_id: EntityId,
        new_id: EntityId,
    },
}
