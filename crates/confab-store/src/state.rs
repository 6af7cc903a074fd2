//! Per-entity sync lifecycle.
//!
//! Every syncable entity carries a [`SyncStatus`]: the lifecycle state
//! plus a counter of in-flight mutations. The counter reaches zero only
//! when the state becomes [`SyncState::Synced`]; the sync queue and the
//! change applier both consult it before acting on an entity.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a syncable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Created locally; the server has never seen it and it has no
    /// server URL.
    New,
    /// Its creation request is queued or in flight.
    Saving,
    /// A mutation of an already-created entity is queued or in flight.
    Syncing,
    /// Matches the server's view.
    Synced,
    /// Being hydrated from a server payload.
    Loading,
}

/// Sync lifecycle bookkeeping attached to every entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    state: SyncState,
    sync_counter: u32,
}

impl SyncStatus {
    /// A locally created entity the server does not know about.
    pub fn new_local() -> Self {
        Self {
            state: SyncState::New,
            sync_counter: 0,
        }
    }

    /// An entity hydrated from a server payload.
    pub fn synced() -> Self {
        Self {
            state: SyncState::Synced,
            sync_counter: 0,
        }
    }

    /// An entity whose full resource is being fetched.
    pub fn loading() -> Self {
        Self {
            state: SyncState::Loading,
            sync_counter: 0,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Count of queued or in-flight mutations against this entity.
    pub fn sync_counter(&self) -> u32 {
        self.sync_counter
    }

    pub fn is_new(&self) -> bool {
        self.state == SyncState::New
    }

    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    /// A mutation was enqueued. NEW entities move to SAVING (their
    /// create is pending); anything else moves to SYNCING.
    pub fn on_mutation_enqueued(&mut self) {
        self.sync_counter = self.sync_counter.saturating_add(1);
        self.state = match self.state {
            SyncState::New | SyncState::Saving => SyncState::Saving,
            _ => SyncState::Syncing,
        };
    }

    /// A mutation resolved (success or permanent failure). The state
    /// becomes SYNCED only once no mutations remain in flight.
    pub fn on_mutation_resolved(&mut self) {
        self.sync_counter = self.sync_counter.saturating_sub(1);
        if self.sync_counter == 0 {
            self.state = SyncState::Synced;
        }
    }

    /// Hydration from the server completed.
    pub fn on_loaded(&mut self) {
        if self.sync_counter == 0 {
            self.state = SyncState::Synced;
        }
    }
}

impl Default for SyncStatus {
    /// Entities deserialized from server payloads are synced.
    fn default() -> Self {
        Self::synced()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entity_saves_then_syncs() {
        let mut status = SyncStatus::new_local();
        assert!(status.is_new());

        status.on_mutation_enqueued();
        assert_eq!(status.state(), SyncState::Saving);
        assert_eq!(status.sync_counter(), 1);

        status.on_mutation_resolved();
        assert!(status.is_synced());
        assert_eq!(status.sync_counter(), 0);
    }

    #[test]
    fn test_synced_only_when_counter_reaches_zero() {
        let mut status = SyncStatus::synced();
        status.on_mutation_enqueued();
        status.on_mutation_enqueued();
        assert_eq!(status.state(), SyncState::Syncing);
        assert_eq!(status.sync_counter(), 2);

        status.on_mutation_resolved();
        assert_eq!(status.state(), SyncState::Syncing);

        status.on_mutation_resolved();
        assert!(status.is_synced());
    }

    #[test]
    fn test_mutation_while_saving_stays_saving() {
        let mut status = SyncStatus::new_local();
        status.on_mutation_enqueued();
        status.on_mutation_enqueued();
        assert_eq!(status.state(), SyncState::Saving);
        assert_eq!(status.sync_counter(), 2);
    }

    #[test]
    fn test_loading_resolves_to_synced() {
        let mut status = SyncStatus::loading();
        assert_eq!(status.state(), SyncState::Loading);
        status.on_loaded();
        assert!(status.is_synced());
    }
}
