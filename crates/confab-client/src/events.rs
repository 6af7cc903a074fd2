//! The client's public event surface.
//!
//! The embedding application observes everything, including failures,
//! through this closed set of events; there is no default console or
//! alert behavior. Subscription is by channel, so there is no event
//! name to misspell.

use std::time::Duration;

use confab_shared::ids::EntityId;
use confab_shared::TransportFailure;

use crate::sync_queue::SyncOperation;

/// How a distinct-conversation create resolved on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationCreateOutcome {
    /// A new conversation was created.
    Created,
    /// An existing conversation for the participant set was returned.
    FoundExisting,
    /// An existing conversation was returned but its metadata does not
    /// match what the create requested.
    FoundWithoutRequestedMetadata,
}

/// Everything the embedding application can observe.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connectivity returned after an outage of the given duration.
    Connected { offline_duration: Duration },
    Disconnected,
    /// Current value of the online boolean, on every transition.
    Online { is_online: bool },
    /// The server issued an authentication nonce; answer with
    /// `answer_challenge`.
    Challenge { nonce: String },
    Authenticated { user_id: String },
    /// Session, socket and queue are all up.
    Ready,
    Deauthenticated,
    /// A session-flow request failed.
    AuthFailed { failure: TransportFailure },
    /// The event stream is caught up after a replay.
    Synced,

    ConversationAdded {
        id: EntityId,
    },
    ConversationRemoved {
        id: EntityId,
    },
    ConversationChanged {
        id: EntityId,
        properties: Vec<String>,
    },
    MessageAdded {
        id: EntityId,
    },
    MessageRemoved {
        id: EntityId,
    },
    MessageChanged {
        id: EntityId,
        properties: Vec<String>,
    },
    /// A temporary id was reconciled to its server id.
    EntityIdChanged {
        old_id: EntityId,
        new_id: EntityId,
    },

    /// A queued operation reached the server (the `sent` family).
    SyncSuccess {
        target: EntityId,
        operation: SyncOperation,
    },
    /// A queued operation permanently failed (the `sent-error` family).
    SyncError {
        target: EntityId,
        operation: SyncOperation,
        failure: TransportFailure,
    },

    /// How a distinct-conversation create resolved.
    ConversationResolved {
        id: EntityId,
        outcome: ConversationCreateOutcome,
    },

    /// Current typing rollup for a conversation.
    TypingIndicator {
        conversation_id: EntityId,
        typing: Vec<String>,
        paused: Vec<String>,
    },
}
