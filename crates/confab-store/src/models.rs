//! Domain model structs held in the entity cache.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be
//! hydrated straight from server payloads and handed to the embedding
//! application. Sync lifecycle state is local-only and never crosses
//! the wire.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use confab_shared::ids::{EntityId, EntityKind};

use crate::state::SyncStatus;

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A participant identity as the server reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BasicUser {
    pub user_id: String,
    /// Optional human-readable display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A conversation between a set of participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: EntityId,
    /// User ids of every participant, including the current user.
    pub participants: Vec<String>,
    /// Whether the conversation is constrained to be unique for its
    /// participant set.
    #[serde(default)]
    pub distinct: bool,
    /// Application-defined key/value metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    /// Most recent message, maintained by the server and by local
    /// sends; drives the last-message sort order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(skip)]
    pub sync: SyncStatus,
}

impl Conversation {
    /// Build a NEW conversation with a temporary id, pending creation
    /// on the server.
    pub fn new_local(participants: Vec<String>, distinct: bool, metadata: Map<String, Value>) -> Self {
        Self {
            id: EntityId::temporary(EntityKind::Conversation),
            participants,
            distinct,
            metadata,
            created_at: Utc::now(),
            last_message_id: None,
            last_message_at: None,
            unread_count: 0,
            sync: SyncStatus::new_local(),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Per-recipient delivery progression carried in `recipient_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptState {
    Sent,
    Delivered,
    Read,
}

/// One typed piece of message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePart {
    pub mime_type: String,
    pub body: String,
}

/// A single message within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: EntityId,
    pub conversation_id: EntityId,
    pub sender_id: String,
    pub parts: Vec<MessagePart>,
    pub created_at: DateTime<Utc>,
    /// Server-assigned ordering position within the conversation. Not
    /// guaranteed unique; ties are broken by insertion order.
    #[serde(default)]
    pub position: u64,
    /// Delivery/read state per recipient user id.
    #[serde(default)]
    pub recipient_status: HashMap<String, ReceiptState>,
    /// Whether the current user has read this message.
    #[serde(default)]
    pub is_read: bool,
    #[serde(skip)]
    pub sync: SyncStatus,
}

impl Message {
    /// Build a NEW message with a temporary id, pending its send.
    pub fn new_local(conversation_id: EntityId, sender_id: String, parts: Vec<MessagePart>) -> Self {
        Self {
            id: EntityId::temporary(EntityKind::Message),
            conversation_id,
            sender_id,
            parts,
            created_at: Utc::now(),
            position: 0,
            recipient_status: HashMap::new(),
            // Our own messages never count as unread.
            is_read: true,
            sync: SyncStatus::new_local(),
        }
    }
}
