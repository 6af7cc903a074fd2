//! # confab-store
//!
//! In-memory entity layer of the Confab SDK: the canonical cache of
//! Conversations, Messages and Users keyed by id, the per-entity sync
//! lifecycle, the generic patch-operation interpreter applied to server
//! pushes, and the live query engine that maintains sorted result
//! windows over the cache.
//!
//! Nothing here touches the network; the cache reacts to whatever the
//! transport layer feeds it and broadcasts typed change events that
//! queries and the embedding application consume.

pub mod cache;
pub mod events;
pub mod models;
pub mod patch;
pub mod query;
pub mod state;

pub use cache::EntityCache;
pub use events::{CacheEvent, ChangeSource};
pub use models::{BasicUser, Conversation, Message, MessagePart, ReceiptState};
pub use query::{
    DataMode, EntityRecord, PageRequest, Predicate, QueryItem, QueryModel, QueryNotification,
    QueryState, SortOrder, WindowUpdate,
};
pub use state::{SyncState, SyncStatus};
