//! Canonical in-memory entity cache.
//!
//! Owns the single authoritative instance of every Conversation,
//! Message and User, keyed by id. All mutation goes through explicit
//! methods that emit [`CacheEvent`]s on a broadcast channel; queries
//! and the client bridge react to that stream.
//!
//! Temporary ids are reconciled to server ids with
//! [`EntityCache::reassign_id`], which rewrites all back-references and
//! keeps the old id resolving for a grace period so in-flight callers
//! holding it are not stranded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use confab_shared::constants::ID_REASSIGNMENT_GRACE;
use confab_shared::ids::{EntityId, EntityKind};
use confab_shared::protocol::PatchOp;

use crate::events::{CacheEvent, ChangeSource};
use crate::models::{BasicUser, Conversation, Message};
use crate::patch::{apply_patch_ops, PatchError, ReentrancyGuard};

struct IdAlias {
    new_id: EntityId,
    recorded_at: Instant,
}

pub struct EntityCache {
    conversations: HashMap<EntityId, Conversation>,
    messages: HashMap<EntityId, Message>,
    users: HashMap<EntityId, BasicUser>,
    /// old id -> reassigned id, honored for a grace period.
    aliases: HashMap<EntityId, IdAlias>,
    /// Raised while the patch interpreter runs, so change observers can
    /// distinguish interpreter-driven updates from direct assignment.
    patching: Arc<AtomicBool>,
    events: broadcast::Sender<CacheEvent>,
}

impl EntityCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            conversations: HashMap::new(),
            messages: HashMap::new(),
            users: HashMap::new(),
            aliases: HashMap::new(),
            patching: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    /// Subscribe to the cache's change-event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Whether the patch interpreter is currently applying a packet.
    pub fn is_patching(&self) -> bool {
        self.patching.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Resolve an id through the alias table. An alias older than the
    /// grace period no longer resolves.
    pub fn resolve_id(&self, id: &EntityId) -> EntityId {
        self.resolve_id_at(id, Instant::now())
    }

    fn resolve_id_at(&self, id: &EntityId, now: Instant) -> EntityId {
        match self.aliases.get(id) {
            Some(alias) if now.duration_since(alias.recorded_at) < ID_REASSIGNMENT_GRACE => {
                alias.new_id.clone()
            }
            _ => id.clone(),
        }
    }

    pub fn get_conversation(&self, id: &EntityId) -> Option<&Conversation> {
        self.conversations.get(&self.resolve_id(id))
    }

    pub fn get_message(&self, id: &EntityId) -> Option<&Message> {
        self.messages.get(&self.resolve_id(id))
    }

    pub fn get_user(&self, id: &EntityId) -> Option<&BasicUser> {
        self.users.get(&self.resolve_id(id))
    }

    pub fn contains(&self, kind: EntityKind, id: &EntityId) -> bool {
        let id = self.resolve_id(id);
        match kind {
            EntityKind::Conversation => self.conversations.contains_key(&id),
            EntityKind::Message => self.messages.contains_key(&id),
            EntityKind::User => self.users.contains_key(&id),
        }
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values()
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    // ------------------------------------------------------------------
    // Upsert / remove
    // ------------------------------------------------------------------

    /// Insert a conversation, or update the cached instance in place if
    /// the id is already present. Returns whether it was newly added.
    pub fn add_conversation(&mut self, conversation: Conversation) -> bool {
        let id = self.resolve_id(&conversation.id);
        match self.conversations.get_mut(&id) {
            Some(existing) => {
                let properties = diff_properties(existing, &conversation);
                let sync = existing.sync;
                *existing = conversation;
                existing.id = id.clone();
                existing.sync = sync;
                self.emit_changed(EntityKind::Conversation, id, properties);
                false
            }
            None => {
                self.conversations.insert(id.clone(), conversation);
                let _ = self.events.send(CacheEvent::Added {
                    kind: EntityKind::Conversation,
                    id,
                });
                true
            }
        }
    }

    /// Insert a message, or update the cached instance in place.
    pub fn add_message(&mut self, message: Message) -> bool {
        let id = self.resolve_id(&message.id);
        match self.messages.get_mut(&id) {
            Some(existing) => {
                let properties = diff_properties(existing, &message);
                let sync = existing.sync;
                *existing = message;
                existing.id = id.clone();
                existing.sync = sync;
                self.emit_changed(EntityKind::Message, id, properties);
                false
            }
            None => {
                self.messages.insert(id.clone(), message);
                let _ = self.events.send(CacheEvent::Added {
                    kind: EntityKind::Message,
                    id,
                });
                true
            }
        }
    }

    pub fn add_user(&mut self, id: EntityId, user: BasicUser) -> bool {
        let added = self.users.insert(id.clone(), user).is_none();
        if added {
            let _ = self.events.send(CacheEvent::Added {
                kind: EntityKind::User,
                id,
            });
        }
        added
    }

    /// Destroy a cached conversation. Observers receive `Removed` and
    /// must drop their references; there is no passive collection of
    /// subscriptions.
    pub fn remove_conversation(&mut self, id: &EntityId) -> Option<Conversation> {
        let id = self.resolve_id(id);
        let removed = self.conversations.remove(&id);
        if removed.is_some() {
            let _ = self.events.send(CacheEvent::Removed {
                kind: EntityKind::Conversation,
                id,
            });
        }
        removed
    }

    pub fn remove_message(&mut self, id: &EntityId) -> Option<Message> {
        let id = self.resolve_id(id);
        let removed = self.messages.remove(&id);
        if removed.is_some() {
            let _ = self.events.send(CacheEvent::Removed {
                kind: EntityKind::Message,
                id,
            });
        }
        removed
    }

    // ------------------------------------------------------------------
    // Controlled mutation
    // ------------------------------------------------------------------

    /// Update a cached conversation through a closure that returns the
    /// property names it changed. Emits one `Changed` event carrying
    /// the current change source.
    pub fn update_conversation<F>(&mut self, id: &EntityId, f: F) -> Option<Vec<String>>
    where
        F: FnOnce(&mut Conversation) -> Vec<String>,
    {
        let id = self.resolve_id(id);
        let conversation = self.conversations.get_mut(&id)?;
        let properties = f(conversation);
        if !properties.is_empty() {
            self.emit_changed(EntityKind::Conversation, id, properties.clone());
        }
        Some(properties)
    }

    /// Update a cached message through a closure; see
    /// [`EntityCache::update_conversation`].
    pub fn update_message<F>(&mut self, id: &EntityId, f: F) -> Option<Vec<String>>
    where
        F: FnOnce(&mut Message) -> Vec<String>,
    {
        let id = self.resolve_id(id);
        let message = self.messages.get_mut(&id)?;
        let properties = f(message);
        if !properties.is_empty() {
            self.emit_changed(EntityKind::Message, id, properties.clone());
        }
        Some(properties)
    }

    /// Run the patch interpreter against a cached entity.
    ///
    /// All ops of the packet are applied before the single `Changed`
    /// event is emitted, so no observer sees a half-updated entity. The
    /// re-entrancy flag is raised for the duration and restored on
    /// every exit path. Patching an uncached entity is a no-op here;
    /// the fetch policy for that case lives with the change applier.
    pub fn apply_patch(
        &mut self,
        kind: EntityKind,
        id: &EntityId,
        ops: &[PatchOp],
    ) -> Result<Vec<String>, PatchError> {
        let id = self.resolve_id(id);
        let _guard = ReentrancyGuard::enter(&self.patching);
        let properties = match kind {
            EntityKind::Conversation => {
                let Some(entity) = self.conversations.get_mut(&id) else {
                    return Ok(Vec::new());
                };
                let sync = entity.sync;
                let mut doc = serde_json::to_value(&*entity)?;
                let properties = apply_patch_ops(&mut doc, ops)?;
                let mut updated: Conversation = serde_json::from_value(doc)?;
                updated.sync = sync;
                *entity = updated;
                properties
            }
            EntityKind::Message => {
                let Some(entity) = self.messages.get_mut(&id) else {
                    return Ok(Vec::new());
                };
                let sync = entity.sync;
                let mut doc = serde_json::to_value(&*entity)?;
                let properties = apply_patch_ops(&mut doc, ops)?;
                let mut updated: Message = serde_json::from_value(doc)?;
                updated.sync = sync;
                *entity = updated;
                properties
            }
            EntityKind::User => Vec::new(),
        };
        if !properties.is_empty() {
            self.emit_changed(kind, id, properties.clone());
        }
        Ok(properties)
    }

    // ------------------------------------------------------------------
    // Id reassignment
    // ------------------------------------------------------------------

    /// Reconcile a temporary id to its server-assigned id.
    ///
    /// Rewrites every back-reference (messages pointing at a renamed
    /// conversation, conversations whose last message was renamed) and
    /// records a grace-period alias so lookups by the old id keep
    /// resolving briefly.
    pub fn reassign_id(&mut self, old_id: &EntityId, new_id: EntityId) -> bool {
        let Some(kind) = old_id.kind() else {
            return false;
        };
        let moved = match kind {
            EntityKind::Conversation => {
                let Some(mut conversation) = self.conversations.remove(old_id) else {
                    return false;
                };
                conversation.id = new_id.clone();
                self.conversations.insert(new_id.clone(), conversation);
                for message in self.messages.values_mut() {
                    if message.conversation_id == *old_id {
                        message.conversation_id = new_id.clone();
                    }
                }
                true
            }
            EntityKind::Message => {
                let Some(mut message) = self.messages.remove(old_id) else {
                    return false;
                };
                message.id = new_id.clone();
                self.messages.insert(new_id.clone(), message);
                for conversation in self.conversations.values_mut() {
                    if conversation.last_message_id.as_ref() == Some(old_id) {
                        conversation.last_message_id = Some(new_id.clone());
                    }
                }
                true
            }
            EntityKind::User => false,
        };
        if moved {
            debug!(old = %old_id, new = %new_id, "Reassigned entity id");
            self.aliases.insert(
                old_id.clone(),
                IdAlias {
                    new_id: new_id.clone(),
                    recorded_at: Instant::now(),
                },
            );
            let _ = self.events.send(CacheEvent::IdReassigned {
                kind,
                old_id: old_id.clone(),
                new_id,
            });
        }
        moved
    }

    /// Drop aliases past the grace period.
    pub fn prune_aliases(&mut self) {
        let now = Instant::now();
        self.aliases
            .retain(|_, alias| now.duration_since(alias.recorded_at) < ID_REASSIGNMENT_GRACE);
    }

    fn emit_changed(&self, kind: EntityKind, id: EntityId, properties: Vec<String>) {
        let source = if self.is_patching() {
            ChangeSource::RemotePatch
        } else {
            ChangeSource::Local
        };
        let _ = self.events.send(CacheEvent::Changed {
            kind,
            id,
            properties,
            source,
        });
    }
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Top-level JSON properties on which two entity snapshots differ.
fn diff_properties<T: serde::Serialize>(old: &T, new: &T) -> Vec<String> {
    let old = serde_json::to_value(old).unwrap_or(Value::Null);
    let new = serde_json::to_value(new).unwrap_or(Value::Null);
    let (Some(old), Some(new)) = (old.as_object(), new.as_object()) else {
        return Vec::new();
    };
    let mut properties: Vec<String> = Vec::new();
    for (key, value) in new {
        if old.get(key) != Some(value) {
            properties.push(key.clone());
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            properties.push(key.clone());
        }
    }
    properties
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessagePart;
    use confab_shared::protocol::PatchVerb;
    use serde_json::json;

    fn conversation(id: &EntityId) -> Conversation {
        let mut conversation = Conversation::new_local(
            vec!["user-a".to_string(), "user-b".to_string()],
            false,
            Default::default(),
        );
        conversation.id = id.clone();
        conversation
    }

    fn message(id: &EntityId, conversation_id: &EntityId) -> Message {
        let mut message = Message::new_local(
            conversation_id.clone(),
            "user-a".to_string(),
            vec![MessagePart {
                mime_type: "text/plain".to_string(),
                body: "hi".to_string(),
            }],
        );
        message.id = id.clone();
        message
    }

    #[test]
    fn test_add_and_remove_emit_events() {
        let mut cache = EntityCache::new();
        let mut events = cache.subscribe();
        let id = EntityId::new(EntityKind::Conversation, "c1");

        assert!(cache.add_conversation(conversation(&id)));
        assert!(matches!(
            events.try_recv().unwrap(),
            CacheEvent::Added { kind: EntityKind::Conversation, .. }
        ));

        assert!(cache.remove_conversation(&id).is_some());
        assert!(matches!(
            events.try_recv().unwrap(),
            CacheEvent::Removed { .. }
        ));
        // Removing again is a no-op with no event.
        assert!(cache.remove_conversation(&id).is_none());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_upsert_reports_differing_properties() {
        let mut cache = EntityCache::new();
        let id = EntityId::new(EntityKind::Conversation, "c1");
        cache.add_conversation(conversation(&id));

        let mut events = cache.subscribe();
        let mut updated = conversation(&id);
        updated.participants.push("user-c".to_string());
        updated.unread_count = 4;
        updated.created_at = cache.get_conversation(&id).unwrap().created_at;

        assert!(!cache.add_conversation(updated));
        match events.try_recv().unwrap() {
            CacheEvent::Changed { properties, .. } => {
                assert!(properties.contains(&"participants".to_string()));
                assert!(properties.contains(&"unread_count".to_string()));
                assert!(!properties.contains(&"created_at".to_string()));
            }
            other => panic!("expected Changed, got {other:?}"),
        }
    }

    #[test]
    fn test_patch_preserves_sync_status_and_sets_source() {
        let mut cache = EntityCache::new();
        let id = EntityId::new(EntityKind::Conversation, "c1");
        let mut entity = conversation(&id);
        entity.sync.on_mutation_enqueued();
        let expected_sync = entity.sync;
        cache.add_conversation(entity);

        let mut events = cache.subscribe();
        let ops = vec![PatchOp {
            operation: PatchVerb::Set,
            property: "metadata.title".to_string(),
            value: Some(json!("renamed")),
            id: None,
        }];
        let properties = cache
            .apply_patch(EntityKind::Conversation, &id, &ops)
            .unwrap();
        assert_eq!(properties, vec!["metadata"]);

        let patched = cache.get_conversation(&id).unwrap();
        assert_eq!(patched.metadata["title"], "renamed");
        assert_eq!(patched.sync, expected_sync);

        match events.try_recv().unwrap() {
            CacheEvent::Changed { source, .. } => {
                assert_eq!(source, ChangeSource::RemotePatch)
            }
            other => panic!("expected Changed, got {other:?}"),
        }
        // Flag restored after interpretation.
        assert!(!cache.is_patching());
    }

    #[test]
    fn test_patch_uncached_entity_is_noop() {
        let mut cache = EntityCache::new();
        let id = EntityId::new(EntityKind::Conversation, "missing");
        let properties = cache
            .apply_patch(EntityKind::Conversation, &id, &[])
            .unwrap();
        assert!(properties.is_empty());
    }

    #[test]
    fn test_reassign_id_rewrites_back_references() {
        let mut cache = EntityCache::new();
        let temp = EntityId::temporary(EntityKind::Conversation);
        let final_id = EntityId::new(EntityKind::Conversation, "c-final");
        cache.add_conversation(conversation(&temp));

        let m1 = EntityId::new(EntityKind::Message, "m1");
        let m2 = EntityId::new(EntityKind::Message, "m2");
        let other_conversation = EntityId::new(EntityKind::Conversation, "c-other");
        cache.add_message(message(&m1, &temp));
        cache.add_message(message(&m2, &other_conversation));

        assert!(cache.reassign_id(&temp, final_id.clone()));

        assert_eq!(cache.get_message(&m1).unwrap().conversation_id, final_id);
        assert_eq!(
            cache.get_message(&m2).unwrap().conversation_id,
            other_conversation
        );
        // The old id still resolves to the same entity within grace.
        let via_alias = cache.get_conversation(&temp).unwrap();
        assert_eq!(via_alias.id, final_id);
    }

    #[test]
    fn test_alias_expires_after_grace_period() {
        let mut cache = EntityCache::new();
        let temp = EntityId::temporary(EntityKind::Conversation);
        let final_id = EntityId::new(EntityKind::Conversation, "c-final");
        cache.add_conversation(conversation(&temp));
        cache.reassign_id(&temp, final_id.clone());

        let now = Instant::now();
        assert_eq!(cache.resolve_id_at(&temp, now), final_id);
        let later = now + ID_REASSIGNMENT_GRACE + std::time::Duration::from_secs(1);
        assert_eq!(cache.resolve_id_at(&temp, later), temp);
    }

    #[test]
    fn test_update_message_emits_local_change() {
        let mut cache = EntityCache::new();
        let conversation_id = EntityId::new(EntityKind::Conversation, "c1");
        let id = EntityId::new(EntityKind::Message, "m1");
        cache.add_message(message(&id, &conversation_id));

        let mut events = cache.subscribe();
        cache.update_message(&id, |message| {
            message.is_read = true;
            vec!["is_read".to_string()]
        });
        match events.try_recv().unwrap() {
            CacheEvent::Changed {
                properties, source, ..
            } => {
                assert_eq!(properties, vec!["is_read"]);
                assert_eq!(source, ChangeSource::Local);
            }
            other => panic!("expected Changed, got {other:?}"),
        }
    }
}
