//! Application of server push packets to the entity cache.
//!
//! The socket's `change` frames land here: creates upsert, deletes
//! destroy, patches run through the interpreter. Malformed payloads are
//! logged and dropped, never propagated; a bad packet must not crash
//! the pipeline.

use tracing::{debug, warn};

use confab_shared::ids::{EntityId, EntityKind};
use confab_shared::protocol::{ChangeBody, ChangeOperation, PatchOp};
use confab_store::{BasicUser, Conversation, EntityCache, Message};

/// Whether a patch against an uncached entity warrants fetching the
/// full resource. Conversation patches always do; the only patchable
/// message fields are receipt-related, of no interest to an app that is
/// not already watching that message.
pub fn warrants_fetch(kind: EntityKind) -> bool {
    match kind {
        EntityKind::Conversation => true,
        EntityKind::Message | EntityKind::User => false,
    }
}

/// Apply one push packet.
///
/// Returns the entity to fetch when a patch targeted something not in
/// the cache and the per-type policy says it is worth hydrating.
pub fn apply_change(
    cache: &mut EntityCache,
    change: &ChangeBody,
) -> Option<(EntityKind, EntityId)> {
    let id = match EntityId::parse(&change.object.id) {
        Ok(id) => id,
        Err(e) => {
            warn!(id = %change.object.id, error = %e, "Dropping change with malformed id");
            return None;
        }
    };
    let kind = change.object.kind;

    match change.operation {
        ChangeOperation::Create => {
            apply_create(cache, kind, &id, change);
            None
        }
        ChangeOperation::Delete => {
            // Destroying a cached entity emits `Removed`, on which every
            // observer detaches; an uncached id has nothing to reconcile.
            let existed = match kind {
                EntityKind::Conversation => cache.remove_conversation(&id).is_some(),
                EntityKind::Message => cache.remove_message(&id).is_some(),
                EntityKind::User => false,
            };
            if !existed {
                debug!(%id, "Delete for uncached entity, nothing to do");
            }
            None
        }
        ChangeOperation::Patch => {
            if !cache.contains(kind, &id) {
                if warrants_fetch(kind) {
                    return Some((kind, id));
                }
                debug!(%id, "Patch for uncached entity, not worth fetching");
                return None;
            }
            let ops: Vec<PatchOp> = match serde_json::from_value(change.data.clone()) {
                Ok(ops) => ops,
                Err(e) => {
                    warn!(%id, error = %e, "Dropping unparseable patch packet");
                    return None;
                }
            };
            if let Err(e) = cache.apply_patch(kind, &id, &ops) {
                warn!(%id, error = %e, "Ignoring malformed patch");
            }
            None
        }
    }
}

fn apply_create(cache: &mut EntityCache, kind: EntityKind, id: &EntityId, change: &ChangeBody) {
    match kind {
        EntityKind::Conversation => match serde_json::from_value::<Conversation>(change.data.clone())
        {
            Ok(conversation) => {
                cache.add_conversation(conversation);
            }
            Err(e) => warn!(%id, error = %e, "Dropping unparseable conversation payload"),
        },
        EntityKind::Message => match serde_json::from_value::<Message>(change.data.clone()) {
            Ok(message) => {
                cache.add_message(message);
            }
            Err(e) => warn!(%id, error = %e, "Dropping unparseable message payload"),
        },
        EntityKind::User => match serde_json::from_value::<BasicUser>(change.data.clone()) {
            Ok(user) => {
                cache.add_user(id.clone(), user);
            }
            Err(e) => warn!(%id, error = %e, "Dropping unparseable user payload"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_shared::protocol::ObjectRef;
    use serde_json::json;

    fn change(operation: ChangeOperation, id: &str, kind: EntityKind, data: serde_json::Value) -> ChangeBody {
        ChangeBody {
            operation,
            object: ObjectRef {
                id: id.to_string(),
                kind,
            },
            data,
        }
    }

    fn conversation_payload(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "participants": ["user-a", "user-b"],
            "created_at": "2026-01-05T10:00:00Z",
        })
    }

    #[test]
    fn test_create_upserts_into_cache() {
        let mut cache = EntityCache::new();
        let id = "confab:///conversations/c1";
        apply_change(
            &mut cache,
            &change(
                ChangeOperation::Create,
                id,
                EntityKind::Conversation,
                conversation_payload(id),
            ),
        );
        assert_eq!(cache.conversation_count(), 1);

        // A second create for the same id updates in place.
        let mut payload = conversation_payload(id);
        payload["participants"] = json!(["user-a", "user-b", "user-c"]);
        apply_change(
            &mut cache,
            &change(ChangeOperation::Create, id, EntityKind::Conversation, payload),
        );
        assert_eq!(cache.conversation_count(), 1);
        let parsed = EntityId::parse(id).unwrap();
        assert_eq!(cache.get_conversation(&parsed).unwrap().participants.len(), 3);
    }

    #[test]
    fn test_delete_destroys_and_uncached_delete_is_noop() {
        let mut cache = EntityCache::new();
        let id = "confab:///conversations/c1";
        apply_change(
            &mut cache,
            &change(
                ChangeOperation::Create,
                id,
                EntityKind::Conversation,
                conversation_payload(id),
            ),
        );

        let delete = change(ChangeOperation::Delete, id, EntityKind::Conversation, json!(null));
        apply_change(&mut cache, &delete);
        assert_eq!(cache.conversation_count(), 0);

        // Again: nothing cached, nothing to reconcile.
        assert!(apply_change(&mut cache, &delete).is_none());
    }

    #[test]
    fn test_patch_applies_to_cached_entity() {
        let mut cache = EntityCache::new();
        let id = "confab:///conversations/c1";
        apply_change(
            &mut cache,
            &change(
                ChangeOperation::Create,
                id,
                EntityKind::Conversation,
                conversation_payload(id),
            ),
        );

        let patch = change(
            ChangeOperation::Patch,
            id,
            EntityKind::Conversation,
            json!([{"operation": "set", "property": "metadata.title", "value": "renamed"}]),
        );
        assert!(apply_change(&mut cache, &patch).is_none());
        let parsed = EntityId::parse(id).unwrap();
        assert_eq!(
            cache.get_conversation(&parsed).unwrap().metadata["title"],
            "renamed"
        );
    }

    #[test]
    fn test_uncached_patch_policy_differs_by_kind() {
        let mut cache = EntityCache::new();
        let conversation_patch = change(
            ChangeOperation::Patch,
            "confab:///conversations/ghost",
            EntityKind::Conversation,
            json!([]),
        );
        let fetch = apply_change(&mut cache, &conversation_patch);
        assert_eq!(
            fetch,
            Some((
                EntityKind::Conversation,
                EntityId::parse("confab:///conversations/ghost").unwrap()
            ))
        );

        let message_patch = change(
            ChangeOperation::Patch,
            "confab:///messages/ghost",
            EntityKind::Message,
            json!([]),
        );
        assert!(apply_change(&mut cache, &message_patch).is_none());
    }

    #[test]
    fn test_malformed_patch_never_propagates() {
        let mut cache = EntityCache::new();
        let id = "confab:///conversations/c1";
        apply_change(
            &mut cache,
            &change(
                ChangeOperation::Create,
                id,
                EntityKind::Conversation,
                conversation_payload(id),
            ),
        );

        // Add against a scalar field is an interpreter error; it is
        // swallowed and the entity survives untouched.
        let bad = change(
            ChangeOperation::Patch,
            id,
            EntityKind::Conversation,
            json!([{"operation": "add", "property": "distinct", "value": true}]),
        );
        assert!(apply_change(&mut cache, &bad).is_none());
        let parsed = EntityId::parse(id).unwrap();
        assert!(cache.get_conversation(&parsed).is_some());
        assert!(!cache.is_patching());
    }
}
