//! Bridge loops between the transport/queue tasks and the client's
//! public surface.
//!
//! Each bridge holds only a weak reference to the client, so a
//! destroyed client is never kept alive by its own plumbing; the loops
//! exit on the first failed upgrade.

use std::sync::{Arc, Weak};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use confab_net::online::OnlineNotification;
use confab_net::rest::{execute_with_retry, HttpMethod, HttpRequest};
use confab_net::socket::{SocketCommand, SocketNotification};
use confab_shared::constants::{OUTAGE_RESET_THRESHOLD, TYPING_INDICATOR_INTERVAL};
use confab_shared::ids::{EntityId, EntityKind};
use confab_shared::protocol::{Envelope, Frame, SignalBody, SignalObject, TypingAction, TypingSignal};
use confab_store::{CacheEvent, ChangeSource, Conversation, Message};

use crate::applier;
use crate::events::{ClientEvent, ConversationCreateOutcome};
use crate::sync_queue::{QueueCommand, QueueNotification, SyncOperation};
use crate::typing::TypingListenerState;
use crate::{ClientInner, PendingCreate};

// ---------------------------------------------------------------------------
// Online tracker bridge
// ---------------------------------------------------------------------------

pub(crate) async fn run_online_bridge(
    weak: Weak<ClientInner>,
    mut rx: mpsc::Receiver<OnlineNotification>,
) {
    while let Some(notification) = rx.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        match notification {
            OnlineNotification::Connected { offline_duration } => {
                if offline_duration >= OUTAGE_RESET_THRESHOLD {
                    // Too long gone to replay the stream; pull fresh.
                    debug!(
                        offline_secs = offline_duration.as_secs(),
                        "Long outage ended, resetting socket stream state"
                    );
                    let socket = inner.socket_tx.borrow().clone();
                    if let Some(socket) = socket {
                        let _ = socket.send(SocketCommand::Reset).await;
                    }
                }
                let _ = inner.events.send(ClientEvent::Online { is_online: true });
                let _ = inner.events.send(ClientEvent::Connected { offline_duration });
                // Reconnection hook: anything queued while offline
                // fires now.
                let _ = inner.queue_cmd.send(QueueCommand::FireHead).await;
            }
            OnlineNotification::Disconnected => {
                let _ = inner.events.send(ClientEvent::Online { is_online: false });
                let _ = inner.events.send(ClientEvent::Disconnected);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cache event bridge
// ---------------------------------------------------------------------------

pub(crate) async fn run_cache_bridge(
    weak: Weak<ClientInner>,
    mut rx: broadcast::Receiver<CacheEvent>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Client fell behind the cache event stream");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = weak.upgrade() else { break };
        match event {
            CacheEvent::Added { kind, id } => {
                let event = match kind {
                    EntityKind::Conversation => ClientEvent::ConversationAdded { id },
                    EntityKind::Message => ClientEvent::MessageAdded { id },
                    EntityKind::User => continue,
                };
                let _ = inner.stage.send(event).await;
            }
            CacheEvent::Removed { kind, id } => {
                let event = match kind {
                    EntityKind::Conversation => ClientEvent::ConversationRemoved { id },
                    EntityKind::Message => ClientEvent::MessageRemoved { id },
                    EntityKind::User => continue,
                };
                let _ = inner.stage.send(event).await;
            }
            CacheEvent::Changed {
                kind,
                id,
                properties,
                source,
            } => {
                let event = match kind {
                    EntityKind::Conversation => ClientEvent::ConversationChanged { id, properties },
                    EntityKind::Message => ClientEvent::MessageChanged { id, properties },
                    EntityKind::User => continue,
                };
                match source {
                    // Direct assignments notify immediately; patch
                    // bursts go through the coalescing dispatcher.
                    ChangeSource::Local => {
                        let _ = inner.events.send(event);
                    }
                    ChangeSource::RemotePatch => {
                        let _ = inner.stage.send(event).await;
                    }
                }
            }
            CacheEvent::IdReassigned { old_id, new_id, .. } => {
                let _ = inner
                    .stage
                    .send(ClientEvent::EntityIdChanged { old_id, new_id })
                    .await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sync queue bridge
// ---------------------------------------------------------------------------

pub(crate) async fn run_queue_bridge(
    weak: Weak<ClientInner>,
    mut rx: mpsc::Receiver<QueueNotification>,
) {
    while let Some(notification) = rx.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        match notification {
            QueueNotification::Success {
                target,
                operation,
                data,
            } => handle_queue_success(&inner, target, operation, data).await,
            QueueNotification::Error {
                target,
                operation,
                failure,
            } => {
                resolve_sync_counter(&inner, &target);
                inner
                    .pending_creates
                    .lock()
                    .expect("pending lock")
                    .remove(&target);
                let _ = inner
                    .stage
                    .send(ClientEvent::SyncError {
                        target,
                        operation,
                        failure,
                    })
                    .await;
            }
            QueueNotification::AuthRequired { nonce } => {
                // Stale session: hand the fresh nonce to the app; the
                // queue stays paused on the entry meanwhile.
                let _ = inner.events.send(ClientEvent::Challenge { nonce });
            }
        }
    }
}

async fn handle_queue_success(
    inner: &Arc<ClientInner>,
    target: EntityId,
    operation: SyncOperation,
    data: Value,
) {
    let final_id = match operation {
        SyncOperation::Create => {
            let kind = target.kind();
            let new_id = data
                .get("id")
                .and_then(Value::as_str)
                .and_then(|raw| EntityId::parse(raw).ok());
            let final_id = {
                let mut cache = inner.cache.lock().expect("cache lock");
                let final_id = match new_id {
                    Some(new_id) if new_id != target => {
                        cache.reassign_id(&target, new_id.clone());
                        new_id
                    }
                    Some(new_id) => new_id,
                    None => target.clone(),
                };
                // The response payload is authoritative for the
                // created resource.
                match kind {
                    Some(EntityKind::Conversation) => {
                        if let Ok(mut conversation) =
                            serde_json::from_value::<Conversation>(data.clone())
                        {
                            // Keep optimistic last-message bookkeeping
                            // the server cannot know about yet.
                            if conversation.last_message_id.is_none() {
                                if let Some(existing) = cache.get_conversation(&final_id) {
                                    conversation.last_message_id =
                                        existing.last_message_id.clone();
                                    conversation.last_message_at = existing.last_message_at;
                                }
                            }
                            cache.add_conversation(conversation);
                        }
                        cache.update_conversation(&final_id, |conversation| {
                            conversation.sync.on_mutation_resolved();
                            Vec::new()
                        });
                    }
                    Some(EntityKind::Message) => {
                        if let Ok(message) = serde_json::from_value::<Message>(data.clone()) {
                            cache.add_message(message);
                        }
                        cache.update_message(&final_id, |message| {
                            message.sync.on_mutation_resolved();
                            Vec::new()
                        });
                    }
                    _ => {}
                }
                final_id
            };
            let pending = inner
                .pending_creates
                .lock()
                .expect("pending lock")
                .remove(&target);
            if let Some(pending) = pending {
                if pending.distinct {
                    let outcome = resolve_create_outcome(&pending, &data);
                    let _ = inner
                        .stage
                        .send(ClientEvent::ConversationResolved {
                            id: final_id.clone(),
                            outcome,
                        })
                        .await;
                }
            }
            final_id
        }
        // The entity was already removed locally; nothing to resolve.
        SyncOperation::Delete => target,
        _ => {
            resolve_sync_counter(inner, &target);
            target
        }
    };
    let _ = inner
        .stage
        .send(ClientEvent::SyncSuccess {
            target: final_id,
            operation,
        })
        .await;
}

fn resolve_sync_counter(inner: &Arc<ClientInner>, target: &EntityId) {
    let mut cache = inner.cache.lock().expect("cache lock");
    match target.kind() {
        Some(EntityKind::Conversation) => {
            cache.update_conversation(target, |conversation| {
                conversation.sync.on_mutation_resolved();
                Vec::new()
            });
        }
        Some(EntityKind::Message) => {
            cache.update_message(target, |message| {
                message.sync.on_mutation_resolved();
                Vec::new()
            });
        }
        _ => {}
    }
}

/// How a distinct-conversation create resolved.
///
/// The server's `found` marker is authoritative when present. Without
/// it we fall back to a documented-as-fuzzy heuristic: an existing
/// conversation has usually seen traffic, so the absence of a last
/// message implies the conversation is new.
fn resolve_create_outcome(pending: &PendingCreate, data: &Value) -> ConversationCreateOutcome {
    let found = match data.get("found").and_then(Value::as_bool) {
        Some(found) => found,
        None => {
            data.get("last_message_id").is_some_and(|v| !v.is_null())
                || data.get("last_message_at").is_some_and(|v| !v.is_null())
        }
    };
    if !found {
        return ConversationCreateOutcome::Created;
    }
    let metadata_matches = match data.get("metadata") {
        Some(server) => *server == Value::Object(pending.metadata.clone()),
        None => pending.metadata.is_empty(),
    };
    if metadata_matches {
        ConversationCreateOutcome::FoundExisting
    } else {
        ConversationCreateOutcome::FoundWithoutRequestedMetadata
    }
}

// ---------------------------------------------------------------------------
// Socket bridge
// ---------------------------------------------------------------------------

pub(crate) async fn run_socket_bridge(
    weak: Weak<ClientInner>,
    mut rx: mpsc::Receiver<SocketNotification>,
) {
    let mut listener = TypingListenerState::new();
    let mut ticker = tokio::time::interval(TYPING_INDICATOR_INTERVAL);

    loop {
        tokio::select! {
            notification = rx.recv() => {
                let Some(notification) = notification else { break };
                let Some(inner) = weak.upgrade() else { break };
                match notification {
                    SocketNotification::Connected | SocketNotification::Disconnected => {}
                    SocketNotification::Synced => {
                        let _ = inner.events.send(ClientEvent::Synced);
                    }
                    SocketNotification::Change(change) => {
                        let fetch = {
                            let mut cache = inner.cache.lock().expect("cache lock");
                            applier::apply_change(&mut cache, &change)
                        };
                        if let Some((kind, id)) = fetch {
                            fetch_resource(&inner, kind, &id).await;
                        }
                    }
                    SocketNotification::Signal(SignalBody::TypingIndicator { object, data }) => {
                        let Ok(conversation_id) = EntityId::parse(&object.id) else {
                            continue;
                        };
                        let changed = listener.on_signal(
                            &conversation_id,
                            &data.user_id,
                            data.action,
                            Instant::now(),
                        );
                        if changed {
                            emit_typing_rollup(&inner, &listener, conversation_id);
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                let Some(inner) = weak.upgrade() else { break };
                let now = Instant::now();

                // Degrade our own silent conversations and broadcast
                // the transitions.
                let transitions = inner
                    .typing_publisher
                    .lock()
                    .expect("typing lock")
                    .tick(now);
                if !transitions.is_empty() {
                    let user_id = inner
                        .session_state
                        .lock()
                        .expect("session lock")
                        .as_ref()
                        .map(|blob| blob.user_id.clone());
                    let socket = inner.socket_tx.borrow().clone();
                    if let (Some(user_id), Some(socket)) = (user_id, socket) {
                        for (conversation_id, action) in transitions {
                            let envelope = typing_envelope(&conversation_id, action, &user_id);
                            let _ = socket.send(SocketCommand::Send(envelope)).await;
                        }
                    }
                }

                // Expire remote users who went silent.
                for conversation_id in listener.sweep(now) {
                    emit_typing_rollup(&inner, &listener, conversation_id);
                }
            }
        }
    }
}

fn emit_typing_rollup(
    inner: &Arc<ClientInner>,
    listener: &TypingListenerState,
    conversation_id: EntityId,
) {
    let rollup = listener.rollup(&conversation_id);
    let _ = inner.events.send(ClientEvent::TypingIndicator {
        conversation_id,
        typing: rollup.typing,
        paused: rollup.paused,
    });
}

pub(crate) fn typing_envelope(
    conversation_id: &EntityId,
    action: TypingAction,
    user_id: &str,
) -> Envelope {
    Envelope::client(Frame::Signal(SignalBody::TypingIndicator {
        object: SignalObject {
            id: conversation_id.to_string(),
        },
        data: TypingSignal {
            action,
            user_id: user_id.to_string(),
        },
    }))
}

/// Hydrate an uncached entity a patch deemed worth fetching.
async fn fetch_resource(inner: &Arc<ClientInner>, kind: EntityKind, id: &EntityId) {
    let url = match kind {
        EntityKind::Conversation => {
            format!("{}/conversations/{}", inner.config.rest_url, id.suffix())
        }
        EntityKind::Message => format!("{}/messages/{}", inner.config.rest_url, id.suffix()),
        EntityKind::User => return,
    };
    let mut request = HttpRequest::new(HttpMethod::Get, url);
    let token = inner.token_rx.borrow().clone();
    if let Some(token) = token {
        request = request.bearer(&token);
    }
    let response = execute_with_retry(inner.executor.as_ref(), request).await;
    if !response.success {
        debug!(%id, status = response.status, "Fetch for patched uncached entity failed");
        return;
    }
    let mut cache = inner.cache.lock().expect("cache lock");
    match kind {
        EntityKind::Conversation => {
            if let Ok(conversation) = serde_json::from_value::<Conversation>(response.data) {
                cache.add_conversation(conversation);
            }
        }
        EntityKind::Message => {
            if let Ok(message) = serde_json::from_value::<Message>(response.data) {
                cache.add_message(message);
            }
        }
        EntityKind::User => {}
    }
}
