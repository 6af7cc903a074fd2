//! # confab-client
//!
//! The client layer of the Confab SDK: one [`Client`] per application
//! id owns the entity cache, the sync queue, the socket and the online
//! tracker, wires their notification streams together, and exposes the
//! conversation/message API plus a single broadcast event surface to
//! the embedding application.
//!
//! Everything network-shaped runs in background tasks; `Client` methods
//! validate synchronously, mutate the cache, enqueue work, and return.
//! Failures surface through [`ClientEvent`]s carrying structured error
//! objects, never through panics or default logging side effects.

pub mod applier;
pub mod batch;
pub mod events;
pub mod queries;
pub mod registry;
pub mod session;
pub mod sync_queue;
pub mod typing;

mod bridge;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use confab_net::online::{spawn_online_monitor, OnlineCommand};
use confab_net::rest::{
    execute_with_retry, HttpExecutor, HttpMethod, HttpRequest, RestProbe, RestTransport,
};
use confab_net::socket::{spawn_socket, SocketCommand, SocketConfig};
use confab_shared::constants::DEFAULT_PAGINATION_WINDOW;
use confab_shared::ids::EntityId;
use confab_shared::protocol::{methods, TypingAction};
use confab_shared::{ConfabError, Result};
use confab_store::{
    Conversation, DataMode, EntityCache, Message, MessagePart, Predicate, QueryModel, QueryState,
    SortOrder,
};

use crate::queries::QueryDeps;
use crate::registry::Registry;
use crate::session::{MemorySessionStore, SessionBlob, SessionManager, SessionStore};
use crate::sync_queue::{
    spawn_sync_manager, EventTransport, PayloadSource, QueueCommand, SyncEvent, SyncOperation,
    UrlSource,
};
use crate::typing::TypingPublisherState;

pub use crate::events::{ClientEvent, ConversationCreateOutcome};
pub use crate::queries::QueryHandle;
pub use crate::sync_queue::SyncOutcome;

/// Registry of live clients keyed by application id.
pub type ClientRegistry = Registry<ClientInner>;

/// Install a tracing subscriber honoring `RUST_LOG`, with sensible
/// per-crate defaults. Opt-in; embedding applications that configure
/// their own subscriber skip this.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("confab_client=debug,confab_net=debug,confab_store=info,warn")
    });
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}

/// Connection endpoints and identity of one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub app_id: String,
    /// REST base URL, e.g. `https://api.example.com`.
    pub rest_url: String,
    /// WebSocket endpoint, e.g. `wss://socket.example.com/ws`.
    pub socket_url: String,
}

/// What a pending distinct-create asked for, kept until its response
/// resolves so the outcome can be classified.
pub(crate) struct PendingCreate {
    pub distinct: bool,
    pub metadata: Map<String, Value>,
}

/// Shared state behind a [`Client`]. Background tasks hold this only
/// weakly; destroying the client tears everything down.
pub struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) executor: Arc<dyn HttpExecutor>,
    pub(crate) cache: Arc<Mutex<EntityCache>>,
    pub(crate) session: SessionManager,
    pub(crate) session_state: Mutex<Option<SessionBlob>>,
    pub(crate) token_tx: watch::Sender<Option<String>>,
    pub(crate) token_rx: watch::Receiver<Option<String>>,
    pub(crate) online_cmd: mpsc::Sender<OnlineCommand>,
    pub(crate) online_watch: watch::Receiver<bool>,
    pub(crate) socket_tx: watch::Sender<Option<mpsc::Sender<SocketCommand>>>,
    pub(crate) queue_cmd: mpsc::Sender<QueueCommand>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) stage: mpsc::Sender<ClientEvent>,
    pub(crate) typing_publisher: Mutex<TypingPublisherState>,
    pub(crate) pending_creates: Mutex<HashMap<EntityId, PendingCreate>>,
    pub(crate) user_id: Mutex<Option<String>>,
    pub(crate) destroyed: AtomicBool,
}

pub struct Client {
    inner: Arc<ClientInner>,
    registry: Arc<ClientRegistry>,
}

impl Client {
    /// Build a client with production transports and an in-memory
    /// session store.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(RestTransport::new()),
            Arc::new(MemorySessionStore::new()),
            Arc::new(ClientRegistry::new()),
        )
    }

    /// Build a client with every collaborator injected.
    pub fn with_parts(
        config: ClientConfig,
        executor: Arc<dyn HttpExecutor>,
        session_store: Arc<dyn SessionStore>,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let stage = batch::spawn_dispatcher(events.clone());

        // The nonce endpoint doubles as the connectivity probe.
        let probe = Arc::new(RestProbe::new(
            executor.clone(),
            format!("{}/nonces", config.rest_url),
        ));
        let (online_cmd, online_notif_rx, online_watch) = spawn_online_monitor(probe);

        let (socket_tx, socket_rx) = watch::channel(None);
        let (token_tx, token_rx) = watch::channel(None);
        let (queue_cmd, queue_notif_rx) = spawn_sync_manager(
            executor.clone(),
            socket_rx,
            online_watch.clone(),
            online_cmd.clone(),
            token_rx.clone(),
        );

        let cache = Arc::new(Mutex::new(EntityCache::new()));
        let cache_events = cache.lock().expect("cache lock").subscribe();
        let session = SessionManager::new(session_store, &config.app_id);

        let inner = Arc::new(ClientInner {
            config,
            executor,
            cache,
            session,
            session_state: Mutex::new(None),
            token_tx,
            token_rx,
            online_cmd,
            online_watch,
            socket_tx,
            queue_cmd,
            events,
            stage,
            typing_publisher: Mutex::new(TypingPublisherState::new()),
            pending_creates: Mutex::new(HashMap::new()),
            user_id: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        registry.register(&inner.config.app_id, &inner);
        tokio::spawn(bridge::run_online_bridge(
            Arc::downgrade(&inner),
            online_notif_rx,
        ));
        tokio::spawn(bridge::run_queue_bridge(
            Arc::downgrade(&inner),
            queue_notif_rx,
        ));
        tokio::spawn(bridge::run_cache_bridge(
            Arc::downgrade(&inner),
            cache_events,
        ));

        Self { inner, registry }
    }

    pub fn app_id(&self) -> &str {
        &self.inner.config.app_id
    }

    /// Subscribe to the public event surface.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online_watch.borrow()
    }

    /// Issue a connectivity probe now and report the resulting state.
    pub async fn check_online_status(&self) -> bool {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        if self
            .inner
            .online_cmd
            .send(OnlineCommand::CheckNow(reply_tx))
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Feed an advisory environment hint (an OS network-change
    /// notification, say). Triggers an immediate re-probe; never sets
    /// the online state directly.
    pub async fn environment_hint(&self) {
        let _ = self
            .inner
            .online_cmd
            .send(OnlineCommand::EnvironmentHint)
            .await;
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Begin a session for a user: restores a persisted session when
    /// one exists, otherwise requests a nonce and emits `Challenge`.
    pub async fn connect(&self, user_id: &str) -> Result<()> {
        self.ensure_alive()?;
        let _ = self.inner.online_cmd.send(OnlineCommand::Start).await;
        *self.inner.user_id.lock().expect("user lock") = Some(user_id.to_string());

        if let Some(blob) = self.inner.session.restore() {
            if blob.user_id == user_id {
                info!("Restoring persisted session, skipping challenge");
                self.establish_session(blob).await;
                return Ok(());
            }
            // A different user's session is useless here.
            self.inner.session.clear();
        }

        let url = format!("{}/nonces", self.inner.config.rest_url);
        let response = execute_with_retry(
            self.inner.executor.as_ref(),
            HttpRequest::new(HttpMethod::Post, url.clone()),
        )
        .await;
        let _ = self
            .inner
            .online_cmd
            .send(OnlineCommand::Signal {
                success: response.status != 0,
            })
            .await;
        if response.success {
            let nonce = response
                .data
                .get("nonce")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let _ = self.inner.events.send(ClientEvent::Challenge { nonce });
        } else {
            let _ = self.inner.events.send(ClientEvent::AuthFailed {
                failure: response.failure(&url),
            });
        }
        Ok(())
    }

    /// Exchange an identity token for a session. Also answers the
    /// re-authentication challenge a stale session raises mid-queue.
    pub async fn answer_challenge(&self, identity_token: &str) -> Result<()> {
        self.ensure_alive()?;
        let user_id = self
            .inner
            .user_id
            .lock()
            .expect("user lock")
            .clone()
            .ok_or(ConfabError::MissingField("user_id"))?;

        let url = format!("{}/sessions", self.inner.config.rest_url);
        let body = json!({
            "identity_token": identity_token,
            "app_id": self.inner.config.app_id,
            "user_id": user_id,
        });
        let response = execute_with_retry(
            self.inner.executor.as_ref(),
            HttpRequest::new(HttpMethod::Post, url.clone()).json(body),
        )
        .await;
        let _ = self
            .inner
            .online_cmd
            .send(OnlineCommand::Signal {
                success: response.status != 0,
            })
            .await;

        if !response.success {
            let _ = self.inner.events.send(ClientEvent::AuthFailed {
                failure: response.failure(&url),
            });
            return Ok(());
        }
        let Some(session_token) = response.data.get("session_token").and_then(Value::as_str)
        else {
            let _ = self.inner.events.send(ClientEvent::AuthFailed {
                failure: confab_shared::TransportFailure::new(
                    "malformed_response",
                    "session response carried no token",
                )
                .with_url(&url),
            });
            return Ok(());
        };

        let blob = SessionBlob {
            session_token: session_token.to_string(),
            user_id,
        };
        self.inner.session.persist(&blob);
        self.establish_session(blob).await;
        Ok(())
    }

    /// Bring up socket and queue under an established session.
    async fn establish_session(&self, blob: SessionBlob) {
        let user_id = blob.user_id.clone();
        let token = blob.session_token.clone();
        *self.inner.session_state.lock().expect("session lock") = Some(blob);
        let _ = self.inner.token_tx.send(Some(token.clone()));
        let _ = self
            .inner
            .events
            .send(ClientEvent::Authenticated { user_id });

        // Replace any previous socket with one carrying the fresh
        // credential.
        let previous = self.inner.socket_tx.borrow().clone();
        if let Some(previous) = previous {
            let _ = previous.send(SocketCommand::Close).await;
        }
        let (socket_cmd, socket_notif_rx) = spawn_socket(
            SocketConfig {
                url: self.inner.config.socket_url.clone(),
                session_token: token,
            },
            self.inner.online_cmd.clone(),
        );
        let _ = socket_cmd.send(SocketCommand::Connect).await;
        let _ = self.inner.socket_tx.send(Some(socket_cmd));
        tokio::spawn(bridge::run_socket_bridge(
            Arc::downgrade(&self.inner),
            socket_notif_rx,
        ));

        // A queue paused on a stale-auth entry can move again.
        let _ = self.inner.queue_cmd.send(QueueCommand::Resume).await;
        let _ = self.inner.queue_cmd.send(QueueCommand::FireHead).await;
        let _ = self.inner.events.send(ClientEvent::Ready);
    }

    /// Clear the session and tear down the transports.
    pub async fn logout(&self) {
        self.inner.session.clear();
        *self.inner.session_state.lock().expect("session lock") = None;
        *self.inner.user_id.lock().expect("user lock") = None;
        let _ = self.inner.token_tx.send(None);
        let socket = self.inner.socket_tx.borrow().clone();
        if let Some(socket) = socket {
            let _ = socket.send(SocketCommand::Close).await;
        }
        let _ = self.inner.socket_tx.send(None);
        let _ = self.inner.online_cmd.send(OnlineCommand::Stop).await;
        let _ = self.inner.events.send(ClientEvent::Deauthenticated);
    }

    /// Destroy the client: unregister, tear down transports, and
    /// detach every background task (they hold only weak references).
    pub async fn destroy(self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        self.registry.unregister(&self.inner.config.app_id);
        self.logout().await;
    }

    // ------------------------------------------------------------------
    // Conversations and messages
    // ------------------------------------------------------------------

    /// Create a conversation. Returns its temporary id immediately;
    /// the id is reconciled to the server id when the create resolves,
    /// and distinct creates additionally report how they resolved via
    /// `ConversationResolved`.
    pub async fn create_conversation(
        &self,
        participants: Vec<String>,
        distinct: bool,
        metadata: Map<String, Value>,
    ) -> Result<EntityId> {
        self.ensure_alive()?;
        self.current_user()?;
        if participants.is_empty() {
            return Err(ConfabError::MissingField("participants"));
        }

        let mut conversation = Conversation::new_local(participants, distinct, metadata.clone());
        conversation.sync.on_mutation_enqueued();
        let id = conversation.id.clone();
        self.inner
            .cache
            .lock()
            .expect("cache lock")
            .add_conversation(conversation);
        self.inner
            .pending_creates
            .lock()
            .expect("pending lock")
            .insert(id.clone(), PendingCreate { distinct, metadata });

        let cache = self.inner.cache.clone();
        let payload_id = id.clone();
        let event = SyncEvent::new(
            SyncOperation::Create,
            id.clone(),
            EventTransport::Rest {
                method: HttpMethod::Post,
                url: UrlSource::Fixed(format!("{}/conversations", self.inner.config.rest_url)),
            },
            PayloadSource::Deferred(Box::new(move || {
                let cache = cache.lock().expect("cache lock");
                match cache.get_conversation(&payload_id) {
                    Some(conversation) => json!({
                        "participants": conversation.participants,
                        "distinct": conversation.distinct,
                        "metadata": conversation.metadata,
                    }),
                    None => Value::Null,
                }
            })),
        );
        self.enqueue(event).await?;
        Ok(id)
    }

    /// Send a message into a conversation. The create depends on the
    /// conversation's own creation while that is still pending.
    pub async fn send_message(
        &self,
        conversation_id: &EntityId,
        parts: Vec<MessagePart>,
    ) -> Result<EntityId> {
        self.ensure_alive()?;
        let user_id = self.current_user()?;
        if parts.is_empty() {
            return Err(ConfabError::MissingField("parts"));
        }

        let (message_id, depends, conversation_key) = {
            let mut cache = self.inner.cache.lock().expect("cache lock");
            let Some(conversation) = cache.get_conversation(conversation_id) else {
                return Err(ConfabError::UnknownEntity(conversation_id.to_string()));
            };
            let conversation_key = conversation.id.clone();
            let depends = if conversation.sync.is_synced() && !conversation_key.is_temporary() {
                Vec::new()
            } else {
                vec![conversation_key.clone()]
            };

            let mut message = Message::new_local(conversation_key.clone(), user_id, parts);
            message.sync.on_mutation_enqueued();
            let message_id = message.id.clone();
            let sent_at = message.created_at;
            cache.add_message(message);
            let last_message_id = message_id.clone();
            cache.update_conversation(&conversation_key, |conversation| {
                conversation.last_message_id = Some(last_message_id);
                conversation.last_message_at = Some(sent_at);
                vec![
                    "last_message_id".to_string(),
                    "last_message_at".to_string(),
                ]
            });
            (message_id, depends, conversation_key)
        };

        let cache = self.inner.cache.clone();
        let payload_id = message_id.clone();
        let event = SyncEvent::new(
            SyncOperation::Create,
            message_id.clone(),
            EventTransport::Rest {
                method: HttpMethod::Post,
                url: self.deferred_conversation_url(&conversation_key, "messages"),
            },
            PayloadSource::Deferred(Box::new(move || {
                let cache = cache.lock().expect("cache lock");
                match cache.get_message(&payload_id) {
                    Some(message) => serde_json::to_value(message).unwrap_or(Value::Null),
                    None => Value::Null,
                }
            })),
        )
        .with_depends(depends);
        self.enqueue(event).await?;
        Ok(message_id)
    }

    pub async fn add_participants(
        &self,
        conversation_id: &EntityId,
        user_ids: Vec<String>,
    ) -> Result<()> {
        self.ensure_alive()?;
        if user_ids.is_empty() {
            return Err(ConfabError::MissingField("participants"));
        }
        let (target, depends) = self.prepare_conversation_patch(conversation_id)?;
        {
            let mut cache = self.inner.cache.lock().expect("cache lock");
            let added = user_ids.clone();
            cache.update_conversation(&target, |conversation| {
                for user in &added {
                    if !conversation.participants.contains(user) {
                        conversation.participants.push(user.clone());
                    }
                }
                vec!["participants".to_string()]
            });
        }
        let ops: Vec<Value> = user_ids
            .iter()
            .map(|user| json!({"operation": "add", "property": "participants", "id": user}))
            .collect();
        let event = SyncEvent::new(
            SyncOperation::Patch,
            target.clone(),
            EventTransport::Rest {
                method: HttpMethod::Patch,
                url: self.deferred_conversation_url(&target, ""),
            },
            PayloadSource::Fixed(Value::Array(ops)),
        )
        .with_depends(depends);
        self.enqueue(event).await
    }

    pub async fn remove_participants(
        &self,
        conversation_id: &EntityId,
        user_ids: Vec<String>,
    ) -> Result<()> {
        self.ensure_alive()?;
        if user_ids.is_empty() {
            return Err(ConfabError::MissingField("participants"));
        }
        let (target, depends) = self.prepare_conversation_patch(conversation_id)?;
        {
            let mut cache = self.inner.cache.lock().expect("cache lock");
            let removed = user_ids.clone();
            cache.update_conversation(&target, |conversation| {
                conversation
                    .participants
                    .retain(|user| !removed.contains(user));
                vec!["participants".to_string()]
            });
        }
        let ops: Vec<Value> = user_ids
            .iter()
            .map(|user| json!({"operation": "remove", "property": "participants", "id": user}))
            .collect();
        let event = SyncEvent::new(
            SyncOperation::Patch,
            target.clone(),
            EventTransport::Rest {
                method: HttpMethod::Patch,
                url: self.deferred_conversation_url(&target, ""),
            },
            PayloadSource::Fixed(Value::Array(ops)),
        )
        .with_depends(depends);
        self.enqueue(event).await
    }

    /// Set metadata keys. The wire payload is produced at fire time so
    /// it carries the latest values, not a snapshot from enqueue time.
    pub async fn set_metadata(
        &self,
        conversation_id: &EntityId,
        entries: Map<String, Value>,
    ) -> Result<()> {
        self.ensure_alive()?;
        if entries.is_empty() {
            return Err(ConfabError::MissingField("metadata"));
        }
        let (target, depends) = self.prepare_conversation_patch(conversation_id)?;
        {
            let mut cache = self.inner.cache.lock().expect("cache lock");
            let merged = entries.clone();
            cache.update_conversation(&target, |conversation| {
                for (key, value) in &merged {
                    conversation.metadata.insert(key.clone(), value.clone());
                }
                vec!["metadata".to_string()]
            });
        }
        let keys: Vec<String> = entries.keys().cloned().collect();
        let cache = self.inner.cache.clone();
        let payload_id = target.clone();
        let event = SyncEvent::new(
            SyncOperation::Patch,
            target.clone(),
            EventTransport::Rest {
                method: HttpMethod::Patch,
                url: self.deferred_conversation_url(&target, ""),
            },
            PayloadSource::Deferred(Box::new(move || {
                let cache = cache.lock().expect("cache lock");
                let ops: Vec<Value> = match cache.get_conversation(&payload_id) {
                    Some(conversation) => keys
                        .iter()
                        .filter_map(|key| {
                            conversation.metadata.get(key).map(|value| {
                                json!({
                                    "operation": "set",
                                    "property": format!("metadata.{key}"),
                                    "value": value,
                                })
                            })
                        })
                        .collect(),
                    None => Vec::new(),
                };
                Value::Array(ops)
            })),
        )
        .with_depends(depends);
        self.enqueue(event).await
    }

    pub async fn delete_metadata(
        &self,
        conversation_id: &EntityId,
        keys: Vec<String>,
    ) -> Result<()> {
        self.ensure_alive()?;
        if keys.is_empty() {
            return Err(ConfabError::MissingField("metadata"));
        }
        let (target, depends) = self.prepare_conversation_patch(conversation_id)?;
        {
            let mut cache = self.inner.cache.lock().expect("cache lock");
            let removed = keys.clone();
            cache.update_conversation(&target, |conversation| {
                for key in &removed {
                    conversation.metadata.remove(key);
                }
                vec!["metadata".to_string()]
            });
        }
        let ops: Vec<Value> = keys
            .iter()
            .map(|key| {
                json!({"operation": "delete", "property": format!("metadata.{key}")})
            })
            .collect();
        let event = SyncEvent::new(
            SyncOperation::Patch,
            target.clone(),
            EventTransport::Rest {
                method: HttpMethod::Patch,
                url: self.deferred_conversation_url(&target, ""),
            },
            PayloadSource::Fixed(Value::Array(ops)),
        )
        .with_depends(depends);
        self.enqueue(event).await
    }

    /// Delete a conversation locally and on the server. Enqueuing the
    /// delete also purges queued operations that depended on it.
    pub async fn delete_conversation(&self, conversation_id: &EntityId) -> Result<()> {
        self.ensure_alive()?;
        let target = {
            let mut cache = self.inner.cache.lock().expect("cache lock");
            let Some(conversation) = cache.get_conversation(conversation_id) else {
                return Err(ConfabError::UnknownEntity(conversation_id.to_string()));
            };
            let target = conversation.id.clone();
            cache.remove_conversation(&target);
            target
        };
        let depends = if target.is_temporary() {
            vec![target.clone()]
        } else {
            Vec::new()
        };
        let event = SyncEvent::new(
            SyncOperation::Delete,
            target.clone(),
            EventTransport::Rest {
                method: HttpMethod::Delete,
                url: self.deferred_conversation_url(&target, ""),
            },
            PayloadSource::Fixed(Value::Null),
        )
        .with_depends(depends);
        self.enqueue(event).await
    }

    pub async fn delete_message(&self, message_id: &EntityId) -> Result<()> {
        self.ensure_alive()?;
        let target = {
            let mut cache = self.inner.cache.lock().expect("cache lock");
            let Some(message) = cache.get_message(message_id) else {
                return Err(ConfabError::UnknownEntity(message_id.to_string()));
            };
            let target = message.id.clone();
            cache.remove_message(&target);
            target
        };
        let depends = if target.is_temporary() {
            vec![target.clone()]
        } else {
            Vec::new()
        };
        let cache = self.inner.cache.clone();
        let rest_url = self.inner.config.rest_url.clone();
        let url_id = target.clone();
        let event = SyncEvent::new(
            SyncOperation::Delete,
            target.clone(),
            EventTransport::Rest {
                method: HttpMethod::Delete,
                url: UrlSource::Deferred(Box::new(move || {
                    let cache = cache.lock().expect("cache lock");
                    let current = cache.resolve_id(&url_id);
                    format!("{rest_url}/messages/{}", current.suffix())
                })),
            },
            PayloadSource::Fixed(Value::Null),
        )
        .with_depends(depends);
        self.enqueue(event).await
    }

    /// Mark a message read: updates unread bookkeeping immediately and
    /// enqueues a receipt over the socket.
    pub async fn mark_read(&self, message_id: &EntityId) -> Result<()> {
        self.ensure_alive()?;
        self.current_user()?;
        let target = {
            let mut cache = self.inner.cache.lock().expect("cache lock");
            let Some(message) = cache.get_message(message_id) else {
                return Err(ConfabError::UnknownEntity(message_id.to_string()));
            };
            if message.is_read {
                return Ok(());
            }
            let target = message.id.clone();
            let conversation_id = message.conversation_id.clone();
            cache.update_message(&target, |message| {
                message.is_read = true;
                message.sync.on_mutation_enqueued();
                vec!["is_read".to_string()]
            });
            cache.update_conversation(&conversation_id, |conversation| {
                if conversation.unread_count > 0 {
                    conversation.unread_count -= 1;
                    vec!["unread_count".to_string()]
                } else {
                    Vec::new()
                }
            });
            target
        };
        let depends = if target.is_temporary() {
            vec![target.clone()]
        } else {
            Vec::new()
        };
        let payload = json!({"message_id": target.as_str(), "receipt_type": "read"});
        let event = SyncEvent::new(
            SyncOperation::Receipt,
            target,
            EventTransport::Socket {
                method: methods::RECEIPT_CREATE.to_string(),
            },
            PayloadSource::Fixed(payload),
        )
        .with_depends(depends);
        self.enqueue(event).await
    }

    /// Publish the user's typing state for a conversation. Redundant
    /// resends are suppressed; silence degrades the state
    /// automatically.
    pub async fn send_typing_state(
        &self,
        conversation_id: &EntityId,
        action: TypingAction,
    ) -> Result<()> {
        self.ensure_alive()?;
        let user_id = self.current_user()?;
        let target = {
            let cache = self.inner.cache.lock().expect("cache lock");
            let Some(conversation) = cache.get_conversation(conversation_id) else {
                return Err(ConfabError::UnknownEntity(conversation_id.to_string()));
            };
            conversation.id.clone()
        };
        let send = self
            .inner
            .typing_publisher
            .lock()
            .expect("typing lock")
            .set_state(&target, action, Instant::now());
        if let Some(action) = send {
            let socket = self.inner.socket_tx.borrow().clone();
            if let Some(socket) = socket {
                let _ = socket
                    .send(SocketCommand::Send(bridge::typing_envelope(
                        &target, action, &user_id,
                    )))
                    .await;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries and lookups
    // ------------------------------------------------------------------

    /// Start a live conversation query; fetching begins immediately.
    pub fn query_conversations(&self, sort: SortOrder, options: QueryOptions) -> QueryHandle {
        let state = QueryState::new(
            QueryModel::Conversation,
            None,
            options.data_mode,
            sort,
            options.window,
        );
        queries::spawn_query(state, self.query_deps())
    }

    /// Start a live message query scoped by a predicate string,
    /// currently `conversation.id = <id>`.
    pub fn query_messages(&self, predicate: &str, options: QueryOptions) -> Result<QueryHandle> {
        let predicate = Predicate::parse(predicate)?;
        let state = QueryState::new(
            QueryModel::Message,
            Some(predicate),
            options.data_mode,
            SortOrder::default_for(QueryModel::Message),
            options.window,
        );
        Ok(queries::spawn_query(state, self.query_deps()))
    }

    pub fn get_conversation(&self, id: &EntityId) -> Option<Conversation> {
        self.inner
            .cache
            .lock()
            .expect("cache lock")
            .get_conversation(id)
            .cloned()
    }

    pub fn get_message(&self, id: &EntityId) -> Option<Message> {
        self.inner
            .cache
            .lock()
            .expect("cache lock")
            .get_message(id)
            .cloned()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn query_deps(&self) -> QueryDeps {
        QueryDeps {
            cache: self.inner.cache.clone(),
            executor: self.inner.executor.clone(),
            rest_url: self.inner.config.rest_url.clone(),
            token_rx: self.inner.token_rx.clone(),
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(ConfabError::ClientDestroyed);
        }
        Ok(())
    }

    fn current_user(&self) -> Result<String> {
        self.inner
            .session_state
            .lock()
            .expect("session lock")
            .as_ref()
            .map(|blob| blob.user_id.clone())
            .ok_or(ConfabError::NotAuthenticated)
    }

    async fn enqueue(&self, event: SyncEvent) -> Result<()> {
        self.inner
            .queue_cmd
            .send(QueueCommand::Enqueue(event))
            .await
            .map_err(|_| ConfabError::ClientDestroyed)
    }

    /// Validate a conversation mutation target and transition its sync
    /// state; patches against a not-yet-created conversation depend on
    /// its create.
    fn prepare_conversation_patch(
        &self,
        conversation_id: &EntityId,
    ) -> Result<(EntityId, Vec<EntityId>)> {
        let mut cache = self.inner.cache.lock().expect("cache lock");
        let Some(conversation) = cache.get_conversation(conversation_id) else {
            return Err(ConfabError::UnknownEntity(conversation_id.to_string()));
        };
        let target = conversation.id.clone();
        let depends = if target.is_temporary() {
            vec![target.clone()]
        } else {
            Vec::new()
        };
        cache.update_conversation(&target, |conversation| {
            conversation.sync.on_mutation_enqueued();
            Vec::new()
        });
        Ok((target, depends))
    }

    /// Build a conversation URL lazily: the id inside is resolved at
    /// fire time, after any temp-to-server reassignment.
    fn deferred_conversation_url(&self, conversation_id: &EntityId, tail: &'static str) -> UrlSource {
        let cache = self.inner.cache.clone();
        let rest_url = self.inner.config.rest_url.clone();
        let id = conversation_id.clone();
        UrlSource::Deferred(Box::new(move || {
            let cache = cache.lock().expect("cache lock");
            let current = cache
                .get_conversation(&id)
                .map(|conversation| conversation.id.clone())
                .unwrap_or_else(|| cache.resolve_id(&id));
            if tail.is_empty() {
                format!("{rest_url}/conversations/{}", current.suffix())
            } else {
                format!("{rest_url}/conversations/{}/{tail}", current.suffix())
            }
        }))
    }
}

/// Result-set shape options for queries.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub data_mode: DataMode,
    pub window: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            data_mode: DataMode::Instance,
            window: DEFAULT_PAGINATION_WINDOW,
        }
    }
}
