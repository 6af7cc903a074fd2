//! Query drivers.
//!
//! Wraps the pure [`QueryState`] engine in a task that subscribes to
//! the cache's event stream, reacts differentially, and performs the
//! page fetches the engine asks for. Constructing a query immediately
//! starts filling its window.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use confab_net::rest::{execute_with_retry, HttpExecutor, HttpMethod, HttpRequest};
use confab_shared::ids::{EntityId, EntityKind};
use confab_shared::Result;
use confab_store::{
    CacheEvent, Conversation, EntityCache, EntityRecord, Message, PageRequest, Predicate,
    QueryItem, QueryModel, QueryNotification, QueryState, SortOrder, WindowUpdate,
};

enum QueryControl {
    SetWindow(usize),
    Reconfigure {
        predicate: Option<Predicate>,
        sort: SortOrder,
    },
    Destroy,
}

/// Handle to a live query. Dropping the handle (or calling
/// [`QueryHandle::destroy`]) stops the driver.
pub struct QueryHandle {
    state: Arc<Mutex<QueryState>>,
    notifications: broadcast::Sender<QueryNotification>,
    control_tx: mpsc::Sender<QueryControl>,
}

impl QueryHandle {
    pub fn ids(&self) -> Vec<EntityId> {
        self.state.lock().expect("query lock").ids()
    }

    pub fn items(&self) -> Vec<QueryItem> {
        self.state.lock().expect("query lock").data().to_vec()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("query lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_size(&self) -> usize {
        self.state.lock().expect("query lock").total_size()
    }

    pub fn window(&self) -> usize {
        self.state.lock().expect("query lock").window()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueryNotification> {
        self.notifications.subscribe()
    }

    /// Resize the result window. Shrinking truncates locally and
    /// synchronously; growing triggers a page fetch.
    pub async fn set_pagination_window(&self, window: usize) {
        // Shrink before yielding to the driver so the truncation is
        // observable immediately, with no network round-trip.
        let update = {
            let mut state = self.state.lock().expect("query lock");
            state.set_pagination_window(window)
        };
        match update {
            WindowUpdate::Truncated(notifications) => {
                for notification in notifications {
                    let _ = self.notifications.send(notification);
                }
            }
            WindowUpdate::NeedsFetch => {
                let _ = self.control_tx.send(QueryControl::SetWindow(window)).await;
            }
            WindowUpdate::NoChange => {}
        }
    }

    /// Change the predicate and/or sort order. The window resets to
    /// empty (a reset notification is emitted first) and refetches
    /// from scratch.
    pub async fn reconfigure(&self, predicate: Option<&str>, sort: SortOrder) -> Result<()> {
        let predicate = match predicate {
            Some(raw) => Some(Predicate::parse(raw)?),
            None => None,
        };
        let _ = self
            .control_tx
            .send(QueryControl::Reconfigure { predicate, sort })
            .await;
        Ok(())
    }

    pub async fn destroy(&self) {
        let _ = self.control_tx.send(QueryControl::Destroy).await;
    }
}

pub(crate) struct QueryDeps {
    pub cache: Arc<Mutex<EntityCache>>,
    pub executor: Arc<dyn HttpExecutor>,
    pub rest_url: String,
    pub token_rx: watch::Receiver<Option<String>>,
}

/// Spawn a query driver over an initialized engine state.
pub(crate) fn spawn_query(initial: QueryState, deps: QueryDeps) -> QueryHandle {
    let state = Arc::new(Mutex::new(initial));
    let (notifications, _) = broadcast::channel(256);
    let (control_tx, mut control_rx) = mpsc::channel(16);
    let mut cache_events = deps.cache.lock().expect("cache lock").subscribe();

    let handle = QueryHandle {
        state: state.clone(),
        notifications: notifications.clone(),
        control_tx,
    };

    tokio::spawn(async move {
        fetch_until_full(&state, &deps, &notifications).await;
        loop {
            tokio::select! {
                event = cache_events.recv() => match event {
                    Ok(event) => {
                        handle_cache_event(&state, &deps, &notifications, event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Query fell behind the cache event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                control = control_rx.recv() => match control {
                    Some(QueryControl::SetWindow(_)) => {
                        fetch_until_full(&state, &deps, &notifications).await;
                    }
                    Some(QueryControl::Reconfigure { predicate, sort }) => {
                        let reset = {
                            let mut query = state.lock().expect("query lock");
                            query.reconfigure(predicate, sort)
                        };
                        let _ = notifications.send(reset);
                        fetch_until_full(&state, &deps, &notifications).await;
                    }
                    Some(QueryControl::Destroy) | None => break,
                },
            }
        }
        debug!("Query driver stopped");
    });

    handle
}

/// Look up the changed entity and build the engine's record view.
fn record_for(
    cache: &EntityCache,
    model: QueryModel,
    kind: EntityKind,
    id: &EntityId,
) -> Option<EntityRecord> {
    match (model, kind) {
        (QueryModel::Conversation, EntityKind::Conversation) => {
            cache.get_conversation(id).map(EntityRecord::from)
        }
        (QueryModel::Message, EntityKind::Message) => cache.get_message(id).map(EntityRecord::from),
        _ => None,
    }
}

async fn handle_cache_event(
    state: &Arc<Mutex<QueryState>>,
    deps: &QueryDeps,
    notifications: &broadcast::Sender<QueryNotification>,
    event: CacheEvent,
) {
    let (out, refetch) = {
        let cache = deps.cache.lock().expect("cache lock");
        let mut query = state.lock().expect("query lock");
        match event {
            CacheEvent::Added { kind, id } => {
                match record_for(&cache, query.model(), kind, &id) {
                    Some(record) => (query.apply_add(&record), false),
                    None => (Vec::new(), false),
                }
            }
            CacheEvent::Removed { kind, id } => {
                let model_matches = matches!(
                    (query.model(), kind),
                    (QueryModel::Conversation, EntityKind::Conversation)
                        | (QueryModel::Message, EntityKind::Message)
                );
                if model_matches {
                    (query.apply_remove(&id), false)
                } else {
                    (Vec::new(), false)
                }
            }
            CacheEvent::Changed {
                kind,
                id,
                properties,
                ..
            } => match record_for(&cache, query.model(), kind, &id) {
                Some(record) => (query.apply_change(&record, &properties), false),
                None => (Vec::new(), false),
            },
            CacheEvent::IdReassigned { old_id, new_id, .. } => {
                let (mut out, refetch) = query.apply_id_reassigned(&old_id, &new_id);
                if refetch {
                    out.push(query.reset());
                }
                (out, refetch)
            }
        }
    };
    for notification in out {
        let _ = notifications.send(notification);
    }
    if refetch {
        fetch_until_full(state, deps, notifications).await;
    }
}

/// Page results in until the window is satisfied or the server runs
/// dry.
async fn fetch_until_full(
    state: &Arc<Mutex<QueryState>>,
    deps: &QueryDeps,
    notifications: &broadcast::Sender<QueryNotification>,
) {
    loop {
        let (request, url) = {
            let mut query = state.lock().expect("query lock");
            if query.is_firing() {
                return;
            }
            let Some(request) = query.next_page_request() else {
                return;
            };
            let Some(url) = page_url(&deps.rest_url, &query, &request) else {
                return;
            };
            query.mark_firing();
            (request, url)
        };

        let mut http = HttpRequest::new(HttpMethod::Get, url);
        if let Some(token) = deps.token_rx.borrow().as_ref() {
            http = http.bearer(token);
        }
        let response = execute_with_retry(deps.executor.as_ref(), http).await;
        if !response.success {
            warn!(status = response.status, "Query page fetch failed");
            let mut query = state.lock().expect("query lock");
            query.apply_page(&[], None);
            return;
        }

        let total = response
            .data
            .get("total")
            .and_then(Value::as_u64)
            .map(|total| total as usize);
        let items = response
            .data
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let fetched = items.len();

        // Hydrate into the cache first, then fold records into the
        // window; the engine deduplicates whichever path lands first.
        let records = {
            let mut cache = deps.cache.lock().expect("cache lock");
            let model = state.lock().expect("query lock").model();
            hydrate_page(&mut cache, model, items)
        };
        let out = {
            let mut query = state.lock().expect("query lock");
            query.apply_page(&records, total)
        };
        for notification in out {
            let _ = notifications.send(notification);
        }

        if fetched < request.limit {
            // Server exhausted; a smaller-than-asked page is the end.
            return;
        }
    }
}

fn hydrate_page(cache: &mut EntityCache, model: QueryModel, items: Vec<Value>) -> Vec<EntityRecord> {
    let mut records = Vec::with_capacity(items.len());
    for item in items {
        match model {
            QueryModel::Conversation => match serde_json::from_value::<Conversation>(item) {
                Ok(conversation) => {
                    records.push(EntityRecord::from(&conversation));
                    cache.add_conversation(conversation);
                }
                Err(e) => warn!(error = %e, "Skipping unparseable conversation in page"),
            },
            QueryModel::Message => match serde_json::from_value::<Message>(item) {
                Ok(message) => {
                    records.push(EntityRecord::from(&message));
                    cache.add_message(message);
                }
                Err(e) => warn!(error = %e, "Skipping unparseable message in page"),
            },
        }
    }
    records
}

fn page_url(rest_url: &str, query: &QueryState, request: &PageRequest) -> Option<String> {
    let mut url = match (query.model(), query.predicate()) {
        (QueryModel::Conversation, _) => {
            format!("{rest_url}/conversations?page_size={}", request.limit)
        }
        (QueryModel::Message, Some(Predicate::ConversationId(conversation))) => format!(
            "{rest_url}/conversations/{}/messages?page_size={}",
            conversation.suffix(),
            request.limit
        ),
        (QueryModel::Message, None) => {
            warn!("Message query has no conversation predicate, not fetching");
            return None;
        }
    };
    if let Some(cursor) = &request.cursor {
        url.push_str(&format!("&from_id={}", cursor.suffix()));
    }
    Some(url)
}
