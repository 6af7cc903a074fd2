//! The ordered, single-flight queue of pending writes.
//!
//! Every local mutation becomes a [`SyncEvent`] on a strict FIFO queue:
//! only the head is ever in flight, and nothing advances until it
//! resolves. Failures are classified per class (offline, flapping
//! connectivity, stuck server, transient 5xx, stale auth, rejected) and
//! each class gets its own recovery policy.
//!
//! [`SyncQueueState`] is the pure core; [`spawn_sync_manager`] wraps it
//! in the driver task that dispatches over REST or the socket, gates on
//! the online watch, and schedules retry backoff.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use confab_net::online::OnlineCommand;
use confab_net::requests::SocketResponse;
use confab_net::rest::{HttpExecutor, HttpMethod, HttpRequest};
use confab_net::socket::SocketCommand;
use confab_shared::backoff::exponential_backoff;
use confab_shared::constants::{
    SYNC_MAX_CONNECTIVITY_FLAPS, SYNC_MAX_RETRIES_408, SYNC_MAX_RETRIES_5XX,
    SYNC_RETRY_MAX_WAIT_SECS,
};
use confab_shared::ids::EntityId;
use confab_shared::TransportFailure;

/// While the tracker still claims online after a network-level failure,
/// wait this long before re-checking instead of spinning on the head.
const SUSPEND_RECHECK_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOperation {
    Create,
    Patch,
    Delete,
    Get,
    Receipt,
}

/// Payload captured at fire time, not enqueue time, so the latest
/// entity state goes on the wire instead of a stale snapshot.
pub enum PayloadSource {
    Fixed(Value),
    Deferred(Box<dyn Fn() -> Value + Send + Sync>),
}

impl PayloadSource {
    pub fn produce(&self) -> Value {
        match self {
            PayloadSource::Fixed(value) => value.clone(),
            PayloadSource::Deferred(producer) => producer(),
        }
    }
}

impl fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadSource::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            PayloadSource::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Request URL, resolvable at fire time (a dependent event's URL may
/// embed an id that is reassigned while it waits in the queue).
pub enum UrlSource {
    Fixed(String),
    Deferred(Box<dyn Fn() -> String + Send + Sync>),
}

impl UrlSource {
    pub fn produce(&self) -> String {
        match self {
            UrlSource::Fixed(url) => url.clone(),
            UrlSource::Deferred(producer) => producer(),
        }
    }
}

impl fmt::Debug for UrlSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlSource::Fixed(url) => f.debug_tuple("Fixed").field(url).finish(),
            UrlSource::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Which wire the event travels on.
#[derive(Debug)]
pub enum EventTransport {
    Rest { method: HttpMethod, url: UrlSource },
    Socket { method: String },
}

/// Outcome delivered to an event's optional reply channel.
#[derive(Debug)]
pub enum SyncOutcome {
    Success(Value),
    Failed(TransportFailure),
}

/// One pending network operation.
#[derive(Debug)]
pub struct SyncEvent {
    pub id: Uuid,
    pub operation: SyncOperation,
    /// Entity this operation acts on.
    pub target: EntityId,
    /// Entity ids whose prior creation this operation requires.
    pub depends: Vec<EntityId>,
    pub transport: EventTransport,
    pub payload: PayloadSource,
    pub reply: Option<oneshot::Sender<SyncOutcome>>,
    firing: bool,
    retry_count: u32,
    flap_count: u32,
    last_url: Option<String>,
}

impl SyncEvent {
    pub fn new(
        operation: SyncOperation,
        target: EntityId,
        transport: EventTransport,
        payload: PayloadSource,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            target,
            depends: Vec::new(),
            transport,
            payload,
            reply: None,
            firing: false,
            retry_count: 0,
            flap_count: 0,
            last_url: None,
        }
    }

    pub fn with_depends(mut self, depends: Vec<EntityId>) -> Self {
        self.depends = depends;
        self
    }

    pub fn with_reply(mut self, reply: oneshot::Sender<SyncOutcome>) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn is_firing(&self) -> bool {
        self.firing
    }

    fn resolve_reply(&mut self, outcome: SyncOutcome) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(outcome);
        }
    }
}

/// Normalized completion of one fire, REST or socket. A network-level
/// failure (nothing reached the server) carries `status == 0`.
#[derive(Debug, Clone)]
pub struct FireResult {
    pub status: u16,
    pub success: bool,
    pub data: Value,
}

/// Everything the driver needs to put the head on the wire, resolved at
/// fire time.
#[derive(Debug)]
pub struct FireDescriptor {
    pub event_id: Uuid,
    pub payload: Value,
    pub dispatch: Dispatch,
}

#[derive(Debug, Clone)]
pub enum Dispatch {
    Rest { method: HttpMethod, url: String },
    Socket { method: String },
}

// ---------------------------------------------------------------------------
// Pure queue core
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum EnqueueOutcome {
    Queued {
        /// The queue was empty, so a fire attempt is due immediately.
        fire_now: bool,
        /// Events invalidated by an enqueued DELETE.
        purged: Vec<SyncEvent>,
    },
    /// The PATCH was dropped: an unfired CREATE for the same target is
    /// still queued and already carries current state.
    DroppedRedundantPatch(SyncEvent),
}

#[derive(Debug)]
pub enum Disposition {
    /// Completion for something no longer at the head; ignore.
    Stale,
    Success(SyncEvent, Value),
    /// Offline; leave the head queued and wait for connectivity.
    Suspend,
    RetryAfter(Duration),
    /// Stale session; the queue pauses on this entry until the app
    /// re-authenticates.
    AuthChallenge { nonce: String },
    Permanent {
        event: SyncEvent,
        failure: TransportFailure,
        /// Dependents of a permanently failed CREATE; they can never
        /// succeed.
        purged: Vec<SyncEvent>,
    },
}

#[derive(Debug, Default)]
pub struct SyncQueueState {
    queue: VecDeque<SyncEvent>,
}

impl SyncQueueState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn head(&self) -> Option<&SyncEvent> {
        self.queue.front()
    }

    /// Add an event, applying the redundancy rules.
    pub fn enqueue(&mut self, event: SyncEvent) -> EnqueueOutcome {
        // Patching something whose creation has not even fired is
        // meaningless; the eventual CREATE carries current state.
        if event.operation == SyncOperation::Patch {
            let redundant = self.queue.iter().any(|queued| {
                queued.operation == SyncOperation::Create
                    && queued.target == event.target
                    && !queued.firing
            });
            if redundant {
                return EnqueueOutcome::DroppedRedundantPatch(event);
            }
        }

        // No point patching something about to be deleted: purge every
        // other queued operation that depends on the deleted target.
        let mut purged = Vec::new();
        if event.operation == SyncOperation::Delete {
            let mut kept = VecDeque::with_capacity(self.queue.len());
            for queued in self.queue.drain(..) {
                if !queued.firing && queued.depends.contains(&event.target) {
                    purged.push(queued);
                } else {
                    kept.push_back(queued);
                }
            }
            self.queue = kept;
        }

        let fire_now = self.queue.is_empty();
        self.queue.push_back(event);
        EnqueueOutcome::Queued { fire_now, purged }
    }

    /// Mark the head as firing and resolve its wire parameters.
    /// Returns `None` while the queue is empty or the head is already
    /// in flight; nothing but the head is ever fired.
    pub fn begin_fire(&mut self) -> Option<FireDescriptor> {
        let head = self.queue.front_mut()?;
        if head.firing {
            return None;
        }
        head.firing = true;
        let payload = head.payload.produce();
        let dispatch = match &head.transport {
            EventTransport::Rest { method, url } => {
                let url = url.produce();
                head.last_url = Some(url.clone());
                Dispatch::Rest {
                    method: *method,
                    url,
                }
            }
            EventTransport::Socket { method } => Dispatch::Socket {
                method: method.clone(),
            },
        };
        Some(FireDescriptor {
            event_id: head.id,
            payload,
            dispatch,
        })
    }

    /// Classify the completion of the in-flight head, in priority
    /// order: network-level failure (offline, or flapping reclassified
    /// as permanent), 408, transient 5xx, stale auth, anything else
    /// rejected.
    pub fn complete_head(&mut self, event_id: Uuid, result: &FireResult) -> Disposition {
        let Some(head) = self.queue.front_mut() else {
            return Disposition::Stale;
        };
        if head.id != event_id || !head.firing {
            return Disposition::Stale;
        }
        head.firing = false;

        if result.success {
            let event = self.queue.pop_front().expect("head checked above");
            return Disposition::Success(event, result.data.clone());
        }

        if result.status == 0 {
            // The request never reached the server. Real disconnects do
            // not flap this fast while a single request is pending; a
            // request that keeps dying while connectivity looks healthy
            // is blocked at the transport (CORS-style), not offline.
            head.flap_count += 1;
            if head.flap_count >= SYNC_MAX_CONNECTIVITY_FLAPS {
                let failure = TransportFailure::new(
                    "cors_error",
                    "request repeatedly failed while the connection appeared healthy",
                );
                return self.fail_head(failure);
            }
            return Disposition::Suspend;
        }

        match result.status {
            408 => {
                head.retry_count += 1;
                if head.retry_count <= SYNC_MAX_RETRIES_408 {
                    Disposition::RetryAfter(exponential_backoff(
                        SYNC_RETRY_MAX_WAIT_SECS,
                        head.retry_count,
                    ))
                } else {
                    // The server answers but never in time: stuck, not
                    // transient.
                    let mut failure = failure_from(result, head.last_url.as_deref());
                    failure.code = "server_stalled".to_string();
                    self.fail_head(failure)
                }
            }
            502 | 503 | 504 => {
                head.retry_count += 1;
                if head.retry_count <= SYNC_MAX_RETRIES_5XX {
                    Disposition::RetryAfter(exponential_backoff(
                        SYNC_RETRY_MAX_WAIT_SECS,
                        head.retry_count,
                    ))
                } else {
                    let failure = failure_from(result, head.last_url.as_deref());
                    self.fail_head(failure)
                }
            }
            401 => match result.data.get("nonce").and_then(Value::as_str) {
                Some(nonce) => Disposition::AuthChallenge {
                    nonce: nonce.to_string(),
                },
                None => {
                    let failure = failure_from(result, head.last_url.as_deref());
                    self.fail_head(failure)
                }
            },
            _ => {
                let failure = failure_from(result, head.last_url.as_deref());
                self.fail_head(failure)
            }
        }
    }

    /// Remove the head as permanently failed. A failed CREATE takes
    /// every queued dependent of its target down with it.
    fn fail_head(&mut self, failure: TransportFailure) -> Disposition {
        let event = self.queue.pop_front().expect("caller verified head");
        let mut purged = Vec::new();
        if event.operation == SyncOperation::Create {
            let mut kept = VecDeque::with_capacity(self.queue.len());
            for queued in self.queue.drain(..) {
                if queued.depends.contains(&event.target) {
                    purged.push(queued);
                } else {
                    kept.push_back(queued);
                }
            }
            self.queue = kept;
        }
        Disposition::Permanent {
            event,
            failure,
            purged,
        }
    }
}

fn failure_from(result: &FireResult, url: Option<&str>) -> TransportFailure {
    let code = result
        .data
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("server_rejected")
        .to_string();
    let message = result
        .data
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("request failed")
        .to_string();
    let mut failure = TransportFailure::new(&code, message).with_status(result.status);
    if let Some(url) = url {
        failure = failure.with_url(url);
    }
    failure
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Commands sent *into* the sync manager task.
#[derive(Debug)]
pub enum QueueCommand {
    Enqueue(SyncEvent),
    /// Attempt to fire the head now (reconnection hook).
    FireHead,
    /// Clear an authentication pause after the app re-authenticated.
    Resume,
}

/// Queue-level notifications for the client bridge.
#[derive(Debug, Clone)]
pub enum QueueNotification {
    Success {
        target: EntityId,
        operation: SyncOperation,
        data: Value,
    },
    Error {
        target: EntityId,
        operation: SyncOperation,
        failure: TransportFailure,
    },
    AuthRequired {
        nonce: String,
    },
}

/// Spawn the sync manager task.
///
/// The queue fires only while `online_rx` reads true; the socket sender
/// in `socket_rx` may appear after authentication. REST outcomes are
/// funneled into the online tracker via `online_tx`.
pub fn spawn_sync_manager(
    executor: Arc<dyn HttpExecutor>,
    socket_rx: watch::Receiver<Option<mpsc::Sender<SocketCommand>>>,
    online_rx: watch::Receiver<bool>,
    online_tx: mpsc::Sender<OnlineCommand>,
    token_rx: watch::Receiver<Option<String>>,
) -> (mpsc::Sender<QueueCommand>, mpsc::Receiver<QueueNotification>) {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<QueueCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<QueueNotification>(256);

    tokio::spawn(async move {
        let mut state = SyncQueueState::new();
        let mut paused = false;
        let mut retry_deadline: Option<Instant> = None;
        let (done_tx, mut done_rx) = mpsc::channel::<(Uuid, FireResult)>(8);
        let mut online_rx = online_rx;

        loop {
            // Fire whenever the head is idle and conditions allow.
            if !paused && retry_deadline.is_none() && *online_rx.borrow() {
                if let Some(descriptor) = state.begin_fire() {
                    dispatch(descriptor, &executor, &socket_rx, &token_rx, &online_tx, &done_tx);
                }
            }

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None => break,
                    Some(QueueCommand::Enqueue(event)) => match state.enqueue(event) {
                        EnqueueOutcome::Queued { purged, .. } => {
                            for event in purged {
                                resolve_cancelled(event, &notif_tx).await;
                            }
                        }
                        EnqueueOutcome::DroppedRedundantPatch(event) => {
                            debug!(
                                target = %event.target,
                                "Dropping patch, unfired create for the target is queued"
                            );
                        }
                    },
                    Some(QueueCommand::FireHead) => {}
                    Some(QueueCommand::Resume) => {
                        paused = false;
                    }
                },
                Some((event_id, result)) = done_rx.recv() => {
                    match state.complete_head(event_id, &result) {
                        Disposition::Stale => {}
                        Disposition::Success(mut event, data) => {
                            info!(target = %event.target, "Sync event succeeded");
                            event.resolve_reply(SyncOutcome::Success(data.clone()));
                            let _ = notif_tx
                                .send(QueueNotification::Success {
                                    target: event.target.clone(),
                                    operation: event.operation,
                                    data,
                                })
                                .await;
                        }
                        Disposition::Suspend => {
                            if *online_rx.borrow() {
                                // The tracker disagrees with what we just
                                // saw; re-check shortly instead of
                                // spinning on the head.
                                retry_deadline = Some(Instant::now() + SUSPEND_RECHECK_DELAY);
                            } else {
                                debug!("Offline, sync queue suspended");
                            }
                        }
                        Disposition::RetryAfter(wait) => {
                            debug!(wait_secs = wait.as_secs_f64(), "Retrying head after backoff");
                            retry_deadline = Some(Instant::now() + wait);
                        }
                        Disposition::AuthChallenge { nonce } => {
                            info!("Session stale, pausing sync queue for re-authentication");
                            paused = true;
                            let _ = notif_tx
                                .send(QueueNotification::AuthRequired { nonce })
                                .await;
                        }
                        Disposition::Permanent { mut event, failure, purged } => {
                            warn!(
                                target = %event.target,
                                code = %failure.code,
                                "Sync event permanently failed"
                            );
                            event.resolve_reply(SyncOutcome::Failed(failure.clone()));
                            let _ = notif_tx
                                .send(QueueNotification::Error {
                                    target: event.target.clone(),
                                    operation: event.operation,
                                    failure,
                                })
                                .await;
                            for dependent in purged {
                                resolve_cancelled(dependent, &notif_tx).await;
                            }
                        }
                    }
                },
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // The loop top fires the head on reconnect.
                },
                _ = tokio::time::sleep_until(
                    retry_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86400))
                ), if retry_deadline.is_some() => {
                    retry_deadline = None;
                }
            }
        }
    });

    (cmd_tx, notif_rx)
}

async fn resolve_cancelled(mut event: SyncEvent, notif_tx: &mpsc::Sender<QueueNotification>) {
    let failure = TransportFailure::new(
        "dependency_failed",
        "a required earlier operation was deleted or failed",
    );
    debug!(target = %event.target, "Purging dependent sync event");
    event.resolve_reply(SyncOutcome::Failed(failure.clone()));
    let _ = notif_tx
        .send(QueueNotification::Error {
            target: event.target.clone(),
            operation: event.operation,
            failure,
        })
        .await;
}

fn dispatch(
    descriptor: FireDescriptor,
    executor: &Arc<dyn HttpExecutor>,
    socket_rx: &watch::Receiver<Option<mpsc::Sender<SocketCommand>>>,
    token_rx: &watch::Receiver<Option<String>>,
    online_tx: &mpsc::Sender<OnlineCommand>,
    done_tx: &mpsc::Sender<(Uuid, FireResult)>,
) {
    let done_tx = done_tx.clone();
    let event_id = descriptor.event_id;
    match descriptor.dispatch {
        Dispatch::Rest { method, url } => {
            let mut request = HttpRequest::new(method, url).json(descriptor.payload);
            if let Some(token) = token_rx.borrow().as_ref() {
                request = request.bearer(token);
            }
            let executor = executor.clone();
            let online_tx = online_tx.clone();
            tokio::spawn(async move {
                let response = executor.execute(request).await;
                let _ = online_tx
                    .send(OnlineCommand::Signal {
                        success: response.status != 0,
                    })
                    .await;
                let _ = done_tx
                    .send((
                        event_id,
                        FireResult {
                            status: response.status,
                            success: response.success,
                            data: response.data,
                        },
                    ))
                    .await;
            });
        }
        Dispatch::Socket { method } => {
            let socket = socket_rx.borrow().clone();
            let payload = descriptor.payload;
            tokio::spawn(async move {
                let result = match socket {
                    Some(socket_tx) => {
                        let (reply_tx, reply_rx) = oneshot::channel();
                        let sent = socket_tx
                            .send(SocketCommand::Request {
                                method,
                                data: payload,
                                reply: reply_tx,
                            })
                            .await;
                        match sent {
                            Ok(()) => match reply_rx.await {
                                Ok(response) => socket_fire_result(response),
                                Err(_) => offline_result(),
                            },
                            Err(_) => offline_result(),
                        }
                    }
                    None => offline_result(),
                };
                let _ = done_tx.send((event_id, result)).await;
            });
        }
    }
}

fn offline_result() -> FireResult {
    FireResult {
        status: 0,
        success: false,
        data: serde_json::json!({"code": "not_connected"}),
    }
}

/// Map a socket reply onto the shared classification scale: a timeout
/// behaves like a stuck server (408), a closed socket like a
/// network-level failure.
fn socket_fire_result(response: SocketResponse) -> FireResult {
    if response.success {
        return FireResult {
            status: 200,
            success: true,
            data: response.data,
        };
    }
    let code = response.data.get("code").and_then(Value::as_str).unwrap_or("");
    let status = match code {
        "not_connected" => 0,
        "request_timeout" => 408,
        _ => response
            .data
            .get("http_status")
            .and_then(Value::as_u64)
            .unwrap_or(500) as u16,
    };
    FireResult {
        status,
        success: false,
        data: response.data,
    }
}
