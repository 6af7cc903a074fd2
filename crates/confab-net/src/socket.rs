//! WebSocket connection management.
//!
//! The socket runs in a dedicated tokio task and talks to the rest of
//! the SDK through typed command and notification channels. The task
//! owns the whole connection lifecycle: dialing with an open timeout,
//! heartbeat probing, counter-gap detection with the replay protocol,
//! reconnect scheduling with jittered backoff, and the pending-request
//! correlation table.
//!
//! Every transport outcome, good or bad, is funneled into the online
//! tracker's command channel so connectivity state is derived in one
//! place.

use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use confab_shared::backoff::exponential_backoff;
use confab_shared::constants::{
    MAX_RECONNECT_WAIT_SECS, SOCKET_HEARTBEAT_INTERVAL, SOCKET_OPEN_TIMEOUT,
    SOCKET_REQUEST_TIMEOUT, SOCKET_SWEEP_INTERVAL,
};
use confab_shared::protocol::{methods, ChangeBody, Envelope, Frame, ReplayRequest, SignalBody};

use crate::cursor::{CursorAction, ReplayOutcome, StreamCursor};
use crate::online::OnlineCommand;
use crate::requests::{PendingRequests, SocketResponse};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// WebSocket endpoint, `ws://` or `wss://`.
    pub url: String,
    /// Session credential embedded in the connection URL.
    pub session_token: String,
}

impl SocketConfig {
    fn connect_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.url)?;
        url.query_pairs_mut()
            .append_pair("session_token", &self.session_token);
        Ok(url)
    }
}

/// Commands sent *into* the socket task.
pub enum SocketCommand {
    /// Open (or re-open) the connection.
    Connect,
    /// Tear the connection down; no reconnect is scheduled.
    Close,
    /// Fire-and-forget envelope; dropped with a warning while closed.
    Send(Envelope),
    /// Request expecting a correlated response. While closed the reply
    /// resolves immediately with a not-connected failure.
    Request {
        method: String,
        data: Value,
        reply: oneshot::Sender<SocketResponse>,
    },
    /// Discard counter/timestamp/replay state after a long outage.
    /// Consumers must pull fresh data rather than resume the stream.
    Reset,
}

/// Notifications sent *from* the socket task.
#[derive(Debug, Clone)]
pub enum SocketNotification {
    Connected,
    Disconnected,
    /// A replay completed with nothing further pending; the event
    /// stream is caught up.
    Synced,
    /// A server push describing one mutation of the object graph.
    Change(ChangeBody),
    /// An ephemeral signal (typing indicator).
    Signal(SignalBody),
}

/// Spawn the socket task.
///
/// Returns the command channel and the notification channel. Transport
/// outcomes are reported to `online_tx` as success/failure signals.
pub fn spawn_socket(
    config: SocketConfig,
    online_tx: mpsc::Sender<OnlineCommand>,
) -> (
    mpsc::Sender<SocketCommand>,
    mpsc::Receiver<SocketNotification>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<SocketCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<SocketNotification>(256);

    let task = SocketTask {
        config,
        cmd_rx,
        notif_tx,
        online_tx,
        cursor: StreamCursor::new(),
        pending: PendingRequests::new(),
        replay: None,
        reconnect_attempts: 0,
        reconnect_deadline: None,
        wants_connection: false,
        last_data_at: None,
    };
    tokio::spawn(task.run());

    (cmd_tx, notif_rx)
}

struct ReplayInFlight {
    request_id: String,
    sent_at: Instant,
}

struct SocketTask {
    config: SocketConfig,
    cmd_rx: mpsc::Receiver<SocketCommand>,
    notif_tx: mpsc::Sender<SocketNotification>,
    online_tx: mpsc::Sender<OnlineCommand>,
    cursor: StreamCursor,
    pending: PendingRequests,
    /// The wire request carrying the current replay, tracked outside
    /// the pending table so its response is intercepted by the loop.
    replay: Option<ReplayInFlight>,
    reconnect_attempts: u32,
    reconnect_deadline: Option<tokio::time::Instant>,
    wants_connection: bool,
    last_data_at: Option<Instant>,
}

impl SocketTask {
    async fn run(mut self) {
        loop {
            if !self.wants_connection {
                match self.cmd_rx.recv().await {
                    Some(cmd) => self.handle_closed_command(cmd),
                    None => return,
                }
                continue;
            }

            // Honor the reconnect backoff before dialing, while still
            // servicing commands (a Close must cancel the attempt).
            if let Some(deadline) = self.reconnect_deadline.take() {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => break,
                        cmd = self.cmd_rx.recv() => match cmd {
                            Some(cmd) => {
                                self.handle_closed_command(cmd);
                                if !self.wants_connection {
                                    break;
                                }
                            }
                            None => return,
                        },
                    }
                }
                if !self.wants_connection {
                    continue;
                }
            }

            match self.open_connection().await {
                Some(ws) => {
                    self.reconnect_attempts = 0;
                    let _ = self
                        .online_tx
                        .send(OnlineCommand::Signal { success: true })
                        .await;
                    let _ = self.notif_tx.send(SocketNotification::Connected).await;
                    if self.drive(ws).await {
                        self.schedule_reconnect();
                    }
                }
                None => {
                    if self.wants_connection {
                        self.schedule_reconnect();
                    }
                }
            }
        }
    }

    /// Dial the endpoint, forcing the error path if the attempt neither
    /// opens nor errors within [`SOCKET_OPEN_TIMEOUT`].
    async fn open_connection(&mut self) -> Option<WsStream> {
        let url = match self.config.connect_url() {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Invalid socket URL, giving up");
                self.wants_connection = false;
                return None;
            }
        };
        info!(attempt = self.reconnect_attempts, "Opening socket connection");
        match tokio::time::timeout(SOCKET_OPEN_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((ws, _))) => Some(ws),
            Ok(Err(e)) => {
                warn!(error = %e, "Socket connection failed");
                let _ = self
                    .online_tx
                    .send(OnlineCommand::Signal { success: false })
                    .await;
                None
            }
            Err(_) => {
                warn!("Socket connection neither opened nor errored in time");
                let _ = self
                    .online_tx
                    .send(OnlineCommand::Signal { success: false })
                    .await;
                None
            }
        }
    }

    /// Service an open connection until it closes.
    ///
    /// Returns whether a reconnect should be scheduled (false for a
    /// self-initiated close).
    async fn drive(&mut self, ws: WsStream) -> bool {
        let (mut sink, mut stream) = ws.split();
        self.last_data_at = Some(Instant::now());

        // A prior session may have left the stream position behind a
        // gap or an aborted replay; catch up from the retained
        // timestamp. After a reset there is no timestamp and the next
        // packet becomes the fresh baseline.
        if let Some(from) = self.cursor.last_timestamp() {
            if let CursorAction::Replay(from) = self.cursor.request_replay(from) {
                if self.issue_replay(&mut sink, from).await.is_err() {
                    return self.on_connection_lost().await;
                }
            }
        }

        let mut heartbeat_at = tokio::time::Instant::now() + SOCKET_HEARTBEAT_INTERVAL;
        let mut sweep_at = tokio::time::Instant::now() + SOCKET_SWEEP_INTERVAL;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => {
                            self.teardown();
                            return false;
                        }
                        Some(SocketCommand::Close) => {
                            // Detach state before the close handshake
                            // finishes so a self-initiated close never
                            // schedules a reconnect.
                            self.wants_connection = false;
                            self.teardown();
                            let _ = sink.send(Message::Close(None)).await;
                            let _ = self.notif_tx.send(SocketNotification::Disconnected).await;
                            return false;
                        }
                        Some(SocketCommand::Connect) => {
                            // Already open.
                        }
                        Some(SocketCommand::Reset) => {
                            self.cursor.reset();
                            self.replay = None;
                        }
                        Some(SocketCommand::Send(envelope)) => {
                            if self.send_envelope(&mut sink, &envelope).await.is_err() {
                                return self.on_connection_lost().await;
                            }
                        }
                        Some(SocketCommand::Request { method, data, reply }) => {
                            let (envelope, request_id) = Envelope::request(&method, data);
                            self.pending.register(request_id, reply, Instant::now());
                            if self.send_envelope(&mut sink, &envelope).await.is_err() {
                                return self.on_connection_lost().await;
                            }
                        }
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            self.last_data_at = Some(Instant::now());
                            heartbeat_at =
                                tokio::time::Instant::now() + SOCKET_HEARTBEAT_INTERVAL;
                            let _ = self
                                .online_tx
                                .send(OnlineCommand::Signal { success: true })
                                .await;
                            if self.handle_frame(&text, &mut sink).await.is_err() {
                                return self.on_connection_lost().await;
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {
                            self.last_data_at = Some(Instant::now());
                            heartbeat_at =
                                tokio::time::Instant::now() + SOCKET_HEARTBEAT_INTERVAL;
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            return self.on_connection_lost().await;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                    }
                }
                _ = tokio::time::sleep_until(heartbeat_at) => {
                    // Silence on the wire: probe with a counter read.
                    // Any inbound packet pushes this deadline out, so
                    // the probe only fires when traffic is absent.
                    heartbeat_at = tokio::time::Instant::now() + SOCKET_HEARTBEAT_INTERVAL;
                    debug!("Heartbeat: no socket traffic, probing counter");
                    let (envelope, request_id) =
                        Envelope::request(methods::COUNTER_READ, Value::Null);
                    let (reply_tx, _reply_rx) = oneshot::channel();
                    self.pending.register(request_id, reply_tx, Instant::now());
                    if self.send_envelope(&mut sink, &envelope).await.is_err() {
                        return self.on_connection_lost().await;
                    }
                }
                _ = tokio::time::sleep_until(sweep_at),
                    if !self.pending.is_empty() || self.replay.is_some() =>
                {
                    sweep_at = tokio::time::Instant::now() + SOCKET_SWEEP_INTERVAL;
                    if self.run_sweep(&mut sink).await.is_err() {
                        return self.on_connection_lost().await;
                    }
                }
            }
        }
    }

    /// Decode one inbound frame and dispatch it.
    async fn handle_frame(&mut self, raw: &str, sink: &mut WsSink) -> Result<(), ()> {
        let envelope = match Envelope::from_json(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Discarding malformed socket frame");
                return Ok(());
            }
        };

        // Gap detection runs on every server-originated frame,
        // including responses, so the replay baseline stays current.
        if let (Some(counter), Some(timestamp)) = (envelope.counter, envelope.timestamp) {
            if let CursorAction::Replay(from) = self.cursor.observe(counter, timestamp) {
                self.issue_replay(sink, from).await?;
            }
        }

        match envelope.frame {
            Frame::Response(response) => {
                if self
                    .replay
                    .as_ref()
                    .is_some_and(|r| r.request_id == response.request_id)
                {
                    self.replay = None;
                    match self.cursor.on_replay_result(response.success) {
                        ReplayOutcome::Synced => {
                            info!("Event replay complete, stream is caught up");
                            let _ = self.notif_tx.send(SocketNotification::Synced).await;
                        }
                        ReplayOutcome::Replay(from) => {
                            self.issue_replay(sink, from).await?;
                        }
                    }
                } else {
                    self.pending.resolve(
                        &response.request_id,
                        SocketResponse {
                            success: response.success,
                            data: response.data,
                        },
                    );
                }
            }
            Frame::Change(change) => {
                let _ = self.notif_tx.send(SocketNotification::Change(change)).await;
            }
            Frame::Signal(signal) => {
                let _ = self.notif_tx.send(SocketNotification::Signal(signal)).await;
            }
            Frame::Request(request) => {
                debug!(method = %request.method, "Ignoring server-originated request frame");
            }
        }
        Ok(())
    }

    /// Put a replay request on the wire. The cursor has already marked
    /// it in flight; only the wire request id is tracked here.
    async fn issue_replay(&mut self, sink: &mut WsSink, from: DateTime<Utc>) -> Result<(), ()> {
        let data = serde_json::to_value(ReplayRequest {
            from_timestamp: from,
        })
        .expect("serializable replay request");
        let (envelope, request_id) = Envelope::request(methods::EVENT_REPLAY, data);
        info!(%from, "Requesting replay of missed events");
        self.replay = Some(ReplayInFlight {
            request_id,
            sent_at: Instant::now(),
        });
        self.send_envelope(sink, &envelope).await
    }

    /// Expire unanswered requests, distinguishing "this one request got
    /// lost" from "the whole pipe is dead".
    async fn run_sweep(&mut self, sink: &mut WsSink) -> Result<(), ()> {
        let now = Instant::now();
        let request_due = self
            .pending
            .oldest_age(now)
            .is_some_and(|age| age >= SOCKET_REQUEST_TIMEOUT);
        let replay_due = self
            .replay
            .as_ref()
            .is_some_and(|r| now.duration_since(r.sent_at) >= SOCKET_REQUEST_TIMEOUT);
        if !request_due && !replay_due {
            return Ok(());
        }

        let pipe_alive = self
            .last_data_at
            .is_some_and(|at| now.duration_since(at) < SOCKET_REQUEST_TIMEOUT);
        if !pipe_alive {
            // Nothing at all has arrived recently; the connection only
            // appears open. Reconnect instead of failing requests one
            // by one.
            warn!("No server data within the timeout window, reconnecting");
            return Err(());
        }

        self.pending.sweep(now, SOCKET_REQUEST_TIMEOUT);
        if replay_due {
            self.replay = None;
            if let ReplayOutcome::Replay(from) = self.cursor.on_replay_result(false) {
                self.issue_replay(sink, from).await?;
            }
        }
        Ok(())
    }

    async fn send_envelope(&mut self, sink: &mut WsSink, envelope: &Envelope) -> Result<(), ()> {
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to serialize outbound envelope");
                return Ok(());
            }
        };
        sink.send(Message::Text(text)).await.map_err(|e| {
            warn!(error = %e, "Socket send failed");
        })
    }

    async fn on_connection_lost(&mut self) -> bool {
        warn!("Socket connection lost");
        self.teardown();
        let _ = self
            .online_tx
            .send(OnlineCommand::Signal { success: false })
            .await;
        let _ = self.notif_tx.send(SocketNotification::Disconnected).await;
        true
    }

    /// Fail pending requests and drop replay bookkeeping. The stream
    /// position itself is kept so the next session can replay from it.
    fn teardown(&mut self) {
        self.pending.fail_all();
        self.replay = None;
        self.cursor.abort_replay();
    }

    fn handle_closed_command(&mut self, cmd: SocketCommand) {
        match cmd {
            SocketCommand::Connect => {
                self.wants_connection = true;
                self.reconnect_deadline = None;
                self.reconnect_attempts = 0;
            }
            SocketCommand::Close => {
                self.wants_connection = false;
                self.reconnect_deadline = None;
            }
            SocketCommand::Reset => {
                self.cursor.reset();
                self.replay = None;
            }
            SocketCommand::Send(_) => {
                warn!("Dropping outbound envelope, socket is closed");
            }
            SocketCommand::Request { reply, .. } => {
                let _ = reply.send(SocketResponse::disconnected());
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let wait = exponential_backoff(MAX_RECONNECT_WAIT_SECS, self.reconnect_attempts);
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        info!(wait_secs = wait.as_secs_f64(), "Scheduling socket reconnect");
        self.reconnect_deadline = Some(tokio::time::Instant::now() + wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures_util::FutureExt;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn change_frame(counter: u64, timestamp: DateTime<Utc>, id: &str) -> String {
        json!({
            "type": "change",
            "counter": counter,
            "timestamp": timestamp.to_rfc3339(),
            "body": {
                "operation": "create",
                "object": {"id": id, "type": "message"},
                "data": {},
            }
        })
        .to_string()
    }

    async fn test_server() -> (TcpListener, SocketConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = SocketConfig {
            url: format!("ws://{addr}"),
            session_token: "tok-1".to_string(),
        };
        (listener, config)
    }

    #[test]
    fn test_connect_url_carries_session_token() {
        let config = SocketConfig {
            url: "wss://socket.example.com/ws".to_string(),
            session_token: "tok-42".to_string(),
        };
        let url = config.connect_url().unwrap();
        assert_eq!(url.query(), Some("session_token=tok-42"));
    }

    #[tokio::test]
    async fn test_request_while_closed_fails_via_reply() {
        let (online_tx, _online_rx) = mpsc::channel(8);
        let (cmd_tx, _notif_rx) = spawn_socket(
            SocketConfig {
                url: "ws://127.0.0.1:1".to_string(),
                session_token: "tok".to_string(),
            },
            online_tx,
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(SocketCommand::Request {
                method: methods::COUNTER_READ.to_string(),
                data: Value::Null,
                reply: reply_tx,
            })
            .await
            .unwrap();
        let response = reply_rx.await.unwrap();
        assert!(!response.success);
        assert_eq!(response.data["code"], "not_connected");
    }

    #[tokio::test]
    async fn test_changes_are_delivered_and_sequence_needs_no_replay() {
        let (listener, config) = test_server().await;
        let (online_tx, _online_rx) = mpsc::channel(64);
        let (cmd_tx, mut notif_rx) = spawn_socket(config, online_tx);

        cmd_tx.send(SocketCommand::Connect).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = tokio_tungstenite::accept_async(stream).await.unwrap();

        for counter in 0..3u64 {
            let frame = change_frame(counter, ts(counter as i64), "confab:///messages/m");
            server.send(Message::Text(frame)).await.unwrap();
        }

        match notif_rx.recv().await {
            Some(SocketNotification::Connected) => {}
            other => panic!("expected Connected, got {other:?}"),
        }
        for _ in 0..3 {
            match notif_rx.recv().await {
                Some(SocketNotification::Change(change)) => {
                    assert_eq!(change.object.id, "confab:///messages/m");
                }
                other => panic!("expected Change, got {other:?}"),
            }
        }
        // A sequential stream never asks for a replay.
        assert!(server.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_gap_triggers_replay_and_synced() {
        let (listener, config) = test_server().await;
        let (online_tx, _online_rx) = mpsc::channel(64);
        let (cmd_tx, mut notif_rx) = spawn_socket(config, online_tx);

        cmd_tx.send(SocketCommand::Connect).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = tokio_tungstenite::accept_async(stream).await.unwrap();

        server
            .send(Message::Text(change_frame(1, ts(1), "confab:///messages/a")))
            .await
            .unwrap();
        server
            .send(Message::Text(change_frame(2, ts(2), "confab:///messages/b")))
            .await
            .unwrap();
        // Gap: counter jumps 2 -> 4.
        server
            .send(Message::Text(change_frame(4, ts(4), "confab:///messages/c")))
            .await
            .unwrap();

        // The client must issue exactly one replay, from packet 2's
        // timestamp.
        let replay_id = loop {
            match server.next().await {
                Some(Ok(Message::Text(text))) => {
                    let envelope = Envelope::from_json(&text).unwrap();
                    let Frame::Request(request) = envelope.frame else {
                        panic!("expected request frame");
                    };
                    assert_eq!(request.method, methods::EVENT_REPLAY);
                    let replay: ReplayRequest = serde_json::from_value(request.data).unwrap();
                    assert_eq!(replay.from_timestamp, ts(2));
                    break request.request_id;
                }
                other => panic!("expected replay request, got {other:?}"),
            }
        };

        // Answer the replay; the client reports the stream caught up.
        let response = json!({
            "type": "response",
            "counter": 5,
            "timestamp": ts(5).to_rfc3339(),
            "body": {"request_id": replay_id, "success": true, "data": {}},
        })
        .to_string();
        server.send(Message::Text(response)).await.unwrap();

        loop {
            match notif_rx.recv().await {
                Some(SocketNotification::Synced) => break,
                Some(_) => continue,
                None => panic!("notification channel closed before synced"),
            }
        }
    }

    #[tokio::test]
    async fn test_socket_request_round_trip() {
        let (listener, config) = test_server().await;
        let (online_tx, _online_rx) = mpsc::channel(64);
        let (cmd_tx, mut _notif_rx) = spawn_socket(config, online_tx);

        cmd_tx.send(SocketCommand::Connect).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = tokio_tungstenite::accept_async(stream).await.unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(SocketCommand::Request {
                method: methods::RECEIPT_CREATE.to_string(),
                data: json!({"message_id": "confab:///messages/m"}),
                reply: reply_tx,
            })
            .await
            .unwrap();

        let request_id = match server.next().await {
            Some(Ok(Message::Text(text))) => {
                let envelope = Envelope::from_json(&text).unwrap();
                let Frame::Request(request) = envelope.frame else {
                    panic!("expected request frame");
                };
                assert_eq!(request.method, methods::RECEIPT_CREATE);
                request.request_id
            }
            other => panic!("expected request, got {other:?}"),
        };

        let response = json!({
            "type": "response",
            "counter": 1,
            "timestamp": ts(1).to_rfc3339(),
            "body": {"request_id": request_id, "success": true, "data": {"ok": true}},
        })
        .to_string();
        server.send(Message::Text(response)).await.unwrap();

        let reply = reply_rx.await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.data["ok"], true);
    }
}
