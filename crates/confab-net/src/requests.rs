//! Correlation of outbound socket requests with inbound responses.
//!
//! Each outbound request frame carries a locally unique request id;
//! [`PendingRequests`] stores the reply channel under that id until the
//! matching response arrives or the entry is swept out by timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome delivered for one socket request.
#[derive(Debug)]
pub struct SocketResponse {
    pub success: bool,
    pub data: Value,
}

impl SocketResponse {
    /// Synthetic failure for a request that was never answered.
    pub fn timeout() -> Self {
        Self {
            success: false,
            data: json!({"code": "request_timeout", "message": "the server did not respond"}),
        }
    }

    /// Synthetic failure for a request cut short by a connection loss.
    pub fn disconnected() -> Self {
        Self {
            success: false,
            data: json!({"code": "not_connected", "message": "socket is not connected"}),
        }
    }
}

struct PendingEntry {
    registered_at: Instant,
    reply: oneshot::Sender<SocketResponse>,
}

/// Table of unanswered outbound requests, keyed by request id.
#[derive(Default)]
pub struct PendingRequests {
    entries: HashMap<String, PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Register an outbound request awaiting a response.
    pub fn register(
        &mut self,
        request_id: impl Into<String>,
        reply: oneshot::Sender<SocketResponse>,
        now: Instant,
    ) {
        self.entries.insert(
            request_id.into(),
            PendingEntry {
                registered_at: now,
                reply,
            },
        );
    }

    /// Deliver a response to the matching entry, exactly once.
    ///
    /// Unmatched ids are dropped silently: duplicate or late deliveries
    /// after a sweep are expected and must not disturb anything.
    pub fn resolve(&mut self, request_id: &str, response: SocketResponse) -> bool {
        match self.entries.remove(request_id) {
            Some(entry) => {
                let _ = entry.reply.send(response);
                true
            }
            None => {
                debug!(request_id, "Dropping response with no pending request");
                false
            }
        }
    }

    /// Age of the oldest pending entry.
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.entries
            .values()
            .map(|entry| now.duration_since(entry.registered_at))
            .max()
    }

    /// Remove entries older than `timeout` and resolve each with a
    /// synthetic timeout error, so no caller is left dangling.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.registered_at) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(entry) = self.entries.remove(id) {
                debug!(request_id = %id, "Expiring unanswered socket request");
                let _ = entry.reply.send(SocketResponse::timeout());
            }
        }
        expired.len()
    }

    /// Fail every pending entry, used when the connection goes down.
    pub fn fail_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            let _ = entry.reply.send(SocketResponse::disconnected());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_delivers_exactly_once() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        pending.register("r-1", tx, Instant::now());

        assert!(pending.resolve(
            "r-1",
            SocketResponse {
                success: true,
                data: json!({"ok": true}),
            }
        ));
        let response = rx.try_recv().unwrap();
        assert!(response.success);

        // A duplicate delivery finds no entry.
        assert!(!pending.resolve(
            "r-1",
            SocketResponse {
                success: true,
                data: Value::Null,
            }
        ));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unmatched_response_is_dropped() {
        let mut pending = PendingRequests::new();
        assert!(!pending.resolve(
            "never-sent",
            SocketResponse {
                success: true,
                data: Value::Null,
            }
        ));
    }

    #[test]
    fn test_sweep_expires_only_old_entries() {
        let mut pending = PendingRequests::new();
        let t0 = Instant::now();
        let (old_tx, mut old_rx) = oneshot::channel();
        let (new_tx, mut new_rx) = oneshot::channel();
        pending.register("old", old_tx, t0);
        pending.register("new", new_tx, t0 + Duration::from_secs(10));

        let expired = pending.sweep(t0 + Duration::from_secs(16), Duration::from_secs(15));
        assert_eq!(expired, 1);
        assert_eq!(pending.len(), 1);

        let response = old_rx.try_recv().unwrap();
        assert!(!response.success);
        assert_eq!(response.data["code"], "request_timeout");
        assert!(new_rx.try_recv().is_err());
    }

    #[test]
    fn test_fail_all_resolves_everything() {
        let mut pending = PendingRequests::new();
        let (tx_a, mut rx_a) = oneshot::channel();
        let (tx_b, mut rx_b) = oneshot::channel();
        let now = Instant::now();
        pending.register("a", tx_a, now);
        pending.register("b", tx_b, now);

        pending.fail_all();
        assert!(pending.is_empty());
        assert_eq!(rx_a.try_recv().unwrap().data["code"], "not_connected");
        assert_eq!(rx_b.try_recv().unwrap().data["code"], "not_connected");
    }
}
