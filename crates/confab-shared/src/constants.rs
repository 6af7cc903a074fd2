//! Timing and sizing constants shared across the SDK.

use std::time::Duration;

/// While online, the tracker flags the client offline if no transport
/// success signal arrives within this window.
pub const ONLINE_LIVENESS_WINDOW: Duration = Duration::from_secs(100);

/// Ceiling for the offline-probe backoff schedule, in seconds.
pub const MAX_OFFLINE_PROBE_WAIT_SECS: f64 = 60.0;

/// Ceiling for socket reconnect backoff. Kept below
/// [`ONLINE_LIVENESS_WINDOW`] so a reconnect attempt always happens
/// before the online tracker would flag the client offline.
pub const MAX_RECONNECT_WAIT_SECS: f64 = 30.0;

/// Heartbeat interval: a counter-read probe fires if no packet has
/// arrived on the socket for this long.
pub const SOCKET_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Unanswered socket requests older than this are resolved with a
/// synthetic timeout error.
pub const SOCKET_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Cadence of the pending-request sweep: the request timeout plus a
/// small margin.
pub const SOCKET_SWEEP_INTERVAL: Duration = Duration::from_secs(17);

/// A connection attempt that has neither opened nor errored within this
/// window is forced down the error path.
pub const SOCKET_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Retries applied by the REST layer to non-queued calls, for
/// 502/503/504 only.
pub const REST_RETRY_COUNT: u32 = 3;
pub const REST_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Retry budgets for queued sync events before a transient failure is
/// escalated to a permanent one.
pub const SYNC_MAX_RETRIES_408: u32 = 3;
pub const SYNC_MAX_RETRIES_5XX: u32 = 6;
pub const SYNC_RETRY_MAX_WAIT_SECS: f64 = 60.0;

/// Network-level failures observed while the tracker claims we are
/// online, for a single head-of-queue request, before the failure is
/// reclassified as CORS-style permanent.
pub const SYNC_MAX_CONNECTIVITY_FLAPS: u32 = 3;

/// Server page-size ceiling for query fetches.
pub const MAX_PAGE_SIZE: usize = 100;

/// Default query result-set size.
pub const DEFAULT_PAGINATION_WINDOW: usize = 100;

/// After a temp-id is reassigned to its server id, the old id keeps
/// resolving for this long so in-flight callers are not stranded.
pub const ID_REASSIGNMENT_GRACE: Duration = Duration::from_secs(60);

/// Typing indicator refresh cadence; `started` degrades to `paused` and
/// then `finished` after successive silent intervals.
pub const TYPING_INDICATOR_INTERVAL: Duration = Duration::from_millis(2500);

/// An outage at least this long ends with a full socket reset ("pull
/// fresh data") instead of an event-stream replay.
pub const OUTAGE_RESET_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Storage key under which the `{session_token, user_id}` blob for an
/// application id is persisted.
pub fn session_storage_key(app_id: &str) -> String {
    format!("confab-session-{app_id}")
}
