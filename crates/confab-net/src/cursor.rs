//! Event-stream position tracking and replay bookkeeping.
//!
//! Every server-originated frame carries a monotonically increasing
//! counter and a timestamp. [`StreamCursor`] watches the counter for
//! gaps and decides when a replay of missed change packets must be
//! requested, keeping at most one replay in flight and remembering the
//! most recent timestamp requested while one was pending.

use chrono::{DateTime, Utc};
use tracing::debug;

/// What the socket loop should do after feeding an inbound frame's
/// counter/timestamp pair into the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorAction {
    /// Sequence intact, nothing to do.
    None,
    /// A gap was detected (or another replay became due); issue a
    /// replay request from this timestamp.
    Replay(DateTime<Utc>),
}

/// Outcome of a completed replay request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Replay succeeded and nothing further is pending; the stream is
    /// caught up.
    Synced,
    /// Another replay must be issued from this timestamp: either a
    /// retry at the original baseline after a failure, or the stashed
    /// (most recent) timestamp requested while the last one was in
    /// flight.
    Replay(DateTime<Utc>),
}

/// Tracks the last-known-good stream position and the replay protocol
/// state.
#[derive(Debug, Default)]
pub struct StreamCursor {
    last_counter: Option<u64>,
    last_timestamp: Option<DateTime<Utc>>,
    /// Timestamp the in-flight replay was issued from, kept so a failed
    /// replay retries at the same baseline instead of skipping ahead.
    in_flight: Option<DateTime<Utc>>,
    /// Replay requested while one was already pending; re-issued on
    /// completion instead of queuing overlapping replays.
    stashed: Option<DateTime<Utc>>,
}

impl StreamCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_counter(&self) -> Option<u64> {
        self.last_counter
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }

    pub fn replay_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Feed the counter/timestamp pair of an inbound server frame.
    ///
    /// Packets arriving during a replay still advance the position, so
    /// a retried replay always carries a current baseline.
    pub fn observe(&mut self, counter: u64, timestamp: DateTime<Utc>) -> CursorAction {
        let gap = match self.last_counter {
            Some(last) => counter != last.wrapping_add(1),
            None => false,
        };
        // The replay baseline is the position before this packet.
        let baseline = self.last_timestamp;
        self.last_counter = Some(counter);
        self.last_timestamp = Some(timestamp);

        if !gap {
            return CursorAction::None;
        }
        let Some(baseline) = baseline else {
            return CursorAction::None;
        };
        debug!(counter, "Counter gap detected in event stream");
        self.request_replay(baseline)
    }

    /// Request a replay from the given timestamp. If one is already in
    /// flight, the timestamp is stashed and re-issued on completion.
    pub fn request_replay(&mut self, from: DateTime<Utc>) -> CursorAction {
        if self.in_flight.is_some() {
            self.stashed = Some(from);
            CursorAction::None
        } else {
            self.in_flight = Some(from);
            CursorAction::Replay(from)
        }
    }

    /// Resolve the in-flight replay.
    ///
    /// On success with a stashed request pending, the stashed (most
    /// recent) timestamp is issued next. On failure the same baseline
    /// is retried; a replay is never skipped after a failure.
    pub fn on_replay_result(&mut self, success: bool) -> ReplayOutcome {
        let Some(original) = self.in_flight.take() else {
            return ReplayOutcome::Synced;
        };
        if !success {
            self.in_flight = Some(original);
            return ReplayOutcome::Replay(original);
        }
        match self.stashed.take() {
            Some(next) => {
                self.in_flight = Some(next);
                ReplayOutcome::Replay(next)
            }
            None => ReplayOutcome::Synced,
        }
    }

    /// Drop replay bookkeeping without losing the stream position.
    ///
    /// Used when the connection goes down mid-replay: after reconnect a
    /// fresh replay is issued from the retained timestamp.
    pub fn abort_replay(&mut self) {
        self.in_flight = None;
        self.stashed = None;
    }

    /// Discard all position and replay state after a long outage.
    ///
    /// Consumers must pull fresh data rather than resume the stream:
    /// the next inbound packet is accepted as the new baseline with no
    /// replay attempted.
    pub fn reset(&mut self) {
        debug!("Stream cursor reset, discarding replay state");
        self.last_counter = None;
        self.last_timestamp = None;
        self.in_flight = None;
        self.stashed = None;
    }
}
