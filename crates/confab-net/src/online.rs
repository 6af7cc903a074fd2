//! Online/offline state tracking.
//!
//! The tracker is a passive observer: every REST or socket outcome is
//! funneled in as a success/failure signal, and the boolean online
//! state is derived only from those observations. Environment hints
//! (e.g. an OS network-change notification) are advisory and merely
//! trigger an immediate re-probe.
//!
//! [`OnlineState`] is the pure state machine; [`spawn_online_monitor`]
//! wraps it in a task that owns the liveness timer and the
//! backoff-scheduled connectivity probes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use confab_shared::backoff::exponential_backoff;
use confab_shared::constants::{MAX_OFFLINE_PROBE_WAIT_SECS, ONLINE_LIVENESS_WINDOW};

/// A cheap "is the server reachable" check, issued while offline and
/// when the liveness window expires.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Commands accepted by the monitor task.
#[derive(Debug)]
pub enum OnlineCommand {
    /// Mark ready and online; begins the monitoring loop.
    Start,
    /// Mark not-ready and force offline.
    Stop,
    /// A transport outcome observed elsewhere in the SDK.
    Signal { success: bool },
    /// Advisory environment hint; schedules an immediate re-probe but
    /// never sets the state directly.
    EnvironmentHint,
    /// Probe now and report the resulting state.
    CheckNow(oneshot::Sender<bool>),
}

/// Notifications emitted on state transitions.
#[derive(Debug, Clone)]
pub enum OnlineNotification {
    /// Back online; carries the duration of the outage just ended.
    Connected { offline_duration: Duration },
    Disconnected,
}

/// State transition produced by feeding an observation into
/// [`OnlineState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineTransition {
    None,
    /// Came online after an outage of the given duration. `None`
    /// duration marks the first-ever start, which emits no `connected`.
    CameOnline { outage: Option<Duration> },
    WentOffline,
}

/// Pure online/offline state machine.
#[derive(Debug)]
pub struct OnlineState {
    started: bool,
    is_online: bool,
    ever_started: bool,
    offline_counter: u32,
    went_offline_at: Option<Instant>,
}

impl OnlineState {
    pub fn new() -> Self {
        Self {
            started: false,
            is_online: false,
            ever_started: false,
            offline_counter: 0,
            went_offline_at: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.is_online
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Attempts scheduled since going offline; drives probe backoff.
    pub fn offline_counter(&self) -> u32 {
        self.offline_counter
    }

    pub fn on_start(&mut self, now: Instant) -> OnlineTransition {
        self.started = true;
        let was_online = self.is_online;
        self.is_online = true;
        self.offline_counter = 0;
        if !self.ever_started {
            // No prior offline baseline to report against.
            self.ever_started = true;
            self.went_offline_at = None;
            return OnlineTransition::CameOnline { outage: None };
        }
        if was_online {
            OnlineTransition::None
        } else {
            OnlineTransition::CameOnline {
                outage: Some(self.outage_duration(now)),
            }
        }
    }

    pub fn on_stop(&mut self, now: Instant) -> OnlineTransition {
        self.started = false;
        if self.is_online {
            self.is_online = false;
            self.went_offline_at = Some(now);
            self.offline_counter = 0;
            OnlineTransition::WentOffline
        } else {
            OnlineTransition::None
        }
    }

    /// Feed a transport success/failure observation.
    pub fn on_signal(&mut self, success: bool, now: Instant) -> OnlineTransition {
        if !self.started {
            return OnlineTransition::None;
        }
        if success {
            if self.is_online {
                OnlineTransition::None
            } else {
                self.is_online = true;
                let outage = self.outage_duration(now);
                self.offline_counter = 0;
                OnlineTransition::CameOnline {
                    outage: Some(outage),
                }
            }
        } else if self.is_online {
            self.is_online = false;
            self.went_offline_at = Some(now);
            self.offline_counter = 0;
            OnlineTransition::WentOffline
        } else {
            OnlineTransition::None
        }
    }

    /// The liveness window elapsed with no intervening success.
    pub fn on_liveness_expired(&mut self, now: Instant) -> OnlineTransition {
        self.on_signal(false, now)
    }

    /// How long to wait before the next offline probe.
    pub fn next_probe_wait(&self) -> Duration {
        exponential_backoff(MAX_OFFLINE_PROBE_WAIT_SECS, self.offline_counter)
    }

    /// Record that a probe has been scheduled, advancing the backoff.
    pub fn on_probe_scheduled(&mut self) {
        self.offline_counter = self.offline_counter.saturating_add(1);
    }

    fn outage_duration(&self, now: Instant) -> Duration {
        self.went_offline_at
            .map(|at| now.duration_since(at))
            .unwrap_or_default()
    }
}

impl Default for OnlineState {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the monitor task.
///
/// Returns the command channel, the notification channel, and a watch
/// receiver holding the current online boolean (consumed by the sync
/// queue to gate firing).
pub fn spawn_online_monitor(
    probe: Arc<dyn ConnectivityProbe>,
) -> (
    mpsc::Sender<OnlineCommand>,
    mpsc::Receiver<OnlineNotification>,
    watch::Receiver<bool>,
) {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<OnlineCommand>(64);
    let (notif_tx, notif_rx) = mpsc::channel::<OnlineNotification>(64);
    let (watch_tx, watch_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut state = OnlineState::new();
        // Deadline for the next timer action: liveness expiry while
        // online, next probe while offline.
        let mut deadline = far_future();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        OnlineCommand::Start => {
                            let transition = state.on_start(Instant::now());
                            publish(&watch_tx, &notif_tx, &state, transition).await;
                            deadline = tokio::time::Instant::now() + ONLINE_LIVENESS_WINDOW;
                        }
                        OnlineCommand::Stop => {
                            let transition = state.on_stop(Instant::now());
                            publish(&watch_tx, &notif_tx, &state, transition).await;
                            deadline = far_future();
                        }
                        OnlineCommand::Signal { success } => {
                            let transition = state.on_signal(success, Instant::now());
                            publish(&watch_tx, &notif_tx, &state, transition).await;
                            deadline = reschedule(&mut state);
                        }
                        OnlineCommand::EnvironmentHint => {
                            if state.is_started() {
                                debug!("Environment hint received, probing now");
                                deadline = tokio::time::Instant::now();
                            }
                        }
                        OnlineCommand::CheckNow(reply) => {
                            let success = state.is_started() && probe.check().await;
                            let transition = state.on_signal(success, Instant::now());
                            publish(&watch_tx, &notif_tx, &state, transition).await;
                            deadline = reschedule(&mut state);
                            let _ = reply.send(state.is_online());
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if state.is_started() => {
                    if state.is_online() {
                        // Liveness window elapsed with no success signal.
                        let transition = state.on_liveness_expired(Instant::now());
                        publish(&watch_tx, &notif_tx, &state, transition).await;
                    } else {
                        let success = probe.check().await;
                        let transition = state.on_signal(success, Instant::now());
                        publish(&watch_tx, &notif_tx, &state, transition).await;
                    }
                    deadline = reschedule(&mut state);
                }
            }
        }
    });

    (cmd_tx, notif_rx, watch_rx)
}

fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(86400 * 365)
}

fn reschedule(state: &mut OnlineState) -> tokio::time::Instant {
    if !state.is_started() {
        return far_future();
    }
    if state.is_online() {
        tokio::time::Instant::now() + ONLINE_LIVENESS_WINDOW
    } else {
        let wait = state.next_probe_wait();
        state.on_probe_scheduled();
        tokio::time::Instant::now() + wait
    }
}

async fn publish(
    watch_tx: &watch::Sender<bool>,
    notif_tx: &mpsc::Sender<OnlineNotification>,
    state: &OnlineState,
    transition: OnlineTransition,
) {
    let _ = watch_tx.send(state.is_online());
    match transition {
        OnlineTransition::CameOnline {
            outage: Some(duration),
        } => {
            info!(offline_secs = duration.as_secs(), "Back online");
            let _ = notif_tx
                .send(OnlineNotification::Connected {
                    offline_duration: duration,
                })
                .await;
        }
        OnlineTransition::CameOnline { outage: None } => {
            // First-ever start: online, but no `connected` to emit.
            debug!("Online monitoring started");
        }
        OnlineTransition::WentOffline => {
            info!("Connection appears to be offline");
            let _ = notif_tx.send(OnlineNotification::Disconnected).await;
        }
        OnlineTransition::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_start_emits_no_connected() {
        let mut state = OnlineState::new();
        let transition = state.on_start(Instant::now());
        assert_eq!(transition, OnlineTransition::CameOnline { outage: None });
        assert!(state.is_online());
    }

    #[test]
    fn test_failure_then_success_reports_outage() {
        let mut state = OnlineState::new();
        let t0 = Instant::now();
        state.on_start(t0);

        assert_eq!(state.on_signal(false, t0), OnlineTransition::WentOffline);
        assert!(!state.is_online());

        let t1 = t0 + Duration::from_secs(30);
        match state.on_signal(true, t1) {
            OnlineTransition::CameOnline {
                outage: Some(duration),
            } => assert_eq!(duration, Duration::from_secs(30)),
            other => panic!("unexpected transition {other:?}"),
        }
        assert!(state.is_online());
    }

    #[test]
    fn test_success_resets_backoff_counter() {
        let mut state = OnlineState::new();
        let now = Instant::now();
        state.on_start(now);
        state.on_signal(false, now);
        for _ in 0..5 {
            state.on_probe_scheduled();
        }
        assert_eq!(state.offline_counter(), 5);
        state.on_signal(true, now);
        assert_eq!(state.offline_counter(), 0);
    }

    #[test]
    fn test_signals_ignored_while_stopped() {
        let mut state = OnlineState::new();
        let now = Instant::now();
        assert_eq!(state.on_signal(true, now), OnlineTransition::None);
        assert!(!state.is_online());

        state.on_start(now);
        state.on_stop(now);
        assert_eq!(state.on_signal(true, now), OnlineTransition::None);
        assert!(!state.is_online());
    }

    #[test]
    fn test_duplicate_success_is_silent() {
        let mut state = OnlineState::new();
        let now = Instant::now();
        state.on_start(now);
        assert_eq!(state.on_signal(true, now), OnlineTransition::None);
    }

    struct ScriptedProbe {
        results: std::sync::Mutex<std::collections::VecDeque<bool>>,
    }

    #[async_trait]
    impl ConnectivityProbe for ScriptedProbe {
        async fn check(&self) -> bool {
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(false)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_flags_offline_after_liveness_expiry() {
        let probe = Arc::new(ScriptedProbe {
            results: std::sync::Mutex::new(std::collections::VecDeque::new()),
        });
        let (cmd_tx, mut notif_rx, watch_rx) = spawn_online_monitor(probe);

        cmd_tx.send(OnlineCommand::Start).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(*watch_rx.borrow());

        // No signals for the full liveness window.
        tokio::time::sleep(ONLINE_LIVENESS_WINDOW + Duration::from_secs(1)).await;
        match notif_rx.recv().await {
            Some(OnlineNotification::Disconnected) => {}
            other => panic!("expected Disconnected, got {other:?}"),
        }
        assert!(!*watch_rx.borrow());
    }
}
