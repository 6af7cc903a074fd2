//! Typing indicator publisher and listener.
//!
//! A simple pub/sub outside the sync core: outbound state is degraded
//! `started -> paused -> finished` on inactivity ticks and redundant
//! resends are suppressed; inbound signals are rolled up per
//! conversation into `{typing, paused}` user lists with per-user
//! expiry. Both halves are pure state machines driven by the client's
//! bridge loop.

use std::collections::HashMap;
use std::time::Instant;

use confab_shared::constants::TYPING_INDICATOR_INTERVAL;
use confab_shared::ids::EntityId;
use confab_shared::protocol::TypingAction;

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

struct PublisherEntry {
    action: TypingAction,
    last_sent_at: Instant,
}

/// Outbound typing state per conversation.
#[derive(Default)]
pub struct TypingPublisherState {
    conversations: HashMap<EntityId, PublisherEntry>,
}

impl TypingPublisherState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the application's typing state for a conversation.
    ///
    /// Returns the action to put on the wire, or `None` when the send
    /// would be redundant (same state, resent within the refresh
    /// interval). A `started` state is refreshed periodically so remote
    /// rollups do not expire mid-typing.
    pub fn set_state(
        &mut self,
        conversation_id: &EntityId,
        action: TypingAction,
        now: Instant,
    ) -> Option<TypingAction> {
        let previous = self.conversations.get(conversation_id);
        let redundant = previous.is_some_and(|entry| {
            entry.action == action
                && now.duration_since(entry.last_sent_at) < TYPING_INDICATOR_INTERVAL
        });
        if redundant {
            return None;
        }
        if previous.is_none() && action == TypingAction::Finished {
            // Nothing to finish.
            return None;
        }
        if action == TypingAction::Finished {
            self.conversations.remove(conversation_id);
        } else {
            self.conversations.insert(
                conversation_id.clone(),
                PublisherEntry {
                    action,
                    last_sent_at: now,
                },
            );
        }
        Some(action)
    }

    /// Degrade silent conversations one step per elapsed interval.
    /// Returns the transitions to broadcast.
    pub fn tick(&mut self, now: Instant) -> Vec<(EntityId, TypingAction)> {
        let mut transitions = Vec::new();
        self.conversations.retain(|conversation_id, entry| {
            if now.duration_since(entry.last_sent_at) < TYPING_INDICATOR_INTERVAL {
                return true;
            }
            match entry.action {
                TypingAction::Started => {
                    entry.action = TypingAction::Paused;
                    entry.last_sent_at = now;
                    transitions.push((conversation_id.clone(), TypingAction::Paused));
                    true
                }
                TypingAction::Paused => {
                    transitions.push((conversation_id.clone(), TypingAction::Finished));
                    false
                }
                TypingAction::Finished => false,
            }
        });
        transitions
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Per-conversation rollup of who is typing and who has paused.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypingRollup {
    pub typing: Vec<String>,
    pub paused: Vec<String>,
}

struct ListenerEntry {
    action: TypingAction,
    heard_at: Instant,
}

/// Inbound typing state, per conversation and user.
#[derive(Default)]
pub struct TypingListenerState {
    conversations: HashMap<EntityId, HashMap<String, ListenerEntry>>,
}

impl TypingListenerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one inbound signal. Returns whether the conversation's
    /// rollup changed.
    pub fn on_signal(
        &mut self,
        conversation_id: &EntityId,
        user_id: &str,
        action: TypingAction,
        now: Instant,
    ) -> bool {
        let users = self.conversations.entry(conversation_id.clone()).or_default();
        let changed = match action {
            TypingAction::Finished => users.remove(user_id).is_some(),
            _ => {
                let previous = users.insert(
                    user_id.to_string(),
                    ListenerEntry {
                        action,
                        heard_at: now,
                    },
                );
                previous.map_or(true, |entry| entry.action != action)
            }
        };
        if users.is_empty() {
            self.conversations.remove(conversation_id);
        }
        changed
    }

    /// Expire users whose state was not refreshed: `started` degrades
    /// to `paused`, `paused` drops out. Returns the conversations whose
    /// rollup changed.
    pub fn sweep(&mut self, now: Instant) -> Vec<EntityId> {
        let mut changed = Vec::new();
        self.conversations.retain(|conversation_id, users| {
            let mut conversation_changed = false;
            users.retain(|_, entry| {
                if now.duration_since(entry.heard_at) < TYPING_INDICATOR_INTERVAL {
                    return true;
                }
                match entry.action {
                    TypingAction::Started => {
                        entry.action = TypingAction::Paused;
                        entry.heard_at = now;
                        conversation_changed = true;
                        true
                    }
                    _ => {
                        conversation_changed = true;
                        false
                    }
                }
            });
            if conversation_changed {
                changed.push(conversation_id.clone());
            }
            !users.is_empty()
        });
        changed
    }

    /// Current rollup for a conversation, user ids sorted.
    pub fn rollup(&self, conversation_id: &EntityId) -> TypingRollup {
        let mut rollup = TypingRollup::default();
        if let Some(users) = self.conversations.get(conversation_id) {
            for (user_id, entry) in users {
                match entry.action {
                    TypingAction::Started => rollup.typing.push(user_id.clone()),
                    TypingAction::Paused => rollup.paused.push(user_id.clone()),
                    TypingAction::Finished => {}
                }
            }
        }
        rollup.typing.sort();
        rollup.paused.sort();
        rollup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_shared::ids::EntityKind;
    use std::time::Duration;

    fn conversation() -> EntityId {
        EntityId::new(EntityKind::Conversation, "c1")
    }

    #[test]
    fn test_publisher_suppresses_redundant_resends() {
        let mut publisher = TypingPublisherState::new();
        let now = Instant::now();
        let id = conversation();

        assert_eq!(
            publisher.set_state(&id, TypingAction::Started, now),
            Some(TypingAction::Started)
        );
        // Same state again within the interval: suppressed.
        assert_eq!(
            publisher.set_state(&id, TypingAction::Started, now + Duration::from_millis(500)),
            None
        );
        // Refreshed once the interval has elapsed.
        assert_eq!(
            publisher.set_state(&id, TypingAction::Started, now + TYPING_INDICATOR_INTERVAL),
            Some(TypingAction::Started)
        );
    }

    #[test]
    fn test_publisher_degrades_on_inactivity() {
        let mut publisher = TypingPublisherState::new();
        let now = Instant::now();
        let id = conversation();
        publisher.set_state(&id, TypingAction::Started, now);

        let first = publisher.tick(now + TYPING_INDICATOR_INTERVAL);
        assert_eq!(first, vec![(id.clone(), TypingAction::Paused)]);

        let second = publisher.tick(now + TYPING_INDICATOR_INTERVAL * 2);
        assert_eq!(second, vec![(id.clone(), TypingAction::Finished)]);

        // Nothing left to degrade.
        assert!(publisher.tick(now + TYPING_INDICATOR_INTERVAL * 3).is_empty());
    }

    #[test]
    fn test_publisher_finished_without_prior_state_is_silent() {
        let mut publisher = TypingPublisherState::new();
        assert_eq!(
            publisher.set_state(&conversation(), TypingAction::Finished, Instant::now()),
            None
        );
    }

    #[test]
    fn test_listener_rollup_tracks_states() {
        let mut listener = TypingListenerState::new();
        let now = Instant::now();
        let id = conversation();

        assert!(listener.on_signal(&id, "user-a", TypingAction::Started, now));
        assert!(listener.on_signal(&id, "user-b", TypingAction::Paused, now));
        // Same state repeated is not a rollup change.
        assert!(!listener.on_signal(&id, "user-a", TypingAction::Started, now));

        let rollup = listener.rollup(&id);
        assert_eq!(rollup.typing, vec!["user-a"]);
        assert_eq!(rollup.paused, vec!["user-b"]);

        assert!(listener.on_signal(&id, "user-a", TypingAction::Finished, now));
        assert_eq!(listener.rollup(&id).typing, Vec::<String>::new());
    }

    #[test]
    fn test_listener_sweep_expires_users() {
        let mut listener = TypingListenerState::new();
        let now = Instant::now();
        let id = conversation();
        listener.on_signal(&id, "user-a", TypingAction::Started, now);

        let changed = listener.sweep(now + TYPING_INDICATOR_INTERVAL);
        assert_eq!(changed, vec![id.clone()]);
        assert_eq!(listener.rollup(&id).paused, vec!["user-a"]);

        let changed = listener.sweep(now + TYPING_INDICATOR_INTERVAL * 2);
        assert_eq!(changed, vec![id.clone()]);
        assert_eq!(listener.rollup(&id), TypingRollup::default());
    }
}
