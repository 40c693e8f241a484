// Ephemeral "who is typing / who is online" state
//
// Every entry carries an expiry. Reads filter expired entries, so a sender
// that crashes mid-type simply ages out after the TTL.

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{ChatError, Result};
use crate::models::{ConversationId, PresenceEntry, PresenceState, UserId};
use crate::utils::lock;
use crate::wire::{self, WireEvent};

/// Outbound half of presence: pushes heartbeats to other participants.
pub trait PresenceBroadcaster: Send + Sync {
    /// Returns `Ok(false)` when there is no live channel for the conversation.
    fn broadcast(&self, conversation_id: &str, event: &WireEvent) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceUpdate {
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        state: PresenceState,
    },
    Online {
        conversation_id: ConversationId,
        user_id: UserId,
        online: bool,
    },
    Cleared,
}

type EntryMap = HashMap<ConversationId, HashMap<UserId, PresenceEntry>>;
type OnlineMap = HashMap<ConversationId, HashMap<UserId, DateTime<Utc>>>;

pub struct PresenceTracker {
    clock: Arc<dyn Clock>,
    typing_ttl: Duration,
    online_ttl: Duration,
    broadcaster: Option<Arc<dyn PresenceBroadcaster>>,
    typing: Mutex<EntryMap>,
    online: Mutex<OnlineMap>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<PresenceUpdate>>>,
}

fn chrono_ttl(ttl: std::time::Duration) -> Duration {
    Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(3))
}

fn require_ids(conversation_id: &str, user_id: &str) -> Result<()> {
    if conversation_id.is_empty() || user_id.is_empty() {
        return Err(ChatError::Validation(
            "presence needs a conversation and a user".to_string(),
        ));
    }
    Ok(())
}

impl PresenceTracker {
    pub fn new(config: &SyncConfig, clock: Arc<dyn Clock>) -> Self {
        PresenceTracker {
            clock,
            typing_ttl: chrono_ttl(config.typing_ttl()),
            online_ttl: chrono_ttl(config.online_ttl()),
            broadcaster: None,
            typing: Mutex::new(HashMap::new()),
            online: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn PresenceBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Record or refresh a local typing heartbeat and announce it.
    pub fn set_typing(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        require_ids(conversation_id, user_id)?;
        self.refresh_typing(conversation_id, user_id);
        self.announce(
            conversation_id,
            &wire::typing_event(conversation_id, user_id, PresenceState::Typing),
        );
        Ok(())
    }

    pub fn clear_typing(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        require_ids(conversation_id, user_id)?;
        self.remove_typing(conversation_id, user_id);
        self.announce(
            conversation_id,
            &wire::typing_event(conversation_id, user_id, PresenceState::Idle),
        );
        Ok(())
    }

    /// Users with a live typing entry. Expired entries are skipped, not removed.
    pub fn typing_users(&self, conversation_id: &str) -> BTreeSet<UserId> {
        let now = self.clock.now();
        lock(&self.typing)
            .get(conversation_id)
            .map(|users| {
                users
                    .values()
                    .filter(|entry| entry.state == PresenceState::Typing && entry.is_live(now))
                    .map(|entry| entry.user_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn entries(&self, conversation_id: &str) -> Vec<PresenceEntry> {
        let now = self.clock.now();
        let mut entries: Vec<_> = lock(&self.typing)
            .get(conversation_id)
            .map(|users| users.values().filter(|e| e.is_live(now)).cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries
    }

    /// Record or refresh a local online heartbeat and announce it.
    pub fn heartbeat(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        require_ids(conversation_id, user_id)?;
        self.refresh_online(conversation_id, user_id);
        self.announce(conversation_id, &wire::online_event(conversation_id, user_id));
        Ok(())
    }

    pub fn online_users(&self, conversation_id: &str) -> BTreeSet<UserId> {
        let now = self.clock.now();
        lock(&self.online)
            .get(conversation_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply a presence event received from another participant.
    pub fn record_remote(&self, event: &WireEvent) {
        match event {
            WireEvent::Typing {
                conversation_id,
                user_id,
                state: PresenceState::Typing,
            } => self.refresh_typing(conversation_id, user_id),
            WireEvent::Typing {
                conversation_id,
                user_id,
                state: PresenceState::Idle,
            } => self.remove_typing(conversation_id, user_id),
            WireEvent::Online {
                conversation_id,
                user_id,
            } => self.refresh_online(conversation_id, user_id),
            WireEvent::Message { message } => {
                // A delivered message ends that author's typing burst
                self.remove_typing(&message.conversation_id, &message.sender_id)
            }
        }
    }

    /// Physically drop expired entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut expired = Vec::new();

        {
            let mut typing = lock(&self.typing);
            for (conversation_id, users) in typing.iter_mut() {
                users.retain(|user_id, entry| {
                    let live = entry.is_live(now);
                    if !live && entry.state == PresenceState::Typing {
                        expired.push(PresenceUpdate::Typing {
                            conversation_id: conversation_id.clone(),
                            user_id: user_id.clone(),
                            state: PresenceState::Idle,
                        });
                    }
                    live
                });
            }
            typing.retain(|_, users| !users.is_empty());
        }
        {
            let mut online = lock(&self.online);
            for (conversation_id, users) in online.iter_mut() {
                users.retain(|user_id, expires_at| {
                    let live = *expires_at > now;
                    if !live {
                        expired.push(PresenceUpdate::Online {
                            conversation_id: conversation_id.clone(),
                            user_id: user_id.clone(),
                            online: false,
                        });
                    }
                    live
                });
            }
            online.retain(|_, users| !users.is_empty());
        }

        let count = expired.len();
        for update in expired {
            self.notify(update);
        }
        if count > 0 {
            debug!("Evicted {} expired presence entries", count);
        }
        count
    }

    /// Periodically evict expired entries so watchers see typing stop on time.
    /// The task ends once the tracker is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        let tracker: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match tracker.upgrade() {
                    Some(tracker) => {
                        tracker.evict_expired();
                    }
                    None => break,
                }
            }
        })
    }

    pub fn clear_conversation(&self, conversation_id: &str) {
        lock(&self.typing).remove(conversation_id);
        lock(&self.online).remove(conversation_id);
    }

    pub fn clear_all(&self) {
        lock(&self.typing).clear();
        lock(&self.online).clear();
        self.notify(PresenceUpdate::Cleared);
    }

    pub fn watch(&self) -> mpsc::UnboundedReceiver<PresenceUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.watchers).push(tx);
        rx
    }

    fn refresh_typing(&self, conversation_id: &str, user_id: &str) {
        let now = self.clock.now();
        let was_live = {
            let mut typing = lock(&self.typing);
            let users = typing.entry(conversation_id.to_string()).or_default();
            let was_live = users
                .get(user_id)
                .map_or(false, |e| e.state == PresenceState::Typing && e.is_live(now));
            users.insert(
                user_id.to_string(),
                PresenceEntry {
                    user_id: user_id.to_string(),
                    conversation_id: conversation_id.to_string(),
                    state: PresenceState::Typing,
                    expires_at: now + self.typing_ttl,
                },
            );
            was_live
        };

        if !was_live {
            self.notify(PresenceUpdate::Typing {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                state: PresenceState::Typing,
            });
        }
    }

    fn remove_typing(&self, conversation_id: &str, user_id: &str) {
        let removed = {
            let mut typing = lock(&self.typing);
            let removed = typing
                .get_mut(conversation_id)
                .and_then(|users| users.remove(user_id));
            if typing.get(conversation_id).map_or(false, |users| users.is_empty()) {
                typing.remove(conversation_id);
            }
            removed
        };

        if removed.is_some() {
            self.notify(PresenceUpdate::Typing {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                state: PresenceState::Idle,
            });
        }
    }

    fn refresh_online(&self, conversation_id: &str, user_id: &str) {
        let now = self.clock.now();
        let was_online = lock(&self.online)
            .entry(conversation_id.to_string())
            .or_default()
            .insert(user_id.to_string(), now + self.online_ttl)
            .map_or(false, |expires_at| expires_at > now);

        if !was_online {
            self.notify(PresenceUpdate::Online {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                online: true,
            });
        }
    }

    fn announce(&self, conversation_id: &str, event: &WireEvent) {
        let Some(broadcaster) = &self.broadcaster else {
            return;
        };
        match broadcaster.broadcast(conversation_id, event) {
            Ok(true) => {}
            Ok(false) => debug!("No live channel for {}, presence stays local", conversation_id),
            Err(e) => warn!("Failed to broadcast presence for {}: {}", conversation_id, e),
        }
    }

    fn notify(&self, update: PresenceUpdate) {
        lock(&self.watchers).retain(|tx| tx.send(update.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration as StdDuration;

    #[derive(Default)]
    struct RecordingBroadcaster {
        sent: Mutex<Vec<(String, WireEvent)>>,
    }

    impl PresenceBroadcaster for RecordingBroadcaster {
        fn broadcast(&self, conversation_id: &str, event: &WireEvent) -> Result<bool> {
            lock(&self.sent).push((conversation_id.to_string(), event.clone()));
            Ok(true)
        }
    }

    fn tracker() -> (PresenceTracker, Arc<ManualClock>, Arc<RecordingBroadcaster>) {
        let clock = Arc::new(ManualClock::default());
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let tracker = PresenceTracker::new(&SyncConfig::default(), clock.clone())
            .with_broadcaster(broadcaster.clone());
        (tracker, clock, broadcaster)
    }

    #[test]
    fn test_typing_expires_without_clear() {
        let (tracker, clock, _) = tracker();
        tracker.set_typing("g1", "kid").unwrap();
        assert!(tracker.typing_users("g1").contains("kid"));

        clock.advance(StdDuration::from_millis(2_999));
        assert!(tracker.typing_users("g1").contains("kid"));

        clock.advance(StdDuration::from_millis(1));
        assert!(tracker.typing_users("g1").is_empty());
    }

    #[test]
    fn test_heartbeat_refreshes_expiry() {
        let (tracker, clock, _) = tracker();
        tracker.set_typing("g1", "kid").unwrap();
        clock.advance(StdDuration::from_secs(2));
        tracker.set_typing("g1", "kid").unwrap();
        clock.advance(StdDuration::from_secs(2));

        assert_eq!(tracker.typing_users("g1").len(), 1);
        let entry = &tracker.entries("g1")[0];
        assert_eq!(entry.expires_at, clock.now() + Duration::seconds(1));
    }

    #[test]
    fn test_clear_is_immediate_and_broadcast() {
        let (tracker, _, broadcaster) = tracker();
        tracker.set_typing("g1", "kid").unwrap();
        tracker.clear_typing("g1", "kid").unwrap();
        assert!(tracker.typing_users("g1").is_empty());

        let sent = lock(&broadcaster.sent);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, wire::typing_event("g1", "kid", PresenceState::Typing));
        assert_eq!(sent[1].1, wire::typing_event("g1", "kid", PresenceState::Idle));
    }

    #[test]
    fn test_conversations_are_independent() {
        let (tracker, _, _) = tracker();
        tracker.set_typing("g1", "kid").unwrap();
        tracker.set_typing("g2", "mom").unwrap();
        assert_eq!(tracker.typing_users("g1").into_iter().collect::<Vec<_>>(), vec!["kid"]);
        assert_eq!(tracker.typing_users("g2").into_iter().collect::<Vec<_>>(), vec!["mom"]);
    }

    #[test]
    fn test_remote_events_do_not_echo() {
        let (tracker, _, broadcaster) = tracker();
        tracker.record_remote(&wire::typing_event("g1", "dad", PresenceState::Typing));
        assert!(tracker.typing_users("g1").contains("dad"));

        tracker.record_remote(&wire::typing_event("g1", "dad", PresenceState::Idle));
        assert!(tracker.typing_users("g1").is_empty());
        assert!(lock(&broadcaster.sent).is_empty());
    }

    #[test]
    fn test_online_uses_longer_ttl() {
        let (tracker, clock, _) = tracker();
        tracker.heartbeat("g1", "grandma").unwrap();
        clock.advance(StdDuration::from_secs(10));
        assert!(tracker.online_users("g1").contains("grandma"));
        clock.advance(StdDuration::from_secs(21));
        assert!(tracker.online_users("g1").is_empty());
    }

    #[test]
    fn test_evict_expired_notifies_watchers() {
        let (tracker, clock, _) = tracker();
        let mut updates = tracker.watch();
        tracker.set_typing("g1", "kid").unwrap();
        clock.advance(StdDuration::from_secs(5));

        assert_eq!(tracker.evict_expired(), 1);
        assert_eq!(tracker.evict_expired(), 0);

        let mut seen = Vec::new();
        while let Ok(update) = updates.try_recv() {
            seen.push(update);
        }
        assert_eq!(
            seen.last(),
            Some(&PresenceUpdate::Typing {
                conversation_id: "g1".to_string(),
                user_id: "kid".to_string(),
                state: PresenceState::Idle,
            })
        );
    }

    #[test]
    fn test_empty_ids_rejected() {
        let (tracker, _, _) = tracker();
        assert!(matches!(tracker.set_typing("", "kid"), Err(ChatError::Validation(_))));
        assert!(matches!(tracker.clear_typing("g1", ""), Err(ChatError::Validation(_))));
    }
}
