//! In-process backend implementing every port.
//!
//! [`MemoryBackend`] keeps a committed log per conversation and a topic hub
//! of open channels. Persisted messages are echoed to every channel on the
//! conversation's topic, the way a hosted realtime service would. It also
//! carries the knobs tests need: open/close counters, a fetch log,
//! scripted failures, forced disconnects and a persistence gate.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::clock::{Clock, SystemClock};
use crate::error::{ChatError, Result};
use crate::models::{ConversationId, Cursor, Message, MessageDraft, MessageStatus, UserId};
use crate::ports::{
    conversation_for, topic_for, ChannelEvent, IdentityPort, LiveChannel, OpenedChannel,
    PersistencePort, RealtimePort,
};
use crate::utils::lock;
use crate::wire;

/// One `fetch_messages` call as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRecord {
    pub conversation_id: ConversationId,
    pub since: Option<String>,
}

struct HubChannel {
    id: u64,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Default)]
struct BackendState {
    log: HashMap<ConversationId, Vec<Message>>,
    groups: HashMap<String, Vec<UserId>>,
    hub: HashMap<String, Vec<HubChannel>>,
    open_count: HashMap<String, usize>,
    close_count: HashMap<String, usize>,
    broadcasts: HashMap<String, Vec<String>>,
    fetches: Vec<FetchRecord>,
    persist_failures: VecDeque<ChatError>,
    fetch_failures: VecDeque<ChatError>,
    open_failures: VecDeque<ChatError>,
    fetch_delay: Option<Duration>,
    next_id: u64,
}

#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
    clock: Arc<dyn Clock>,
    persist_gate: watch::Receiver<bool>,
    persist_gate_tx: Arc<watch::Sender<bool>>,
    next_channel: Arc<AtomicU64>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend::new(Arc::new(SystemClock))
    }
}

impl MemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (gate_tx, gate_rx) = watch::channel(true);
        MemoryBackend {
            state: Arc::new(Mutex::new(BackendState::default())),
            clock,
            persist_gate: gate_rx,
            persist_gate_tx: Arc::new(gate_tx),
            next_channel: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn add_group(&self, group_id: &str, members: &[&str]) {
        lock(&self.state)
            .groups
            .insert(group_id.to_string(), members.iter().map(|m| m.to_string()).collect());
    }

    /// Commit a message as if another client had sent it, and echo it live.
    pub fn seed_message(&self, conversation_id: &str, sender_id: &str, body: &str) -> Message {
        let draft = MessageDraft {
            correlation_id: format!("seed-{}", uuid::Uuid::new_v4()),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            attachment: None,
        };
        self.commit(&draft)
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        lock(&self.state)
            .log
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn open_count(&self, topic: &str) -> usize {
        lock(&self.state).open_count.get(topic).copied().unwrap_or(0)
    }

    pub fn close_count(&self, topic: &str) -> usize {
        lock(&self.state).close_count.get(topic).copied().unwrap_or(0)
    }

    pub fn live_channels(&self, topic: &str) -> usize {
        lock(&self.state).hub.get(topic).map_or(0, Vec::len)
    }

    /// Payloads clients pushed with `LiveChannel::send` on a topic.
    pub fn broadcasts(&self, topic: &str) -> Vec<String> {
        lock(&self.state).broadcasts.get(topic).cloned().unwrap_or_default()
    }

    pub fn fetches(&self) -> Vec<FetchRecord> {
        lock(&self.state).fetches.clone()
    }

    pub fn fail_next_persist(&self, err: ChatError) {
        lock(&self.state).persist_failures.push_back(err);
    }

    pub fn fail_next_fetch(&self, err: ChatError) {
        lock(&self.state).fetch_failures.push_back(err);
    }

    pub fn fail_next_open(&self, err: ChatError) {
        lock(&self.state).open_failures.push_back(err);
    }

    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        lock(&self.state).fetch_delay = delay;
    }

    /// Hold every persist call until [`MemoryBackend::resume_persistence`].
    pub fn pause_persistence(&self) {
        let _ = self.persist_gate_tx.send(false);
    }

    pub fn resume_persistence(&self) {
        let _ = self.persist_gate_tx.send(true);
    }

    /// Drop every channel on a topic, as a network loss would.
    pub fn disconnect(&self, topic: &str) {
        let dropped = lock(&self.state).hub.remove(topic).unwrap_or_default();
        debug!("Dropping {} channel(s) on {}", dropped.len(), topic);
        for channel in dropped {
            let _ = channel
                .events
                .send(ChannelEvent::Disconnected("connection reset".to_string()));
        }
    }

    /// Deliver a raw payload to every channel on a topic.
    pub fn inject(&self, topic: &str, payload: &str) {
        self.deliver(topic, None, payload);
    }

    fn deliver(&self, topic: &str, except: Option<u64>, payload: &str) {
        let state = lock(&self.state);
        if let Some(channels) = state.hub.get(topic) {
            for channel in channels.iter().filter(|c| Some(c.id) != except) {
                let _ = channel.events.send(ChannelEvent::Payload(payload.to_string()));
            }
        }
    }

    fn next_timestamp(&self, log: &[Message]) -> DateTime<Utc> {
        let now = self.clock.now();
        match log.last() {
            Some(last) if last.created_at >= now => last.created_at + ChronoDuration::milliseconds(1),
            _ => now,
        }
    }

    fn commit(&self, draft: &MessageDraft) -> Message {
        let message = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            let id = format!("m{}", state.next_id);
            let created_at = {
                let log = state.log.get(&draft.conversation_id).map(Vec::as_slice).unwrap_or(&[]);
                self.next_timestamp(log)
            };
            let message = Message {
                id,
                conversation_id: draft.conversation_id.clone(),
                sender_id: draft.sender_id.clone(),
                body: draft.body.clone(),
                attachment: draft.attachment.clone(),
                created_at,
                status: MessageStatus::Sent,
                correlation_id: Some(draft.correlation_id.clone()),
            };
            state
                .log
                .entry(draft.conversation_id.clone())
                .or_default()
                .push(message.clone());
            message
        };

        if let Ok(payload) = wire::encode(&wire::message_event(&message)) {
            self.deliver(&topic_for(&message.conversation_id), None, &payload);
        }
        message
    }

    fn check_membership(&self, draft: &MessageDraft) -> Result<()> {
        let state = lock(&self.state);
        match state.groups.get(&draft.conversation_id) {
            Some(members) if !members.contains(&draft.sender_id) => Err(ChatError::Permission(format!(
                "{} is not a member of {}",
                draft.sender_id, draft.conversation_id
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PersistencePort for MemoryBackend {
    async fn fetch_messages(&self, conversation_id: &str, since: Option<&Cursor>) -> Result<Vec<Message>> {
        let (failure, delay) = {
            let mut state = lock(&self.state);
            state.fetches.push(FetchRecord {
                conversation_id: conversation_id.to_string(),
                since: since.map(|c| c.message_id.clone()),
            });
            (state.fetch_failures.pop_front(), state.fetch_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let log = self.messages(conversation_id);
        let start = match since {
            None => 0,
            Some(cursor) => match log.iter().position(|m| m.id == cursor.message_id) {
                Some(pos) => pos + 1,
                None => log.partition_point(|m| m.created_at <= cursor.created_at),
            },
        };
        Ok(log[start..].to_vec())
    }

    async fn persist_message(&self, draft: &MessageDraft) -> Result<Message> {
        let mut gate = self.persist_gate.clone();
        loop {
            let open = *gate.borrow_and_update();
            if open || gate.changed().await.is_err() {
                break;
            }
        }

        let failure = lock(&self.state).persist_failures.pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        self.check_membership(draft)?;
        Ok(self.commit(draft))
    }

    async fn fetch_group_members(&self, group_id: &str) -> Result<Vec<UserId>> {
        lock(&self.state)
            .groups
            .get(group_id)
            .cloned()
            .ok_or_else(|| ChatError::Permission(format!("no access to group {}", group_id)))
    }
}

struct MemoryChannel {
    id: u64,
    topic: String,
    backend: MemoryBackend,
    closed: AtomicBool,
}

impl LiveChannel for MemoryChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn send(&self, payload: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChatError::TransientNetwork(format!("channel {} is closed", self.topic)));
        }
        lock(&self.backend.state)
            .broadcasts
            .entry(self.topic.clone())
            .or_default()
            .push(payload.clone());
        self.backend.deliver(&self.topic, Some(self.id), &payload);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = lock(&self.backend.state);
        *state.close_count.entry(self.topic.clone()).or_default() += 1;
        if let Some(channels) = state.hub.get_mut(&self.topic) {
            channels.retain(|c| c.id != self.id);
        }
    }
}

#[async_trait]
impl RealtimePort for MemoryBackend {
    async fn open_channel(&self, topic: &str) -> Result<OpenedChannel> {
        if conversation_for(topic).is_none() {
            return Err(ChatError::Validation(format!("unknown topic {}", topic)));
        }

        let mut state = lock(&self.state);
        *state.open_count.entry(topic.to_string()).or_default() += 1;
        if let Some(err) = state.open_failures.pop_front() {
            return Err(err);
        }

        let id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .hub
            .entry(topic.to_string())
            .or_default()
            .push(HubChannel { id, events: tx });

        Ok(OpenedChannel {
            channel: Arc::new(MemoryChannel {
                id,
                topic: topic.to_string(),
                backend: self.clone(),
                closed: AtomicBool::new(false),
            }),
            events: rx,
        })
    }
}

/// Identity port driven by hand.
pub struct MemoryIdentity {
    user: watch::Sender<Option<UserId>>,
    receiver: watch::Receiver<Option<UserId>>,
}

impl MemoryIdentity {
    pub fn signed_in(user_id: &str) -> Self {
        let (user, receiver) = watch::channel(Some(user_id.to_string()));
        MemoryIdentity { user, receiver }
    }

    pub fn signed_out() -> Self {
        let (user, receiver) = watch::channel(None);
        MemoryIdentity { user, receiver }
    }

    pub fn sign_in(&self, user_id: &str) {
        let _ = self.user.send(Some(user_id.to_string()));
    }

    pub fn sign_out(&self) {
        let _ = self.user.send(None);
    }
}

impl IdentityPort for MemoryIdentity {
    fn current_user_id(&self) -> Option<UserId> {
        self.receiver.borrow().clone()
    }

    fn auth_changes(&self) -> watch::Receiver<Option<UserId>> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(conversation_id: &str, sender: &str, body: &str) -> MessageDraft {
        MessageDraft {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender.to_string(),
            body: body.to_string(),
            attachment: None,
        }
    }

    #[tokio::test]
    async fn test_persist_assigns_monotonic_ids_and_times() {
        let backend = MemoryBackend::default();
        let a = backend.persist_message(&draft("g1", "mom", "one")).await.unwrap();
        let b = backend.persist_message(&draft("g1", "mom", "two")).await.unwrap();

        assert_ne!(a.id, b.id);
        assert!(b.created_at > a.created_at);
        assert_eq!(a.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_fetch_since_cursor() {
        let backend = MemoryBackend::default();
        let first = backend.seed_message("g1", "mom", "one");
        backend.seed_message("g1", "dad", "two");
        backend.seed_message("g1", "kid", "three");

        let cursor = Cursor {
            message_id: first.id.clone(),
            created_at: first.created_at,
        };
        let newer = backend.fetch_messages("g1", Some(&cursor)).await.unwrap();
        assert_eq!(newer.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(), vec!["two", "three"]);
        assert_eq!(backend.fetches()[0].since, Some(first.id));
    }

    #[tokio::test]
    async fn test_membership_enforced() {
        let backend = MemoryBackend::default();
        backend.add_group("g1", &["mom", "dad"]);
        let err = backend
            .persist_message(&draft("g1", "stranger", "hi"))
            .await
            .unwrap_err();
        assert!(err.is_permission());
        assert_eq!(backend.fetch_group_members("g1").await.unwrap(), vec!["mom", "dad"]);
    }

    #[tokio::test]
    async fn test_channels_fan_out_and_count() {
        let backend = MemoryBackend::default();
        let topic = topic_for("g1");
        let mut a = backend.open_channel(&topic).await.unwrap();
        let mut b = backend.open_channel(&topic).await.unwrap();

        a.channel.send("ping".to_string()).unwrap();
        assert_eq!(b.events.recv().await, Some(ChannelEvent::Payload("ping".to_string())));
        assert!(a.events.try_recv().is_err(), "sender does not hear itself");

        a.channel.close();
        a.channel.close();
        assert_eq!(backend.open_count(&topic), 2);
        assert_eq!(backend.close_count(&topic), 1);
        assert_eq!(backend.live_channels(&topic), 1);
    }

    #[test]
    fn test_identity_switches() {
        let identity = MemoryIdentity::signed_in("alice");
        let changes = identity.auth_changes();
        assert_eq!(identity.current_user_id().as_deref(), Some("alice"));

        identity.sign_out();
        assert_eq!(identity.current_user_id(), None);
        assert!(changes.has_changed().unwrap());
    }
}
