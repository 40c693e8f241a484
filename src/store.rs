//! Per-conversation message cache.
//!
//! A [`ConversationStore`] is the only writer of its message list. The
//! subscription pump and the send queue go through [`ConversationStore::append`]
//! and [`ConversationStore::mark_failed`]; observers get a [`StoreChange`]
//! after every mutation. The cache is not the source of truth and can be
//! rebuilt from the persistence port at any time.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::{ChatError, Result};
use crate::models::{ConversationId, CorrelationId, Cursor, Message, MessageId, MessageStatus};
use crate::utils::lock;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    Inserted { message_id: MessageId },
    /// A pending entry was confirmed in place, or an entry was refreshed.
    Replaced { previous_id: MessageId, message_id: MessageId },
    Failed { correlation_id: CorrelationId },
    Read { through: MessageId },
    Evicted { message_id: MessageId },
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Replaced,
    /// Already known with the same committed state; nothing changed.
    Duplicate,
}

#[derive(Default)]
struct StoreState {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    last_read_at: Option<DateTime<Utc>>,
}

impl StoreState {
    fn position_of_id(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    fn position_of_correlation(&self, correlation_id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.correlation_id.as_deref() == Some(correlation_id))
    }

    /// Just after the last entry not newer than `created_at`, so equal
    /// timestamps keep arrival order.
    ///
    /// Confirmed entries keep the slot of their pending copy but take the
    /// server's timestamp, so the list is only mostly sorted and a binary
    /// search would be unreliable.
    fn insertion_point(&self, created_at: DateTime<Utc>) -> usize {
        self.messages
            .iter()
            .rposition(|m| m.created_at <= created_at)
            .map_or(0, |pos| pos + 1)
    }

    fn replace_at(&mut self, pos: usize, message: Message) -> MessageId {
        let previous = std::mem::replace(&mut self.messages[pos], message);
        self.ids.remove(&previous.id);
        self.ids.insert(self.messages[pos].id.clone());
        previous.id
    }
}

pub struct ConversationStore {
    conversation_id: ConversationId,
    max_history: usize,
    state: Mutex<StoreState>,
    observers: Mutex<Vec<mpsc::UnboundedSender<StoreChange>>>,
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("conversation_id", &self.conversation_id)
            .field("len", &self.len())
            .finish()
    }
}

impl ConversationStore {
    pub fn new(conversation_id: impl Into<String>, max_history: usize) -> Self {
        ConversationStore {
            conversation_id: conversation_id.into(),
            max_history: max_history.max(1),
            state: Mutex::new(StoreState::default()),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Insert a message, or merge it with an entry it supersedes.
    ///
    /// * a known id is a duplicate unless it upgrades a non-committed entry
    /// * a correlation id matching an uncommitted entry replaces that entry
    ///   in place, keeping its list position
    /// * anything else is inserted by `created_at`, ties after existing entries
    pub fn append(&self, message: Message) -> Result<AppendOutcome> {
        if message.conversation_id != self.conversation_id {
            return Err(ChatError::Validation(format!(
                "message {} belongs to {}, not {}",
                message.id, message.conversation_id, self.conversation_id
            )));
        }
        if message.id.is_empty() {
            return Err(ChatError::Validation("message without id".to_string()));
        }

        let mut changes = Vec::new();
        let outcome = {
            let mut state = lock(&self.state);

            if state.ids.contains(&message.id) {
                let pos = state.position_of_id(&message.id);
                match pos {
                    Some(pos)
                        if state.messages[pos].status != MessageStatus::Sent
                            && message.status == MessageStatus::Sent =>
                    {
                        let id = message.id.clone();
                        let previous_id = state.replace_at(pos, message);
                        changes.push(StoreChange::Replaced { previous_id, message_id: id });
                        AppendOutcome::Replaced
                    }
                    _ => {
                        debug!("Ignoring duplicate message {} in {}", message.id, self.conversation_id);
                        AppendOutcome::Duplicate
                    }
                }
            } else if let Some(pos) = message
                .correlation_id
                .as_deref()
                .and_then(|cid| state.position_of_correlation(cid))
                .filter(|&pos| state.messages[pos].status != MessageStatus::Sent)
            {
                let id = message.id.clone();
                let previous_id = state.replace_at(pos, message);
                changes.push(StoreChange::Replaced { previous_id, message_id: id });
                AppendOutcome::Replaced
            } else {
                let pos = state.insertion_point(message.created_at);
                let id = message.id.clone();
                state.ids.insert(id.clone());
                state.messages.insert(pos, message);
                changes.push(StoreChange::Inserted { message_id: id });

                while state.messages.len() > self.max_history {
                    let Some(oldest) = state.messages.iter().position(|m| !m.is_pending()) else {
                        break;
                    };
                    let evicted = state.messages.remove(oldest);
                    state.ids.remove(&evicted.id);
                    changes.push(StoreChange::Evicted { message_id: evicted.id });
                }
                AppendOutcome::Inserted
            }
        };

        for change in changes {
            self.notify(change);
        }
        Ok(outcome)
    }

    /// Merge a batch, e.g. a resync page. Returns how many entries changed.
    pub fn merge(&self, messages: Vec<Message>) -> usize {
        let mut changed = 0;
        for message in messages {
            match self.append(message) {
                Ok(AppendOutcome::Duplicate) => {}
                Ok(_) => changed += 1,
                Err(e) => warn!("Skipping message during merge into {}: {}", self.conversation_id, e),
            }
        }
        changed
    }

    /// Flip a pending entry to failed. Returns false if no pending entry matched.
    pub fn mark_failed(&self, correlation_id: &str) -> bool {
        let updated = {
            let mut state = lock(&self.state);
            match state.position_of_correlation(correlation_id) {
                Some(pos) if state.messages[pos].is_pending() => {
                    state.messages[pos].status = MessageStatus::Failed;
                    true
                }
                _ => false,
            }
        };

        if updated {
            self.notify(StoreChange::Failed {
                correlation_id: correlation_id.to_string(),
            });
        }
        updated
    }

    /// Snapshot in display order.
    pub fn list(&self) -> Vec<Message> {
        lock(&self.state).messages.clone()
    }

    pub fn get(&self, id: &str) -> Option<Message> {
        let state = lock(&self.state);
        state.position_of_id(id).map(|pos| state.messages[pos].clone())
    }

    pub fn find_by_correlation(&self, correlation_id: &str) -> Option<Message> {
        let state = lock(&self.state);
        state
            .position_of_correlation(correlation_id)
            .map(|pos| state.messages[pos].clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.state).messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The newest committed message, used to resume after a reconnect.
    pub fn cursor(&self) -> Option<Cursor> {
        let state = lock(&self.state);
        state
            .messages
            .iter()
            .filter(|m| m.status == MessageStatus::Sent)
            .max_by_key(|m| m.created_at)
            .map(|m| Cursor {
                message_id: m.id.clone(),
                created_at: m.created_at,
            })
    }

    pub fn mark_read(&self, message_id: &str) -> bool {
        let marked = {
            let mut state = lock(&self.state);
            match state.position_of_id(message_id) {
                Some(pos) => {
                    let at = state.messages[pos].created_at;
                    if state.last_read_at.map_or(true, |read| at > read) {
                        state.last_read_at = Some(at);
                    }
                    true
                }
                None => false,
            }
        };

        if marked {
            self.notify(StoreChange::Read {
                through: message_id.to_string(),
            });
        }
        marked
    }

    pub fn mark_all_read(&self) {
        let latest = self.cursor();
        if let Some(cursor) = latest {
            self.mark_read(&cursor.message_id);
        }
    }

    /// Committed messages from other people newer than the read marker.
    pub fn unread_count(&self, local_user: &str) -> usize {
        let state = lock(&self.state);
        state
            .messages
            .iter()
            .filter(|m| m.status == MessageStatus::Sent && m.sender_id != local_user)
            .filter(|m| state.last_read_at.map_or(true, |read| m.created_at > read))
            .count()
    }

    pub fn clear(&self) {
        {
            let mut state = lock(&self.state);
            *state = StoreState::default();
        }
        self.notify(StoreChange::Cleared);
    }

    /// Register an observer. Dropping the receiver unregisters it.
    pub fn watch(&self) -> mpsc::UnboundedReceiver<StoreChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.observers).push(tx);
        rx
    }

    pub fn observer_count(&self) -> usize {
        let mut observers = lock(&self.observers);
        observers.retain(|tx| !tx.is_closed());
        observers.len()
    }

    fn notify(&self, change: StoreChange) {
        let mut observers = lock(&self.observers);
        observers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

/// Lazily created stores, one per conversation.
#[derive(Debug)]
pub struct StoreRegistry {
    max_history: usize,
    stores: Mutex<HashMap<ConversationId, Arc<ConversationStore>>>,
}

impl StoreRegistry {
    pub fn new(max_history: usize) -> Self {
        StoreRegistry {
            max_history,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, conversation_id: &str) -> Arc<ConversationStore> {
        lock(&self.stores)
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                debug!("Creating store for {}", conversation_id);
                Arc::new(ConversationStore::new(conversation_id, self.max_history))
            })
            .clone()
    }

    pub fn get(&self, conversation_id: &str) -> Option<Arc<ConversationStore>> {
        lock(&self.stores).get(conversation_id).cloned()
    }

    pub fn remove(&self, conversation_id: &str) -> Option<Arc<ConversationStore>> {
        let removed = lock(&self.stores).remove(conversation_id);
        if removed.is_some() {
            debug!("Disposed store for {}", conversation_id);
        }
        removed
    }

    /// Drop every store, telling observers their view is gone.
    pub fn clear_all(&self) {
        let drained: Vec<_> = lock(&self.stores).drain().map(|(_, store)| store).collect();
        for store in drained {
            store.clear();
        }
    }

    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        lock(&self.stores).keys().cloned().collect()
    }
}
