// Conversation client facade
// Wires the store registry, subscription manager, presence tracker and send
// queue to the backend ports, and tears everything down on sign-out.

use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{ChatError, Result};
use crate::models::{Attachment, Conversation, CorrelationId, Message, UserId};
use crate::outbound::OutboundQueue;
use crate::ports::{IdentityPort, PersistencePort, RealtimePort};
use crate::presence::PresenceTracker;
use crate::store::{ConversationStore, StoreChange, StoreRegistry};
use crate::subscription::{ChannelRegistry, SubscriptionHandle, SubscriptionManager};
use crate::utils::lock;

pub struct ChatClientBuilder {
    persistence: Arc<dyn PersistencePort>,
    realtime: Arc<dyn RealtimePort>,
    identity: Arc<dyn IdentityPort>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    sweep_interval: Option<Duration>,
}

impl ChatClientBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Evict expired presence on a timer instead of only filtering on read.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Arc<ChatClient>> {
        self.config.validate()?;

        let stores = Arc::new(StoreRegistry::new(self.config.max_history));
        let channels = Arc::new(ChannelRegistry::new());
        let presence = Arc::new(
            PresenceTracker::new(&self.config, self.clock.clone()).with_broadcaster(channels.clone()),
        );
        let subscriptions = SubscriptionManager::new(
            self.realtime,
            self.persistence.clone(),
            stores.clone(),
            presence.clone(),
            channels,
            &self.config,
        );
        let outbound = OutboundQueue::new(
            self.persistence.clone(),
            stores.clone(),
            self.clock.clone(),
            &self.config,
        );

        let sweeper = self.sweep_interval.map(|interval| presence.spawn_sweeper(interval));
        let client = Arc::new(ChatClient {
            identity: self.identity,
            persistence: self.persistence,
            stores,
            presence,
            subscriptions,
            outbound,
            background: Mutex::new(sweeper.into_iter().collect()),
        });

        let watcher = ChatClient::watch_auth(&client);
        lock(&client.background).push(watcher);
        Ok(client)
    }
}

pub struct ChatClient {
    identity: Arc<dyn IdentityPort>,
    persistence: Arc<dyn PersistencePort>,
    stores: Arc<StoreRegistry>,
    presence: Arc<PresenceTracker>,
    subscriptions: SubscriptionManager,
    outbound: OutboundQueue,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn builder(
        persistence: Arc<dyn PersistencePort>,
        realtime: Arc<dyn RealtimePort>,
        identity: Arc<dyn IdentityPort>,
    ) -> ChatClientBuilder {
        ChatClientBuilder {
            persistence,
            realtime,
            identity,
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
            sweep_interval: None,
        }
    }

    pub fn current_user(&self) -> Result<UserId> {
        self.identity.current_user_id().ok_or(ChatError::NotSignedIn)
    }

    pub async fn subscribe(&self, conversation_id: &str) -> Result<SubscriptionHandle> {
        self.current_user()?;
        self.subscriptions.subscribe(conversation_id).await
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.subscriptions.unsubscribe(handle)
    }

    pub fn send(
        &self,
        conversation_id: &str,
        body: &str,
        attachment: Option<Attachment>,
    ) -> Result<CorrelationId> {
        let user = self.current_user()?;
        let correlation_id = self.outbound.send(conversation_id, &user, body, attachment)?;
        // Sending ends the typing burst
        if self.presence.typing_users(conversation_id).contains(&user) {
            self.presence.clear_typing(conversation_id, &user)?;
        }
        Ok(correlation_id)
    }

    pub fn retry(&self, conversation_id: &str, correlation_id: &str) -> Result<CorrelationId> {
        let user = self.current_user()?;
        self.outbound.retry(conversation_id, &user, correlation_id)
    }

    pub fn set_typing(&self, conversation_id: &str) -> Result<()> {
        let user = self.current_user()?;
        self.presence.set_typing(conversation_id, &user)
    }

    pub fn clear_typing(&self, conversation_id: &str) -> Result<()> {
        let user = self.current_user()?;
        self.presence.clear_typing(conversation_id, &user)
    }

    pub fn heartbeat(&self, conversation_id: &str) -> Result<()> {
        let user = self.current_user()?;
        self.presence.heartbeat(conversation_id, &user)
    }

    /// Other participants currently typing.
    pub fn typing_users(&self, conversation_id: &str) -> BTreeSet<UserId> {
        let mut users = self.presence.typing_users(conversation_id);
        if let Some(me) = self.identity.current_user_id() {
            users.remove(&me);
        }
        users
    }

    pub fn online_users(&self, conversation_id: &str) -> BTreeSet<UserId> {
        self.presence.online_users(conversation_id)
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.stores
            .get(conversation_id)
            .map(|store| store.list())
            .unwrap_or_default()
    }

    pub fn store(&self, conversation_id: &str) -> Option<Arc<ConversationStore>> {
        self.stores.get(conversation_id)
    }

    pub fn watch(&self, conversation_id: &str) -> mpsc::UnboundedReceiver<StoreChange> {
        self.stores.get_or_create(conversation_id).watch()
    }

    pub fn mark_read(&self, conversation_id: &str, message_id: &str) -> bool {
        self.stores
            .get(conversation_id)
            .map_or(false, |store| store.mark_read(message_id))
    }

    pub fn unread_count(&self, conversation_id: &str) -> usize {
        match (self.stores.get(conversation_id), self.identity.current_user_id()) {
            (Some(store), Some(me)) => store.unread_count(&me),
            _ => 0,
        }
    }

    /// Build a group conversation from the backend's member list.
    pub async fn load_group(&self, group_id: &str) -> Result<Conversation> {
        let user = self.current_user()?;
        if group_id.trim().is_empty() {
            return Err(ChatError::Validation("empty group id".to_string()));
        }

        let members = self.persistence.fetch_group_members(group_id).await?;
        let group = Conversation::group(group_id, members);
        if !group.includes(&user) {
            return Err(ChatError::Permission(format!("{} is not in group {}", user, group_id)));
        }
        debug!("Loaded group {} with {} members", group_id, group.participant_ids.len());
        Ok(group)
    }

    pub fn direct_with(&self, other_user: &str) -> Result<Conversation> {
        let user = self.current_user()?;
        if other_user.is_empty() || other_user == user {
            return Err(ChatError::Validation(format!("cannot open a direct chat with {:?}", other_user)));
        }
        Ok(Conversation::direct(&user, other_user))
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Drop all conversation state: channels, queued sends, caches, presence.
    pub fn teardown(&self) {
        info!("Tearing down conversation state");
        self.subscriptions.unsubscribe_all();
        self.outbound.cancel_all();
        self.stores.clear_all();
        self.presence.clear_all();
    }

    pub fn shutdown(&self) {
        self.teardown();
        for task in lock(&self.background).drain(..) {
            task.abort();
        }
    }

    fn watch_auth(client: &Arc<ChatClient>) -> JoinHandle<()> {
        let weak: Weak<ChatClient> = Arc::downgrade(client);
        let mut changes = client.identity.auth_changes();

        tokio::spawn(async move {
            let mut current = changes.borrow_and_update().clone();
            while changes.changed().await.is_ok() {
                let next = changes.borrow_and_update().clone();
                if next == current {
                    continue;
                }
                let Some(client) = weak.upgrade() else {
                    break;
                };
                match (&current, &next) {
                    (Some(old), None) => info!("{} signed out", old),
                    (Some(old), Some(new)) => info!("Account switched from {} to {}", old, new),
                    (None, Some(new)) => info!("{} signed in", new),
                    (None, None) => {}
                }
                if current.is_some() {
                    client.teardown();
                }
                current = next;
            }
            warn!("Identity stream closed, no longer watching for sign-out");
        })
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        for task in lock(&self.background).drain(..) {
            task.abort();
        }
    }
}
