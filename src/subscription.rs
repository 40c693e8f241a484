//! Live channel lifecycle.
//!
//! One realtime channel per conversation, shared by every handle that
//! subscribes to it. Each live channel gets a pump task that
//!
//! 1. resyncs the store from the persistence port (bounded by a timeout),
//! 2. decodes inbound payloads and routes them to the store / presence tracker,
//! 3. on disconnect or failed resync, reopens the channel with exponential
//!    backoff and resyncs again from the store's cursor.
//!
//! Dropping the last handle closes the channel immediately and stops the
//! pump; any fetch still in flight for it is discarded. A permission
//! failure on open or resync removes the subscription the same way.

use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::error::{ChatError, Result};
use crate::models::ConversationId;
use crate::ports::{topic_for, ChannelEvent, LiveChannel, OpenedChannel, PersistencePort, RealtimePort};
use crate::presence::{PresenceBroadcaster, PresenceTracker};
use crate::store::StoreRegistry;
use crate::utils::lock;
use crate::wire::{self, WireEvent};

/// Proof of one subscription. Pass it back to [`SubscriptionManager::unsubscribe`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    conversation_id: ConversationId,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

#[derive(Default)]
struct SlotState {
    channel: Option<Arc<dyn LiveChannel>>,
    disposed: bool,
}

/// The currently open channel of a subscription, if any.
#[derive(Default)]
struct ChannelSlot {
    state: Mutex<SlotState>,
}

impl ChannelSlot {
    /// Returns false if the subscription was disposed meanwhile.
    fn install(&self, channel: Arc<dyn LiveChannel>) -> bool {
        let mut state = lock(&self.state);
        if state.disposed {
            return false;
        }
        state.channel = Some(channel);
        true
    }

    /// Forget a dead channel. Returns false if disposal already took it.
    fn detach(&self) -> bool {
        let mut state = lock(&self.state);
        if state.disposed {
            return false;
        }
        state.channel = None;
        true
    }

    fn dispose(&self) -> Option<Arc<dyn LiveChannel>> {
        let mut state = lock(&self.state);
        state.disposed = true;
        state.channel.take()
    }

    fn is_disposed(&self) -> bool {
        lock(&self.state).disposed
    }

    fn current(&self) -> Option<Arc<dyn LiveChannel>> {
        lock(&self.state).channel.clone()
    }
}

struct LiveSubscription {
    handles: HashSet<u64>,
    slot: Arc<ChannelSlot>,
    shutdown: watch::Sender<bool>,
}

/// Refcounted map of live channels, keyed by conversation.
#[derive(Default)]
pub struct ChannelRegistry {
    entries: Mutex<HashMap<ConversationId, LiveSubscription>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refcount(&self, conversation_id: &str) -> usize {
        lock(&self.entries)
            .get(conversation_id)
            .map_or(0, |live| live.handles.len())
    }

    /// Whether a channel is currently open (not between reconnect attempts).
    pub fn is_connected(&self, conversation_id: &str) -> bool {
        lock(&self.entries)
            .get(conversation_id)
            .map_or(false, |live| live.slot.current().is_some())
    }

    pub fn conversations(&self) -> Vec<ConversationId> {
        lock(&self.entries).keys().cloned().collect()
    }

    fn slot(&self, conversation_id: &str) -> Option<Arc<ChannelSlot>> {
        lock(&self.entries)
            .get(conversation_id)
            .map(|live| live.slot.clone())
    }
}

impl PresenceBroadcaster for ChannelRegistry {
    fn broadcast(&self, conversation_id: &str, event: &WireEvent) -> Result<bool> {
        let Some(channel) = self.slot(conversation_id).and_then(|slot| slot.current()) else {
            return Ok(false);
        };
        channel.send(wire::encode(event)?)?;
        Ok(true)
    }
}

enum Resync {
    Applied(usize),
    Failed(ChatError),
    Cancelled,
}

struct ManagerInner {
    realtime: Arc<dyn RealtimePort>,
    persistence: Arc<dyn PersistencePort>,
    stores: Arc<StoreRegistry>,
    presence: Arc<PresenceTracker>,
    channels: Arc<ChannelRegistry>,
    backoff: Backoff,
    resync_timeout: Duration,
    next_handle: AtomicU64,
}

/// Opens, shares and tears down live channels. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(
        realtime: Arc<dyn RealtimePort>,
        persistence: Arc<dyn PersistencePort>,
        stores: Arc<StoreRegistry>,
        presence: Arc<PresenceTracker>,
        channels: Arc<ChannelRegistry>,
        config: &SyncConfig,
    ) -> Self {
        SubscriptionManager {
            inner: Arc::new(ManagerInner {
                realtime,
                persistence,
                stores,
                presence,
                channels,
                backoff: Backoff::from_config(config),
                resync_timeout: config.resync_timeout(),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.inner.channels
    }

    /// Subscribe to a conversation's live updates.
    ///
    /// The first subscriber opens the channel and waits for the initial
    /// resync; later subscribers share it and return at once. Only
    /// validation and permission failures are returned, and a refused open
    /// or first resync removes the subscription again. A transient failure
    /// is retried in the background.
    pub async fn subscribe(&self, conversation_id: &str) -> Result<SubscriptionHandle> {
        if conversation_id.trim().is_empty() {
            return Err(ChatError::Validation("empty conversation id".to_string()));
        }

        let handle = SubscriptionHandle {
            id: self.inner.next_handle.fetch_add(1, Ordering::Relaxed),
            conversation_id: conversation_id.to_string(),
        };

        let (slot, shutdown_rx) = {
            let mut entries = lock(&self.inner.channels.entries);
            if let Some(live) = entries.get_mut(conversation_id) {
                live.handles.insert(handle.id);
                debug!(
                    "Joined live channel for {} (refcount {})",
                    conversation_id,
                    live.handles.len()
                );
                return Ok(handle);
            }

            let slot = Arc::new(ChannelSlot::default());
            let (shutdown, shutdown_rx) = watch::channel(false);
            entries.insert(
                conversation_id.to_string(),
                LiveSubscription {
                    handles: HashSet::from([handle.id]),
                    slot: slot.clone(),
                    shutdown,
                },
            );
            (slot, shutdown_rx)
        };

        self.inner.stores.get_or_create(conversation_id);
        let topic = topic_for(conversation_id);
        info!("Opening live channel {}", topic);

        let opened = match self.inner.realtime.open_channel(&topic).await {
            Ok(opened) => Some(opened),
            Err(e) if e.is_transient() => {
                warn!("Could not open {} yet, retrying in background: {}", topic, e);
                None
            }
            Err(e) => {
                error!("Failed to open {}: {}", topic, e);
                self.inner.abandon(conversation_id, &slot);
                return Err(e);
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let wait_for_resync = opened.is_some();
        tokio::spawn(Self::run_channel(
            self.inner.clone(),
            conversation_id.to_string(),
            slot,
            opened,
            shutdown_rx,
            ready_tx,
        ));

        if wait_for_resync {
            if let Ok(Err(e)) = ready_rx.await {
                return Err(e);
            }
        }
        Ok(handle)
    }

    /// Release one handle. The channel closes when the last handle goes.
    /// Unknown or already released handles are ignored.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = {
            let mut entries = lock(&self.inner.channels.entries);
            let Some(live) = entries.get_mut(&handle.conversation_id) else {
                return false;
            };
            if !live.handles.remove(&handle.id) {
                return false;
            }
            if !live.handles.is_empty() {
                debug!(
                    "Released handle {} for {} (refcount {})",
                    handle.id,
                    handle.conversation_id,
                    live.handles.len()
                );
                return true;
            }
            entries.remove(&handle.conversation_id)
        };

        if let Some(live) = removed {
            self.inner.dispose(&handle.conversation_id, live);
        }
        true
    }

    /// Close every channel, e.g. on sign-out.
    pub fn unsubscribe_all(&self) {
        let drained: Vec<_> = lock(&self.inner.channels.entries).drain().collect();
        for (conversation_id, live) in drained {
            self.inner.dispose(&conversation_id, live);
        }
    }

    pub fn refcount(&self, conversation_id: &str) -> usize {
        self.inner.channels.refcount(conversation_id)
    }

    pub fn is_subscribed(&self, conversation_id: &str) -> bool {
        self.refcount(conversation_id) > 0
    }

    pub fn is_connected(&self, conversation_id: &str) -> bool {
        self.inner.channels.is_connected(conversation_id)
    }

    async fn run_channel(
        inner: Arc<ManagerInner>,
        conversation_id: ConversationId,
        slot: Arc<ChannelSlot>,
        mut opened: Option<OpenedChannel>,
        mut shutdown: watch::Receiver<bool>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let topic = topic_for(&conversation_id);
        let mut ready = Some(ready);
        let mut attempt: u32 = 0;

        loop {
            let OpenedChannel { channel, mut events } = match opened.take() {
                Some(opened) => opened,
                None => match inner.reconnect(&topic, &mut attempt, &mut shutdown).await {
                    Ok(Some(opened)) => opened,
                    Ok(None) => return,
                    Err(e) => {
                        inner.abandon(&conversation_id, &slot);
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Err(e));
                        }
                        return;
                    }
                },
            };

            if !slot.install(channel.clone()) {
                channel.close();
                return;
            }

            let resync = inner.resync(&conversation_id, &slot, &mut shutdown).await;
            if let Resync::Failed(e) = &resync {
                if e.is_permission() {
                    error!("Resync of {} refused, giving up: {}", conversation_id, e);
                    inner.abandon(&conversation_id, &slot);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(e.clone()));
                    }
                    return;
                }
            }
            if let Some(tx) = ready.take() {
                let _ = tx.send(Ok(()));
            }
            match resync {
                Resync::Applied(changed) => {
                    debug!("Resynced {} ({} changes)", conversation_id, changed);
                    attempt = 0;
                }
                Resync::Cancelled => return,
                Resync::Failed(e) => {
                    warn!("Resync of {} failed: {}", conversation_id, e);
                    if !slot.detach() {
                        return;
                    }
                    channel.close();
                    continue;
                }
            }

            let reason = loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    event = events.recv() => match event {
                        Some(ChannelEvent::Payload(payload)) => {
                            inner.route(&conversation_id, &slot, &payload);
                        }
                        Some(ChannelEvent::Disconnected(reason)) => break reason,
                        None => break "event stream ended".to_string(),
                    },
                }
            };

            info!("Live channel {} dropped: {}", topic, reason);
            if !slot.detach() {
                return;
            }
            channel.close();
        }
    }
}

impl ManagerInner {
    fn dispose(&self, conversation_id: &str, live: LiveSubscription) {
        if let Some(channel) = live.slot.dispose() {
            channel.close();
        }
        let _ = live.shutdown.send(true);
        self.stores.remove(conversation_id);
        self.presence.clear_conversation(conversation_id);
        info!("Closed live channel for {}", conversation_id);
    }

    /// Drop a subscription the backend refused. A newer subscription that
    /// replaced it in the meantime is left alone.
    fn abandon(&self, conversation_id: &str, slot: &Arc<ChannelSlot>) {
        let removed = {
            let mut entries = lock(&self.channels.entries);
            let ours = entries
                .get(conversation_id)
                .map_or(false, |live| Arc::ptr_eq(&live.slot, slot));
            if ours {
                entries.remove(conversation_id)
            } else {
                None
            }
        };
        if let Some(live) = removed {
            self.dispose(conversation_id, live);
        }
    }

    /// Reopen a channel, backing off between attempts. `Ok(None)` means the
    /// subscription was disposed; an error means the backend refused it.
    async fn reconnect(
        &self,
        topic: &str,
        attempt: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<OpenedChannel>> {
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }
            let delay = self.backoff.delay(*attempt);
            info!("Reconnecting {} in {:?} (attempt {})", topic, delay, *attempt + 1);

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(None);
                    }
                    continue;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            *attempt = attempt.saturating_add(1);

            let result = tokio::select! {
                _ = shutdown.changed() => return Ok(None),
                result = self.realtime.open_channel(topic) => result,
            };
            match result {
                Ok(opened) => {
                    info!("Reconnected {}", topic);
                    return Ok(Some(opened));
                }
                Err(e) if e.is_transient() => warn!("Reconnect of {} failed: {}", topic, e),
                Err(e) => {
                    error!("Reconnect of {} refused, giving up: {}", topic, e);
                    return Err(e);
                }
            }
        }
    }

    /// Fetch what was missed since the store's cursor and merge it.
    async fn resync(
        &self,
        conversation_id: &str,
        slot: &ChannelSlot,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Resync {
        let Some(store) = self.stores.get(conversation_id) else {
            return Resync::Cancelled;
        };
        let cursor = store.cursor();
        debug!(
            "Resyncing {} since {:?}",
            conversation_id,
            cursor.as_ref().map(|c| c.message_id.as_str())
        );

        let fetch = self.persistence.fetch_messages(conversation_id, cursor.as_ref());
        let result = tokio::select! {
            _ = shutdown.changed() => return Resync::Cancelled,
            result = tokio::time::timeout(self.resync_timeout, fetch) => result,
        };

        // Disposed while the fetch was in flight: drop the result
        if slot.is_disposed() {
            return Resync::Cancelled;
        }
        match result {
            Err(_) => Resync::Failed(ChatError::Timeout(self.resync_timeout)),
            Ok(Err(e)) => Resync::Failed(e),
            Ok(Ok(messages)) => Resync::Applied(store.merge(messages)),
        }
    }

    fn route(&self, conversation_id: &str, slot: &ChannelSlot, payload: &str) {
        if slot.is_disposed() {
            return;
        }
        let event = match wire::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping malformed event on {}: {}", topic_for(conversation_id), e);
                return;
            }
        };

        if event.conversation_id() != conversation_id {
            warn!(
                "Dropping event for {} received on {}",
                event.conversation_id(),
                topic_for(conversation_id)
            );
            return;
        }

        self.presence.record_remote(&event);
        if let WireEvent::Message { message } = event {
            let Some(store) = self.stores.get(conversation_id) else {
                debug!("No live store for {}, dropping message {}", conversation_id, message.id);
                return;
            };
            if let Err(e) = store.append(message.into_message()) {
                warn!("Rejected inbound message for {}: {}", conversation_id, e);
            }
        }
    }
}
