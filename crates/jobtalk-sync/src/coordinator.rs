//! Session-level orchestration.
//!
//! One [`SyncCoordinator`] per signed-in user. It owns the open
//! conversations, their live subscriptions, the offline send queue and the
//! conversation list. Buffers live behind a std mutex that is never held
//! across an await; network work happens outside it and results are
//! applied under it, tagged with the generation of the session that asked
//! for them so stale results from a closed or rebuilt session are dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures_util::{Stream, StreamExt};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use jobtalk_types::access::{Decision, DenyReason};
use jobtalk_types::models::{Conversation, ConversationSummary, Identity, Message, Role};

use crate::access::AccessGate;
use crate::backend::{Backend, FeedStream, OutgoingMessage};
use crate::backoff::with_backoff;
use crate::channel::{ChannelState, ChannelView, Delivery, MessageChannel, Outgoing, Reconciled, reconcile};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::store::ConversationStore;

/// Result of [`SyncCoordinator::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// An entry was added to the conversation; this is where it stands now.
    Delivered(Delivery),
    /// The gate refused. Nothing was added or written.
    Blocked(DenyReason),
}

impl SendOutcome {
    pub fn delivery(&self) -> Option<&Delivery> {
        match self {
            Self::Delivered(delivery) => Some(delivery),
            Self::Blocked(_) => None,
        }
    }
}

/// Live view of one open conversation.
pub struct ConversationView {
    conversation_id: Uuid,
    rx: watch::Receiver<ChannelView>,
}

impl ConversationView {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn current(&self) -> ChannelView {
        self.rx.borrow().clone()
    }

    /// Wait for the next snapshot. `None` once the conversation is closed.
    pub async fn changed(&mut self) -> Option<ChannelView> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Every snapshot from now on, starting with the current one. Ends after
    /// the closed snapshot.
    pub fn into_stream(self) -> impl Stream<Item = ChannelView> + Send + 'static {
        let mut rx = self.rx;
        async_stream::stream! {
            let first = rx.borrow_and_update().clone();
            yield first;
            while rx.changed().await.is_ok() {
                let next = rx.borrow_and_update().clone();
                yield next;
            }
        }
    }
}

struct OpenChannel {
    channel: MessageChannel,
    generation: u64,
    cancel: CancellationToken,
    view_tx: watch::Sender<ChannelView>,
    conversation: Option<Conversation>,
}

impl OpenChannel {
    fn publish(&self) {
        self.view_tx.send_replace(self.channel.snapshot());
    }
}

#[derive(Debug, Clone, Copy)]
struct QueuedSend {
    conversation_id: Uuid,
    temp_id: Uuid,
}

#[derive(Default)]
struct Session {
    open: HashMap<Uuid, OpenChannel>,
    /// Unresolved sends of closed conversations, reseeded on reopen.
    parked: HashMap<Uuid, Vec<Outgoing>>,
    /// Sends made while offline, flushed in order on reconnect.
    queued: VecDeque<QueuedSend>,
    /// A flush is draining `queued`; new sends line up behind it.
    flushing: bool,
}

impl Session {
    /// Queue a send that must not overtake earlier ones: everything while
    /// offline, and everything while a flush is still draining.
    fn enqueue_if_behind(&mut self, online: bool, conversation_id: Uuid, temp_id: Uuid) -> bool {
        if online && !self.flushing && self.queued.is_empty() {
            return false;
        }
        self.queued.push_back(QueuedSend {
            conversation_id,
            temp_id,
        });
        true
    }
}

struct Inner<B: Backend> {
    backend: Arc<B>,
    identity: Identity,
    config: SyncConfig,
    gate: AccessGate<B>,
    store: ConversationStore<B>,
    online: AtomicBool,
    next_generation: AtomicU64,
    session: Mutex<Session>,
    /// One flush at a time, so queued sends persist in queue order.
    flush_lock: AsyncMutex<()>,
}

pub struct SyncCoordinator<B: Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for SyncCoordinator<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> SyncCoordinator<B> {
    /// `store` must belong to the same user as `identity`.
    pub fn new(backend: Arc<B>, identity: Identity, store: ConversationStore<B>, config: SyncConfig) -> Self {
        debug_assert_eq!(store.user_id(), identity.user_id);
        let gate = AccessGate::new(backend.clone(), identity);
        Self {
            inner: Arc::new(Inner {
                backend,
                identity,
                config,
                gate,
                store,
                online: AtomicBool::new(true),
                next_generation: AtomicU64::new(1),
                session: Mutex::new(Session::default()),
                flush_lock: AsyncMutex::new(()),
            }),
        }
    }

    /// Coordinator with its own store over `backend`.
    pub fn for_backend(backend: Arc<B>, identity: Identity, config: SyncConfig) -> Self {
        let store = ConversationStore::new(backend.clone(), identity.user_id, config.retry);
        Self::new(backend, identity, store, config)
    }

    pub fn identity(&self) -> Identity {
        self.inner.identity
    }

    pub fn store(&self) -> &ConversationStore<B> {
        &self.inner.store
    }

    pub fn gate(&self) -> &AccessGate<B> {
        &self.inner.gate
    }

    pub fn is_online(&self) -> bool {
        self.inner.is_online()
    }

    pub fn is_open(&self, conversation_id: Uuid) -> bool {
        self.inner.lock().open.contains_key(&conversation_id)
    }

    pub fn open_conversations(&self) -> Vec<Uuid> {
        self.inner.lock().open.keys().copied().collect()
    }

    /// Another handle on an open conversation's view.
    pub fn view(&self, conversation_id: Uuid) -> Option<ConversationView> {
        let session = self.inner.lock();
        session.open.get(&conversation_id).map(|open| ConversationView {
            conversation_id,
            rx: open.view_tx.subscribe(),
        })
    }

    /// Cached conversation list; never touches the network.
    pub fn list_conversations(&self) -> Arc<Vec<ConversationSummary>> {
        self.inner.store.list()
    }

    pub async fn refresh_conversations(&self) -> Result<Arc<Vec<ConversationSummary>>, SyncError> {
        self.inner.store.refresh().await
    }

    pub async fn can_communicate(&self, job_id: Uuid, counterparty_id: Uuid, role: Role) -> bool {
        self.inner.gate.can_communicate(job_id, counterparty_id, role).await
    }

    /// Open a conversation: subscribe, load history, mark it read.
    ///
    /// Opening an already open conversation is a caller bug and fails with
    /// [`SyncError::AlreadyOpen`]. Load failures do not fail the call; they
    /// show up as `last_error` on the view and the next reconnect retries.
    pub async fn open(&self, conversation_id: Uuid) -> Result<ConversationView, SyncError> {
        let (generation, rx) = {
            let mut session = self.inner.lock();
            if session.open.contains_key(&conversation_id) {
                error!("Conversation {} opened twice", conversation_id);
                return Err(SyncError::AlreadyOpen(conversation_id));
            }

            let carried = session.parked.remove(&conversation_id).unwrap_or_default();
            let mut channel = MessageChannel::new(conversation_id);
            channel.begin_open(carried);

            let generation = self.inner.next_generation();
            let (view_tx, rx) = watch::channel(channel.snapshot());
            session.open.insert(
                conversation_id,
                OpenChannel {
                    channel,
                    generation,
                    cancel: CancellationToken::new(),
                    view_tx,
                    conversation: None,
                },
            );
            (generation, rx)
        };

        info!("Opening conversation {}", conversation_id);
        self.inner.start(conversation_id, generation).await;

        Ok(ConversationView { conversation_id, rx })
    }

    /// Close a conversation: stop its subscription and drop its buffer.
    /// Sends still in flight are kept and settle into the next open.
    pub fn close(&self, conversation_id: Uuid) -> Result<(), SyncError> {
        let mut session = self.inner.lock();
        let Some(mut open) = session.open.remove(&conversation_id) else {
            error!("Close of conversation {} that is not open", conversation_id);
            return Err(SyncError::NotOpen(conversation_id));
        };

        open.cancel.cancel();
        let unresolved = open.channel.close();
        open.publish();
        if !unresolved.is_empty() {
            debug!("Parking {} unresolved sends for {}", unresolved.len(), conversation_id);
            session.parked.insert(conversation_id, unresolved);
        }

        info!("Closed conversation {}", conversation_id);
        Ok(())
    }

    /// Send a message into an open conversation.
    ///
    /// The permission check runs first; a denial adds nothing. Otherwise a
    /// pending entry appears immediately and the call resolves once the
    /// write settles. Offline, the entry is queued and stays pending until
    /// connectivity returns. While earlier queued sends are still being
    /// flushed, the entry waits behind them.
    pub async fn send_message(&self, conversation_id: Uuid, content: impl Into<String>) -> Result<SendOutcome, SyncError> {
        let content = content.into();
        let online = self.inner.is_online();

        if !self.is_open(conversation_id) {
            error!("Send into conversation {} that is not open", conversation_id);
            return Err(SyncError::NotOpen(conversation_id));
        }
        if content.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }

        if online {
            let decision = match self.inner.conversation_meta(conversation_id).await {
                Some(conversation) => self.inner.gate.decide_for_conversation(&conversation).await,
                None => Decision::Deny(DenyReason::Unverified),
            };
            if let Decision::Deny(reason) = decision {
                info!("Send into {} blocked: {}", conversation_id, reason);
                return Ok(SendOutcome::Blocked(reason));
            }
        }

        let (temp_id, queued) = {
            let mut guard = self.inner.lock();
            let session = &mut *guard;
            let open = session
                .open
                .get_mut(&conversation_id)
                .ok_or(SyncError::NotOpen(conversation_id))?;
            let temp_id = open
                .channel
                .push_pending(self.inner.identity.user_id, content.clone(), Utc::now());
            open.publish();
            (temp_id, session.enqueue_if_behind(online, conversation_id, temp_id))
        };

        if !online {
            debug!("Offline, queued {} for {}", temp_id, conversation_id);
            return Ok(SendOutcome::Delivered(Delivery::Pending { temp_id }));
        }
        if queued {
            return Ok(SendOutcome::Delivered(self.inner.wait_in_queue(conversation_id, temp_id).await));
        }

        let delivery = self.inner.deliver_now(conversation_id, temp_id, content, false).await;
        Ok(SendOutcome::Delivered(delivery))
    }

    /// Resend a failed entry with the same temp id, so a write that did
    /// land after all is not duplicated.
    pub async fn retry(&self, conversation_id: Uuid, temp_id: Uuid) -> Result<SendOutcome, SyncError> {
        let online = self.inner.is_online();

        let (content, queued) = {
            let mut guard = self.inner.lock();
            let session = &mut *guard;
            let open = session
                .open
                .get_mut(&conversation_id)
                .ok_or(SyncError::NotOpen(conversation_id))?;
            let entry = open
                .channel
                .mark_retrying(temp_id)
                .ok_or(SyncError::UnknownEntry(temp_id))?;
            open.publish();
            (entry.content, session.enqueue_if_behind(online, conversation_id, temp_id))
        };

        if !online {
            return Ok(SendOutcome::Delivered(Delivery::Pending { temp_id }));
        }
        if queued {
            return Ok(SendOutcome::Delivered(self.inner.wait_in_queue(conversation_id, temp_id).await));
        }

        if let Some(reason) = self.inner.denied(conversation_id).await {
            self.inner.settle(conversation_id, temp_id, Err(blocked_reason(reason)));
            return Ok(SendOutcome::Blocked(reason));
        }

        let delivery = self.inner.deliver_now(conversation_id, temp_id, content, false).await;
        Ok(SendOutcome::Delivered(delivery))
    }

    /// Share the signed-in user's phone number in a conversation. Requires
    /// the same permission as messaging. Once shared it stays shared.
    pub async fn share_phone(&self, conversation_id: Uuid) -> Result<Decision, SyncError> {
        let conversation = match self.inner.conversation_meta(conversation_id).await {
            Some(conversation) => conversation,
            None => {
                if !self.inner.is_online() {
                    return Ok(Decision::Deny(DenyReason::Unverified));
                }
                return Err(SyncError::NotFound);
            }
        };
        if !conversation.is_participant(self.inner.identity.user_id) {
            return Err(SyncError::NotFound);
        }

        let decision = self.inner.gate.decide_for_conversation(&conversation).await;
        if let Decision::Deny(reason) = decision {
            info!("Phone share in {} blocked: {}", conversation_id, reason);
            return Ok(decision);
        }

        let sharer = self.inner.identity.user_id;
        with_backoff(&self.inner.config.retry, "share phone", || {
            self.inner.backend.share_phone(conversation_id, sharer)
        })
        .await?;
        info!("{} shared phone in {}", sharer, conversation_id);

        self.inner.reload_meta(conversation_id).await;
        self.inner.refresh_store().await;
        Ok(Decision::Allow)
    }

    /// Report a connectivity change. Going online flushes queued sends in
    /// order, then rebuilds every open conversation from scratch.
    pub async fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return;
        }

        if !online {
            info!("Connectivity lost");
            return;
        }

        info!("Connectivity restored");
        self.inner.flush_queued().await;
        self.inner.rebuild_open().await;
        self.inner.refresh_store().await;
    }
}

fn blocked_reason(reason: DenyReason) -> String {
    format!("blocked: {}", reason)
}

fn failure_reason(e: &SyncError) -> String {
    match e {
        SyncError::Authorization(reason) => blocked_reason(*reason),
        other => other.to_string(),
    }
}

impl<B: Backend> Inner<B> {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Run `f` on the open channel if it still belongs to `generation`.
    fn with_current<T>(&self, conversation_id: Uuid, generation: u64, f: impl FnOnce(&mut OpenChannel) -> T) -> Option<T> {
        let mut session = self.lock();
        session
            .open
            .get_mut(&conversation_id)
            .filter(|open| open.generation == generation)
            .map(f)
    }

    fn record_error(&self, conversation_id: Uuid, generation: u64, error: &SyncError) {
        warn!("Conversation {} failed to load: {}", conversation_id, error);
        self.with_current(conversation_id, generation, |open| {
            open.channel.set_error(error.to_string());
            open.publish();
        });
    }

    /// Subscribe, then load history. Subscribing first means an insert that
    /// races the history read lands in the channel's early buffer instead of
    /// being lost.
    async fn start(self: &Arc<Self>, conversation_id: Uuid, generation: u64) {
        if !self.is_online() {
            debug!("Offline, deferring load of {}", conversation_id);
            return;
        }

        let feed = match with_backoff(&self.config.retry, "subscribe", || {
            self.backend.subscribe(conversation_id)
        })
        .await
        {
            Ok(feed) => feed,
            Err(e) => {
                self.record_error(conversation_id, generation, &e);
                return;
            }
        };

        let Some(cancel) = self.with_current(conversation_id, generation, |open| open.cancel.clone()) else {
            debug!("Conversation {} closed while subscribing", conversation_id);
            return;
        };
        tokio::spawn(pump(self.clone(), conversation_id, generation, feed, cancel));

        let history = match with_backoff(&self.config.retry, "history", || {
            self.backend.fetch_history(conversation_id)
        })
        .await
        {
            Ok(history) => history,
            Err(SyncError::NotFound) => Vec::new(),
            Err(e) => {
                self.record_error(conversation_id, generation, &e);
                return;
            }
        };

        let conversation = match self.backend.get_conversation(conversation_id).await {
            Ok(conversation) => conversation,
            Err(e) => {
                warn!("Could not load metadata of {}: {}", conversation_id, e);
                None
            }
        };

        let count = history.len();
        let applied = self.with_current(conversation_id, generation, |open| {
            open.channel.apply_history(history);
            if conversation.is_some() {
                open.conversation = conversation;
            }
            open.publish();
        });
        if applied.is_none() {
            return;
        }
        debug!("Conversation {} live with {} messages", conversation_id, count);

        self.mark_read(conversation_id).await;
    }

    fn apply_live(self: &Arc<Self>, conversation_id: Uuid, generation: u64, message: Message) {
        let from_counterparty = message.sender_id != self.identity.user_id;
        let live = self.with_current(conversation_id, generation, |open| {
            if open.channel.apply_live(message) {
                open.publish();
            }
            open.channel.state() == ChannelState::Live
        });

        // The user is looking at it.
        if from_counterparty && live == Some(true) {
            let inner = self.clone();
            tokio::spawn(async move {
                inner.mark_read(conversation_id).await;
            });
        }
    }

    async fn mark_read(&self, conversation_id: Uuid) {
        if let Err(e) = self
            .backend
            .mark_read(conversation_id, self.identity.user_id)
            .await
        {
            warn!("Mark read of {} failed: {}", conversation_id, e);
        }
        self.refresh_store().await;
    }

    async fn refresh_store(&self) {
        // Failure is logged by the store, which keeps its last good list.
        let _ = self.store.refresh().await;
    }

    /// Conversation metadata: the open channel's copy, or a fresh read
    /// when online.
    async fn conversation_meta(&self, conversation_id: Uuid) -> Option<Conversation> {
        let cached = self
            .lock()
            .open
            .get(&conversation_id)
            .and_then(|open| open.conversation.clone());
        if cached.is_some() || !self.is_online() {
            return cached;
        }
        self.reload_meta(conversation_id).await
    }

    async fn reload_meta(&self, conversation_id: Uuid) -> Option<Conversation> {
        let conversation = match self.backend.get_conversation(conversation_id).await {
            Ok(conversation) => conversation?,
            Err(e) => {
                warn!("Could not load metadata of {}: {}", conversation_id, e);
                return None;
            }
        };

        if let Some(open) = self.lock().open.get_mut(&conversation_id) {
            open.conversation = Some(conversation.clone());
        }
        Some(conversation)
    }

    /// Fresh gate check for acting in `conversation_id`. `None` means allowed.
    async fn denied(&self, conversation_id: Uuid) -> Option<DenyReason> {
        let decision = match self.conversation_meta(conversation_id).await {
            Some(conversation) => self.gate.decide_for_conversation(&conversation).await,
            None => Decision::Deny(DenyReason::Unverified),
        };
        decision.reason()
    }

    /// Deliver on a task of its own so the write completes even if the
    /// caller stops waiting.
    async fn deliver_now(self: &Arc<Self>, conversation_id: Uuid, temp_id: Uuid, content: String, front: bool) -> Delivery {
        let inner = self.clone();
        let handle = tokio::spawn(async move { inner.deliver(conversation_id, temp_id, content, front).await });
        match handle.await {
            Ok(delivery) => delivery,
            Err(e) => {
                error!("Delivery task for {} failed: {}", temp_id, e);
                Delivery::Pending { temp_id }
            }
        }
    }

    /// Write with backoff and settle the entry. A transient failure after
    /// connectivity dropped requeues the entry instead of failing it; `front`
    /// puts it back at the head of the queue.
    async fn deliver(&self, conversation_id: Uuid, temp_id: Uuid, content: String, front: bool) -> Delivery {
        let outgoing = OutgoingMessage {
            conversation_id,
            sender_id: self.identity.user_id,
            content,
            client_marker: temp_id,
        };

        let result = with_backoff(&self.config.retry, "send", || {
            self.backend.send_message(outgoing.clone())
        })
        .await;

        match result {
            Ok(message) => {
                let id = message.id;
                self.settle(conversation_id, temp_id, Ok(message));
                self.refresh_store().await;
                Delivery::Confirmed { id }
            }
            Err(SyncError::Conflict(detail)) => self.resolve_conflict(conversation_id, temp_id, &detail).await,
            Err(e) if e.is_transient() && !self.is_online() => {
                debug!("Connectivity lost during send of {}, requeueing", temp_id);
                let queued = QueuedSend {
                    conversation_id,
                    temp_id,
                };
                {
                    let mut session = self.lock();
                    if front {
                        session.queued.push_front(queued);
                    } else {
                        session.queued.push_back(queued);
                    }
                }
                Delivery::Pending { temp_id }
            }
            Err(e) => {
                warn!("Send of {} into {} failed: {}", temp_id, conversation_id, e);
                let reason = failure_reason(&e);
                self.settle(conversation_id, temp_id, Err(reason.clone()));
                Delivery::Failed { temp_id, reason }
            }
        }
    }

    /// The store refused the write as a conflict. A copy it holds under our
    /// marker wins over the optimistic entry; without one the entry fails.
    async fn resolve_conflict(&self, conversation_id: Uuid, temp_id: Uuid, detail: &str) -> Delivery {
        let persisted = match with_backoff(&self.config.retry, "history", || {
            self.backend.fetch_history(conversation_id)
        })
        .await
        {
            Ok(history) => history
                .into_iter()
                .find(|m| m.client_marker == Some(temp_id)),
            Err(e) => {
                warn!("Could not look up {} after a conflict: {}", temp_id, e);
                None
            }
        };

        match persisted {
            Some(message) => {
                let id = message.id;
                debug!("Conflict on {} resolved to stored message {}", temp_id, id);
                self.settle(conversation_id, temp_id, Ok(message));
                self.refresh_store().await;
                Delivery::Confirmed { id }
            }
            None => {
                let reason = format!("conflict: {}", detail);
                warn!("Send of {} into {} failed: {}", temp_id, conversation_id, reason);
                self.settle(conversation_id, temp_id, Err(reason.clone()));
                Delivery::Failed { temp_id, reason }
            }
        }
    }

    /// Apply a write's outcome to the open channel, or to the parked
    /// entries if the conversation was closed meanwhile.
    fn settle(&self, conversation_id: Uuid, temp_id: Uuid, outcome: Result<Message, String>) {
        let mut guard = self.lock();
        let session = &mut *guard;

        if let Some(open) = session.open.get_mut(&conversation_id) {
            let result = open.channel.reconcile(temp_id, outcome);
            open.publish();
            if result == Reconciled::Unknown {
                debug!("Send {} already settled by the live feed", temp_id);
            }
            return;
        }

        let Some(parked) = session.parked.get_mut(&conversation_id) else {
            debug!("Send {} settled after its entry was dropped", temp_id);
            return;
        };
        if let Reconciled::Confirmed(message) = reconcile(parked, temp_id, outcome) {
            debug!("Send {} confirmed as {} while {} was closed", temp_id, message.id, conversation_id);
        }
        if parked.is_empty() {
            session.parked.remove(&conversation_id);
        }
    }

    /// Content of a still-unresolved entry, wherever it lives.
    fn outgoing_content(&self, conversation_id: Uuid, temp_id: Uuid) -> Option<String> {
        let session = self.lock();
        let entries = match session.open.get(&conversation_id) {
            Some(open) => open.channel.outgoing(),
            None => session.parked.get(&conversation_id)?.as_slice(),
        };
        entries
            .iter()
            .find(|o| o.temp_id == temp_id && o.failure.is_none())
            .map(|o| o.content.clone())
    }

    /// Send queued entries one at a time so they persist in queue order.
    async fn flush_queued(self: &Arc<Self>) {
        let _flush = self.flush_lock.lock().await;
        self.lock().flushing = true;

        loop {
            let next = {
                let mut session = self.lock();
                match session.queued.pop_front() {
                    Some(queued) if self.is_online() => Some(queued),
                    other => {
                        // Drained, or offline again with the rest left for
                        // the next reconnect.
                        if let Some(queued) = other {
                            session.queued.push_front(queued);
                        }
                        session.flushing = false;
                        None
                    }
                }
            };
            let Some(QueuedSend {
                conversation_id,
                temp_id,
            }) = next
            else {
                break;
            };
            let Some(content) = self.outgoing_content(conversation_id, temp_id) else {
                continue;
            };

            if let Some(reason) = self.denied(conversation_id).await {
                info!("Queued send {} blocked: {}", temp_id, reason);
                self.settle(conversation_id, temp_id, Err(blocked_reason(reason)));
                continue;
            }

            let delivery = self.deliver_now(conversation_id, temp_id, content, true).await;
            if delivery.is_pending() {
                // Offline again; the entry went back to the head of the queue.
                self.lock().flushing = false;
                break;
            }
        }
    }

    /// Flush until `temp_id` has had its turn, then report where it stands.
    async fn wait_in_queue(self: &Arc<Self>, conversation_id: Uuid, temp_id: Uuid) -> Delivery {
        debug!("Send {} waits behind queued sends", temp_id);
        self.flush_queued().await;
        self.delivery_of(conversation_id, temp_id)
    }

    fn delivery_of(&self, conversation_id: Uuid, temp_id: Uuid) -> Delivery {
        let session = self.lock();
        let known = match session.open.get(&conversation_id) {
            Some(open) => open.channel.delivery_of(temp_id),
            None => session
                .parked
                .get(&conversation_id)
                .and_then(|parked| parked.iter().find(|o| o.temp_id == temp_id))
                .map(|o| o.delivery()),
        };
        known.unwrap_or(Delivery::Pending { temp_id })
    }

    /// Rebuild every open conversation under a new generation.
    async fn rebuild_open(self: &Arc<Self>) {
        let targets: Vec<(Uuid, u64)> = {
            let mut session = self.lock();
            session
                .open
                .iter_mut()
                .map(|(id, open)| {
                    open.cancel.cancel();
                    open.cancel = CancellationToken::new();
                    open.generation = self.next_generation();
                    open.channel.restart();
                    open.publish();
                    (*id, open.generation)
                })
                .collect()
        };

        debug!("Rebuilding {} open conversations", targets.len());
        futures_util::future::join_all(
            targets
                .into_iter()
                .map(|(conversation_id, generation)| self.start(conversation_id, generation)),
        )
        .await;
    }
}

/// Forward live inserts into the channel until cancelled or the feed ends.
async fn pump<B: Backend>(inner: Arc<Inner<B>>, conversation_id: Uuid, generation: u64, mut feed: FeedStream, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = feed.next() => match next {
                Some(insert) => inner.apply_live(conversation_id, generation, insert.into()),
                None => {
                    inner.record_error(conversation_id, generation, &SyncError::Network("live feed ended".into()));
                    break;
                }
            },
        }
    }
    debug!("Feed for {} (generation {}) stopped", conversation_id, generation);
}
