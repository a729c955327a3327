//! In-process conversation store.
//!
//! Holds every message and reaction in memory and fans changes out to
//! subscribers over one broadcast channel, each subscription filtering by its
//! own scope. Tests drive it through the hooks at the bottom of `MemoryStore`
//! (injected failures, paused operations, dropped subscriptions, writes from
//! other users).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_types::{
    Attachment, ConversationScope, FeedEvent, Message, MessageStatus, Reaction, ReactionEvent,
};

use crate::{ConversationStore, StoreError, Subscription};

/// Store operations that tests can fail or pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    FetchMessages,
    SendMessage,
    Subscribe,
    FetchReactions,
    AddReaction,
    RemoveReaction,
}

#[derive(Debug, Clone, Copy)]
enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
enum StoreChange {
    Message { kind: ChangeKind, row: Message },
    Reaction(ReactionEvent),
    /// Ends every open subscription
    Disconnect,
}

/// Shared backend. Cheap to clone; clones see the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    messages: RwLock<Vec<Message>>,
    reactions: RwLock<Vec<Reaction>>,

    /// Every change goes here; subscriptions filter their own slice
    changes_tx: broadcast::Sender<StoreChange>,

    /// Remaining injected failures per operation
    failures: Mutex<HashMap<StoreOp, usize>>,

    /// Operations currently held before they return
    paused_tx: watch::Sender<HashSet<StoreOp>>,

    calls: Mutex<HashMap<StoreOp, usize>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(1024);
        let (paused_tx, _) = watch::channel(HashSet::new());
        Self {
            inner: Arc::new(MemoryInner {
                messages: RwLock::new(Vec::new()),
                reactions: RwLock::new(Vec::new()),
                changes_tx,
                failures: Mutex::new(HashMap::new()),
                paused_tx,
                calls: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// A client handle acting as `user_id`.
    pub fn session(&self, user_id: impl Into<String>) -> MemorySession {
        MemorySession {
            store: self.clone(),
            user_id: user_id.into(),
        }
    }

    fn broadcast(&self, change: StoreChange) {
        let _ = self.inner.changes_tx.send(change);
    }

    /// Count the call, then fail it if a failure was injected for `op`.
    fn checkpoint(&self, op: StoreOp) -> Result<(), StoreError> {
        *self
            .inner
            .calls
            .lock()
            .expect("calls lock poisoned")
            .entry(op)
            .or_default() += 1;

        let mut failures = self.inner.failures.lock().expect("failures lock poisoned");
        match failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                debug!("Injected failure for {:?}", op);
                Err(StoreError::Network(format!("injected failure for {:?}", op)))
            }
            _ => Ok(()),
        }
    }

    /// Wait while `op` is paused.
    async fn hold(&self, op: StoreOp) {
        let mut paused = self.inner.paused_tx.subscribe();
        let _ = paused.wait_for(|ops| !ops.contains(&op)).await;
    }

    fn forward<T, F>(&self, filter: F) -> Subscription<T>
    where
        T: Send + 'static,
        F: Fn(StoreChange) -> Option<T> + Send + 'static,
    {
        let mut changes = self.inner.changes_tx.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(StoreChange::Disconnect) => break,
                        Ok(change) => {
                            if let Some(item) = filter(change) {
                                if tx.send(item).is_err() {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // A gap cannot be repaired here; end the feed so the
                            // subscriber resubscribes and refetches.
                            warn!("Subscription lagged by {} changes, closing", n);
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tx.closed() => break,
                }
            }
        });

        Subscription::new(rx)
    }

    // -- Test hooks --

    /// Fail the next `times` calls of `op` with a network error.
    pub fn fail_next(&self, op: StoreOp, times: usize) {
        *self
            .inner
            .failures
            .lock()
            .expect("failures lock poisoned")
            .entry(op)
            .or_default() += times;
    }

    /// Hold `op` calls before they return until [`resume`](Self::resume).
    /// Fetches take their snapshot before holding; writes apply and
    /// broadcast before holding. Subscribes hold before they start
    /// listening, like a gateway that has not answered yet.
    pub fn pause(&self, op: StoreOp) {
        self.inner.paused_tx.send_modify(|ops| {
            ops.insert(op);
        });
    }

    pub fn resume(&self, op: StoreOp) {
        self.inner.paused_tx.send_modify(|ops| {
            ops.remove(&op);
        });
    }

    pub fn calls(&self, op: StoreOp) -> usize {
        self.inner
            .calls
            .lock()
            .expect("calls lock poisoned")
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Open subscriptions, message and reaction feeds alike.
    pub fn subscriber_count(&self) -> usize {
        self.inner.changes_tx.receiver_count()
    }

    /// End every open subscription, as a dropped connection would.
    pub fn disconnect_subscribers(&self) {
        info!("Disconnecting all subscribers");
        self.broadcast(StoreChange::Disconnect);
    }

    /// Store a message written elsewhere and notify subscribers.
    pub async fn post(&self, message: Message) {
        self.inner.messages.write().await.push(message.clone());
        self.broadcast(StoreChange::Message {
            kind: ChangeKind::Insert,
            row: message,
        });
    }

    /// Store a message without notifying anyone, as if the change was lost.
    pub async fn post_silently(&self, message: Message) {
        self.inner.messages.write().await.push(message);
    }

    /// Replace the stored message with the same id and notify subscribers.
    pub async fn update(&self, message: Message) {
        {
            let mut messages = self.inner.messages.write().await;
            match messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => *existing = message.clone(),
                None => return,
            }
        }
        self.broadcast(StoreChange::Message {
            kind: ChangeKind::Update,
            row: message,
        });
    }

    pub async fn delete(&self, id: &str) {
        let removed = {
            let mut messages = self.inner.messages.write().await;
            messages
                .iter()
                .position(|m| m.id == id)
                .map(|idx| messages.remove(idx))
        };
        if let Some(row) = removed {
            self.broadcast(StoreChange::Message {
                kind: ChangeKind::Delete,
                row,
            });
        }
    }

    /// Add a reaction on behalf of another user and notify subscribers.
    pub async fn react(&self, message_id: &str, author_id: &str, emoji: &str) -> Reaction {
        self.insert_reaction(message_id, author_id, emoji).await
    }

    pub async fn message(&self, id: &str) -> Option<Message> {
        self.inner
            .messages
            .read()
            .await
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    async fn insert_reaction(&self, message_id: &str, author_id: &str, emoji: &str) -> Reaction {
        let reaction = {
            let mut reactions = self.inner.reactions.write().await;
            if let Some(existing) = reactions
                .iter()
                .find(|r| r.message_id == message_id && r.author_id == author_id && r.emoji == emoji)
            {
                return existing.clone();
            }

            let reaction = Reaction {
                id: Uuid::new_v4().to_string(),
                message_id: message_id.to_string(),
                author_id: author_id.to_string(),
                emoji: emoji.to_string(),
            };
            reactions.push(reaction.clone());
            reaction
        };

        self.broadcast(StoreChange::Reaction(ReactionEvent::Insert(reaction.clone())));
        reaction
    }
}

/// A [`MemoryStore`] client acting as one user.
#[derive(Clone)]
pub struct MemorySession {
    store: MemoryStore,
    user_id: String,
}

impl MemorySession {
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    async fn scoped(&self, scope: &ConversationScope) -> Vec<Message> {
        let mut rows: Vec<Message> = self
            .store
            .inner
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.belongs_to(scope, &self.user_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        rows
    }
}

/// Last `limit` rows of an ascending list.
fn newest(mut rows: Vec<Message>, limit: usize) -> Vec<Message> {
    let skip = rows.len().saturating_sub(limit);
    rows.drain(..skip);
    rows
}

#[async_trait]
impl ConversationStore for MemorySession {
    fn current_user(&self) -> &str {
        &self.user_id
    }

    async fn fetch_messages(
        &self,
        scope: &ConversationScope,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.store.checkpoint(StoreOp::FetchMessages)?;
        let rows = newest(self.scoped(scope).await, limit as usize);
        self.store.hold(StoreOp::FetchMessages).await;
        Ok(rows)
    }

    async fn fetch_messages_before(
        &self,
        scope: &ConversationScope,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.store.checkpoint(StoreOp::FetchMessages)?;
        let older: Vec<Message> = self
            .scoped(scope)
            .await
            .into_iter()
            .filter(|m| m.created_at < before)
            .collect();
        let rows = newest(older, limit as usize);
        self.store.hold(StoreOp::FetchMessages).await;
        Ok(rows)
    }

    async fn send_message(
        &self,
        scope: &ConversationScope,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<Message, StoreError> {
        self.store.checkpoint(StoreOp::SendMessage)?;

        if content.trim().is_empty() && attachments.is_empty() {
            return Err(StoreError::Rejected("empty message".into()));
        }
        if let Some(parent_id) = scope.parent_id() {
            if self.store.message(parent_id).await.is_none() {
                return Err(StoreError::NotFound(format!("parent message {}", parent_id)));
            }
        }

        let message = Message::compose(
            scope,
            Uuid::new_v4().to_string(),
            &self.user_id,
            content,
            attachments.to_vec(),
            Utc::now(),
            MessageStatus::Confirmed,
        );
        self.store.post(message.clone()).await;

        self.store.hold(StoreOp::SendMessage).await;
        Ok(message)
    }

    async fn subscribe(&self, scope: &ConversationScope) -> Result<Subscription<FeedEvent>, StoreError> {
        self.store.checkpoint(StoreOp::Subscribe)?;
        self.store.hold(StoreOp::Subscribe).await;

        let scope = scope.clone();
        let user_id = self.user_id.clone();
        debug!("{} subscribing to {}", user_id, scope);

        let sub = self.store.forward(move |change| match change {
            StoreChange::Message { kind, row } if row.belongs_to(&scope, &user_id) => {
                Some(match kind {
                    ChangeKind::Insert => FeedEvent::Insert(row),
                    ChangeKind::Update => FeedEvent::Update(row),
                    ChangeKind::Delete => FeedEvent::Delete { id: row.id },
                })
            }
            _ => None,
        });
        Ok(sub)
    }

    async fn fetch_reactions(&self, message_id: &str) -> Result<Vec<Reaction>, StoreError> {
        self.store.checkpoint(StoreOp::FetchReactions)?;
        let rows = self
            .store
            .inner
            .reactions
            .read()
            .await
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect();
        self.store.hold(StoreOp::FetchReactions).await;
        Ok(rows)
    }

    async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<Reaction, StoreError> {
        self.store.checkpoint(StoreOp::AddReaction)?;
        if self.store.message(message_id).await.is_none() {
            return Err(StoreError::NotFound(format!("message {}", message_id)));
        }
        let reaction = self
            .store
            .insert_reaction(message_id, &self.user_id, emoji)
            .await;
        self.store.hold(StoreOp::AddReaction).await;
        Ok(reaction)
    }

    async fn remove_reaction(&self, message_id: &str, emoji: &str) -> Result<(), StoreError> {
        self.store.checkpoint(StoreOp::RemoveReaction)?;
        let removed = {
            let mut reactions = self.store.inner.reactions.write().await;
            reactions
                .iter()
                .position(|r| {
                    r.message_id == message_id && r.author_id == self.user_id && r.emoji == emoji
                })
                .map(|idx| reactions.remove(idx))
        };
        if let Some(reaction) = removed {
            self.store
                .broadcast(StoreChange::Reaction(ReactionEvent::Delete(reaction)));
        }
        self.store.hold(StoreOp::RemoveReaction).await;
        Ok(())
    }

    async fn subscribe_reactions(
        &self,
        message_id: &str,
    ) -> Result<Subscription<ReactionEvent>, StoreError> {
        self.store.checkpoint(StoreOp::Subscribe)?;
        let message_id = message_id.to_string();
        Ok(self.store.forward(move |change| match change {
            StoreChange::Reaction(event) if event.message_id() == message_id => Some(event),
            _ => None,
        }))
    }
}
