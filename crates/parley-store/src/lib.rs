//! Client-side contract of the Conversation Store, the remote service that
//! owns messages and reactions.
//!
//! The synchronizer only ever talks to a [`ConversationStore`]. Two
//! implementations ship here: [`MemoryStore`], an in-process backend used by
//! tests and demos, and [`RemoteStore`], which speaks REST + WebSocket to a
//! running server.

pub mod memory;
pub mod remote;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use parley_types::{Attachment, ConversationScope, FeedEvent, Message, Reaction, ReactionEvent};

pub use memory::{MemorySession, MemoryStore, StoreOp};
pub use remote::RemoteStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rejected by store: {0}")]
    Rejected(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store connection closed")]
    Closed,
}

/// A live change feed. Dropping it unsubscribes; `recv` returning `None`
/// means the feed dropped and changes may have been missed.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx, on_drop: None }
    }

    /// Attach a hook that runs when the subscription is dropped.
    pub fn on_drop(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(hook));
        self
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
    }
}

/// Operations the feed and reaction synchronizers consume. Every call is
/// made on behalf of [`current_user`](ConversationStore::current_user).
#[async_trait]
pub trait ConversationStore: Send + Sync + 'static {
    fn current_user(&self) -> &str;

    /// The newest `limit` messages of the scope, ascending by `created_at`.
    async fn fetch_messages(
        &self,
        scope: &ConversationScope,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError>;

    /// Up to `limit` messages older than `before`, ascending by `created_at`.
    async fn fetch_messages_before(
        &self,
        scope: &ConversationScope,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError>;

    /// Returns the confirmed record.
    async fn send_message(
        &self,
        scope: &ConversationScope,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<Message, StoreError>;

    async fn subscribe(&self, scope: &ConversationScope) -> Result<Subscription<FeedEvent>, StoreError>;

    async fn fetch_reactions(&self, message_id: &str) -> Result<Vec<Reaction>, StoreError>;

    /// Adding a pair the user already holds returns the existing reaction.
    async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<Reaction, StoreError>;

    /// Removing a pair the user does not hold is a no-op.
    async fn remove_reaction(&self, message_id: &str, emoji: &str) -> Result<(), StoreError>;

    async fn subscribe_reactions(
        &self,
        message_id: &str,
    ) -> Result<Subscription<ReactionEvent>, StoreError>;
}
