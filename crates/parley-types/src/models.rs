use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scope::{ConversationScope, HostScope};

/// Sender/receiver of a direct message. Direction does not matter for scoping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmPair {
    pub sender_id: String,
    pub receiver_id: String,
}

impl DmPair {
    /// True if the pair is exactly `{a, b}` in either direction.
    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Written locally, not yet acknowledged by the store
    Pending,
    #[default]
    Confirmed,
    /// The store rejected the write; kept for retry or discard
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub dm: Option<DmPair>,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub author_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    /// Build a message addressed to `scope` as written by `author_id`.
    pub fn compose(
        scope: &ConversationScope,
        id: impl Into<String>,
        author_id: &str,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
        created_at: DateTime<Utc>,
        status: MessageStatus,
    ) -> Self {
        let (channel_id, dm) = match scope.host() {
            HostScope::Channel(channel_id) => (Some(channel_id), None),
            HostScope::DirectMessage(peer_id) => (
                None,
                Some(DmPair {
                    sender_id: author_id.to_string(),
                    receiver_id: peer_id,
                }),
            ),
        };

        Self {
            id: id.into(),
            channel_id,
            dm,
            parent_id: scope.parent_id().map(str::to_string),
            author_id: author_id.to_string(),
            content: content.into(),
            attachments,
            created_at,
            status,
        }
    }

    /// Feed order: ascending `created_at`, ties broken by id.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }

    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Whether this message belongs in the feed of `scope`, seen by user `me`.
    ///
    /// Replies only ever belong to the thread of their parent, never to the
    /// channel or DM that hosts it.
    pub fn belongs_to(&self, scope: &ConversationScope, me: &str) -> bool {
        match scope {
            ConversationScope::Channel(channel_id) => {
                !self.is_reply() && self.channel_id.as_deref() == Some(channel_id.as_str())
            }
            ConversationScope::DirectMessage(peer_id) => {
                !self.is_reply()
                    && self.dm.as_ref().is_some_and(|pair| pair.connects(me, peer_id))
            }
            ConversationScope::Thread { parent_id, .. } => {
                self.parent_id.as_deref() == Some(parent_id.as_str())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    pub message_id: String,
    pub author_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<String>,
    /// The viewing user is one of `user_ids`
    pub includes_me: bool,
}

/// Group reactions by emoji for display, in order of each emoji's first appearance.
pub fn group_reactions<'a, I>(reactions: I, me: &str) -> Vec<ReactionGroup>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut groups: Vec<ReactionGroup> = Vec::new();
    for (author_id, emoji) in reactions {
        let idx = match groups.iter().position(|g| g.emoji == emoji) {
            Some(idx) => idx,
            None => {
                groups.push(ReactionGroup {
                    emoji: emoji.to_string(),
                    count: 0,
                    user_ids: Vec::new(),
                    includes_me: false,
                });
                groups.len() - 1
            }
        };

        let group = &mut groups[idx];
        if group.user_ids.iter().any(|u| u == author_id) {
            continue;
        }
        group.user_ids.push(author_id.to_string());
        group.count += 1;
        group.includes_me |= author_id == me;
    }
    groups
}
