use std::fmt;

use serde::{Deserialize, Serialize};

/// The conversation a feed is filtered to. Exactly one is active at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationScope {
    /// Top-level messages of a channel
    Channel(String),

    /// Top-level messages exchanged with one peer
    DirectMessage(String),

    /// Replies to `parent_id`, nested under the channel or DM that hosts it
    Thread { parent_id: String, host: HostScope },
}

/// A scope that can host a thread. Threads never nest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostScope {
    Channel(String),
    DirectMessage(String),
}

impl ConversationScope {
    pub fn channel(channel_id: impl Into<String>) -> Self {
        Self::Channel(channel_id.into())
    }

    pub fn direct(peer_id: impl Into<String>) -> Self {
        Self::DirectMessage(peer_id.into())
    }

    pub fn thread(parent_id: impl Into<String>, host: HostScope) -> Self {
        Self::Thread {
            parent_id: parent_id.into(),
            host,
        }
    }

    /// The channel or DM this scope lives in. For a thread that is its host.
    pub fn host(&self) -> HostScope {
        match self {
            Self::Channel(id) => HostScope::Channel(id.clone()),
            Self::DirectMessage(id) => HostScope::DirectMessage(id.clone()),
            Self::Thread { host, .. } => host.clone(),
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        match self {
            Self::Thread { parent_id, .. } => Some(parent_id),
            _ => None,
        }
    }

    pub fn is_thread(&self) -> bool {
        matches!(self, Self::Thread { .. })
    }
}

impl From<HostScope> for ConversationScope {
    fn from(host: HostScope) -> Self {
        match host {
            HostScope::Channel(id) => Self::Channel(id),
            HostScope::DirectMessage(id) => Self::DirectMessage(id),
        }
    }
}

impl fmt::Display for HostScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(id) => write!(f, "channel:{}", id),
            Self::DirectMessage(id) => write!(f, "dm:{}", id),
        }
    }
}

impl fmt::Display for ConversationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(id) => write!(f, "channel:{}", id),
            Self::DirectMessage(id) => write!(f, "dm:{}", id),
            Self::Thread { parent_id, host } => write!(f, "thread:{}@{}", parent_id, host),
        }
    }
}
