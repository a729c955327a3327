//! Maps navigation state to the conversation scope a feed should show.

use tracing::debug;
use url::Url;

use parley_types::{ConversationScope, HostScope};

/// Selection state as the navigation layer knows it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavState {
    pub channel_id: Option<String>,
    pub peer_user_id: Option<String>,
    /// Id of the message whose reply thread is open
    pub thread_id: Option<String>,
}

impl NavState {
    /// Parse `channelId`, `userId` and `messageId` query parameters.
    /// A leading `?` is optional.
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut nav = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "channelId" => nav.channel_id = Some(value.into_owned()),
                "userId" => nav.peer_user_id = Some(value.into_owned()),
                "messageId" => nav.thread_id = Some(value.into_owned()),
                _ => {}
            }
        }
        nav
    }

    /// Parse an app route: `/<channelId>`, `/dm/<userId>` or `/`, each with
    /// optional query parameters. Path ids override query ids. Unknown routes
    /// select nothing.
    pub fn from_path(path: &str) -> Self {
        let Ok(base) = Url::parse("http://parley.invalid/") else {
            return Self::default();
        };
        let Ok(url) = base.join(path) else {
            debug!("Unparseable route {:?}", path);
            return Self::default();
        };

        let mut nav = Self::from_query(url.query().unwrap_or(""));
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        match segments.as_slice() {
            [] => {}
            ["dm", peer] => {
                nav.peer_user_id = Some(peer.to_string());
                nav.channel_id = None;
            }
            [channel] => {
                nav.channel_id = Some(channel.to_string());
                nav.peer_user_id = None;
            }
            _ => {
                debug!("Unknown route {:?}", path);
                return Self::default();
            }
        }
        nav
    }
}

/// Resolve navigation state to a scope. Pure; `None` means nothing valid is
/// selected and the caller shows the empty state.
///
/// Blank ids count as missing. A channel and a peer selected together are
/// ambiguous and resolve to nothing, as does a thread without a host.
pub fn resolve(nav: &NavState) -> Option<ConversationScope> {
    let channel = present(&nav.channel_id);
    let peer = present(&nav.peer_user_id);
    let thread = present(&nav.thread_id);

    let host = match (channel, peer) {
        (Some(channel), None) => HostScope::Channel(channel.to_string()),
        (None, Some(peer)) => HostScope::DirectMessage(peer.to_string()),
        _ => return None,
    };

    Some(match thread {
        Some(parent_id) => ConversationScope::thread(parent_id, host),
        None => host.into(),
    })
}

fn present(id: &Option<String>) -> Option<&str> {
    id.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeChange {
    Unchanged,
    /// The synchronizer must drop the old scope's messages and restart.
    Changed {
        from: Option<ConversationScope>,
        to: Option<ConversationScope>,
    },
}

/// Remembers the resolved scope so navigation updates that land on the same
/// conversation do not restart the feed.
#[derive(Debug, Default)]
pub struct ScopeTracker {
    current: Option<ConversationScope>,
}

impl ScopeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&ConversationScope> {
        self.current.as_ref()
    }

    pub fn update(&mut self, nav: &NavState) -> ScopeChange {
        let next = resolve(nav);
        if next == self.current {
            return ScopeChange::Unchanged;
        }
        let from = std::mem::replace(&mut self.current, next.clone());
        ScopeChange::Changed { from, to: next }
    }
}
