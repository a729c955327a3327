pub mod api;
pub mod events;
pub mod models;
pub mod scope;

pub use events::{FeedEvent, ReactionEvent};
pub use models::{Attachment, DmPair, Message, MessageStatus, Reaction, ReactionGroup, group_reactions};
pub use scope::{ConversationScope, HostScope};
