//! Conversation feed synchronization.
//!
//! A [`FeedSynchronizer`] keeps one ordered, deduplicated message feed for
//! the active [`ConversationScope`](parley_types::ConversationScope), merging
//! the initial fetch, the store's change feed and local optimistic writes. A
//! [`ReactionAggregator`] does the same for the reactions on one message. The
//! [`ScrollCoordinator`] turns feed views into viewport moves.

pub mod config;
pub mod error;
pub mod feed;
pub mod lifecycle;
pub mod reactions;
pub mod scope;
pub mod scroll;
pub mod synchronizer;

pub use config::SyncConfig;
pub use error::{ConfigError, SyncError};
pub use feed::{FeedState, FeedView, SendOutcome};
pub use lifecycle::{Generation, Phase};
pub use reactions::{ReactionAggregator, ReactionState, ReactionView, Toggle};
pub use scope::{NavState, ScopeChange, ScopeTracker, resolve};
pub use scroll::{ScrollAction, ScrollCoordinator, ViewMark, Viewport, decide};
pub use synchronizer::FeedSynchronizer;
