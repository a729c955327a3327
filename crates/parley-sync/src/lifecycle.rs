//! Pieces shared by the feed and reaction state machines.

use std::fmt;
use std::time::Duration;

use tracing::warn;

/// Lifecycle of a synchronized collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Nothing selected
    #[default]
    Idle,

    /// Initial fetch in flight; change-feed events are buffered
    Loading,

    /// Snapshot applied; events merge as they arrive
    Live,

    /// The change feed dropped and a repair fetch is in flight. The current
    /// view stays visible while events are buffered as in `Loading`.
    Resyncing,
}

impl Phase {
    pub fn is_buffering(self) -> bool {
        matches!(self, Self::Loading | Self::Resyncing)
    }

    /// A snapshot has been applied at least once for the active target.
    pub fn has_snapshot(self) -> bool {
        matches!(self, Self::Live | Self::Resyncing)
    }
}

/// Bumped on every activate and deactivate. Async results carry the
/// generation that issued them; anything older than the current one is stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What happened to a snapshot handed to a state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Applied,
    /// Issued for a generation that is no longer current; discarded
    Stale,
    /// Events were lost while buffering; another fetch is needed
    Refetch,
}

/// Change-feed events held while a snapshot is in flight.
#[derive(Debug)]
pub struct EventBuffer<E> {
    events: Vec<E>,
    capacity: usize,
    overflowed: bool,
}

impl<E> EventBuffer<E> {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity,
            overflowed: false,
        }
    }

    /// Once the buffer overflows it stops holding anything until cleared.
    pub fn push(&mut self, event: E) {
        if self.overflowed {
            return;
        }
        if self.events.len() >= self.capacity {
            warn!(
                "Event buffer overflowed at {} events, snapshot will be refetched",
                self.capacity
            );
            self.events.clear();
            self.overflowed = true;
            return;
        }
        self.events.push(event);
    }

    /// Take the held events in arrival order. `None` if some were dropped.
    pub fn drain(&mut self) -> Option<Vec<E>> {
        let overflowed = std::mem::take(&mut self.overflowed);
        let events = std::mem::take(&mut self.events);
        if overflowed { None } else { Some(events) }
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.overflowed = false;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Bounded retry schedule for reopening a dropped change feed.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
