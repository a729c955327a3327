//! Reactions on one message: an initial fetch, the reaction change feed and
//! optimistic toggles by the local user, merged into emoji groups.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use parley_store::{ConversationStore, StoreError, Subscription};
use parley_types::{Reaction, ReactionEvent, ReactionGroup, group_reactions};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::lifecycle::{Backoff, EventBuffer, Generation, Phase, SnapshotOutcome};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReactionView {
    pub message_id: Option<String>,
    pub generation: Generation,
    pub phase: Phase,
    pub groups: Vec<ReactionGroup>,
    pub error: Option<SyncError>,
    pub revision: u64,
}

impl ReactionView {
    pub fn group(&self, emoji: &str) -> Option<&ReactionGroup> {
        self.groups.iter().find(|g| g.emoji == emoji)
    }
}

/// Which way a toggle went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Added,
    Removed,
}

#[derive(Debug, Clone)]
struct Held {
    author_id: String,
    emoji: String,
    /// `None` until the store confirms an optimistic add
    reaction_id: Option<String>,
}

pub struct ReactionState {
    me: String,
    message_id: Option<String>,
    generation: Generation,
    phase: Phase,
    held: Vec<Held>,
    buffer: EventBuffer<ReactionEvent>,
    error: Option<SyncError>,
    revision: u64,
}

impl ReactionState {
    pub fn new(me: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            me: me.into(),
            message_id: None,
            generation: Generation::default(),
            phase: Phase::Idle,
            held: Vec::new(),
            buffer: EventBuffer::new(config.max_buffered_events),
            error: None,
            revision: 0,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.message_id.is_some() && generation == self.generation
    }

    pub fn view(&self) -> ReactionView {
        ReactionView {
            message_id: self.message_id.clone(),
            generation: self.generation,
            phase: self.phase,
            groups: group_reactions(
                self.held
                    .iter()
                    .map(|h| (h.author_id.as_str(), h.emoji.as_str())),
                &self.me,
            ),
            error: self.error.clone(),
            revision: self.revision,
        }
    }

    pub fn activate(&mut self, message_id: impl Into<String>) -> Generation {
        self.reset();
        self.generation = self.generation.next();
        self.message_id = Some(message_id.into());
        self.phase = Phase::Loading;
        self.touch();
        self.generation
    }

    pub fn deactivate(&mut self) -> bool {
        if self.message_id.is_none() {
            return false;
        }
        self.reset();
        self.generation = self.generation.next();
        self.message_id = None;
        self.phase = Phase::Idle;
        self.touch();
        true
    }

    /// A refetch is about to replace the set; hold events until it lands.
    pub fn begin_resync(&mut self) {
        if self.phase == Phase::Live {
            self.phase = Phase::Resyncing;
            self.touch();
        }
    }

    pub fn set_error(&mut self, error: SyncError) {
        self.error = Some(error);
        self.touch();
    }

    pub fn fetch_failed(&mut self, generation: Generation, error: SyncError) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.set_error(error);
        true
    }

    /// Replace the whole set with `rows`, then replay buffered events.
    pub fn apply_snapshot(&mut self, generation: Generation, rows: Vec<Reaction>) -> SnapshotOutcome {
        if !self.is_current(generation) {
            debug!("Discarding stale reaction snapshot from generation {}", generation);
            return SnapshotOutcome::Stale;
        }
        let Some(buffered) = self.buffer.drain() else {
            return SnapshotOutcome::Refetch;
        };

        self.held.clear();
        for row in rows {
            self.insert(row);
        }
        for event in buffered {
            self.dispatch(event);
        }
        self.phase = Phase::Live;
        self.error = None;
        self.touch();
        SnapshotOutcome::Applied
    }

    pub fn apply_event(&mut self, generation: Generation, event: ReactionEvent) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        if self.event_targets_other_message(&event) {
            trace!("Ignoring reaction for message {}", event.message_id());
            return false;
        }
        if self.phase.is_buffering() {
            self.buffer.push(event);
            return false;
        }
        let changed = self.dispatch(event);
        if changed {
            self.touch();
        }
        changed
    }

    /// Flip the local user's `emoji`. `None` unless the set is live.
    pub fn toggle(&mut self, emoji: &str) -> Option<Toggle> {
        if self.message_id.is_none() || self.phase != Phase::Live {
            return None;
        }
        let toggle = match self.position(&self.me, emoji) {
            Some(idx) => {
                self.held.remove(idx);
                Toggle::Removed
            }
            None => {
                self.held.push(Held {
                    author_id: self.me.clone(),
                    emoji: emoji.to_string(),
                    reaction_id: None,
                });
                Toggle::Added
            }
        };
        self.touch();
        Some(toggle)
    }

    /// Undo a toggle the store rejected, unless a remote event has already
    /// moved the pair.
    pub fn revert(&mut self, generation: Generation, emoji: &str, toggle: Toggle) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        let position = self.position(&self.me, emoji);
        match (toggle, position) {
            (Toggle::Added, Some(idx)) if self.held[idx].reaction_id.is_none() => {
                self.held.remove(idx);
            }
            (Toggle::Removed, None) => self.held.push(Held {
                author_id: self.me.clone(),
                emoji: emoji.to_string(),
                reaction_id: None,
            }),
            _ => return false,
        }
        self.touch();
        true
    }

    /// Record the id the store gave an optimistic add.
    pub fn confirm_add(&mut self, generation: Generation, reaction: Reaction) {
        if !self.is_current(generation) {
            return;
        }
        if let Some(idx) = self.position(&reaction.author_id, &reaction.emoji) {
            self.held[idx].reaction_id.get_or_insert(reaction.id);
        }
    }

    fn dispatch(&mut self, event: ReactionEvent) -> bool {
        match event {
            ReactionEvent::Insert(reaction) => self.insert(reaction),
            ReactionEvent::Delete(reaction) => {
                match self.position(&reaction.author_id, &reaction.emoji) {
                    Some(idx) => {
                        self.held.remove(idx);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    fn insert(&mut self, reaction: Reaction) -> bool {
        match self.position(&reaction.author_id, &reaction.emoji) {
            Some(idx) => {
                self.held[idx].reaction_id.get_or_insert(reaction.id);
                false
            }
            None => {
                self.held.push(Held {
                    author_id: reaction.author_id,
                    emoji: reaction.emoji,
                    reaction_id: Some(reaction.id),
                });
                true
            }
        }
    }

    fn event_targets_other_message(&self, event: &ReactionEvent) -> bool {
        self.message_id.as_deref() != Some(event.message_id())
    }

    fn position(&self, author_id: &str, emoji: &str) -> Option<usize> {
        self.held
            .iter()
            .position(|h| h.author_id == author_id && h.emoji == emoji)
    }

    fn reset(&mut self) {
        self.held.clear();
        self.buffer.clear();
        self.error = None;
    }

    fn touch(&mut self) {
        self.revision += 1;
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Activate { message_id: String, reply: Reply<()> },
    Deactivate { reply: Reply<()> },
    RetryFetch { reply: Reply<Result<(), SyncError>> },
    Toggle { emoji: String, reply: Reply<Result<Toggle, SyncError>> },
}

enum Input {
    Snapshot {
        generation: Generation,
        seq: u64,
        result: Result<Vec<Reaction>, StoreError>,
    },
    Subscribed {
        generation: Generation,
        repair: bool,
        result: Result<Subscription<ReactionEvent>, StoreError>,
    },
    Toggled {
        generation: Generation,
        emoji: String,
        toggle: Toggle,
        result: Result<Option<Reaction>, StoreError>,
    },
    ResubscribeDue {
        generation: Generation,
    },
    RefetchDue {
        generation: Generation,
    },
}

/// Handle to a running reaction aggregator for one message at a time.
#[derive(Clone)]
pub struct ReactionAggregator {
    commands: mpsc::UnboundedSender<Command>,
    views: watch::Receiver<ReactionView>,
}

impl ReactionAggregator {
    pub fn spawn(store: Arc<dyn ConversationStore>, config: SyncConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (views_tx, views_rx) = watch::channel(ReactionView::default());

        let worker = Worker {
            state: ReactionState::new(store.current_user(), &config),
            backoff: Backoff::new(config.resubscribe_delay, config.max_resubscribe_attempts),
            refetch: Backoff::new(config.resubscribe_delay, config.max_resubscribe_attempts),
            store,
            subscription: None,
            inputs: inputs_tx,
            views: views_tx,
            published: 0,
            fetch_seq: 0,
        };
        tokio::spawn(worker.run(commands_rx, inputs_rx));

        Self {
            commands: commands_tx,
            views: views_rx,
        }
    }

    pub fn view(&self) -> ReactionView {
        self.views.borrow().clone()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<ReactionView> {
        self.views.clone()
    }

    pub async fn activate(&self, message_id: impl Into<String>) -> Result<(), SyncError> {
        let message_id = message_id.into();
        self.request(|reply| Command::Activate { message_id, reply }).await
    }

    pub async fn deactivate(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Deactivate { reply }).await
    }

    /// Refetch the set after the automatic refetches have given up.
    pub async fn retry_fetch(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::RetryFetch { reply }).await?
    }

    /// Add or remove the local user's `emoji`. The view changes right away;
    /// a store failure reverts it later.
    pub async fn toggle(&self, emoji: &str) -> Result<Toggle, SyncError> {
        let emoji = emoji.to_string();
        self.request(|reply| Command::Toggle { emoji, reply }).await?
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }
}

struct Worker {
    state: ReactionState,
    backoff: Backoff,
    /// Bounds automatic refetches after a failed snapshot.
    refetch: Backoff,
    store: Arc<dyn ConversationStore>,
    subscription: Option<Subscription<ReactionEvent>>,
    inputs: mpsc::UnboundedSender<Input>,
    views: watch::Sender<ReactionView>,
    published: u64,
    fetch_seq: u64,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(input) = inputs.recv() => self.handle_input(input),
                event = next_event(&mut self.subscription) => match event {
                    Some(event) => {
                        let generation = self.state.generation();
                        self.state.apply_event(generation, event);
                    }
                    None => {
                        warn!("Reaction feed dropped");
                        self.subscription = None;
                        self.schedule_resubscribe();
                    }
                },
            }

            if self.state.revision() != self.published {
                self.published = self.state.revision();
                self.views.send_replace(self.state.view());
            }
        }
        debug!("Reaction aggregator stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Activate { message_id, reply } => {
                info!("Watching reactions on {}", message_id);
                self.subscription = None;
                self.backoff.reset();
                self.refetch.reset();
                let generation = self.state.activate(message_id);
                self.request_snapshot();
                self.start_subscribe(generation, false);
                let _ = reply.send(());
            }
            Command::Deactivate { reply } => {
                self.state.deactivate();
                self.subscription = None;
                let _ = reply.send(());
            }
            Command::RetryFetch { reply } => {
                let result = match self.state.message_id() {
                    Some(_) => {
                        self.refetch.reset();
                        self.state.begin_resync();
                        self.request_snapshot();
                        Ok(())
                    }
                    None => Err(SyncError::Inactive),
                };
                let _ = reply.send(result);
            }
            Command::Toggle { emoji, reply } => {
                let result = match self.state.toggle(&emoji) {
                    Some(toggle) => {
                        self.start_toggle(emoji, toggle);
                        Ok(toggle)
                    }
                    None => Err(SyncError::Inactive),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Snapshot {
                generation,
                seq,
                result,
            } => {
                if seq != self.fetch_seq {
                    return;
                }
                match result {
                    Ok(rows) => match self.state.apply_snapshot(generation, rows) {
                        SnapshotOutcome::Applied => self.refetch.reset(),
                        SnapshotOutcome::Refetch => self.request_snapshot(),
                        SnapshotOutcome::Stale => {}
                    },
                    Err(err) => {
                        if self.state.fetch_failed(generation, err.clone().into()) {
                            warn!("Fetching reactions failed: {}", err);
                            self.schedule_refetch();
                        }
                    }
                }
            }
            Input::Subscribed {
                generation,
                repair,
                result,
            } => {
                if !self.state.is_current(generation) {
                    return;
                }
                match result {
                    // Refetch once the feed is in place, whether it is new or
                    // restored after a drop.
                    Ok(subscription) => {
                        self.subscription = Some(subscription);
                        self.backoff.reset();
                        if repair {
                            debug!("Reaction feed restored");
                        }
                        self.state.begin_resync();
                        self.request_snapshot();
                    }
                    Err(err) => {
                        warn!("Subscribing to reactions failed: {}", err);
                        self.schedule_resubscribe();
                    }
                }
            }
            Input::Toggled {
                generation,
                emoji,
                toggle,
                result,
            } => match result {
                Ok(Some(reaction)) => self.state.confirm_add(generation, reaction),
                Ok(None) => {}
                Err(err) => {
                    warn!("Reaction {} failed, reverting: {}", emoji, err);
                    self.state.revert(generation, &emoji, toggle);
                    if self.state.is_current(generation) {
                        self.state.begin_resync();
                        self.request_snapshot();
                    }
                }
            },
            Input::ResubscribeDue { generation } => {
                if self.state.is_current(generation) && self.subscription.is_none() {
                    self.start_subscribe(generation, true);
                }
            }
            Input::RefetchDue { generation } => {
                if self.state.is_current(generation) && self.state.phase().is_buffering() {
                    self.request_snapshot();
                }
            }
        }
    }

    /// Try the snapshot again later; the error stays visible once attempts
    /// run out and `retry_fetch` is the way back.
    fn schedule_refetch(&mut self) {
        let generation = self.state.generation();
        if let Some(delay) = self.refetch.next_delay() {
            self.spawn_input(async move {
                tokio::time::sleep(delay).await;
                Input::RefetchDue { generation }
            });
        }
    }

    fn schedule_resubscribe(&mut self) {
        let generation = self.state.generation();
        match self.backoff.next_delay() {
            Some(delay) => self.spawn_input(async move {
                tokio::time::sleep(delay).await;
                Input::ResubscribeDue { generation }
            }),
            None => self
                .state
                .set_error(SyncError::TransientNetwork("reaction feed unavailable".into())),
        }
    }

    fn request_snapshot(&mut self) {
        let Some(message_id) = self.state.message_id().map(String::from) else {
            return;
        };
        self.fetch_seq += 1;
        let (generation, seq) = (self.state.generation(), self.fetch_seq);
        let store = self.store.clone();

        self.spawn_input(async move {
            let result = store.fetch_reactions(&message_id).await;
            Input::Snapshot {
                generation,
                seq,
                result,
            }
        });
    }

    fn start_subscribe(&self, generation: Generation, repair: bool) {
        let Some(message_id) = self.state.message_id().map(String::from) else {
            return;
        };
        let store = self.store.clone();

        self.spawn_input(async move {
            let result = store.subscribe_reactions(&message_id).await;
            Input::Subscribed {
                generation,
                repair,
                result,
            }
        });
    }

    fn start_toggle(&self, emoji: String, toggle: Toggle) {
        let Some(message_id) = self.state.message_id().map(String::from) else {
            return;
        };
        let generation = self.state.generation();
        let store = self.store.clone();

        self.spawn_input(async move {
            let result = match toggle {
                Toggle::Added => store.add_reaction(&message_id, &emoji).await.map(Some),
                Toggle::Removed => store.remove_reaction(&message_id, &emoji).await.map(|_| None),
            };
            Input::Toggled {
                generation,
                emoji,
                toggle,
                result,
            }
        });
    }

    fn spawn_input<F>(&self, task: F)
    where
        F: Future<Output = Input> + Send + 'static,
    {
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let _ = inputs.send(task.await);
        });
    }
}

async fn next_event(
    subscription: &mut Option<Subscription<ReactionEvent>>,
) -> Option<ReactionEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
