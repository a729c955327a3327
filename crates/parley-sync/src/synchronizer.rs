//! The feed actor.
//!
//! One tokio task owns the [`FeedState`]. Handle calls arrive as commands,
//! store calls run in spawned tasks that report back as inputs tagged with
//! their generation, and the change feed is polled in the same `select!`
//! loop. Every change is published on a `watch` channel.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use parley_store::{ConversationStore, StoreError, Subscription};
use parley_types::{Attachment, ConversationScope, FeedEvent, Message};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::feed::{FeedState, FeedView, SendOutcome};
use crate::lifecycle::{Backoff, Generation, SnapshotOutcome};

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Activate {
        scope: ConversationScope,
        reply: Reply<()>,
    },
    Deactivate {
        reply: Reply<()>,
    },
    RetryFetch {
        reply: Reply<Result<(), SyncError>>,
    },
    Send {
        content: String,
        attachments: Vec<Attachment>,
        reply: Reply<Result<String, SyncError>>,
    },
    Retry {
        local_id: String,
        reply: Reply<Result<(), SyncError>>,
    },
    Discard {
        local_id: String,
        reply: Reply<Result<(), SyncError>>,
    },
    LoadOlder {
        reply: Reply<Result<(), SyncError>>,
    },
}

/// Results of store calls, reported back to the worker.
enum Input {
    Snapshot {
        generation: Generation,
        seq: u64,
        limit: u32,
        result: Result<Vec<Message>, StoreError>,
    },
    Older {
        generation: Generation,
        limit: u32,
        result: Result<Vec<Message>, StoreError>,
        reply: Reply<Result<(), SyncError>>,
    },
    Subscribed {
        generation: Generation,
        /// Reopened after a drop; changes may have been missed
        repair: bool,
        result: Result<Subscription<FeedEvent>, StoreError>,
    },
    Sent {
        generation: Generation,
        local_id: String,
        outcome: SendOutcome,
    },
    ResubscribeDue {
        generation: Generation,
    },
}

/// Handle to a running feed synchronizer. Clones share the same worker; the
/// worker stops when the last handle is dropped.
#[derive(Clone)]
pub struct FeedSynchronizer {
    commands: mpsc::UnboundedSender<Command>,
    views: watch::Receiver<FeedView>,
}

impl FeedSynchronizer {
    /// Start a worker acting as `store.current_user()`. Must be called within
    /// a tokio runtime.
    pub fn spawn(store: Arc<dyn ConversationStore>, config: SyncConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (views_tx, views_rx) = watch::channel(FeedView::default());

        let worker = Worker {
            state: FeedState::new(store.current_user(), &config),
            backoff: Backoff::new(config.resubscribe_delay, config.max_resubscribe_attempts),
            store,
            config,
            subscription: None,
            inputs: inputs_tx,
            views: views_tx,
            published: 0,
            fetch_seq: 0,
            loading_older: false,
        };
        tokio::spawn(worker.run(commands_rx, inputs_rx));

        Self {
            commands: commands_tx,
            views: views_rx,
        }
    }

    /// The latest published view.
    pub fn view(&self) -> FeedView {
        self.views.borrow().clone()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<FeedView> {
        self.views.clone()
    }

    /// Switch to `scope`, dropping whatever the previous scope held.
    pub async fn activate(&self, scope: ConversationScope) -> Result<(), SyncError> {
        self.request(|reply| Command::Activate { scope, reply }).await
    }

    pub async fn deactivate(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Deactivate { reply }).await
    }

    /// Re-issue the snapshot fetch after a failure.
    pub async fn retry_fetch(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::RetryFetch { reply }).await?
    }

    /// Show a pending message right away and send it. Returns its local id.
    pub async fn send_optimistic(
        &self,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<String, SyncError> {
        let content = content.into();
        self.request(|reply| Command::Send {
            content,
            attachments,
            reply,
        })
        .await?
    }

    pub async fn retry(&self, local_id: &str) -> Result<(), SyncError> {
        let local_id = local_id.to_string();
        self.request(|reply| Command::Retry { local_id, reply }).await?
    }

    pub async fn discard(&self, local_id: &str) -> Result<(), SyncError> {
        let local_id = local_id.to_string();
        self.request(|reply| Command::Discard { local_id, reply }).await?
    }

    /// Fetch the page before the oldest confirmed message. Resolves once the
    /// page is merged; a no-op when nothing older exists.
    pub async fn load_older(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::LoadOlder { reply }).await?
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
    state: FeedState,
    backoff: Backoff,
    store: Arc<dyn ConversationStore>,
    config: SyncConfig,
    subscription: Option<Subscription<FeedEvent>>,
    inputs: mpsc::UnboundedSender<Input>,
    views: watch::Sender<FeedView>,
    published: u64,
    /// Only the most recently requested snapshot is applied
    fetch_seq: u64,
    loading_older: bool,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
    ) {
        debug!("Feed synchronizer started for {}", self.state.me());

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
                    None => self.feed_dropped(),
                },
            }
            self.publish();
        }

        debug!("Feed synchronizer for {} stopped", self.state.me());
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Activate { scope, reply } => {
                self.activate(scope);
                let _ = reply.send(());
            }
            Command::Deactivate { reply } => {
                if self.state.deactivate() {
                    info!("Feed deactivated");
                }
                self.subscription = None;
                self.loading_older = false;
                let _ = reply.send(());
            }
            Command::RetryFetch { reply } => {
                let result = match self.state.scope() {
                    Some(_) => {
                        self.request_snapshot();
                        Ok(())
                    }
                    None => Err(SyncError::Inactive),
                };
                let _ = reply.send(result);
            }
            Command::Send {
                content,
                attachments,
                reply,
            } => {
                let result = match self.state.insert_local(content, attachments, Utc::now()) {
                    Some(local) => {
                        let local_id = local.id.clone();
                        self.start_send(local);
                        Ok(local_id)
                    }
                    None => Err(SyncError::Inactive),
                };
                let _ = reply.send(result);
            }
            Command::Retry { local_id, reply } => {
                let result = self
                    .state
                    .retry(&local_id)
                    .map(|message| self.start_send(message));
                let _ = reply.send(result);
            }
            Command::Discard { local_id, reply } => {
                let _ = reply.send(self.state.discard(&local_id));
            }
            Command::LoadOlder { reply } => self.load_older(reply),
        }
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Snapshot {
                generation,
                seq,
                limit,
                result,
            } => {
                if seq != self.fetch_seq {
                    debug!("Snapshot {} superseded by {}", seq, self.fetch_seq);
                    return;
                }
                match result {
                    Ok(rows) => {
                        let outcome = self.state.apply_snapshot(generation, rows, limit);
                        if outcome == SnapshotOutcome::Refetch {
                            self.request_snapshot();
                        }
                    }
                    Err(err) => {
                        if self.state.fetch_failed(generation, err.clone().into()) {
                            warn!("Fetching messages failed: {}", err);
                        }
                    }
                }
            }
            Input::Older {
                generation,
                limit,
                result,
                reply,
            } => {
                if !self.state.is_current(generation) {
                    let _ = reply.send(Err(SyncError::Inactive));
                    return;
                }
                self.loading_older = false;
                let outcome = match result {
                    Ok(rows) => {
                        debug!("Loaded {} older messages", rows.len());
                        self.state.apply_older(generation, rows, limit);
                        Ok(())
                    }
                    Err(err) => {
                        warn!("Loading older messages failed: {}", err);
                        Err(err.into())
                    }
                };
                let _ = reply.send(outcome);
            }
            Input::Subscribed {
                generation,
                repair,
                result,
            } => {
                if !self.state.is_current(generation) {
                    debug!("Dropping subscription from stale generation {}", generation);
                    return;
                }
                match result {
                    // A snapshot taken before the feed existed can miss changes,
                    // so one is always requested once the feed is in place.
                    Ok(subscription) => {
                        self.subscription = Some(subscription);
                        self.backoff.reset();
                        if repair {
                            info!("Change feed restored, fetching to repair the gap");
                        } else {
                            debug!("Change feed open, fetching to close the startup gap");
                        }
                        self.state.begin_resync();
                        self.request_snapshot();
                    }
                    Err(StoreError::NotFound(what)) => {
                        warn!("Cannot subscribe, {} not found", what);
                        self.state.set_error(SyncError::NotFound(what));
                    }
                    Err(err) => {
                        warn!("Subscribing failed: {}", err);
                        self.schedule_resubscribe();
                    }
                }
            }
            Input::Sent {
                generation,
                local_id,
                outcome,
            } => {
                self.state.complete_send(generation, &local_id, outcome);
            }
            Input::ResubscribeDue { generation } => {
                if self.state.is_current(generation) && self.subscription.is_none() {
                    self.start_subscribe(generation, true);
                }
            }
        }
    }

    fn activate(&mut self, scope: ConversationScope) {
        info!("Activating feed for {}", scope);
        self.subscription = None;
        self.backoff.reset();
        self.loading_older = false;

        let generation = self.state.activate(scope);
        self.request_snapshot();
        self.start_subscribe(generation, false);
    }

    fn feed_dropped(&mut self) {
        self.subscription = None;
        if let Some(scope) = self.state.scope() {
            warn!("Change feed for {} dropped", scope);
        }
        self.state.begin_resync();
        self.schedule_resubscribe();
    }

    fn schedule_resubscribe(&mut self) {
        let generation = self.state.generation();
        match self.backoff.next_delay() {
            Some(delay) => {
                debug!("Resubscribing in {:?}", delay);
                self.spawn_input(async move {
                    tokio::time::sleep(delay).await;
                    Input::ResubscribeDue { generation }
                });
            }
            None => {
                warn!("Giving up on the change feed after repeated failures");
                self.state
                    .set_error(SyncError::TransientNetwork("change feed unavailable".into()));
            }
        }
    }

    fn request_snapshot(&mut self) {
        let Some(scope) = self.state.scope().cloned() else {
            return;
        };
        self.fetch_seq += 1;
        let (generation, seq) = (self.state.generation(), self.fetch_seq);
        let limit = self.state.snapshot_limit();
        let store = self.store.clone();

        self.spawn_input(async move {
            let result = store.fetch_messages(&scope, limit).await;
            Input::Snapshot {
                generation,
                seq,
                limit,
                result,
            }
        });
    }

    fn start_subscribe(&self, generation: Generation, repair: bool) {
        let Some(scope) = self.state.scope().cloned() else {
            return;
        };
        let store = self.store.clone();

        self.spawn_input(async move {
            let result = store.subscribe(&scope).await;
            Input::Subscribed {
                generation,
                repair,
                result,
            }
        });
    }

    fn start_send(&self, message: Message) {
        let Some(scope) = self.state.scope().cloned() else {
            return;
        };
        let generation = self.state.generation();
        let store = self.store.clone();
        let timeout = self.config.send_timeout;
        debug!("Sending {} to {}", message.id, scope);

        self.spawn_input(async move {
            let send = store.send_message(&scope, &message.content, &message.attachments);
            let outcome = match tokio::time::timeout(timeout, send).await {
                Ok(Ok(record)) => SendOutcome::Confirmed(record),
                Ok(Err(err)) => SendOutcome::Failed(err.into()),
                Err(_) => SendOutcome::TimedOut,
            };
            Input::Sent {
                generation,
                local_id: message.id,
                outcome,
            }
        });
    }

    fn load_older(&mut self, reply: Reply<Result<(), SyncError>>) {
        let Some(scope) = self.state.scope().cloned() else {
            let _ = reply.send(Err(SyncError::Inactive));
            return;
        };
        let ready = self.state.phase().has_snapshot() && self.state.has_more() && !self.loading_older;
        let before = match self.state.oldest_confirmed() {
            Some(before) if ready => before,
            _ => {
                let _ = reply.send(Ok(()));
                return;
            }
        };

        self.loading_older = true;
        let generation = self.state.generation();
        let limit = self.config.page_size;
        let store = self.store.clone();

        self.spawn_input(async move {
            let result = store.fetch_messages_before(&scope, before, limit).await;
            Input::Older {
                generation,
                limit,
                result,
                reply,
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

    fn publish(&mut self) {
        if self.state.revision() != self.published {
            self.published = self.state.revision();
            self.views.send_replace(self.state.view());
        }
    }
}

async fn next_event(subscription: &mut Option<Subscription<FeedEvent>>) -> Option<FeedEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
