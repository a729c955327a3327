use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use parley_store::{ConversationStore, RemoteStore};
use parley_sync::{
    FeedSynchronizer, FeedView, NavState, Phase, ReactionAggregator, ScrollCoordinator, SyncConfig,
    Viewport, resolve,
};
use parley_types::MessageStatus;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug".into()),
        )
        .init();

    // Config
    let server_url =
        std::env::var("PARLEY_SERVER_URL").unwrap_or_else(|_| "http://localhost:3000".into());
    let token = std::env::var("PARLEY_TOKEN").context("PARLEY_TOKEN is not set")?;
    let user_id = std::env::var("PARLEY_USER_ID").context("PARLEY_USER_ID is not set")?;
    let nav = std::env::var("PARLEY_NAV").unwrap_or_else(|_| "/".into());
    let highlight = std::env::var("PARLEY_HIGHLIGHT").ok();
    let config = SyncConfig::from_env()?;

    let Some(scope) = resolve(&NavState::from_path(&nav)) else {
        bail!("{:?} does not select a conversation", nav);
    };

    let store: Arc<dyn ConversationStore> = Arc::new(RemoteStore::new(&server_url, token, user_id)?);
    let feed = FeedSynchronizer::spawn(store.clone(), config.clone());
    let reactions = ReactionAggregator::spawn(store, config);

    info!("Tailing {} on {}", scope, server_url);
    feed.activate(scope).await?;

    let (highlight_tx, highlight_rx) = mpsc::unbounded_channel();
    if highlight.is_some() {
        let _ = highlight_tx.send(highlight);
    }
    tokio::spawn(ScrollCoordinator::new().run(feed.subscribe_view(), highlight_rx, Terminal));
    tokio::spawn(print_feed(feed.subscribe_view()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if let Err(err) = handle_line(line.trim(), &feed, &reactions).await {
                    warn!("{}", err);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    feed.deactivate().await?;
    reactions.deactivate().await?;
    Ok(())
}

async fn handle_line(
    line: &str,
    feed: &FeedSynchronizer,
    reactions: &ReactionAggregator,
) -> anyhow::Result<()> {
    let mut words = line.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (None, ..) => {}
        (Some("/older"), ..) => feed.load_older().await?,
        (Some("/retry"), Some(local_id), _) => feed.retry(local_id).await?,
        (Some("/discard"), Some(local_id), _) => feed.discard(local_id).await?,
        (Some("/react"), Some(message_id), Some(emoji)) => {
            reactions.activate(message_id).await?;
            let mut views = reactions.subscribe_view();
            views.wait_for(|v| v.phase == Phase::Live).await?;
            let toggle = reactions.toggle(emoji).await?;
            info!("Reaction {} on {}: {:?}", emoji, message_id, toggle);
        }
        (Some(cmd), ..) if cmd.starts_with('/') => bail!("unknown command {}", cmd),
        _ => {
            let local_id = feed.send_optimistic(line, vec![]).await?;
            info!("Queued {}", local_id);
        }
    }
    Ok(())
}

/// Print confirmed messages once each, and failures as they happen.
async fn print_feed(mut views: watch::Receiver<FeedView>) {
    let mut printed = HashSet::new();
    let mut failed = HashSet::new();
    let mut phase = Phase::Idle;

    while views.changed().await.is_ok() {
        let view = views.borrow_and_update().clone();
        if view.phase != phase {
            info!("Feed is {:?}", view.phase);
            phase = view.phase;
        }
        if let Some(err) = &view.error {
            warn!("Feed error: {}", err);
        }

        for message in &view.messages {
            match message.status {
                MessageStatus::Confirmed if printed.insert(message.id.clone()) => {
                    println!(
                        "[{}] {}: {}",
                        message.created_at.format("%H:%M:%S"),
                        message.author_id,
                        message.content
                    );
                }
                MessageStatus::Failed if failed.insert(message.id.clone()) => {
                    let reason = view
                        .send_errors
                        .get(&message.id)
                        .map(|e| e.to_string())
                        .unwrap_or_default();
                    println!("! {} not sent ({}), /retry or /discard it", message.id, reason);
                }
                _ => {}
            }
        }
    }
}

/// A terminal has no scroll position; it always follows the tail.
struct Terminal;

impl Viewport for Terminal {
    fn distance_from_bottom(&self) -> f64 {
        0.0
    }

    fn is_settled(&self, _message_id: &str) -> bool {
        true
    }

    fn scroll_to_bottom(&mut self, _animated: bool) {}

    fn scroll_to_message(&mut self, message_id: &str) {
        println!("--- jump to {} ---", message_id);
    }

    fn set_highlight(&mut self, message_id: Option<&str>) {
        if let Some(id) = message_id {
            println!(">>> {}", id);
        }
    }
}
