mod common;

use parley_store::{MemoryStore, StoreOp};
use parley_sync::{Phase, ReactionAggregator, ReactionView, SyncConfig, SyncError, Toggle};

use common::*;

fn own_thumbs(view: &ReactionView) -> bool {
    view.group("👍").is_some_and(|g| g.includes_me)
}

async fn watching_m1(store: &MemoryStore) -> ReactionAggregator {
    watching_m1_with(store, config()).await
}

async fn watching_m1_with(store: &MemoryStore, config: SyncConfig) -> ReactionAggregator {
    store.post_silently(channel_message("m1", "general", 0)).await;
    let aggregator = ReactionAggregator::spawn(session(store, "alice"), config);
    aggregator.activate("m1").await.unwrap();
    // The first fetch, then the one issued once the feed is open.
    wait_until(|| store.calls(StoreOp::FetchReactions) == 2).await;
    wait_for(&aggregator.subscribe_view(), |v| v.phase == Phase::Live).await;
    wait_until(|| store.subscriber_count() == 1).await;
    aggregator
}

#[tokio::test(start_paused = true)]
async fn remote_and_local_reactions_are_grouped() {
    let store = MemoryStore::new();
    let aggregator = watching_m1(&store).await;

    store.react("m1", "bob", "👍").await;
    wait_for(&aggregator.subscribe_view(), |v| v.group("👍").is_some()).await;

    assert_eq!(aggregator.toggle("👍").await, Ok(Toggle::Added));
    let view = wait_for(&aggregator.subscribe_view(), own_thumbs).await;
    let group = view.group("👍").unwrap();
    assert_eq!(group.count, 2);
    assert_eq!(group.user_ids, vec!["bob", "alice"]);

    // Our own insert echoes back without double counting.
    wait_until(|| store.calls(StoreOp::AddReaction) == 1).await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert_eq!(aggregator.view().group("👍").unwrap().count, 2);
}

#[tokio::test(start_paused = true)]
async fn failed_toggle_reverts_and_refetches() {
    let store = MemoryStore::new();
    let aggregator = watching_m1(&store).await;
    aggregator.toggle("👍").await.unwrap();
    wait_for(&aggregator.subscribe_view(), own_thumbs).await;
    wait_until(|| store.calls(StoreOp::AddReaction) == 1).await;

    store.fail_next(StoreOp::RemoveReaction, 1);
    assert_eq!(aggregator.toggle("👍").await, Ok(Toggle::Removed));

    wait_until(|| store.calls(StoreOp::FetchReactions) == 3).await;
    let view = wait_for(&aggregator.subscribe_view(), |v| {
        v.phase == Phase::Live && own_thumbs(v)
    })
    .await;
    assert_eq!(view.group("👍").unwrap().count, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_refetch_after_revert_is_tried_again() {
    let store = MemoryStore::new();
    let aggregator = watching_m1(&store).await;

    store.fail_next(StoreOp::AddReaction, 1);
    store.fail_next(StoreOp::FetchReactions, 1);
    assert_eq!(aggregator.toggle("👍").await, Ok(Toggle::Added));

    wait_until(|| store.calls(StoreOp::FetchReactions) == 4).await;
    let view = wait_for(&aggregator.subscribe_view(), |v| {
        v.phase == Phase::Live && v.error.is_none()
    })
    .await;
    assert!(!own_thumbs(&view));

    store.react("m1", "bob", "🔥").await;
    wait_for(&aggregator.subscribe_view(), |v| v.group("🔥").is_some()).await;
    assert_eq!(aggregator.toggle("👍").await, Ok(Toggle::Added));
}

#[tokio::test(start_paused = true)]
async fn retry_fetch_recovers_once_refetches_give_up() {
    let store = MemoryStore::new();
    let aggregator = watching_m1_with(
        &store,
        SyncConfig {
            max_resubscribe_attempts: 1,
            ..config()
        },
    )
    .await;

    store.fail_next(StoreOp::AddReaction, 1);
    store.fail_next(StoreOp::FetchReactions, 2);
    aggregator.toggle("👍").await.unwrap();

    wait_until(|| store.calls(StoreOp::FetchReactions) == 4).await;
    let stuck = wait_for(&aggregator.subscribe_view(), |v| v.error.is_some()).await;
    assert_eq!(stuck.phase, Phase::Resyncing);
    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    assert_eq!(store.calls(StoreOp::FetchReactions), 4);
    assert_eq!(aggregator.toggle("👍").await, Err(SyncError::Inactive));

    store.react("m1", "bob", "🔥").await;
    aggregator.retry_fetch().await.unwrap();
    let view = wait_for(&aggregator.subscribe_view(), |v| {
        v.phase == Phase::Live && v.group("🔥").is_some()
    })
    .await;
    assert_eq!(view.error, None);
    assert_eq!(aggregator.toggle("👍").await, Ok(Toggle::Added));
}

#[tokio::test(start_paused = true)]
async fn toggle_before_activation_is_rejected() {
    let store = MemoryStore::new();
    let aggregator = ReactionAggregator::spawn(session(&store, "alice"), config());
    assert_eq!(aggregator.toggle("👍").await, Err(SyncError::Inactive));
}

#[tokio::test(start_paused = true)]
async fn switching_messages_drops_the_old_feed() {
    let store = MemoryStore::new();
    let aggregator = watching_m1(&store).await;
    store.post_silently(channel_message("m2", "general", 1)).await;

    aggregator.activate("m2").await.unwrap();
    wait_for(&aggregator.subscribe_view(), |v| {
        v.message_id.as_deref() == Some("m2") && v.phase == Phase::Live
    })
    .await;
    wait_until(|| store.subscriber_count() == 1).await;

    store.react("m1", "bob", "🔥").await;
    store.react("m2", "bob", "👀").await;
    let view = wait_for(&aggregator.subscribe_view(), |v| !v.groups.is_empty()).await;
    assert_eq!(view.groups.len(), 1);
    assert_eq!(view.groups[0].emoji, "👀");

    aggregator.deactivate().await.unwrap();
    wait_until(|| store.subscriber_count() == 0).await;
}
