#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;

use parley_store::{ConversationStore, MemoryStore};
use parley_sync::SyncConfig;
use parley_types::{Message, MessageStatus};

pub fn config() -> SyncConfig {
    SyncConfig {
        resubscribe_delay: Duration::from_millis(50),
        ..SyncConfig::default()
    }
}

pub fn session(store: &MemoryStore, user: &str) -> Arc<dyn ConversationStore> {
    Arc::new(store.session(user))
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

pub fn channel_message(id: &str, channel: &str, secs: i64) -> Message {
    Message {
        id: id.into(),
        channel_id: Some(channel.into()),
        dm: None,
        parent_id: None,
        author_id: "bob".into(),
        content: format!("body of {}", id),
        attachments: vec![],
        created_at: at(secs),
        status: MessageStatus::Confirmed,
    }
}

pub fn reply(id: &str, parent: &str, secs: i64) -> Message {
    Message {
        parent_id: Some(parent.into()),
        ..channel_message(id, "general", secs)
    }
}

/// Wait for a published value matching `pred`.
pub async fn wait_for<T: Clone>(rx: &watch::Receiver<T>, pred: impl FnMut(&T) -> bool) -> T {
    let mut rx = rx.clone();
    let value = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(pred))
        .await
        .expect("timed out waiting for view")
        .expect("synchronizer stopped");
    value.clone()
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}
