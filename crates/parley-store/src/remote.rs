//! Conversation store backed by a Parley server: REST for reads and writes,
//! one multiplexed WebSocket gateway connection for change feeds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use url::Url;

use parley_types::api::{ErrorResponse, MessagePageQuery, ReactionRequest, SendMessageRequest};
use parley_types::events::{GatewayCommand, GatewayEvent, Topic};
use parley_types::{
    Attachment, ConversationScope, FeedEvent, Message, Reaction, ReactionEvent,
};

use crate::{ConversationStore, StoreError, Subscription};

/// How long the gateway may take to answer `Identify` with `Ready`.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

enum Route {
    Feed(mpsc::UnboundedSender<FeedEvent>),
    Reactions(mpsc::UnboundedSender<ReactionEvent>),
}

type Routes = Arc<Mutex<HashMap<u64, Route>>>;

/// Live gateway connection. Dropping every clone of `cmd_tx` closes it.
#[derive(Clone)]
struct Gateway {
    cmd_tx: mpsc::UnboundedSender<GatewayCommand>,
    routes: Routes,
}

pub struct RemoteStore {
    http: reqwest::Client,
    base_url: Url,
    token: String,
    user_id: String,
    gateway: tokio::sync::Mutex<Option<Gateway>>,
    next_subscription: AtomicU64,
}

impl RemoteStore {
    pub fn new(base_url: &str, token: impl Into<String>, user_id: impl Into<String>) -> Result<Self, StoreError> {
        let base_url =
            Url::parse(base_url).map_err(|e| StoreError::Rejected(format!("bad server url: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Rejected(format!("bad server url: {}", base_url)));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token: token.into(),
            user_id: user_id.into(),
            gateway: tokio::sync::Mutex::new(None),
            next_subscription: AtomicU64::new(1),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn messages_endpoint(&self, scope: &ConversationScope) -> Url {
        match scope {
            ConversationScope::Channel(channel_id) => self.endpoint(&["channels", channel_id.as_str(), "messages"]),
            ConversationScope::DirectMessage(peer_id) => self.endpoint(&["dm", peer_id.as_str(), "messages"]),
            ConversationScope::Thread { parent_id, .. } => {
                self.endpoint(&["messages", parent_id.as_str(), "replies"])
            }
        }
    }

    fn reactions_endpoint(&self, message_id: &str) -> Url {
        self.endpoint(&["messages", message_id, "reactions"])
    }

    fn gateway_url(&self) -> Result<Url, StoreError> {
        let mut url = self.endpoint(&["gateway"]);
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| StoreError::Rejected(format!("cannot derive gateway url from {}", self.base_url)))?;
        Ok(url)
    }

    async fn get_messages(&self, scope: &ConversationScope, query: &MessagePageQuery) -> Result<Vec<Message>, StoreError> {
        let req = self
            .http
            .get(self.messages_endpoint(scope))
            .bearer_auth(&self.token)
            .query(query);
        let mut rows: Vec<Message> = read_json(req.send().await).await?;
        // Servers page newest-first; feeds want ascending.
        rows.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Ok(rows)
    }

    /// Current gateway connection, connecting if there is none or it died.
    async fn gateway(&self) -> Result<Gateway, StoreError> {
        let mut slot = self.gateway.lock().await;
        if let Some(gw) = slot.as_ref() {
            if !gw.cmd_tx.is_closed() {
                return Ok(gw.clone());
            }
        }

        let gw = connect_gateway(self.gateway_url()?, self.token.clone()).await?;
        *slot = Some(gw.clone());
        Ok(gw)
    }

    async fn open(&self, topic: Topic, route: Route) -> Result<(u64, Gateway), StoreError> {
        let gw = self.gateway().await?;
        let subscription = self.next_subscription.fetch_add(1, Ordering::Relaxed);

        gw.routes
            .lock()
            .expect("routes lock poisoned")
            .insert(subscription, route);
        gw.cmd_tx
            .send(GatewayCommand::Subscribe { subscription, topic })
            .map_err(|_| StoreError::Closed)?;
        Ok((subscription, gw))
    }
}

/// Drop hook: forget the route and tell the server, best effort.
fn closer(gw: Gateway, subscription: u64) -> impl FnOnce() + Send + 'static {
    move || {
        gw.routes
            .lock()
            .expect("routes lock poisoned")
            .remove(&subscription);
        let _ = gw.cmd_tx.send(GatewayCommand::Unsubscribe { subscription });
    }
}

async fn read_json<T: DeserializeOwned>(
    result: Result<reqwest::Response, reqwest::Error>,
) -> Result<T, StoreError> {
    let resp = check(result).await?;
    resp.json::<T>()
        .await
        .map_err(|e| StoreError::Network(format!("bad response body: {}", e)))
}

async fn check(result: Result<reqwest::Response, reqwest::Error>) -> Result<reqwest::Response, StoreError> {
    let resp = result.map_err(|e| StoreError::Network(e.to_string()))?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let reason = resp
        .json::<ErrorResponse>()
        .await
        .map(|e| e.error)
        .unwrap_or_else(|_| status.to_string());

    Err(match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(reason),
        StatusCode::CONFLICT => StoreError::Conflict(reason),
        s if s.is_client_error() => StoreError::Rejected(reason),
        _ => StoreError::Network(reason),
    })
}

async fn connect_gateway(url: Url, token: String) -> Result<Gateway, StoreError> {
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| StoreError::Network(format!("gateway connect failed: {}", e)))?;
    let (mut sink, mut stream) = ws.split();

    let identify = serde_json::to_string(&GatewayCommand::Identify { token })
        .map_err(|e| StoreError::Rejected(e.to_string()))?;
    sink.send(WsMessage::Text(identify.into()))
        .await
        .map_err(|e| StoreError::Network(e.to_string()))?;

    let ready = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = stream.next().await {
            if let WsMessage::Text(text) = msg {
                if let Ok(GatewayEvent::Ready { user_id }) = serde_json::from_str::<GatewayEvent>(&text) {
                    return Some(user_id);
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
    .ok_or_else(|| StoreError::Network("gateway did not acknowledge identify".into()))?;

    info!("Gateway ready for {} at {}", ready, url);

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<GatewayCommand>();
    let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
    let task_routes = routes.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    let text = match serde_json::to_string(&cmd) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Unencodable gateway command: {}", e);
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                msg = stream.next() => {
                    let text = match msg {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => continue,
                    };
                    match serde_json::from_str::<GatewayEvent>(&text) {
                        Ok(event) => route_event(&task_routes, event),
                        Err(e) => warn!(
                            "Bad gateway event: {} -- raw: {}",
                            e,
                            text.chars().take(200).collect::<String>()
                        ),
                    }
                }
            }
        }

        // Ending every route tells each subscriber its feed dropped.
        task_routes.lock().expect("routes lock poisoned").clear();
        info!("Gateway connection closed");
    });

    Ok(Gateway { cmd_tx, routes })
}

fn route_event(routes: &Routes, event: GatewayEvent) {
    let mut routes = routes.lock().expect("routes lock poisoned");
    match event {
        GatewayEvent::Ready { .. } => {}
        GatewayEvent::Message { subscription, event } => {
            if let Some(Route::Feed(tx)) = routes.get(&subscription) {
                if tx.send(event).is_err() {
                    routes.remove(&subscription);
                }
            }
        }
        GatewayEvent::Reaction { subscription, event } => {
            if let Some(Route::Reactions(tx)) = routes.get(&subscription) {
                if tx.send(event).is_err() {
                    routes.remove(&subscription);
                }
            }
        }
        GatewayEvent::SubscriptionClosed { subscription } => {
            debug!("Server closed subscription {}", subscription);
            routes.remove(&subscription);
        }
    }
}

#[async_trait]
impl ConversationStore for RemoteStore {
    fn current_user(&self) -> &str {
        &self.user_id
    }

    async fn fetch_messages(
        &self,
        scope: &ConversationScope,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.get_messages(
            scope,
            &MessagePageQuery {
                before: None,
                limit: Some(limit),
            },
        )
        .await
    }

    async fn fetch_messages_before(
        &self,
        scope: &ConversationScope,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.get_messages(
            scope,
            &MessagePageQuery {
                before: Some(before),
                limit: Some(limit),
            },
        )
        .await
    }

    async fn send_message(
        &self,
        scope: &ConversationScope,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<Message, StoreError> {
        let req = self
            .http
            .post(self.messages_endpoint(scope))
            .bearer_auth(&self.token)
            .json(&SendMessageRequest {
                content: content.to_string(),
                attachments: attachments.to_vec(),
            });
        read_json(req.send().await).await
    }

    async fn subscribe(&self, scope: &ConversationScope) -> Result<Subscription<FeedEvent>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let topic = Topic::Conversation { scope: scope.clone() };
        let (subscription, gw) = self.open(topic, Route::Feed(tx)).await?;
        debug!("Subscribed to {} as #{}", scope, subscription);
        Ok(Subscription::new(rx).on_drop(closer(gw, subscription)))
    }

    async fn fetch_reactions(&self, message_id: &str) -> Result<Vec<Reaction>, StoreError> {
        let req = self
            .http
            .get(self.reactions_endpoint(message_id))
            .bearer_auth(&self.token);
        read_json(req.send().await).await
    }

    async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<Reaction, StoreError> {
        let req = self
            .http
            .post(self.reactions_endpoint(message_id))
            .bearer_auth(&self.token)
            .json(&ReactionRequest { emoji: emoji.to_string() });
        read_json(req.send().await).await
    }

    async fn remove_reaction(&self, message_id: &str, emoji: &str) -> Result<(), StoreError> {
        let req = self
            .http
            .delete(self.reactions_endpoint(message_id))
            .bearer_auth(&self.token)
            .json(&ReactionRequest { emoji: emoji.to_string() });
        check(req.send().await).await?;
        Ok(())
    }

    async fn subscribe_reactions(
        &self,
        message_id: &str,
    ) -> Result<Subscription<ReactionEvent>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let topic = Topic::Reactions {
            message_id: message_id.to_string(),
        };
        let (subscription, gw) = self.open(topic, Route::Reactions(tx)).await?;
        Ok(Subscription::new(rx).on_drop(closer(gw, subscription)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_encode_ids_as_path_segments() {
        let store = RemoteStore::new("http://localhost:3000/api/", "t", "alice").unwrap();
        let url = store.messages_endpoint(&ConversationScope::channel("dev ops"));
        assert_eq!(url.as_str(), "http://localhost:3000/api/channels/dev%20ops/messages");

        let url = store.messages_endpoint(&ConversationScope::thread(
            "m1",
            parley_types::HostScope::Channel("general".into()),
        ));
        assert_eq!(url.as_str(), "http://localhost:3000/api/messages/m1/replies");
    }

    #[test]
    fn gateway_url_follows_tls() {
        let plain = RemoteStore::new("http://chat.local", "t", "alice").unwrap();
        assert_eq!(plain.gateway_url().unwrap().as_str(), "ws://chat.local/gateway");

        let tls = RemoteStore::new("https://chat.example.com", "t", "alice").unwrap();
        assert_eq!(tls.gateway_url().unwrap().as_str(), "wss://chat.example.com/gateway");
    }

    #[test]
    fn rejects_unusable_base_url() {
        assert!(matches!(
            RemoteStore::new("mailto:someone@example.com", "t", "alice"),
            Err(StoreError::Rejected(_))
        ));
    }

    #[test]
    fn routes_message_events_to_their_subscription() {
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        routes.lock().unwrap().insert(4, Route::Feed(tx));

        route_event(
            &routes,
            GatewayEvent::Message {
                subscription: 4,
                event: FeedEvent::Delete { id: "m1".into() },
            },
        );
        route_event(&routes, GatewayEvent::SubscriptionClosed { subscription: 4 });

        assert_eq!(rx.try_recv().unwrap(), FeedEvent::Delete { id: "m1".into() });
        assert!(routes.lock().unwrap().is_empty());
    }
}
