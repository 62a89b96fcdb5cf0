//! Live data delivery over sockets.
//!
//! A socket subscribes to a query through [`subscribe_socket`]. When a
//! mutation affects the query, [`SocketHandler`] sends the fresh rows to
//! that socket alone, on the channel recorded in the subscription payload. [`DataPresence`]
//! keeps the socket's data subscriptions alive only while it is connected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use trellis_core::value::{Value, Values};
use trellis_data::{Delivery, Proxy, SubscriptionHandler, SubscriptionKey, Subscribers};

use crate::error::RealtimeError;
use crate::server::{PresenceHook, RealtimeServer};

/// Name the socket handler is registered under.
pub const SOCKET_HANDLER: &str = "realtime";

const CHANNEL_KEY: &str = "channel";

/// The subscription payload routing deliveries to `channel`.
pub fn subscription_payload(channel: &str) -> Value {
    let mut payload = Values::new();
    payload.insert(CHANNEL_KEY.to_owned(), Value::from(channel));
    Value::Map(payload)
}

/// Sends subscription results to the subscribed socket.
#[derive(Debug, Clone)]
pub struct SocketHandler {
    server: Arc<RealtimeServer>,
}

impl SocketHandler {
    /// A handler broadcasting through `server`.
    pub const fn new(server: Arc<RealtimeServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl SubscriptionHandler for SocketHandler {
    async fn call(&self, delivery: Delivery) -> anyhow::Result<()> {
        let channel = delivery
            .subscription
            .payload
            .as_map()
            .and_then(|payload| payload.get(CHANNEL_KEY))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "subscription {} has no channel in its payload",
                    delivery.key
                )
            })?;

        let payload = serde_json::to_value(&delivery.result)?;
        let socket_id = delivery.subscription.subscriber.as_str();
        debug!(socket_id, channel, rows = delivery.result.len(), "sending subscription result");
        self.server.socket_broadcast(socket_id, channel, payload).await?;
        Ok(())
    }
}

/// Expires a socket's data subscriptions when it leaves and keeps them when
/// it comes back.
#[derive(Debug, Clone)]
pub struct DataPresence {
    subscribers: Arc<Subscribers>,
    disconnect: Duration,
}

impl DataPresence {
    /// Subscriptions of departed sockets survive for `disconnect`.
    pub const fn new(subscribers: Arc<Subscribers>, disconnect: Duration) -> Self {
        Self {
            subscribers,
            disconnect,
        }
    }
}

#[async_trait]
impl PresenceHook for DataPresence {
    async fn join(&self, socket_id: &str) -> anyhow::Result<()> {
        self.subscribers.persist(socket_id).await?;
        Ok(())
    }

    async fn leave(&self, socket_id: &str) -> anyhow::Result<()> {
        self.subscribers.expire(socket_id, self.disconnect).await?;
        Ok(())
    }
}

/// Send `proxy`'s fresh results to `socket_id` on `channel` whenever a
/// mutation may change them.
pub async fn subscribe_socket(
    proxy: &Proxy,
    server: &RealtimeServer,
    socket_id: &str,
    channel: &str,
) -> Result<SubscriptionKey, RealtimeError> {
    server.socket_subscribe(socket_id, channel).await?;
    let key = proxy
        .subscribe(socket_id, SOCKET_HANDLER, subscription_payload(channel))
        .await?;
    Ok(key)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::extract::ws::Message;
    use futures::StreamExt;
    use futures::channel::mpsc::UnboundedReceiver;
    use tokio::time::timeout;
    use trellis_core::config::RealtimeTimeouts;
    use trellis_core::value::FieldType;
    use trellis_core::values;
    use trellis_data::{Lookup, SourceDefinition};

    use super::*;
    use crate::adapter::MemoryChannelAdapter;
    use crate::socket::testing::{drain, sink};
    use crate::socket::{Envelope, Socket};

    #[test]
    fn payload_names_the_channel() {
        let payload = subscription_payload("posts:1");
        assert_eq!(
            payload.as_map().unwrap().get("channel"),
            Some(&Value::from("posts:1"))
        );
    }

    struct Fixture {
        server: Arc<RealtimeServer>,
        subscribers: Arc<Subscribers>,
        lookup: Lookup,
    }

    async fn fixture() -> Fixture {
        let server = RealtimeServer::new(
            Arc::new(MemoryChannelAdapter::new()),
            RealtimeTimeouts::default(),
        );
        server.start().await.unwrap();

        let subscribers = Arc::new(Subscribers::memory());
        subscribers.register_handler(
            SOCKET_HANDLER,
            Arc::new(SocketHandler::new(Arc::clone(&server))),
        );
        server.add_presence_hook(Arc::new(DataPresence::new(
            Arc::clone(&subscribers),
            Duration::from_secs(60),
        )));
        let lookup = Lookup::with_definitions(
            [SourceDefinition::new("posts")
                .primary_id()
                .attribute("title", FieldType::String)],
            Arc::clone(&subscribers),
        )
        .unwrap();
        Fixture {
            server,
            subscribers,
            lookup,
        }
    }

    async fn connect(server: &RealtimeServer, id: &str) -> (Arc<Socket>, UnboundedReceiver<Message>) {
        let (out, mut rx) = sink();
        let socket = Arc::new(Socket::new(id, out));
        server.socket_connect(Arc::clone(&socket)).await.unwrap();
        let greeting = timeout(Duration::from_secs(1), rx.next()).await.unwrap();
        assert!(greeting.is_some());
        (socket, rx)
    }

    async fn next_envelope(rx: &mut UnboundedReceiver<Message>) -> Envelope {
        let frame = timeout(Duration::from_secs(1), rx.next()).await.unwrap().unwrap();
        let text = match frame {
            Message::Text(text) => text.as_str().to_owned(),
            other => format!("{other:?}"),
        };
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn mutations_reach_the_subscribed_socket() {
        let Fixture { server, lookup, .. } = fixture().await;
        let (_socket, mut rx) = connect(&server, "s1").await;

        let posts = lookup.source("posts").unwrap();
        subscribe_socket(&posts, &server, "s1", "posts").await.unwrap();
        posts.create(values! { "title" => "hello" }).await.unwrap();

        let envelope = next_envelope(&mut rx).await;
        assert_eq!(envelope.channel, "posts");
        assert_eq!(envelope.payload[0]["title"], "hello");
    }

    #[tokio::test]
    async fn sockets_sharing_a_channel_get_only_their_own_results() {
        let Fixture { server, lookup, .. } = fixture().await;
        let posts = lookup.source("posts").unwrap();
        posts.create(values! { "title" => "one" }).await.unwrap();
        posts.create(values! { "title" => "two" }).await.unwrap();

        let (_first, mut first_rx) = connect(&server, "s1").await;
        let (_second, mut second_rx) = connect(&server, "s2").await;
        let by_one = posts.clone().query("by_id", vec![Value::from(1)]).unwrap();
        let by_two = posts.clone().query("by_id", vec![Value::from(2)]).unwrap();
        subscribe_socket(&by_one, &server, "s1", "posts").await.unwrap();
        subscribe_socket(&by_two, &server, "s2", "posts").await.unwrap();

        by_one.update(values! { "title" => "changed" }).await.unwrap();

        let envelope = next_envelope(&mut first_rx).await;
        assert_eq!(envelope.payload[0]["id"], 1);
        assert_eq!(envelope.payload[0]["title"], "changed");
        tokio::task::yield_now().await;
        assert!(drain(&mut first_rx).is_empty());
        assert!(drain(&mut second_rx).is_empty());
    }

    #[tokio::test]
    async fn reconnecting_in_time_resumes_delivery() {
        let Fixture {
            server,
            subscribers,
            lookup,
        } = fixture().await;
        let posts = lookup.source("posts").unwrap();

        let (first, _first_rx) = connect(&server, "s1").await;
        subscribe_socket(&posts, &server, "s1", "posts").await.unwrap();
        assert!(server.socket_disconnect(&first).await.unwrap());
        assert_eq!(subscribers.adapter().subscriptions_for_source("posts").await.unwrap().len(), 1);

        let (_second, mut second_rx) = connect(&server, "s1").await;
        posts.create(values! { "title" => "while away" }).await.unwrap();

        let envelope = next_envelope(&mut second_rx).await;
        assert_eq!(envelope.channel, "posts");
        assert_eq!(envelope.payload[0]["title"], "while away");
    }

    #[tokio::test]
    async fn payload_without_channel_is_an_error() {
        let server = RealtimeServer::new(
            Arc::new(MemoryChannelAdapter::new()),
            RealtimeTimeouts::default(),
        );
        let handler = SocketHandler::new(server);
        let delivery = Delivery {
            key: SubscriptionKey::new("k"),
            subscription: trellis_data::Subscription {
                subscriber: "s1".into(),
                source: "posts".into(),
                queries: Vec::new(),
                includes: Vec::new(),
                handler: SOCKET_HANDLER.into(),
                payload: Value::Null,
            },
            result: Vec::new(),
        };
        assert!(handler.call(delivery).await.is_err());
    }
}
