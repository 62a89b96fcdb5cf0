//! The realtime server: socket registry, channels, heartbeat and presence.
//!
//! One [`RealtimeServer`] exists per application. Sockets register by id
//! when they open and deregister exactly once when they close. A closed
//! socket's channels outlive it for the disconnect timeout, so a client
//! reconnecting under the same id picks them up again. Broadcasts go through
//! the [`ChannelAdapter`], whose listener task hands every published message
//! back to the sockets registered in this process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, warn};
use trellis_core::config::{AdapterKind, RealtimeConfig, RealtimeTimeouts};

use crate::adapter::{ChannelAdapter, MemoryChannelAdapter, Published, RedisChannelAdapter};
use crate::error::RealtimeError;
use crate::socket::{Envelope, HEARTBEAT, SYSTEM_CHANNEL, Socket};

/// Notified when a socket joins or leaves the server.
#[async_trait]
pub trait PresenceHook: Send + Sync {
    /// `socket_id` connected.
    async fn join(&self, socket_id: &str) -> anyhow::Result<()>;

    /// `socket_id` disconnected.
    async fn leave(&self, socket_id: &str) -> anyhow::Result<()>;
}

/// Live sockets and the channels they listen on.
pub struct RealtimeServer {
    timeouts: RealtimeTimeouts,
    sockets: RwLock<HashMap<String, Arc<Socket>>>,
    adapter: Arc<dyn ChannelAdapter>,
    presence: std::sync::RwLock<Vec<Arc<dyn PresenceHook>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for RealtimeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeServer")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl RealtimeServer {
    /// A server over `adapter`. Call [`start`](Self::start) before
    /// broadcasting.
    pub fn new(adapter: Arc<dyn ChannelAdapter>, timeouts: RealtimeTimeouts) -> Arc<Self> {
        Arc::new(Self {
            timeouts,
            sockets: RwLock::new(HashMap::new()),
            adapter,
            presence: std::sync::RwLock::new(Vec::new()),
            tasks: std::sync::Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Build and start a server with the configured channel adapter.
    pub async fn from_config(config: &RealtimeConfig) -> Result<Arc<Self>, RealtimeError> {
        let adapter: Arc<dyn ChannelAdapter> = match config.adapter {
            AdapterKind::Memory => Arc::new(MemoryChannelAdapter::new()),
            AdapterKind::Redis => Arc::new(
                RedisChannelAdapter::connect(
                    &config.adapter_settings.redis_url,
                    config.adapter_settings.redis_prefix.clone(),
                )
                .await?,
            ),
        };
        let server = Self::new(adapter, config.timeouts);
        server.start().await?;
        Ok(server)
    }

    /// Spawn the broadcast listener and the heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::AlreadyListening`] if the server was already
    /// started.
    pub async fn start(self: &Arc<Self>) -> Result<(), RealtimeError> {
        let mut published = self.adapter.listen().await?;

        let server = Arc::downgrade(self);
        let listener = tokio::spawn(async move {
            while let Some(message) = published.recv().await {
                let Some(server) = server.upgrade() else {
                    break;
                };
                server.deliver(&message).await;
            }
        });

        let server = Arc::downgrade(self);
        let period = Duration::from_secs(self.timeouts.heartbeat_secs.max(1));
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(server) = server.upgrade() else {
                    break;
                };
                server.beat().await;
            }
        });

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([listener, heartbeat]);
        info!(heartbeat_secs = period.as_secs(), "realtime server started");
        Ok(())
    }

    /// Register a presence hook.
    pub fn add_presence_hook(&self, hook: Arc<dyn PresenceHook>) {
        self.presence
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    fn presence_hooks(&self) -> Vec<Arc<dyn PresenceHook>> {
        self.presence
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The open socket registered under `id`.
    pub async fn socket(&self, id: &str) -> Option<Arc<Socket>> {
        self.sockets.read().await.get(id).cloned()
    }

    /// Number of registered sockets.
    pub async fn socket_count(&self) -> usize {
        self.sockets.read().await.len()
    }

    /// Open `socket`, register it, greet it and fire join hooks.
    ///
    /// A socket already registered under the same id is closed and replaced.
    pub async fn socket_connect(&self, socket: Arc<Socket>) -> Result<(), RealtimeError> {
        socket.open().await;

        let previous = self
            .sockets
            .write()
            .await
            .insert(socket.id().to_owned(), Arc::clone(&socket));
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &socket) {
                socket.span().in_scope(|| debug!("replacing socket with the same id"));
                previous.close().await;
            }
        }

        self.adapter.connect(socket.id()).await?;
        self.adapter.persist(socket.id()).await?;

        let greeting = Envelope {
            channel: SYSTEM_CHANNEL.to_owned(),
            payload: serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }),
        };
        socket.transmit_envelope(&greeting).await?;
        socket.span().in_scope(|| info!("opened"));

        for hook in self.presence_hooks() {
            if let Err(error) = hook.join(socket.id()).await {
                socket.span().in_scope(|| warn!(error = %format!("{error:#}"), "join hook failed"));
            }
        }
        Ok(())
    }

    /// Close `socket` and, if it is the one registered under its id,
    /// deregister it, schedule its channels to expire and fire leave hooks.
    ///
    /// Safe to call any number of times from any task; only one call
    /// deregisters. Returns whether this call did.
    pub async fn socket_disconnect(&self, socket: &Arc<Socket>) -> Result<bool, RealtimeError> {
        let removed = {
            let mut sockets = self.sockets.write().await;
            let registered = sockets
                .get(socket.id())
                .is_some_and(|current| Arc::ptr_eq(current, socket));
            registered && sockets.remove(socket.id()).is_some()
        };
        socket.close().await;
        if !removed {
            return Ok(false);
        }

        let disconnected = self
            .adapter
            .expire(socket.id(), Duration::from_secs(self.timeouts.disconnect_secs))
            .await;
        for hook in self.presence_hooks() {
            if let Err(error) = hook.leave(socket.id()).await {
                socket.span().in_scope(|| warn!(error = %format!("{error:#}"), "leave hook failed"));
            }
        }
        socket.span().in_scope(|| info!("shutdown"));
        disconnected.map(|()| true)
    }

    /// Listen for broadcasts on `channel`.
    pub async fn socket_subscribe(&self, socket_id: &str, channel: &str) -> Result<(), RealtimeError> {
        debug!(socket_id, channel, "socket subscribed");
        self.adapter.subscribe(socket_id, channel).await
    }

    /// Stop listening for broadcasts on `channel`.
    pub async fn socket_unsubscribe(&self, socket_id: &str, channel: &str) -> Result<(), RealtimeError> {
        debug!(socket_id, channel, "socket unsubscribed");
        self.adapter.unsubscribe(socket_id, channel).await
    }

    /// Send `payload` to every socket listening on `channel`, in any process.
    pub async fn subscription_broadcast(
        &self,
        channel: &str,
        payload: serde_json::Value,
    ) -> Result<(), RealtimeError> {
        self.publish(None, channel, payload).await
    }

    /// Send `payload` on `channel` to the socket `socket_id` alone, in
    /// whichever process holds it. Nothing is sent unless the socket listens
    /// on `channel`.
    pub async fn socket_broadcast(
        &self,
        socket_id: &str,
        channel: &str,
        payload: serde_json::Value,
    ) -> Result<(), RealtimeError> {
        self.publish(Some(socket_id.to_owned()), channel, payload).await
    }

    async fn publish(
        &self,
        socket_id: Option<String>,
        channel: &str,
        payload: serde_json::Value,
    ) -> Result<(), RealtimeError> {
        let message = serde_json::to_string(&Envelope {
            channel: channel.to_owned(),
            payload,
        })?;
        self.adapter
            .publish(Published {
                channel: channel.to_owned(),
                message,
                socket_id,
            })
            .await
    }

    async fn deliver(&self, published: &Published) {
        let ids = match self.adapter.socket_ids(&published.channel).await {
            Ok(ids) => ids,
            Err(error) => {
                warn!(channel = %published.channel, error = %error, "failed to list channel sockets");
                return;
            }
        };
        let targets: Vec<Arc<Socket>> = {
            let sockets = self.sockets.read().await;
            ids.iter()
                .filter(|id| published.socket_id.as_ref().is_none_or(|target| target == *id))
                .filter_map(|id| sockets.get(id).cloned())
                .collect()
        };
        for socket in targets {
            socket.transmit(&published.message).await;
        }
    }

    async fn beat(&self) {
        let sockets: Vec<Arc<Socket>> = self.sockets.read().await.values().cloned().collect();
        for socket in sockets {
            socket.transmit(HEARTBEAT).await;
        }
    }

    /// Run a client connection until it closes.
    pub async fn serve(self: Arc<Self>, ws: WebSocket, id: String) {
        let (sink, mut stream) = ws.split();
        let socket = Arc::new(Socket::new(id, Box::pin(sink)));
        let span = socket.span().clone();

        async move {
            if let Err(error) = self.socket_connect(Arc::clone(&socket)).await {
                warn!(error = %error, "failed to connect socket");
            }

            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => debug!(frame = %text.as_str(), "received frame"),
                    Ok(Message::Close(_)) => {
                        debug!("client closed socket");
                        break;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        debug!(error = %error, "socket read ended");
                        break;
                    }
                }
            }

            if let Err(error) = self.socket_disconnect(&socket).await {
                warn!(error = %error, "failed to disconnect socket");
            }
        }
        .instrument(span)
        .await;
    }

    /// Stop background tasks, close every socket and release the adapter.
    /// Later calls do nothing.
    pub async fn shutdown(&self) -> Result<(), RealtimeError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }

        let sockets: Vec<Arc<Socket>> = self.sockets.write().await.drain().map(|(_, socket)| socket).collect();
        info!(sockets = sockets.len(), "realtime server shutting down");
        for socket in sockets {
            socket.close().await;
        }
        self.adapter.shutdown().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::channel::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::socket::Phase;
    use crate::socket::testing::{drain, sink};

    #[derive(Default)]
    struct Counter {
        joins: AtomicUsize,
        leaves: AtomicUsize,
    }

    #[async_trait]
    impl PresenceHook for Counter {
        async fn join(&self, _socket_id: &str) -> anyhow::Result<()> {
            self.joins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn leave(&self, _socket_id: &str) -> anyhow::Result<()> {
            self.leaves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn server() -> Arc<RealtimeServer> {
        RealtimeServer::new(Arc::new(MemoryChannelAdapter::new()), RealtimeTimeouts::default())
    }

    fn socket(id: &str) -> (Arc<Socket>, mpsc::UnboundedReceiver<Message>) {
        let (out, rx) = sink();
        (Arc::new(Socket::new(id, out)), rx)
    }

    async fn next_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> String {
        let message = timeout(Duration::from_secs(1), rx.next()).await.unwrap().unwrap();
        match message {
            Message::Text(text) => text.as_str().to_owned(),
            other => format!("{other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_greets_with_the_version() {
        let server = server();
        let (socket, mut rx) = socket("s1");
        server.socket_connect(Arc::clone(&socket)).await.unwrap();

        let greeting: Envelope = serde_json::from_str(&next_text(&mut rx).await).unwrap();
        assert_eq!(greeting.channel, "system");
        assert_eq!(greeting.payload["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(socket.phase().await, Phase::Open);
        assert_eq!(server.socket_count().await, 1);
    }

    #[tokio::test]
    async fn double_disconnect_leaves_once() {
        let server = server();
        let counter = Arc::new(Counter::default());
        server.add_presence_hook(Arc::clone(&counter) as Arc<dyn PresenceHook>);

        let (socket, _rx) = socket("s1");
        server.socket_connect(Arc::clone(&socket)).await.unwrap();

        let (first, second) = tokio::join!(
            server.socket_disconnect(&socket),
            server.socket_disconnect(&socket)
        );
        assert!(first.unwrap() ^ second.unwrap());
        assert!(!server.socket_disconnect(&socket).await.unwrap());

        assert_eq!(counter.joins.load(Ordering::SeqCst), 1);
        assert_eq!(counter.leaves.load(Ordering::SeqCst), 1);
        assert_eq!(server.socket_count().await, 0);
        assert!(!socket.transmit("late").await);
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribed_sockets_only() {
        let server = server();
        server.start().await.unwrap();

        let (listening, mut listening_rx) = socket("listening");
        let (idle, mut idle_rx) = socket("idle");
        server.socket_connect(Arc::clone(&listening)).await.unwrap();
        server.socket_connect(Arc::clone(&idle)).await.unwrap();
        server.socket_subscribe("listening", "posts").await.unwrap();

        next_text(&mut listening_rx).await;
        server
            .subscription_broadcast("posts", serde_json::json!([{"id": 1}]))
            .await
            .unwrap();

        let frame: Envelope = serde_json::from_str(&next_text(&mut listening_rx).await).unwrap();
        assert_eq!(frame.channel, "posts");
        assert_eq!(frame.payload, serde_json::json!([{"id": 1}]));

        tokio::task::yield_now().await;
        assert_eq!(drain(&mut idle_rx).len(), 1);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn socket_broadcast_reaches_only_its_socket() {
        let server = server();
        server.start().await.unwrap();

        let (target, mut target_rx) = socket("target");
        let (other, mut other_rx) = socket("other");
        server.socket_connect(Arc::clone(&target)).await.unwrap();
        server.socket_connect(Arc::clone(&other)).await.unwrap();
        server.socket_subscribe("target", "posts").await.unwrap();
        server.socket_subscribe("other", "posts").await.unwrap();
        next_text(&mut target_rx).await;
        next_text(&mut other_rx).await;

        server
            .socket_broadcast("target", "posts", serde_json::json!([{"id": 1}]))
            .await
            .unwrap();
        let frame: Envelope = serde_json::from_str(&next_text(&mut target_rx).await).unwrap();
        assert_eq!(frame.payload, serde_json::json!([{"id": 1}]));

        tokio::task::yield_now().await;
        assert!(drain(&mut other_rx).is_empty());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn channels_survive_a_reconnect_within_the_timeout() {
        let server = server();
        server.start().await.unwrap();

        let (first, _first_rx) = socket("s1");
        server.socket_connect(Arc::clone(&first)).await.unwrap();
        server.socket_subscribe("s1", "posts").await.unwrap();
        assert!(server.socket_disconnect(&first).await.unwrap());

        let (second, mut second_rx) = socket("s1");
        server.socket_connect(Arc::clone(&second)).await.unwrap();
        next_text(&mut second_rx).await;

        server
            .subscription_broadcast("posts", serde_json::json!([]))
            .await
            .unwrap();
        let frame: Envelope = serde_json::from_str(&next_text(&mut second_rx).await).unwrap();
        assert_eq!(frame.channel, "posts");
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reconnecting_id_replaces_the_old_socket() {
        let server = server();
        let counter = Arc::new(Counter::default());
        server.add_presence_hook(Arc::clone(&counter) as Arc<dyn PresenceHook>);

        let (old, _old_rx) = socket("same");
        let (new, _new_rx) = socket("same");
        server.socket_connect(Arc::clone(&old)).await.unwrap();
        server.socket_connect(Arc::clone(&new)).await.unwrap();

        assert_eq!(old.phase().await, Phase::Closed);
        assert!(!server.socket_disconnect(&old).await.unwrap());
        assert_eq!(counter.leaves.load(Ordering::SeqCst), 0);
        assert!(Arc::ptr_eq(&server.socket("same").await.unwrap(), &new));
    }

    #[tokio::test]
    async fn shutdown_closes_sockets_once() {
        let server = server();
        server.start().await.unwrap();
        let (socket, _rx) = socket("s1");
        server.socket_connect(Arc::clone(&socket)).await.unwrap();

        server.shutdown().await.unwrap();
        server.shutdown().await.unwrap();

        assert_eq!(socket.phase().await, Phase::Closed);
        assert_eq!(server.socket_count().await, 0);
    }
}
