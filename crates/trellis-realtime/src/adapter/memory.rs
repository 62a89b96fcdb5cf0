use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, mpsc};

use super::{ChannelAdapter, Published};
use crate::error::RealtimeError;

#[derive(Debug, Default)]
struct Membership {
    channels: HashMap<String, BTreeSet<String>>,
    sockets: HashMap<String, BTreeSet<String>>,
    expirations: HashMap<String, Instant>,
}

impl Membership {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(socket_id, _)| socket_id.clone())
            .collect();
        for socket_id in expired {
            self.forget(&socket_id);
        }
    }

    fn forget(&mut self, socket_id: &str) {
        self.expirations.remove(socket_id);
        let channels = self.sockets.remove(socket_id).unwrap_or_default();
        for channel in channels {
            if let Some(ids) = self.channels.get_mut(&channel) {
                ids.remove(socket_id);
                if ids.is_empty() {
                    self.channels.remove(&channel);
                }
            }
        }
    }
}

/// Channel state for a single process.
#[derive(Debug)]
pub struct MemoryChannelAdapter {
    membership: RwLock<Membership>,
    tx: mpsc::UnboundedSender<Published>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Published>>>,
}

impl Default for MemoryChannelAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannelAdapter {
    /// An adapter with no sockets.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            membership: RwLock::new(Membership::default()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl ChannelAdapter for MemoryChannelAdapter {
    async fn connect(&self, socket_id: &str) -> Result<(), RealtimeError> {
        let mut membership = self.membership.write().await;
        membership.purge_expired();
        membership.sockets.entry(socket_id.to_owned()).or_default();
        Ok(())
    }

    async fn disconnect(&self, socket_id: &str) -> Result<(), RealtimeError> {
        self.membership.write().await.forget(socket_id);
        Ok(())
    }

    async fn expire(&self, socket_id: &str, after: Duration) -> Result<(), RealtimeError> {
        let mut membership = self.membership.write().await;
        match Instant::now().checked_add(after) {
            Some(deadline) if !after.is_zero() => {
                membership.expirations.insert(socket_id.to_owned(), deadline);
            }
            Some(_) => membership.forget(socket_id),
            None => {}
        }
        Ok(())
    }

    async fn persist(&self, socket_id: &str) -> Result<(), RealtimeError> {
        self.membership.write().await.expirations.remove(socket_id);
        Ok(())
    }

    async fn subscribe(&self, socket_id: &str, channel: &str) -> Result<(), RealtimeError> {
        let mut membership = self.membership.write().await;
        membership.purge_expired();
        membership
            .channels
            .entry(channel.to_owned())
            .or_default()
            .insert(socket_id.to_owned());
        membership
            .sockets
            .entry(socket_id.to_owned())
            .or_default()
            .insert(channel.to_owned());
        Ok(())
    }

    async fn unsubscribe(&self, socket_id: &str, channel: &str) -> Result<(), RealtimeError> {
        let mut membership = self.membership.write().await;
        if let Some(ids) = membership.channels.get_mut(channel) {
            ids.remove(socket_id);
            if ids.is_empty() {
                membership.channels.remove(channel);
            }
        }
        if let Some(channels) = membership.sockets.get_mut(socket_id) {
            channels.remove(channel);
        }
        Ok(())
    }

    async fn socket_ids(&self, channel: &str) -> Result<Vec<String>, RealtimeError> {
        let mut membership = self.membership.write().await;
        membership.purge_expired();
        Ok(membership
            .channels
            .get(channel)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, published: Published) -> Result<(), RealtimeError> {
        // Nobody listening is not an error.
        let _ = self.tx.send(published);
        Ok(())
    }

    async fn listen(&self) -> Result<mpsc::UnboundedReceiver<Published>, RealtimeError> {
        self.rx.lock().await.take().ok_or(RealtimeError::AlreadyListening)
    }

    async fn shutdown(&self) -> Result<(), RealtimeError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn membership_follows_subscribe_and_disconnect() {
        let adapter = MemoryChannelAdapter::new();
        adapter.connect("a").await.unwrap();
        adapter.connect("b").await.unwrap();
        adapter.subscribe("a", "posts").await.unwrap();
        adapter.subscribe("b", "posts").await.unwrap();
        adapter.subscribe("a", "comments").await.unwrap();

        assert_eq!(adapter.socket_ids("posts").await.unwrap(), ["a", "b"]);

        adapter.unsubscribe("b", "posts").await.unwrap();
        assert_eq!(adapter.socket_ids("posts").await.unwrap(), ["a"]);

        adapter.disconnect("a").await.unwrap();
        assert!(adapter.socket_ids("posts").await.unwrap().is_empty());
        assert!(adapter.socket_ids("comments").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn published_messages_reach_the_listener_once() {
        let adapter = MemoryChannelAdapter::new();
        let mut rx = adapter.listen().await.unwrap();
        assert!(matches!(adapter.listen().await, Err(RealtimeError::AlreadyListening)));

        adapter
            .publish(Published {
                channel: "posts".into(),
                message: "{}".into(),
                socket_id: None,
            })
            .await
            .unwrap();
        let published = rx.recv().await.unwrap();
        assert_eq!(published.channel, "posts");
    }

    #[tokio::test]
    async fn expiring_sockets_keep_channels_until_the_deadline() {
        let adapter = MemoryChannelAdapter::new();
        adapter.connect("a").await.unwrap();
        adapter.subscribe("a", "posts").await.unwrap();

        adapter.expire("a", Duration::from_secs(60)).await.unwrap();
        assert_eq!(adapter.socket_ids("posts").await.unwrap(), ["a"]);
        adapter.persist("a").await.unwrap();

        adapter.expire("a", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(adapter.socket_ids("posts").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_expiry_forgets_at_once() {
        let adapter = MemoryChannelAdapter::new();
        adapter.subscribe("a", "posts").await.unwrap();
        adapter.expire("a", Duration::ZERO).await.unwrap();
        assert!(adapter.socket_ids("posts").await.unwrap().is_empty());
    }
}
