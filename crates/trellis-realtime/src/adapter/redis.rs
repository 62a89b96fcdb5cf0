//! Redis-backed channels.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `{prefix}:channel:{name}` | Set | Socket ids listening on a channel |
//! | `{prefix}:socket:{id}` | Set | Channels a socket listens on |
//! | `{prefix}:expiry:{id}` | Integer | Unix time a departed socket's channels expire at |
//! | `{prefix}:broadcast` | Pub/Sub | Every published message, as JSON |

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fred::interfaces::{EventInterface, PubsubInterface};
use fred::prelude::*;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ChannelAdapter, Published};
use crate::error::RealtimeError;

/// Channel state shared by every process through Redis.
pub struct RedisChannelAdapter {
    client: Client,
    subscriber: Client,
    prefix: String,
    listener: Mutex<Option<JoinHandle<()>>>,
    listening: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisChannelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisChannelAdapter")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisChannelAdapter {
    /// Connect to Redis at `url`, namespacing every key under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Config`] if the URL cannot be parsed.
    /// Returns [`RealtimeError::Redis`] if either connection fails.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, RealtimeError> {
        let config = Config::from_url(url)
            .map_err(|e| RealtimeError::Config(format!("Invalid Redis URL: {e}")))?;

        let client = Builder::from_config(config.clone()).build()?;
        client.init().await?;
        let subscriber = Builder::from_config(config).build()?;
        subscriber.init().await?;

        info!("Connected to Redis for realtime channels");
        Ok(Self {
            client,
            subscriber,
            prefix: prefix.into(),
            listener: Mutex::new(None),
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    async fn is_expired(&self, socket_id: &str) -> Result<bool, RealtimeError> {
        let deadline: Option<String> = self.client.get(expiry_key(&self.prefix, socket_id)).await?;
        Ok(deadline
            .and_then(|d| d.parse::<i64>().ok())
            .is_some_and(|d| d <= Utc::now().timestamp()))
    }
}

fn channel_key(prefix: &str, channel: &str) -> String {
    format!("{prefix}:channel:{channel}")
}

fn socket_key(prefix: &str, socket_id: &str) -> String {
    format!("{prefix}:socket:{socket_id}")
}

fn expiry_key(prefix: &str, socket_id: &str) -> String {
    format!("{prefix}:expiry:{socket_id}")
}

fn broadcast_channel(prefix: &str) -> String {
    format!("{prefix}:broadcast")
}

#[async_trait]
impl ChannelAdapter for RedisChannelAdapter {
    async fn connect(&self, socket_id: &str) -> Result<(), RealtimeError> {
        debug!(socket_id, "socket registered with Redis channels");
        Ok(())
    }

    async fn disconnect(&self, socket_id: &str) -> Result<(), RealtimeError> {
        let key = socket_key(&self.prefix, socket_id);
        let channels: Vec<String> = self.client.smembers(key.as_str()).await?;
        for channel in channels {
            let _: u32 = self
                .client
                .srem(channel_key(&self.prefix, &channel), socket_id)
                .await?;
        }
        let _: u32 = self.client.del(key.as_str()).await?;
        let _: u32 = self.client.del(expiry_key(&self.prefix, socket_id)).await?;
        Ok(())
    }

    async fn expire(&self, socket_id: &str, after: Duration) -> Result<(), RealtimeError> {
        if after.is_zero() {
            return self.disconnect(socket_id).await;
        }
        let seconds = i64::try_from(after.as_secs()).unwrap_or(i64::MAX);
        let deadline = Utc::now().timestamp().saturating_add(seconds);
        let _: () = self
            .client
            .set(expiry_key(&self.prefix, socket_id), deadline.to_string().as_str(), None, None, false)
            .await?;
        Ok(())
    }

    async fn persist(&self, socket_id: &str) -> Result<(), RealtimeError> {
        let _: u32 = self.client.del(expiry_key(&self.prefix, socket_id)).await?;
        Ok(())
    }

    async fn subscribe(&self, socket_id: &str, channel: &str) -> Result<(), RealtimeError> {
        let _: u32 = self
            .client
            .sadd(channel_key(&self.prefix, channel), socket_id)
            .await?;
        let _: u32 = self
            .client
            .sadd(socket_key(&self.prefix, socket_id), channel)
            .await?;
        Ok(())
    }

    async fn unsubscribe(&self, socket_id: &str, channel: &str) -> Result<(), RealtimeError> {
        let _: u32 = self
            .client
            .srem(channel_key(&self.prefix, channel), socket_id)
            .await?;
        let _: u32 = self
            .client
            .srem(socket_key(&self.prefix, socket_id), channel)
            .await?;
        Ok(())
    }

    async fn socket_ids(&self, channel: &str) -> Result<Vec<String>, RealtimeError> {
        let members: Vec<String> = self
            .client
            .smembers(channel_key(&self.prefix, channel))
            .await?;

        let mut ids = Vec::with_capacity(members.len());
        for id in members {
            if self.is_expired(&id).await? {
                debug!(socket_id = %id, "purging expired socket channels");
                self.disconnect(&id).await?;
            } else {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn publish(&self, published: Published) -> Result<(), RealtimeError> {
        let json = serde_json::to_string(&published)?;
        let _: i64 = self
            .client
            .publish(broadcast_channel(&self.prefix), json.as_str())
            .await?;
        Ok(())
    }

    async fn listen(&self) -> Result<mpsc::UnboundedReceiver<Published>, RealtimeError> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(RealtimeError::AlreadyListening);
        }

        let mut messages = self.subscriber.message_rx();
        self.subscriber.subscribe(broadcast_channel(&self.prefix)).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(message) => {
                        let Some(text) = message.value.as_string() else {
                            continue;
                        };
                        match serde_json::from_str::<Published>(&text) {
                            Ok(published) => {
                                if tx.send(published).is_err() {
                                    break;
                                }
                            }
                            Err(error) => warn!(error = %error, "ignoring malformed broadcast"),
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "realtime broadcast listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("realtime broadcast listener stopped");
        });
        *self.listener.lock().await = Some(handle);
        Ok(rx)
    }

    async fn shutdown(&self) -> Result<(), RealtimeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        self.subscriber.quit().await?;
        self.client.quit().await?;
        info!("Disconnected realtime channels from Redis");
        Ok(())
    }
}
