//! Channel membership and message fan-out.
//!
//! An adapter knows which sockets listen on which channel and moves
//! published messages to the process that owns the socket. The memory
//! adapter serves one process; the Redis adapter shares membership and
//! fans every message out to all processes through pub/sub.
//!
//! A departed socket keeps its channels until its expiry passes, so a client
//! that reconnects under the same id in time still hears what it listened
//! to. Expired sockets are purged lazily.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::MemoryChannelAdapter;
pub use redis::RedisChannelAdapter;

use crate::error::RealtimeError;

/// A message published on a channel, as seen by the listening process.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Published {
    /// The channel.
    pub channel: String,
    /// The encoded frame.
    pub message: String,
    /// Only this socket receives the message, if it listens on `channel`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<String>,
}

/// Channel state shared by the realtime server.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Record that `socket_id` is connected.
    async fn connect(&self, socket_id: &str) -> Result<(), RealtimeError>;

    /// Forget `socket_id` and every channel it listened on, now.
    async fn disconnect(&self, socket_id: &str) -> Result<(), RealtimeError>;

    /// Forget `socket_id` and its channels once `after` has passed.
    async fn expire(&self, socket_id: &str, after: Duration) -> Result<(), RealtimeError>;

    /// Cancel a pending expiry of `socket_id`.
    async fn persist(&self, socket_id: &str) -> Result<(), RealtimeError>;

    /// Add `socket_id` to `channel`.
    async fn subscribe(&self, socket_id: &str, channel: &str) -> Result<(), RealtimeError>;

    /// Remove `socket_id` from `channel`.
    async fn unsubscribe(&self, socket_id: &str, channel: &str) -> Result<(), RealtimeError>;

    /// Sockets listening on `channel`, across every process.
    async fn socket_ids(&self, channel: &str) -> Result<Vec<String>, RealtimeError>;

    /// Hand `published` to every process.
    async fn publish(&self, published: Published) -> Result<(), RealtimeError>;

    /// The stream of messages published to this process. Can be taken once.
    async fn listen(&self) -> Result<mpsc::UnboundedReceiver<Published>, RealtimeError>;

    /// Release connections. Calling it more than once has no effect.
    async fn shutdown(&self) -> Result<(), RealtimeError>;
}
