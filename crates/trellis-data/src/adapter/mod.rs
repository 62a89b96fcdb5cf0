//! Storage for subscriptions.
//!
//! The memory adapter keeps subscriptions in the process; the Redis adapter
//! shares them between every process pointed at the same Redis instance.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemorySubscriberAdapter;
pub use redis::RedisSubscriberAdapter;

use crate::error::DataError;
use crate::subscription::{Subscription, SubscriptionKey};

/// Where subscriptions live.
///
/// Subscriptions are indexed by their root source and by every source they
/// include. A subscriber scheduled to expire keeps its subscriptions until
/// the deadline passes; expired subscribers are purged lazily.
#[async_trait]
pub trait SubscriberAdapter: Send + Sync {
    /// Store `subscription` under `key` and cancel any pending expiry of its
    /// subscriber.
    async fn register(
        &self,
        key: &SubscriptionKey,
        subscription: &Subscription,
    ) -> Result<(), DataError>;

    /// The subscription stored under `key`.
    async fn subscription(&self, key: &SubscriptionKey) -> Result<Option<Subscription>, DataError>;

    /// Every live subscription whose root or included sources contain
    /// `source`.
    async fn subscriptions_for_source(
        &self,
        source: &str,
    ) -> Result<Vec<(SubscriptionKey, Subscription)>, DataError>;

    /// Live subscriptions rooted at `source` that applied `query`, or that
    /// applied no query at all when `query` is `None`.
    async fn subscriptions_for(
        &self,
        source: &str,
        query: Option<&str>,
    ) -> Result<Vec<(SubscriptionKey, Subscription)>, DataError> {
        Ok(self
            .subscriptions_for_source(source)
            .await?
            .into_iter()
            .filter(|(_, s)| {
                s.source == source
                    && query.map_or(s.queries.is_empty(), |name| {
                        s.queries.iter().any(|call| call.name == name)
                    })
            })
            .collect())
    }

    /// Remove every subscription of `subscriber`.
    async fn remove_subscriber(&self, subscriber: &str) -> Result<(), DataError>;

    /// Remove the subscriptions of `subscriber` once `after` has passed.
    async fn expire(&self, subscriber: &str, after: Duration) -> Result<(), DataError>;

    /// Cancel a pending expiry.
    async fn persist(&self, subscriber: &str) -> Result<(), DataError>;

    /// Release connections. Calling it more than once has no effect.
    async fn shutdown(&self) -> Result<(), DataError>;
}
