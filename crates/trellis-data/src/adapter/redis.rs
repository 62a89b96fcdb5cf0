//! Redis-backed subscriptions.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `{prefix}:subscription:{key}` | JSON | The subscription record |
//! | `{prefix}:subscriber:{id}` | Set | Keys owned by a subscriber |
//! | `{prefix}:source:{name}` | Set | Keys whose root or includes touch a source |
//! | `{prefix}:expiry:{id}` | Integer | Unix time the subscriber expires at |

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fred::prelude::*;
use tracing::{debug, info};

use super::SubscriberAdapter;
use crate::error::DataError;
use crate::subscription::{Subscription, SubscriptionKey};

/// Shares subscriptions between processes through Redis.
pub struct RedisSubscriberAdapter {
    client: Client,
    prefix: String,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisSubscriberAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSubscriberAdapter")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisSubscriberAdapter {
    /// Connect to Redis at `url`, namespacing every key under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::Config`] if the URL cannot be parsed.
    /// Returns [`DataError::Redis`] if the connection fails.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, DataError> {
        let config = Config::from_url(url)
            .map_err(|e| DataError::Config(format!("Invalid Redis URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        info!("Connected to Redis for data subscriptions");
        Ok(Self {
            client,
            prefix: prefix.into(),
            closed: AtomicBool::new(false),
        })
    }

    fn subscription_key(&self, key: &SubscriptionKey) -> String {
        subscription_key(&self.prefix, key)
    }

    fn subscriber_key(&self, subscriber: &str) -> String {
        subscriber_key(&self.prefix, subscriber)
    }

    fn source_key(&self, source: &str) -> String {
        source_key(&self.prefix, source)
    }

    fn expiry_key(&self, subscriber: &str) -> String {
        expiry_key(&self.prefix, subscriber)
    }

    async fn is_expired(&self, subscriber: &str) -> Result<bool, DataError> {
        let deadline: Option<String> = self.client.get(self.expiry_key(subscriber)).await?;
        Ok(deadline
            .and_then(|d| d.parse::<i64>().ok())
            .is_some_and(|d| d <= Utc::now().timestamp()))
    }
}

fn subscription_key(prefix: &str, key: &SubscriptionKey) -> String {
    format!("{prefix}:subscription:{key}")
}

fn subscriber_key(prefix: &str, subscriber: &str) -> String {
    format!("{prefix}:subscriber:{subscriber}")
}

fn source_key(prefix: &str, source: &str) -> String {
    format!("{prefix}:source:{source}")
}

fn expiry_key(prefix: &str, subscriber: &str) -> String {
    format!("{prefix}:expiry:{subscriber}")
}

#[async_trait]
impl SubscriberAdapter for RedisSubscriberAdapter {
    async fn register(
        &self,
        key: &SubscriptionKey,
        subscription: &Subscription,
    ) -> Result<(), DataError> {
        let json = serde_json::to_string(subscription)?;
        let _: () = self
            .client
            .set(self.subscription_key(key), json.as_str(), None, None, false)
            .await?;
        let _: u32 = self
            .client
            .sadd(self.subscriber_key(&subscription.subscriber), key.as_str())
            .await?;
        for source in subscription.sources() {
            let _: u32 = self.client.sadd(self.source_key(source), key.as_str()).await?;
        }
        self.persist(&subscription.subscriber).await
    }

    async fn subscription(&self, key: &SubscriptionKey) -> Result<Option<Subscription>, DataError> {
        let json: Option<String> = self.client.get(self.subscription_key(key)).await?;
        let Some(json) = json else {
            return Ok(None);
        };
        let subscription: Subscription = serde_json::from_str(&json)?;
        if self.is_expired(&subscription.subscriber).await? {
            self.remove_subscriber(&subscription.subscriber).await?;
            return Ok(None);
        }
        Ok(Some(subscription))
    }

    async fn subscriptions_for_source(
        &self,
        source: &str,
    ) -> Result<Vec<(SubscriptionKey, Subscription)>, DataError> {
        let index = self.source_key(source);
        let mut members: Vec<String> = self.client.smembers(index.as_str()).await?;
        members.sort();

        let mut expired: HashMap<String, bool> = HashMap::new();
        let mut found = Vec::with_capacity(members.len());
        for member in members {
            let key = SubscriptionKey::new(member);
            let json: Option<String> = self.client.get(self.subscription_key(&key)).await?;
            let Some(json) = json else {
                debug!(key = %key, source, "pruning stale subscription index entry");
                let _: u32 = self.client.srem(index.as_str(), key.as_str()).await?;
                continue;
            };
            let subscription: Subscription = serde_json::from_str(&json)?;

            let is_expired = match expired.get(&subscription.subscriber) {
                Some(flag) => *flag,
                None => {
                    let flag = self.is_expired(&subscription.subscriber).await?;
                    expired.insert(subscription.subscriber.clone(), flag);
                    if flag {
                        self.remove_subscriber(&subscription.subscriber).await?;
                    }
                    flag
                }
            };
            if !is_expired {
                found.push((key, subscription));
            }
        }
        Ok(found)
    }

    async fn remove_subscriber(&self, subscriber: &str) -> Result<(), DataError> {
        let owned = self.subscriber_key(subscriber);
        let keys: Vec<String> = self.client.smembers(owned.as_str()).await?;
        for key in keys {
            let key = SubscriptionKey::new(key);
            let record = self.subscription_key(&key);
            let json: Option<String> = self.client.get(record.as_str()).await?;
            if let Some(json) = json {
                let subscription: Subscription = serde_json::from_str(&json)?;
                for source in subscription.sources() {
                    let _: u32 = self.client.srem(self.source_key(source), key.as_str()).await?;
                }
            }
            let _: u32 = self.client.del(record.as_str()).await?;
        }
        let _: u32 = self.client.del(owned.as_str()).await?;
        let _: u32 = self.client.del(self.expiry_key(subscriber)).await?;
        Ok(())
    }

    async fn expire(&self, subscriber: &str, after: Duration) -> Result<(), DataError> {
        let seconds = i64::try_from(after.as_secs()).unwrap_or(i64::MAX);
        let deadline = Utc::now().timestamp().saturating_add(seconds);
        let _: () = self
            .client
            .set(self.expiry_key(subscriber), deadline.to_string().as_str(), None, None, false)
            .await?;
        Ok(())
    }

    async fn persist(&self, subscriber: &str) -> Result<(), DataError> {
        let _: u32 = self.client.del(self.expiry_key(subscriber)).await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DataError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client.quit().await?;
        info!("Disconnected data subscriptions from Redis");
        Ok(())
    }
}
