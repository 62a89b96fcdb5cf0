use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::SubscriberAdapter;
use crate::error::DataError;
use crate::subscription::{Subscription, SubscriptionKey};

#[derive(Debug, Default)]
struct State {
    subscriptions: HashMap<SubscriptionKey, Subscription>,
    by_subscriber: HashMap<String, HashSet<SubscriptionKey>>,
    by_source: HashMap<String, HashSet<SubscriptionKey>>,
    expirations: HashMap<String, Instant>,
}

impl State {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(subscriber, _)| subscriber.clone())
            .collect();
        for subscriber in expired {
            self.remove_subscriber(&subscriber);
        }
    }

    fn remove_subscriber(&mut self, subscriber: &str) {
        self.expirations.remove(subscriber);
        let Some(keys) = self.by_subscriber.remove(subscriber) else {
            return;
        };
        for key in keys {
            let Some(subscription) = self.subscriptions.remove(&key) else {
                continue;
            };
            for source in subscription.sources() {
                if let Some(keys) = self.by_source.get_mut(source) {
                    keys.remove(&key);
                    if keys.is_empty() {
                        self.by_source.remove(source);
                    }
                }
            }
        }
    }
}

/// Keeps subscriptions in process memory.
#[derive(Debug, Default)]
pub struct MemorySubscriberAdapter {
    state: Mutex<State>,
}

impl MemorySubscriberAdapter {
    /// An empty adapter.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriberAdapter for MemorySubscriberAdapter {
    async fn register(
        &self,
        key: &SubscriptionKey,
        subscription: &Subscription,
    ) -> Result<(), DataError> {
        let mut state = self.state.lock().await;
        state.purge_expired();

        for source in subscription.sources() {
            state
                .by_source
                .entry(source.to_owned())
                .or_default()
                .insert(key.clone());
        }
        state
            .by_subscriber
            .entry(subscription.subscriber.clone())
            .or_default()
            .insert(key.clone());
        state.expirations.remove(&subscription.subscriber);
        state.subscriptions.insert(key.clone(), subscription.clone());
        Ok(())
    }

    async fn subscription(&self, key: &SubscriptionKey) -> Result<Option<Subscription>, DataError> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        Ok(state.subscriptions.get(key).cloned())
    }

    async fn subscriptions_for_source(
        &self,
        source: &str,
    ) -> Result<Vec<(SubscriptionKey, Subscription)>, DataError> {
        let mut state = self.state.lock().await;
        state.purge_expired();

        let Some(keys) = state.by_source.get(source) else {
            return Ok(Vec::new());
        };
        let mut found: Vec<(SubscriptionKey, Subscription)> = keys
            .iter()
            .filter_map(|key| {
                state
                    .subscriptions
                    .get(key)
                    .map(|subscription| (key.clone(), subscription.clone()))
            })
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    async fn remove_subscriber(&self, subscriber: &str) -> Result<(), DataError> {
        self.state.lock().await.remove_subscriber(subscriber);
        Ok(())
    }

    async fn expire(&self, subscriber: &str, after: Duration) -> Result<(), DataError> {
        let mut state = self.state.lock().await;
        if let Some(deadline) = Instant::now().checked_add(after) {
            state.expirations.insert(subscriber.to_owned(), deadline);
        }
        Ok(())
    }

    async fn persist(&self, subscriber: &str) -> Result<(), DataError> {
        self.state.lock().await.expirations.remove(subscriber);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DataError> {
        Ok(())
    }
}
