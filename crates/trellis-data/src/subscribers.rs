//! The subscription engine.
//!
//! [`Subscribers`] stores subscriptions through a [`SubscriberAdapter`],
//! decides which of them a [`Mutation`] affects, re-runs their queries and
//! hands the fresh results to the named [`SubscriptionHandler`] on the
//! [`Executor`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use trellis_core::config::{AdapterKind, SubscriptionsConfig};
use trellis_core::value::Values;

use crate::adapter::{MemorySubscriberAdapter, RedisSubscriberAdapter, SubscriberAdapter};
use crate::command::Mutation;
use crate::container::Container;
use crate::error::{DataError, LookupError};
use crate::executor::Executor;
use crate::qualification;
use crate::subscription::{Subscription, SubscriptionKey};

/// Fresh results for one subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The subscription's key.
    pub key: SubscriptionKey,
    /// The subscription.
    pub subscription: Subscription,
    /// The re-run query results.
    pub result: Vec<Values>,
}

/// Receives deliveries for subscriptions naming it.
#[async_trait]
pub trait SubscriptionHandler: Send + Sync {
    /// Handle one delivery.
    async fn call(&self, delivery: Delivery) -> anyhow::Result<()>;
}

/// Handlers by name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn SubscriptionHandler>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("HandlerRegistry")
            .field("handlers", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    /// Register `handler` under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn SubscriptionHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), handler);
    }

    /// The handler registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn SubscriptionHandler>, LookupError> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| LookupError::Handler(name.to_owned()))
    }
}

/// The subscription engine shared by every container of an environment.
pub struct Subscribers {
    adapter: Arc<dyn SubscriberAdapter>,
    handlers: HandlerRegistry,
    executor: Executor,
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("handlers", &self.handlers)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl Subscribers {
    /// An engine over `adapter`, delivering on `executor`.
    pub fn new(adapter: Arc<dyn SubscriberAdapter>, executor: Executor) -> Self {
        Self {
            adapter,
            handlers: HandlerRegistry::default(),
            executor,
        }
    }

    /// An in-memory engine delivering inline.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemorySubscriberAdapter::new()), Executor::Inline)
    }

    /// Build the engine described by `config`. Must be called within a
    /// tokio runtime.
    pub async fn from_config(config: &SubscriptionsConfig) -> Result<Self, DataError> {
        let adapter: Arc<dyn SubscriberAdapter> = match config.adapter {
            AdapterKind::Memory => Arc::new(MemorySubscriberAdapter::new()),
            AdapterKind::Redis => Arc::new(
                RedisSubscriberAdapter::connect(
                    &config.adapter_settings.redis_url,
                    config.adapter_settings.redis_prefix.clone(),
                )
                .await?,
            ),
        };
        info!(adapter = ?config.adapter, workers = config.workers, "data subscriptions ready");
        Ok(Self::new(adapter, Executor::sharded(config.workers)))
    }

    /// The storage adapter.
    pub fn adapter(&self) -> &Arc<dyn SubscriberAdapter> {
        &self.adapter
    }

    /// Register `handler` under `name`.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn SubscriptionHandler>) {
        self.handlers.register(name, handler);
    }

    /// Store `subscription`. Subscribing the same thing twice yields the
    /// same key and one stored subscription.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<SubscriptionKey, DataError> {
        self.handlers.get(&subscription.handler)?;
        let key = subscription.key()?;
        self.adapter.register(&key, &subscription).await?;
        debug!(
            key = %key,
            subscriber = %subscription.subscriber,
            source = %subscription.source,
            "subscribed"
        );
        Ok(key)
    }

    /// Remove every subscription of `subscriber`.
    pub async fn unsubscribe(&self, subscriber: &str) -> Result<(), DataError> {
        self.adapter.remove_subscriber(subscriber).await
    }

    /// Remove the subscriptions of `subscriber` once `after` has passed.
    pub async fn expire(&self, subscriber: &str, after: Duration) -> Result<(), DataError> {
        self.adapter.expire(subscriber, after).await
    }

    /// Cancel a pending expiry of `subscriber`.
    pub async fn persist(&self, subscriber: &str) -> Result<(), DataError> {
        self.adapter.persist(subscriber).await
    }

    /// Deliver fresh results to every subscription `mutation` may affect.
    pub async fn did_mutate(&self, container: &Container, mutation: &Mutation) -> Result<(), DataError> {
        let candidates = self.adapter.subscriptions_for_source(&mutation.source).await?;
        if candidates.is_empty() {
            return Ok(());
        }

        let affected: Vec<(SubscriptionKey, Subscription)> = {
            let tables = container.store().read().await;
            candidates
                .into_iter()
                .filter(|(key, subscription)| {
                    if !container.contains(&subscription.source) {
                        return false;
                    }
                    qualification::affects(container, &tables, subscription, mutation)
                        .unwrap_or_else(|error| {
                            warn!(key = %key, error = %error, "cannot qualify subscription");
                            false
                        })
                })
                .collect()
        };

        debug!(
            source = %mutation.source,
            kind = ?mutation.kind,
            affected = affected.len(),
            "mutation qualified"
        );

        for (key, subscription) in affected {
            let handler = match self.handlers.get(&subscription.handler) {
                Ok(handler) => handler,
                Err(error) => {
                    warn!(key = %key, error = %error, "skipping delivery");
                    continue;
                }
            };
            let job_key = key.clone();
            let container = container.clone();
            self.executor
                .submit(
                    &job_key,
                    Box::pin(deliver(container, handler, key, subscription)),
                )
                .await;
        }
        Ok(())
    }

    /// Stop delivering and release the adapter. Calling it again has no
    /// effect.
    pub async fn shutdown(&self) -> Result<(), DataError> {
        self.executor.shutdown().await;
        self.adapter.shutdown().await
    }
}

async fn deliver(
    container: Container,
    handler: Arc<dyn SubscriptionHandler>,
    key: SubscriptionKey,
    subscription: Subscription,
) {
    let result = match container.resolve(&subscription) {
        Ok(proxy) => proxy.to_a().await,
        Err(error) => Err(error),
    };
    let result = match result {
        Ok(result) => result,
        Err(error) => {
            warn!(key = %key, error = %error, "cannot re-run subscribed query");
            return;
        }
    };

    let delivery = Delivery {
        key,
        subscription,
        result,
    };
    let key = delivery.key.clone();
    if let Err(error) = handler.call(delivery).await {
        warn!(key = %key, error = %format!("{error:#}"), "subscription handler failed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::sync::Mutex;
    use trellis_core::value::{FieldType, Value};
    use trellis_core::values;

    use super::*;
    use crate::definition::SourceDefinition;

    #[derive(Default)]
    struct Recorder {
        deliveries: Mutex<Vec<Delivery>>,
    }

    #[async_trait]
    impl SubscriptionHandler for Recorder {
        async fn call(&self, delivery: Delivery) -> anyhow::Result<()> {
            self.deliveries.lock().await.push(delivery);
            Ok(())
        }
    }

    fn setup() -> (Container, Arc<Recorder>) {
        let subscribers = Arc::new(Subscribers::memory());
        let recorder = Arc::new(Recorder::default());
        subscribers.register_handler("test", recorder.clone());

        let posts = SourceDefinition::new("posts")
            .primary_id()
            .attribute("title", FieldType::String)
            .attribute("author", FieldType::String)
            .has_many("comments");
        let comments = SourceDefinition::new("comments")
            .primary_id()
            .attribute("body", FieldType::String);
        let container = Container::new([posts, comments], subscribers).unwrap();
        (container, recorder)
    }

    #[tokio::test]
    async fn updates_notify_only_matching_subscriptions() {
        let (container, recorder) = setup();
        let posts = container.source("posts").unwrap();
        posts.create(values! { "title" => "one" }).await.unwrap();
        posts.create(values! { "title" => "two" }).await.unwrap();

        let by_one = posts.clone().query("by_id", vec![Value::from(1)]).unwrap();
        by_one.subscribe("s1", "test", Value::from("post:1")).await.unwrap();

        posts
            .clone()
            .query("by_id", vec![Value::from(2)])
            .unwrap()
            .update(values! { "title" => "changed" })
            .await
            .unwrap();
        assert!(recorder.deliveries.lock().await.is_empty());

        by_one.update(values! { "title" => "changed" }).await.unwrap();
        let deliveries = recorder.deliveries.lock().await;
        assert_eq!(deliveries.len(), 1);
        let delivery = deliveries.first().unwrap();
        assert_eq!(delivery.subscription.payload, Value::from("post:1"));
        assert_eq!(
            delivery.result.first().and_then(|row| row.get("title")),
            Some(&Value::from("changed"))
        );
    }

    #[tokio::test]
    async fn chained_queries_qualify_and_rerun_together() {
        let (container, recorder) = setup();
        let posts = container.source("posts").unwrap();
        posts.create(values! { "title" => "a", "author" => "x" }).await.unwrap();

        let key = posts
            .clone()
            .query("by_author", vec![Value::from("x")])
            .unwrap()
            .query("by_title", vec![Value::from("a")])
            .unwrap()
            .subscribe("s1", "test", Value::Null)
            .await
            .unwrap();
        let stored = container.subscribers().adapter().subscription(&key).await.unwrap().unwrap();
        let names: Vec<&str> = stored.queries.iter().map(|call| call.name.as_str()).collect();
        assert_eq!(names, ["by_author", "by_title"]);

        posts.create(values! { "title" => "a", "author" => "y" }).await.unwrap();
        assert!(recorder.deliveries.lock().await.is_empty());

        posts.create(values! { "title" => "a", "author" => "x" }).await.unwrap();
        let deliveries = recorder.deliveries.lock().await;
        assert_eq!(deliveries.len(), 1);
        let authors: Vec<Option<&Value>> = deliveries
            .first()
            .unwrap()
            .result
            .iter()
            .map(|row| row.get("author"))
            .collect();
        assert_eq!(authors, [Some(&Value::from("x")), Some(&Value::from("x"))]);
    }

    #[tokio::test]
    async fn association_changes_reach_the_parent_subscription() {
        let (container, recorder) = setup();
        let posts = container.source("posts").unwrap();
        posts.create(values! { "title" => "one" }).await.unwrap();
        posts.create(values! { "title" => "two" }).await.unwrap();
        posts
            .clone()
            .query("by_id", vec![Value::from(1)])
            .unwrap()
            .including("comments")
            .unwrap()
            .subscribe("s1", "test", Value::Null)
            .await
            .unwrap();

        let comments = container.source("comments").unwrap();
        comments.create(values! { "body" => "elsewhere", "post_id" => 2 }).await.unwrap();
        assert!(recorder.deliveries.lock().await.is_empty());

        comments.create(values! { "body" => "here", "post_id" => 1 }).await.unwrap();
        let deliveries = recorder.deliveries.lock().await;
        assert_eq!(deliveries.len(), 1);
        let included = deliveries
            .first()
            .and_then(|d| d.result.first())
            .and_then(|row| row.get("comments"))
            .and_then(Value::as_list)
            .map(<[Value]>::len);
        assert_eq!(included, Some(1));
    }

    #[tokio::test]
    async fn resubscribing_is_idempotent() {
        let (container, recorder) = setup();
        let posts = container.source("posts").unwrap();
        let first = posts.subscribe("s1", "test", Value::Null).await.unwrap();
        let second = posts.subscribe("s1", "test", Value::Null).await.unwrap();
        assert_eq!(first, second);

        posts.create(values! { "title" => "one" }).await.unwrap();
        assert_eq!(recorder.deliveries.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_handler_is_rejected_at_subscribe_time() {
        let (container, _) = setup();
        let err = container
            .source("posts")
            .unwrap()
            .subscribe("s1", "missing", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Lookup(LookupError::Handler(_))));
    }

    #[tokio::test]
    async fn unsubscribed_subscribers_hear_nothing() {
        let (container, recorder) = setup();
        let posts = container.source("posts").unwrap();
        posts.subscribe("s1", "test", Value::Null).await.unwrap();
        container.subscribers().unsubscribe("s1").await.unwrap();

        posts.create(values! { "title" => "one" }).await.unwrap();
        assert!(recorder.deliveries.lock().await.is_empty());
    }
}
