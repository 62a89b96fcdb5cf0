//! Runs subscription deliveries.
//!
//! Deliveries for one subscription key always land on the same worker, so a
//! subscriber sees results in the order the mutations happened.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::subscription::SubscriptionKey;

/// A unit of delivery work.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Where deliveries run.
pub enum Executor {
    /// In the mutating task, before the command returns.
    Inline,
    /// On a fixed set of worker tasks.
    Sharded(Workers),
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline => f.write_str("Inline"),
            Self::Sharded(_) => f.write_str("Sharded"),
        }
    }
}

/// Worker tasks and their queues.
pub struct Workers {
    senders: Mutex<Vec<mpsc::UnboundedSender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// Spawn `workers` worker tasks. Zero workers means inline delivery.
    /// Must be called within a tokio runtime.
    pub fn sharded(workers: usize) -> Self {
        if workers == 0 {
            return Self::Inline;
        }

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            senders.push(tx);
            handles.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                }
                debug!(worker, "delivery worker stopped");
            }));
        }

        Self::Sharded(Workers {
            senders: Mutex::new(senders),
            handles: Mutex::new(handles),
        })
    }

    /// Run `job`, keyed by the subscription it delivers to.
    pub async fn submit(&self, key: &SubscriptionKey, job: Job) {
        match self {
            Self::Inline => job.await,
            Self::Sharded(workers) => {
                let senders = workers.senders.lock().await;
                let sender = shard(key, senders.len()).and_then(|index| senders.get(index));
                match sender {
                    Some(sender) => {
                        if sender.send(job).is_err() {
                            warn!(key = %key, "delivery worker is gone, dropping delivery");
                        }
                    }
                    None => debug!(key = %key, "executor shut down, dropping delivery"),
                }
            }
        }
    }

    /// Stop accepting work, let queued deliveries finish and join the
    /// workers. Calling it again has no effect.
    pub async fn shutdown(&self) {
        let Self::Sharded(workers) = self else {
            return;
        };

        workers.senders.lock().await.clear();
        let handles: Vec<JoinHandle<()>> = workers.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(error) = handle.await {
                warn!(error = %error, "delivery worker failed");
            }
        }
    }
}

fn shard(key: &SubscriptionKey, workers: usize) -> Option<usize> {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let workers = u64::try_from(workers).ok()?;
    hasher
        .finish()
        .checked_rem(workers)
        .and_then(|index| usize::try_from(index).ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn one_key_keeps_its_order() {
        let executor = Executor::sharded(4);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let key = SubscriptionKey::new("k");

        for i in 0..20 {
            let seen = Arc::clone(&seen);
            executor
                .submit(&key, Box::pin(async move { seen.lock().unwrap().push(i) }))
                .await;
        }
        executor.shutdown().await;
        executor.shutdown().await;

        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_dropped() {
        let executor = Executor::sharded(2);
        executor.shutdown().await;

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        executor
            .submit(
                &SubscriptionKey::new("k"),
                Box::pin(async move { flag.store(true, std::sync::atomic::Ordering::SeqCst) }),
            )
            .await;
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn zero_workers_is_inline() {
        assert!(matches!(Executor::sharded(0), Executor::Inline));
    }

    #[test]
    fn shard_is_stable_and_in_range() {
        let key = SubscriptionKey::new("abc");
        let first = shard(&key, 8).unwrap();
        assert!(first < 8);
        assert_eq!(shard(&key, 8), Some(first));
        assert_eq!(shard(&key, 0), None);
    }
}
