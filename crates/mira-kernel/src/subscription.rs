// Subscription records and the directory the pre-processor queries for
// topic routing.
use crate::topic;
use ahash::RandomState;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use hashbrown::HashMap;
use mira_common::ids::ChannelId;
use mira_common::message::{DIRECT_EXCHANGE_NAME, TOPIC_EXCHANGE_NAME};
use parking_lot::Mutex;
use slab::Slab;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("subscription directory unavailable: {0}")]
    Unavailable(String),
    #[error("subscription directory query timed out after {0:?}")]
    Timeout(Duration),
}

/// Storage queue for a non-durable topic subscriber on `node_id`.
pub fn node_topic_storage_queue(node_id: &str, destination: &str) -> String {
    format!("{node_id}:{destination}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub channel_id: ChannelId,
    // Topic pattern or queue name this subscription listens on.
    pub destination: String,
    // Queue a durable subscription collects into.
    pub target_queue: String,
    // Physical queue copies are persisted under. Routing dedups on this.
    pub storage_queue_name: String,
    pub is_bound_to_topic: bool,
    pub is_durable: bool,
    pub subscribed_node: String,
    pub exchange: String,
    pub is_active: bool,
}

impl Subscription {
    /// Non-durable topic subscriber; shares a per-node storage queue with
    /// every other non-durable subscriber of the same destination.
    pub fn non_durable_topic(
        channel_id: ChannelId,
        destination: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        let destination = destination.into();
        let node_id = node_id.into();
        Self {
            channel_id,
            storage_queue_name: node_topic_storage_queue(&node_id, &destination),
            target_queue: destination.clone(),
            destination,
            is_bound_to_topic: true,
            is_durable: false,
            subscribed_node: node_id,
            exchange: TOPIC_EXCHANGE_NAME.to_string(),
            is_active: true,
        }
    }

    /// Durable topic subscriber collecting into its own `target_queue`.
    pub fn durable_topic(
        channel_id: ChannelId,
        destination: impl Into<String>,
        target_queue: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        let target_queue = target_queue.into();
        Self {
            channel_id,
            destination: destination.into(),
            storage_queue_name: target_queue.clone(),
            target_queue,
            is_bound_to_topic: true,
            is_durable: true,
            subscribed_node: node_id.into(),
            exchange: TOPIC_EXCHANGE_NAME.to_string(),
            is_active: true,
        }
    }

    /// Point-to-point consumer of `queue`.
    pub fn queue(channel_id: ChannelId, queue: impl Into<String>, node_id: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            channel_id,
            destination: queue.clone(),
            target_queue: queue.clone(),
            storage_queue_name: queue,
            is_bound_to_topic: false,
            is_durable: true,
            subscribed_node: node_id.into(),
            exchange: DIRECT_EXCHANGE_NAME.to_string(),
            is_active: true,
        }
    }

    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            channel_id: self.channel_id,
            destination: self.destination.clone(),
            is_bound_to_topic: self.is_bound_to_topic,
        }
    }
}

/// Identity of a subscription in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub channel_id: ChannelId,
    pub destination: String,
    pub is_bound_to_topic: bool,
}

/// Where subscriptions live. Cluster-aware implementations sit behind this.
#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    /// Add or replace the subscription with the same key.
    async fn open_subscription(&self, subscription: Subscription) -> Result<(), DirectoryError>;

    /// Remove the subscription with the same key; `false` if none existed.
    async fn close_subscription(&self, subscription: &Subscription) -> Result<bool, DirectoryError>;

    /// Active topic-bound subscriptions matching `routing_key`, in a stable
    /// order. With `include_hierarchical` the subscription destination is
    /// treated as a wildcard pattern, otherwise names must be equal.
    async fn subscribers_for_destination(
        &self,
        routing_key: &str,
        include_hierarchical: bool,
    ) -> Result<Vec<Subscription>, DirectoryError>;

    async fn subscription_count(&self) -> usize;
}

#[derive(Debug, Default)]
struct SubscriptionRegistry {
    entries: Slab<Subscription>,
    index: HashMap<SubscriptionKey, usize, RandomState>,
}

/// Single-node directory.
///
/// ```
/// use mira_common::ids::ChannelId;
/// use mira_kernel::subscription::{
///     InMemorySubscriptionDirectory, Subscription, SubscriptionDirectory,
/// };
///
/// let directory = InMemorySubscriptionDirectory::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     directory
///         .open_subscription(Subscription::non_durable_topic(ChannelId::new(), "sports.*", "n1"))
///         .await
///         .expect("open");
///     let matches = directory
///         .subscribers_for_destination("sports.cricket", true)
///         .await
///         .expect("query");
///     assert_eq!(matches.len(), 1);
/// });
/// ```
#[derive(Debug)]
pub struct InMemorySubscriptionDirectory {
    // Routing reads this without taking the registry lock.
    snapshot: ArcSwap<Vec<Subscription>>,
    // Mutated only on open/close.
    registry: Mutex<SubscriptionRegistry>,
}

impl InMemorySubscriptionDirectory {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            registry: Mutex::new(SubscriptionRegistry::default()),
        }
    }

    #[inline]
    fn subscriptions(&self) -> Arc<Vec<Subscription>> {
        self.snapshot.load_full()
    }

    fn rebuild_snapshot(&self, registry: &SubscriptionRegistry) {
        let mut snapshot = Vec::with_capacity(registry.entries.len());
        for (_, subscription) in registry.entries.iter() {
            snapshot.push(subscription.clone());
        }
        self.snapshot.store(Arc::new(snapshot));
    }
}

impl Default for InMemorySubscriptionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionDirectory for InMemorySubscriptionDirectory {
    async fn open_subscription(&self, subscription: Subscription) -> Result<(), DirectoryError> {
        let mut registry = self.registry.lock();
        let key = subscription.key();
        match registry.index.get(&key).copied() {
            Some(slot) => registry.entries[slot] = subscription,
            None => {
                let slot = registry.entries.insert(subscription);
                registry.index.insert(key, slot);
            }
        }
        self.rebuild_snapshot(&registry);
        Ok(())
    }

    async fn close_subscription(&self, subscription: &Subscription) -> Result<bool, DirectoryError> {
        let mut registry = self.registry.lock();
        let Some(slot) = registry.index.remove(&subscription.key()) else {
            return Ok(false);
        };
        registry.entries.remove(slot);
        self.rebuild_snapshot(&registry);
        Ok(true)
    }

    async fn subscribers_for_destination(
        &self,
        routing_key: &str,
        include_hierarchical: bool,
    ) -> Result<Vec<Subscription>, DirectoryError> {
        let subscriptions = self.subscriptions();
        Ok(subscriptions
            .iter()
            .filter(|s| s.is_active && s.is_bound_to_topic)
            .filter(|s| {
                if include_hierarchical {
                    topic::matches(&s.destination, routing_key)
                } else {
                    s.destination == routing_key
                }
            })
            .cloned()
            .collect())
    }

    async fn subscription_count(&self) -> usize {
        self.subscriptions().len()
    }
}
