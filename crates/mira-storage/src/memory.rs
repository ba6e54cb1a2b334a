use crate::{MessageStore, PreparedRecords, Result, StorageError};
use async_trait::async_trait;
use mira_common::{AckData, Message, MessageId, Xid};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct StoreState {
    // Storage queue name -> messages ordered by id.
    queues: HashMap<String, BTreeMap<MessageId, Message>>,
    // Branches that reached prepare and have not been resolved yet.
    prepared: HashMap<Xid, PreparedRecords>,
}

impl StoreState {
    fn insert_all(&mut self, messages: &[Message]) {
        for message in messages {
            self.queues
                .entry(message.metadata().storage_queue_name.clone())
                .or_default()
                .insert(message.id(), message.clone());
        }
    }

    fn remove_all(&mut self, acks: &[AckData]) {
        for ack in acks {
            if let Some(queue) = self.queues.get_mut(&ack.storage_queue_name) {
                queue.remove(&ack.message_id);
            }
        }
    }
}

fn ensure_routed(messages: &[Message]) -> Result<()> {
    // Reject the whole batch before touching state so writes stay all-or-nothing.
    match messages
        .iter()
        .find(|message| message.metadata().storage_queue_name.is_empty())
    {
        Some(message) => Err(StorageError::Unrouted {
            message_id: message.id(),
        }),
        None => Ok(()),
    }
}

/// Volatile message store used by the broker service and tests.
///
/// ```
/// use bytes::Bytes;
/// use mira_common::{Message, MessageId, MessageMetadata};
/// use mira_storage::{InMemoryMessageStore, MessageStore};
///
/// let store = InMemoryMessageStore::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let mut msg = Message::from_payload(
///         MessageMetadata::queue("orders"),
///         Bytes::from_static(b"v"),
///         16,
///     );
///     msg.set_message_id(MessageId::new(1));
///     msg.metadata_mut().storage_queue_name = "orders".into();
///     store.store_messages(&[msg]).await.expect("store");
///     assert_eq!(store.queue_len("orders").await, 1);
/// });
/// ```
#[derive(Debug)]
pub struct InMemoryMessageStore {
    // One lock over queues and prepared records keeps commit atomic.
    inner: RwLock<StoreState>,
    healthy: AtomicBool,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip health; an unhealthy store rejects every write.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub async fn queue_messages(&self, queue: &str) -> Vec<Message> {
        self.inner
            .read()
            .await
            .queues
            .get(queue)
            .map(|messages| messages.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .read()
            .await
            .queues
            .get(queue)
            .map_or(0, BTreeMap::len)
    }

    pub async fn total_messages(&self) -> usize {
        self.inner.read().await.queues.values().map(BTreeMap::len).sum()
    }

    pub async fn prepared_records(&self, xid: &Xid) -> Option<PreparedRecords> {
        self.inner.read().await.prepared.get(xid).cloned()
    }

    fn check_available(&self) -> Result<()> {
        if self.healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(StorageError::Unavailable)
        }
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self {
            inner: RwLock::new(StoreState::default()),
            healthy: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn store_messages(&self, messages: &[Message]) -> Result<()> {
        self.check_available()?;
        ensure_routed(messages)?;
        self.inner.write().await.insert_all(messages);
        Ok(())
    }

    async fn acknowledge(&self, acks: &[AckData]) -> Result<()> {
        self.check_available()?;
        self.inner.write().await.remove_all(acks);
        Ok(())
    }

    async fn store_dtx_records(
        &self,
        xid: &Xid,
        enqueues: &[Message],
        dequeues: &[AckData],
    ) -> Result<()> {
        self.check_available()?;
        let mut guard = self.inner.write().await;
        if guard.prepared.contains_key(xid) {
            return Err(StorageError::DuplicateDtxRecords(xid.clone()));
        }
        guard.prepared.insert(
            xid.clone(),
            PreparedRecords {
                enqueues: enqueues.to_vec(),
                dequeues: dequeues.to_vec(),
            },
        );
        Ok(())
    }

    async fn commit_dtx(
        &self,
        xid: &Xid,
        enqueues: &[Message],
        dequeues: &[AckData],
    ) -> Result<()> {
        self.check_available()?;
        ensure_routed(enqueues)?;
        let mut guard = self.inner.write().await;
        guard.prepared.remove(xid);
        guard.insert_all(enqueues);
        guard.remove_all(dequeues);
        Ok(())
    }

    async fn rollback_dtx(&self, xid: &Xid) -> Result<()> {
        self.check_available()?;
        self.inner.write().await.prepared.remove(xid);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
