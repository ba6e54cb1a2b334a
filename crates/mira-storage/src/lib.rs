// Storage collaborator contract for the kernel plus an in-memory backend.
use async_trait::async_trait;
use mira_common::{AckData, Message, MessageId, Xid};

pub mod memory;

pub use memory::InMemoryMessageStore;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("store unavailable")]
    Unavailable,
    #[error("message {message_id} has no storage queue")]
    Unrouted { message_id: MessageId },
    #[error("dtx records already stored for {0}")]
    DuplicateDtxRecords(Xid),
}

/// Records a transaction branch wrote at prepare time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedRecords {
    pub enqueues: Vec<Message>,
    pub dequeues: Vec<AckData>,
}

/// What the kernel needs from a durable message store.
///
/// Every method that takes a slice applies it as one unit: either all of
/// it is visible afterwards or none of it is.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist routed messages under their storage queue names.
    async fn store_messages(&self, messages: &[Message]) -> Result<()>;

    /// Drop acknowledged messages from their storage queues.
    async fn acknowledge(&self, acks: &[AckData]) -> Result<()>;

    /// Durably record a prepared branch so it survives until commit or rollback.
    async fn store_dtx_records(
        &self,
        xid: &Xid,
        enqueues: &[Message],
        dequeues: &[AckData],
    ) -> Result<()>;

    /// Apply a committed branch: store the routed enqueues, remove the
    /// dequeued messages and forget the prepared record, atomically.
    async fn commit_dtx(&self, xid: &Xid, enqueues: &[Message], dequeues: &[AckData])
    -> Result<()>;

    /// Discard a prepared record without applying it.
    async fn rollback_dtx(&self, xid: &Xid) -> Result<()>;

    async fn is_healthy(&self) -> bool;

    fn backend_name(&self) -> &'static str;
}
