// Message kernel: ordered identity assignment, topic fan-out and distributed
// transaction coordination in front of a message store.
use mira_common::ids::ChannelId;
use mira_common::{AckData, KernelConfig, Message, MessageId, Xid};
use mira_storage::{InMemoryMessageStore, MessageStore, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

pub mod bridge;
pub mod cluster;
pub mod dtx;
pub mod event;
pub mod pipeline;
pub mod preprocess;
pub mod sequencer;
pub mod subscription;
pub mod topic;

use cluster::{ClusterIdentity, ClusterManagementInformation, StaticClusterIdentity};
use dtx::{DtxBranch, DtxError, DtxRegistry};
use event::InboundEvent;
use pipeline::PipelineHandle;
use preprocess::MessagePreProcessor;
use sequencer::{ClockIdGenerator, MessageIdGenerator, Sequencer, SequencerError};
use subscription::{
    DirectoryError, InMemorySubscriptionDirectory, Subscription, SubscriptionDirectory,
};

pub type Result<T> = std::result::Result<T, KernelError>;

#[derive(thiserror::Error, Debug)]
pub enum KernelError {
    #[error("message pipeline closed")]
    PipelineClosed,
    #[error(transparent)]
    Common(#[from] mira_common::Error),
    #[error("message id generation failed: {0}")]
    Sequencer(#[from] SequencerError),
    #[error("routing failed for {routing_key}: {source}")]
    Routing {
        routing_key: String,
        #[source]
        source: DirectoryError,
    },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Dtx(#[from] DtxError),
    #[error("invalid event: {0}")]
    InvalidEvent(&'static str),
}

/// Entry point for protocol bridges and the management layer.
///
/// ```
/// use bytes::Bytes;
/// use mira_common::{KernelConfig, Message, MessageMetadata};
/// use mira_kernel::Kernel;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let kernel = Kernel::start_in_memory(KernelConfig::new("node-a")).expect("kernel");
///     let message = Message::from_payload(
///         MessageMetadata::queue("orders"),
///         Bytes::from_static(b"order #1"),
///         1024,
///     );
///     kernel.submit_message_event(message).await.expect("submit");
///     kernel.shutdown().await;
/// });
/// ```
pub struct Kernel {
    config: KernelConfig,
    pipeline: PipelineHandle,
    directory: Arc<dyn SubscriptionDirectory>,
    dtx: DtxRegistry,
    store: Arc<dyn MessageStore>,
    cluster: Arc<dyn ClusterIdentity>,
}

impl Kernel {
    /// Wire the pipeline and registry around the given collaborators.
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: KernelConfig,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn SubscriptionDirectory>,
        cluster: Arc<dyn ClusterIdentity>,
        id_generator: Box<dyn MessageIdGenerator>,
    ) -> Result<Self> {
        config.validate()?;
        let preprocessor = MessagePreProcessor::new(
            Sequencer::new(id_generator),
            Arc::clone(&directory),
            Duration::from_millis(config.directory_query_timeout_ms),
        );
        let pipeline = pipeline::spawn_pipeline(
            preprocessor,
            Arc::clone(&store),
            config.ingress_capacity,
            config.writer_queue_depth,
        );
        let dtx = DtxRegistry::new(
            Arc::clone(&store),
            Duration::from_millis(config.dtx_timeout_ms),
        );
        tracing::info!(
            node_id = %cluster.my_node_id(),
            clustering = cluster.is_clustering_enabled(),
            store = store.backend_name(),
            "message kernel started"
        );
        Ok(Self {
            config,
            pipeline,
            directory,
            dtx,
            store,
            cluster,
        })
    }

    /// Single node with in-memory store and directory.
    pub fn start_in_memory(config: KernelConfig) -> Result<Self> {
        let cluster = Arc::new(StaticClusterIdentity::from_config(&config));
        let id_generator = Box::new(ClockIdGenerator::new(config.node_slot));
        Self::start(
            config,
            Arc::new(InMemoryMessageStore::new()),
            Arc::new(InMemorySubscriptionDirectory::new()),
            cluster,
            id_generator,
        )
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        self.cluster.my_node_id()
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<dyn SubscriptionDirectory> {
        &self.directory
    }

    pub fn dtx_registry(&self) -> &DtxRegistry {
        &self.dtx
    }

    /// Hand a newly published message to the pipeline. Returns once the
    /// event is queued; identity and routing happen in submission order.
    pub async fn submit_message_event(&self, message: Message) -> Result<()> {
        message.validate()?;
        self.pipeline.publish(InboundEvent::message(message)).await
    }

    /// Like [`Kernel::submit_message_event`] but waits until the writer has
    /// stored (or dropped) every routed copy.
    pub async fn submit_message_event_and_wait(&self, message: Message) -> Result<()> {
        message.validate()?;
        let (tx, rx) = oneshot::channel();
        self.pipeline
            .publish(InboundEvent::message(message).with_completion(tx))
            .await?;
        rx.await.map_err(|_| KernelError::PipelineClosed)?
    }

    pub async fn acknowledge(&self, ack: AckData) -> Result<()> {
        self.pipeline.publish(InboundEvent::ack(vec![ack])).await
    }

    pub async fn open_subscription(&self, subscription: Subscription) -> Result<()> {
        tracing::debug!(
            channel_id = %subscription.channel_id,
            destination = %subscription.destination,
            storage_queue = %subscription.storage_queue_name,
            durable = subscription.is_durable,
            "opening subscription"
        );
        self.directory.open_subscription(subscription).await?;
        Ok(())
    }

    pub async fn close_subscription(&self, subscription: &Subscription) -> Result<bool> {
        Ok(self.directory.close_subscription(subscription).await?)
    }

    /// Create a branch for `xid` with the configured default timeout.
    /// `false` if one already exists.
    pub async fn register_dtx_branch(&self, xid: Xid) -> bool {
        self.dtx.create_branch(xid).await.is_some()
    }

    pub async fn lookup_dtx_branch(&self, xid: &Xid) -> Option<Arc<DtxBranch>> {
        self.dtx.get_branch(xid).await
    }

    pub async fn prepare_dtx_branch(&self, xid: &Xid) -> Result<()> {
        Ok(self.dtx.prepare(xid).await?)
    }

    /// Commit and wait until the branch's work is applied to the store.
    ///
    /// If routing or the store fails, the branch stays registered in its
    /// previous state and can be committed again or rolled back.
    pub async fn commit_dtx_branch(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        self.dtx
            .commit(xid, one_phase, |records| async move {
                let (tx, rx) = oneshot::channel();
                self.pipeline
                    .publish(InboundEvent::dtx_commit(
                        xid.clone(),
                        records.enqueues,
                        records.dequeues,
                        tx,
                    ))
                    .await?;
                rx.await.map_err(|_| KernelError::PipelineClosed)?
            })
            .await
    }

    pub async fn rollback_dtx_branch(&self, xid: &Xid) -> Result<()> {
        Ok(self.dtx.rollback(xid).await?)
    }

    pub async fn forget_dtx_branch(&self, xid: &Xid) -> Result<()> {
        Ok(self.dtx.forget(xid).await?)
    }

    /// Buffer a publish under `xid`; it is routed only when the branch commits.
    pub async fn dtx_enqueue(&self, xid: &Xid, message: Message) -> Result<()> {
        message.validate()?;
        let branch = self.require_branch(xid).await?;
        branch.store_records(vec![message], Vec::new()).await?;
        Ok(())
    }

    /// Buffer an acknowledgement under `xid`.
    pub async fn dtx_acknowledge(&self, xid: &Xid, ack: AckData) -> Result<()> {
        let branch = self.require_branch(xid).await?;
        branch.store_records(Vec::new(), vec![ack]).await?;
        Ok(())
    }

    pub async fn sweep_expired_dtx_branches(&self) -> usize {
        self.dtx.sweep_expired().await
    }

    pub async fn cluster_information(&self) -> ClusterManagementInformation {
        ClusterManagementInformation::collect(self.cluster.as_ref(), self.store.as_ref()).await
    }

    pub fn is_running(&self) -> bool {
        !self.pipeline.is_closed()
    }

    /// Stop accepting events and drain the pipeline.
    pub async fn shutdown(self) {
        tracing::info!(node_id = %self.cluster.my_node_id(), "message kernel shutting down");
        self.pipeline.shutdown().await;
    }

    async fn require_branch(&self, xid: &Xid) -> Result<Arc<DtxBranch>> {
        self.dtx
            .get_branch(xid)
            .await
            .ok_or_else(|| KernelError::Dtx(DtxError::UnknownBranch(xid.clone())))
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("node_id", &self.cluster.my_node_id())
            .field("store", &self.store.backend_name())
            .field("dtx", &self.dtx)
            .finish()
    }
}

/// Acknowledgement for a routed copy held by `channel_id`.
pub fn ack_for(message: &Message, channel_id: ChannelId) -> AckData {
    let metadata = message.metadata();
    AckData {
        channel_id,
        message_id: message.id(),
        destination: metadata.destination.clone(),
        storage_queue_name: metadata.storage_queue_name.clone(),
        is_topic: metadata.is_topic,
    }
}

/// Shorthand used by bridges that only carry the id and queue.
pub fn ack_by_id(
    channel_id: ChannelId,
    message_id: MessageId,
    destination: impl Into<String>,
    storage_queue_name: impl Into<String>,
    is_topic: bool,
) -> AckData {
    AckData {
        channel_id,
        message_id,
        destination: destination.into(),
        storage_queue_name: storage_queue_name.into(),
        is_topic,
    }
}
