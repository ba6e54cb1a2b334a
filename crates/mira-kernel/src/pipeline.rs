// Two-stage event pipeline: ingress -> pre-processor -> writer -> store.
//
// Each stage is a task that exclusively owns its state, so ids are issued and
// batches are written in ingress order without any locking.
use crate::event::{EventKind, InboundEvent};
use crate::preprocess::MessagePreProcessor;
use crate::{KernelError, Result};
use mira_storage::MessageStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Publisher side of a running pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    ingress: mpsc::Sender<InboundEvent>,
    preprocessor_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl PipelineHandle {
    /// Enqueue an event, waiting for ingress capacity if the ring is full.
    pub async fn publish(&self, event: InboundEvent) -> Result<()> {
        self.ingress
            .send(event)
            .await
            .map_err(|_| KernelError::PipelineClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.ingress.is_closed()
    }

    /// Stop accepting events and wait until everything already accepted has
    /// been written.
    pub async fn shutdown(self) {
        drop(self.ingress);
        if let Err(err) = self.preprocessor_task.await {
            tracing::error!(error = %err, "pre-processor task failed");
        }
        if let Err(err) = self.writer_task.await {
            tracing::error!(error = %err, "writer task failed");
        }
    }
}

/// Start both stages. Must be called from within a tokio runtime.
pub fn spawn_pipeline(
    preprocessor: MessagePreProcessor,
    store: Arc<dyn MessageStore>,
    ingress_capacity: usize,
    writer_queue_depth: usize,
) -> PipelineHandle {
    let (ingress_tx, ingress_rx) = mpsc::channel(ingress_capacity);
    let (writer_tx, writer_rx) = mpsc::channel(writer_queue_depth);
    let preprocessor_task = tokio::spawn(run_preprocessor(preprocessor, ingress_rx, writer_tx));
    let writer_task = tokio::spawn(run_writer(store, writer_rx));
    PipelineHandle {
        ingress: ingress_tx,
        preprocessor_task,
        writer_task,
    }
}

async fn run_preprocessor(
    mut preprocessor: MessagePreProcessor,
    mut rx: mpsc::Receiver<InboundEvent>,
    writer: mpsc::Sender<InboundEvent>,
) {
    while let Some(mut event) = rx.recv().await {
        metrics::counter!("mira_pipeline_events_total", "kind" => event.kind().to_string())
            .increment(1);
        if let Err(err) = preprocessor.on_event(&mut event).await {
            // Continuing would risk reusing or reordering ids.
            tracing::error!(error = %err, "message id generation failed, stopping pipeline");
            event.fail(KernelError::Sequencer(err));
            rx.close();
            while let Ok(mut pending) = rx.try_recv() {
                pending.fail(KernelError::PipelineClosed);
            }
            break;
        }
        if let Err(mpsc::error::SendError(mut event)) = writer.send(event).await {
            tracing::warn!("writer stage closed, stopping pre-processor");
            event.fail(KernelError::PipelineClosed);
            break;
        }
    }
    tracing::debug!("pre-processor stopped");
}

async fn run_writer(store: Arc<dyn MessageStore>, mut rx: mpsc::Receiver<InboundEvent>) {
    while let Some(mut event) = rx.recv().await {
        let result = apply_event(store.as_ref(), &mut event).await;
        if let Err(err) = &result {
            metrics::counter!("mira_writer_store_failures_total").increment(1);
            tracing::error!(
                kind = %event.kind(),
                messages = event.messages().len(),
                error = %err,
                "failed to apply event to store"
            );
        }
        event.complete(result);
    }
    tracing::debug!("writer stopped");
}

async fn apply_event(store: &dyn MessageStore, event: &mut InboundEvent) -> Result<()> {
    match event.kind() {
        EventKind::Ignore => {
            metrics::counter!("mira_pipeline_ignored_total").increment(1);
            Ok(())
        }
        EventKind::Message => {
            drop_invalid(event);
            if event.messages().is_empty() {
                return Ok(());
            }
            store.store_messages(event.messages()).await?;
            Ok(())
        }
        EventKind::Ack => {
            store.acknowledge(event.acks()).await?;
            Ok(())
        }
        EventKind::DtxCommit => {
            let Some(xid) = event.xid() else {
                return Err(KernelError::InvalidEvent("dtx commit without xid"));
            };
            // A committed branch is applied whole or not at all.
            for message in event.messages() {
                message.validate()?;
            }
            store.commit_dtx(xid, event.messages(), event.acks()).await?;
            tracing::debug!(
                xid = %xid,
                enqueues = event.messages().len(),
                dequeues = event.acks().len(),
                "dtx branch applied"
            );
            Ok(())
        }
    }
}

fn drop_invalid(event: &mut InboundEvent) {
    event.messages_mut().retain(|message| match message.validate() {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(message_id = %message.id(), error = %err, "dropping malformed message");
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::{Sequencer, SequentialIdGenerator};
    use crate::subscription::InMemorySubscriptionDirectory;
    use bytes::Bytes;
    use mira_common::{Message, MessageId, MessageMetadata};
    use mira_storage::InMemoryMessageStore;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn pipeline(store: Arc<InMemoryMessageStore>, first_id: u64) -> PipelineHandle {
        let preprocessor = MessagePreProcessor::new(
            Sequencer::new(Box::new(SequentialIdGenerator::starting_at(first_id))),
            Arc::new(InMemorySubscriptionDirectory::new()),
            Duration::from_millis(100),
        );
        spawn_pipeline(preprocessor, store, 8, 8)
    }

    fn queue_message(queue: &str, payload: &'static [u8]) -> Message {
        Message::from_payload(MessageMetadata::queue(queue), Bytes::from_static(payload), 4)
    }

    #[tokio::test]
    async fn shutdown_drains_accepted_events() {
        let store = Arc::new(InMemoryMessageStore::new());
        let handle = pipeline(Arc::clone(&store), 1);
        for _ in 0..20 {
            handle
                .publish(InboundEvent::message(queue_message("orders", b"payload")))
                .await
                .expect("publish");
        }
        handle.shutdown().await;
        let ids: Vec<_> = store
            .queue_messages("orders")
            .await
            .iter()
            .map(Message::id)
            .collect();
        assert_eq!(ids, (1..=20).map(MessageId::new).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn completion_reports_store_failure() {
        let store = Arc::new(InMemoryMessageStore::new());
        store.set_healthy(false);
        let handle = pipeline(Arc::clone(&store), 1);
        let (tx, rx) = oneshot::channel();
        handle
            .publish(InboundEvent::message(queue_message("orders", b"x")).with_completion(tx))
            .await
            .expect("publish");
        let result = rx.await.expect("resolved");
        assert!(matches!(result, Err(KernelError::Storage(_))));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_ids_close_the_pipeline() {
        let store = Arc::new(InMemoryMessageStore::new());
        let handle = pipeline(Arc::clone(&store), u64::MAX);
        let (tx, rx) = oneshot::channel();
        handle
            .publish(InboundEvent::message(queue_message("orders", b"x")).with_completion(tx))
            .await
            .expect("publish");
        assert!(matches!(
            rx.await.expect("resolved"),
            Err(KernelError::Sequencer(_))
        ));

        let mut closed = false;
        for _ in 0..50 {
            if handle.is_closed() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(closed);
        let err = handle
            .publish(InboundEvent::message(queue_message("orders", b"y")))
            .await
            .expect_err("closed");
        assert!(matches!(err, KernelError::PipelineClosed));
        handle.shutdown().await;
        assert_eq!(store.total_messages().await, 0);
    }
}
