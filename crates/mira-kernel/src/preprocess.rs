// First pipeline stage: stamp identity on inbound messages and expand topic
// messages into one copy per distinct storage queue.
use crate::event::{EventKind, InboundEvent};
use crate::sequencer::{Sequencer, SequencerError};
use crate::subscription::{DirectoryError, Subscription, SubscriptionDirectory};
use crate::KernelError;
use ahash::RandomState;
use hashbrown::HashSet;
use mira_common::Message;
use mira_common::message::DIRECT_EXCHANGE_NAME;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("routing lookup for {routing_key} failed: {source}")]
    Directory {
        routing_key: String,
        #[source]
        source: DirectoryError,
    },
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
}

/// Owns the [`Sequencer`], so exactly one task may drive it.
pub struct MessagePreProcessor {
    sequencer: Sequencer,
    directory: Arc<dyn SubscriptionDirectory>,
    query_timeout: Duration,
}

impl MessagePreProcessor {
    pub fn new(
        sequencer: Sequencer,
        directory: Arc<dyn SubscriptionDirectory>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            sequencer,
            directory,
            query_timeout,
        }
    }

    /// Prepare one event for the writer.
    ///
    /// Only id generation failures escape; the pipeline treats them as fatal.
    /// Routing failures turn the event into a no-op and report the error to
    /// whoever waits on it.
    pub async fn on_event(&mut self, event: &mut InboundEvent) -> Result<(), SequencerError> {
        match event.kind() {
            EventKind::Message => self.pre_process_message(event).await,
            EventKind::DtxCommit => self.pre_process_dtx_commit(event).await,
            EventKind::Ack | EventKind::Ignore => Ok(()),
        }
    }

    async fn pre_process_message(&mut self, event: &mut InboundEvent) -> Result<(), SequencerError> {
        let message = match <[Message; 1]>::try_from(event.take_messages()) {
            Ok([message]) => message,
            Err(messages) => {
                tracing::error!(
                    count = messages.len(),
                    "message event must carry exactly one message"
                );
                event.mark_ignored();
                return Ok(());
            }
        };
        match self.route(message).await {
            Ok(routed) if routed.is_empty() => {
                metrics::counter!("mira_pipeline_ignored_total").increment(1);
                event.mark_ignored();
                Ok(())
            }
            Ok(routed) => {
                event.replace_messages(routed);
                Ok(())
            }
            Err(RoutingError::Directory {
                routing_key,
                source,
            }) => {
                metrics::counter!("mira_routing_failures_total").increment(1);
                tracing::error!(
                    routing_key = %routing_key,
                    error = %source,
                    "dropping message, subscription lookup failed"
                );
                event.fail(KernelError::Routing {
                    routing_key,
                    source,
                });
                event.mark_ignored();
                Ok(())
            }
            Err(RoutingError::Sequencer(err)) => Err(err),
        }
    }

    async fn pre_process_dtx_commit(&mut self, event: &mut InboundEvent) -> Result<(), SequencerError> {
        let enqueues = event.take_messages();
        let mut routed = Vec::with_capacity(enqueues.len());
        for message in enqueues {
            match self.route(message).await {
                Ok(copies) => routed.extend(copies),
                Err(RoutingError::Directory {
                    routing_key,
                    source,
                }) => {
                    metrics::counter!("mira_routing_failures_total").increment(1);
                    tracing::error!(
                        xid = ?event.xid(),
                        routing_key = %routing_key,
                        error = %source,
                        "dtx commit aborted, subscription lookup failed"
                    );
                    event.fail(KernelError::Routing {
                        routing_key,
                        source,
                    });
                    event.mark_ignored();
                    return Ok(());
                }
                Err(RoutingError::Sequencer(err)) => return Err(err),
            }
        }
        event.replace_messages(routed);
        Ok(())
    }

    /// Assign identity and resolve storage queues for one message.
    ///
    /// Queue messages come back as-is with their storage queue set to the
    /// destination. Topic messages come back as one copy per distinct storage
    /// queue among the matching subscriptions, possibly none.
    pub async fn route(&mut self, mut message: Message) -> Result<Vec<Message>, RoutingError> {
        self.sequencer.assign_identity(&mut message)?;
        if !message.metadata().is_topic {
            let metadata = message.metadata_mut();
            metadata.storage_queue_name = metadata.destination.clone();
            return Ok(vec![message]);
        }

        let routing_key = message.metadata().destination.clone();
        let subscriptions = match tokio::time::timeout(
            self.query_timeout,
            self.directory.subscribers_for_destination(&routing_key, true),
        )
        .await
        {
            Ok(Ok(subscriptions)) => subscriptions,
            Ok(Err(source)) => {
                return Err(RoutingError::Directory {
                    routing_key,
                    source,
                });
            }
            Err(_) => {
                return Err(RoutingError::Directory {
                    routing_key,
                    source: DirectoryError::Timeout(self.query_timeout),
                });
            }
        };

        let copies = self.fan_out(&message, &subscriptions)?;
        if copies.is_empty() {
            tracing::info!(
                routing_key = %routing_key,
                message_id = %message.id(),
                "no subscriptions matched topic message"
            );
        } else {
            metrics::counter!("mira_fanout_clones_total").increment(copies.len() as u64);
            metrics::histogram!("mira_fanout_clone_count").record(copies.len() as f64);
        }
        Ok(copies)
    }

    fn fan_out(
        &mut self,
        message: &Message,
        subscriptions: &[Subscription],
    ) -> Result<Vec<Message>, SequencerError> {
        let mut seen: HashSet<&str, RandomState> =
            HashSet::with_capacity_and_hasher(subscriptions.len(), RandomState::new());
        let mut copies = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            if !seen.insert(subscription.storage_queue_name.as_str()) {
                continue;
            }
            let mut copy = message.clone_with_id(self.sequencer.next_id()?);
            let metadata = copy.metadata_mut();
            metadata.storage_queue_name = subscription.storage_queue_name.clone();
            if subscription.is_durable {
                metadata.update_routing(subscription.target_queue.clone(), DIRECT_EXCHANGE_NAME);
            }
            tracing::debug!(
                source_id = %message.id(),
                copy_id = %copy.id(),
                storage_queue = %subscription.storage_queue_name,
                durable = subscription.is_durable,
                "routed topic copy"
            );
            copies.push(copy);
        }
        Ok(copies)
    }
}

impl std::fmt::Debug for MessagePreProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePreProcessor")
            .field("sequencer", &self.sequencer)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}
