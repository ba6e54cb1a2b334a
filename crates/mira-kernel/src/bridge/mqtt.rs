// MQTT front-end adapter. Wire parsing lives in the protocol server; this
// only maps publishes, acks and subscriptions onto the kernel.
use crate::subscription::Subscription;
use crate::{Kernel, KernelError};
use bytes::Bytes;
use mira_common::ids::{ChannelId, PublisherId};
use mira_common::{Message, MessageId, MessageMetadata};
use smallvec::{SmallVec, smallvec};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(thiserror::Error, Debug)]
pub enum MqttError {
    #[error("{context}: {source}")]
    Kernel {
        context: &'static str,
        #[source]
        source: KernelError,
    },
}

impl MqttError {
    fn kernel(context: &'static str) -> impl FnOnce(KernelError) -> Self {
        move |source| MqttError::Kernel { context, source }
    }
}

pub type Result<T> = std::result::Result<T, MqttError>;

/// Queue a persistent MQTT session collects into for `topic`.
pub fn durable_queue_name(topic: &str, mqtt_client_id: &str) -> String {
    format!("{topic}{mqtt_client_id}")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

#[derive(Debug, Clone)]
pub struct MqttChannel {
    kernel: Arc<Kernel>,
}

impl MqttChannel {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Submit a publish as a single-part topic message.
    pub async fn add_message(
        &self,
        payload: Bytes,
        topic: &str,
        qos: u8,
        retain: bool,
        publisher_id: PublisherId,
    ) -> Result<()> {
        let mut metadata = MessageMetadata::topic(topic);
        metadata.qos = qos;
        metadata.is_persistent = retain;
        metadata.publisher_id = Some(publisher_id);
        metadata.arrival_time_millis = now_millis();
        let chunk_size = payload.len();
        let message = Message::from_payload(metadata, payload, chunk_size);
        self.kernel
            .submit_message_event(message)
            .await
            .map_err(MqttError::kernel("failed to submit mqtt publish"))?;
        tracing::debug!(topic = %topic, qos, retain, publisher_id = %publisher_id, "mqtt message added");
        Ok(())
    }

    pub async fn message_ack(
        &self,
        message_id: MessageId,
        topic: &str,
        storage_name: &str,
        channel_id: ChannelId,
    ) -> Result<()> {
        let ack = crate::ack_by_id(channel_id, message_id, topic, storage_name, true);
        self.kernel
            .acknowledge(ack)
            .await
            .map_err(MqttError::kernel("failed to submit mqtt ack"))
    }

    /// A clean session gets one non-durable topic subscription. A persistent
    /// session gets a durable topic subscription plus a queue subscription on
    /// the queue it collects into.
    pub async fn add_subscriber(
        &self,
        topic: &str,
        client_id: &str,
        mqtt_client_id: &str,
        clean_session: bool,
        qos: u8,
        channel_id: ChannelId,
    ) -> Result<()> {
        for subscription in self.subscriptions(topic, mqtt_client_id, clean_session, channel_id) {
            self.kernel
                .open_subscription(subscription)
                .await
                .map_err(MqttError::kernel("failed to open mqtt subscription"))?;
        }
        tracing::debug!(
            topic = %topic,
            client_id = %client_id,
            channel_id = %channel_id,
            clean_session,
            qos,
            "mqtt subscriber registered"
        );
        Ok(())
    }

    pub async fn remove_subscriber(
        &self,
        topic: &str,
        mqtt_client_id: &str,
        clean_session: bool,
        channel_id: ChannelId,
    ) -> Result<()> {
        for subscription in self.subscriptions(topic, mqtt_client_id, clean_session, channel_id) {
            self.kernel
                .close_subscription(&subscription)
                .await
                .map_err(MqttError::kernel("failed to close mqtt subscription"))?;
        }
        tracing::debug!(topic = %topic, channel_id = %channel_id, "mqtt subscriber removed");
        Ok(())
    }

    fn subscriptions(
        &self,
        topic: &str,
        mqtt_client_id: &str,
        clean_session: bool,
        channel_id: ChannelId,
    ) -> SmallVec<[Subscription; 2]> {
        let node_id = self.kernel.node_id();
        if clean_session {
            return smallvec![Subscription::non_durable_topic(channel_id, topic, node_id)];
        }
        let queue = durable_queue_name(topic, mqtt_client_id);
        smallvec![
            Subscription::durable_topic(channel_id, topic, queue.clone(), node_id),
            Subscription::queue(channel_id, queue, node_id),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mira_common::KernelConfig;

    fn channel() -> MqttChannel {
        let kernel = Kernel::start_in_memory(KernelConfig::new("n1")).expect("kernel");
        MqttChannel::new(Arc::new(kernel))
    }

    #[tokio::test]
    async fn clean_session_opens_one_topic_subscription() {
        let mqtt = channel();
        let channel_id = ChannelId::new();
        mqtt.add_subscriber("sensors.*", "c1", "m1", true, 1, channel_id)
            .await
            .expect("subscribe");
        assert_eq!(mqtt.kernel.directory().subscription_count().await, 1);

        mqtt.remove_subscriber("sensors.*", "m1", true, channel_id)
            .await
            .expect("unsubscribe");
        assert_eq!(mqtt.kernel.directory().subscription_count().await, 0);
    }

    #[tokio::test]
    async fn persistent_session_opens_durable_pair() {
        let mqtt = channel();
        let channel_id = ChannelId::new();
        mqtt.add_subscriber("sports.cricket", "c1", "m1", false, 1, channel_id)
            .await
            .expect("subscribe");
        assert_eq!(mqtt.kernel.directory().subscription_count().await, 2);

        let routes = mqtt
            .kernel
            .directory()
            .subscribers_for_destination("sports.cricket", true)
            .await
            .expect("query");
        assert_eq!(routes.len(), 1);
        assert!(routes[0].is_durable);
        assert_eq!(routes[0].storage_queue_name, "sports.cricketm1");

        mqtt.remove_subscriber("sports.cricket", "m1", false, channel_id)
            .await
            .expect("unsubscribe");
        assert_eq!(mqtt.kernel.directory().subscription_count().await, 0);
    }

    #[tokio::test]
    async fn publish_is_accepted() {
        let mqtt = channel();
        mqtt.add_message(
            Bytes::from_static(b"21.5"),
            "sensors.temp",
            0,
            false,
            PublisherId::new(),
        )
        .await
        .expect("publish");
    }
}
