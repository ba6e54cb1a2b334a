// Message envelope: routing metadata plus ordered content chunks.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{ChannelId, PublisherId};
use crate::{Error, Result};

pub const DIRECT_EXCHANGE_NAME: &str = "amq.direct";
pub const TOPIC_EXCHANGE_NAME: &str = "amq.topic";

/// Cluster-wide message identity. Zero means "not yet assigned".
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct MessageId(u64);

impl MessageId {
    pub const UNASSIGNED: MessageId = MessageId(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub message_id: MessageId,
    // Routing key as published (topic name or queue name).
    pub destination: String,
    pub exchange: String,
    pub is_topic: bool,
    // Physical queue the message is persisted under; empty until routed.
    pub storage_queue_name: String,
    pub is_persistent: bool,
    pub content_length: Option<usize>,
    pub arrival_time_millis: u64,
    pub publisher_id: Option<PublisherId>,
    pub qos: u8,
}

impl MessageMetadata {
    pub fn queue(destination: impl Into<String>) -> Self {
        Self::new(destination, DIRECT_EXCHANGE_NAME, false)
    }

    pub fn topic(destination: impl Into<String>) -> Self {
        Self::new(destination, TOPIC_EXCHANGE_NAME, true)
    }

    fn new(destination: impl Into<String>, exchange: &str, is_topic: bool) -> Self {
        Self {
            message_id: MessageId::UNASSIGNED,
            destination: destination.into(),
            exchange: exchange.to_string(),
            is_topic,
            storage_queue_name: String::new(),
            is_persistent: true,
            content_length: None,
            arrival_time_millis: 0,
            publisher_id: None,
            qos: 0,
        }
    }

    /// Turn a topic copy into a self-contained point-to-point message.
    pub fn update_routing(&mut self, destination: impl Into<String>, exchange: impl Into<String>) {
        self.destination = destination.into();
        self.exchange = exchange.into();
        self.is_topic = false;
    }
}

/// One content chunk. `offset` is the byte position of `data` in the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePart {
    pub message_id: MessageId,
    pub offset: usize,
    pub data: Bytes,
}

impl MessagePart {
    pub fn new(offset: usize, data: Bytes) -> Self {
        Self {
            message_id: MessageId::UNASSIGNED,
            offset,
            data,
        }
    }

    pub fn clone_with_id(&self, message_id: MessageId) -> Self {
        Self {
            message_id,
            offset: self.offset,
            data: self.data.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    metadata: MessageMetadata,
    parts: Vec<MessagePart>,
}

impl Message {
    pub fn new(metadata: MessageMetadata) -> Self {
        Self {
            metadata,
            parts: Vec::new(),
        }
    }

    /// Build a message from a whole payload split into `chunk_size` parts.
    ///
    /// ```
    /// use bytes::Bytes;
    /// use mira_common::{Message, MessageMetadata};
    ///
    /// let msg = Message::from_payload(
    ///     MessageMetadata::queue("orders"),
    ///     Bytes::from_static(b"abcdef"),
    ///     4,
    /// );
    /// assert_eq!(msg.parts().len(), 2);
    /// assert_eq!(msg.content(), Bytes::from_static(b"abcdef"));
    /// ```
    pub fn from_payload(mut metadata: MessageMetadata, payload: Bytes, chunk_size: usize) -> Self {
        metadata.content_length = Some(payload.len());
        let mut message = Self::new(metadata);
        let chunk_size = chunk_size.max(1);
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + chunk_size).min(payload.len());
            message.add_part(MessagePart::new(offset, payload.slice(offset..end)));
            offset = end;
        }
        message
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MessageMetadata {
        &mut self.metadata
    }

    pub fn parts(&self) -> &[MessagePart] {
        &self.parts
    }

    pub fn id(&self) -> MessageId {
        self.metadata.message_id
    }

    pub fn add_part(&mut self, mut part: MessagePart) {
        part.message_id = self.metadata.message_id;
        self.parts.push(part);
    }

    /// Stamp `message_id` on the metadata and on every owned part.
    pub fn set_message_id(&mut self, message_id: MessageId) {
        self.metadata.message_id = message_id;
        for part in &mut self.parts {
            part.message_id = message_id;
        }
    }

    /// Value copy of metadata and every part, re-identified as `message_id`.
    pub fn clone_with_id(&self, message_id: MessageId) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.message_id = message_id;
        let mut parts = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            parts.push(part.clone_with_id(message_id));
        }
        Self { metadata, parts }
    }

    /// Reassemble the payload from its parts.
    pub fn content(&self) -> Bytes {
        if let [single] = self.parts.as_slice() {
            return single.data.clone();
        }
        let total = self.parts.iter().map(|part| part.data.len()).sum();
        let mut buf = Vec::with_capacity(total);
        for part in &self.parts {
            buf.extend_from_slice(&part.data);
        }
        Bytes::from(buf)
    }

    /// Check the id/part/offset invariants without repairing anything.
    pub fn validate(&self) -> Result<()> {
        let message_id = self.metadata.message_id;
        let mut expected_offset = 0usize;
        for (index, part) in self.parts.iter().enumerate() {
            if part.message_id != message_id {
                return Err(Error::MalformedMessage {
                    message_id,
                    reason: format!("part {index} carries message id {}", part.message_id),
                });
            }
            if part.offset != expected_offset {
                return Err(Error::MalformedMessage {
                    message_id,
                    reason: format!(
                        "part {index} starts at offset {} (expected {expected_offset})",
                        part.offset
                    ),
                });
            }
            expected_offset += part.data.len();
        }
        if let Some(length) = self.metadata.content_length
            && length != expected_offset
        {
            return Err(Error::MalformedMessage {
                message_id,
                reason: format!("parts cover {expected_offset} bytes, declared {length}"),
            });
        }
        Ok(())
    }
}

/// Consumer acknowledgement for one delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckData {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub destination: String,
    pub storage_queue_name: String,
    pub is_topic: bool,
}
