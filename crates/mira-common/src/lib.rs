// Shared data types used by the kernel, storage and protocol bridges.
use serde::{Deserialize, Serialize};

pub mod message;
pub mod xid;

pub use message::{AckData, Message, MessageId, MessageMetadata, MessagePart};
pub use xid::Xid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("malformed message {message_id}: {reason}")]
    MalformedMessage { message_id: MessageId, reason: String },
    #[error("config error: {0}")]
    Config(String),
}

pub mod ids {
    // Strongly typed IDs so channel and publisher ids never get mixed up.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            pub struct $name(Uuid);

            impl $name {
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    // Subscriber channel as seen by a protocol bridge.
    id_type!(ChannelId);
    // Publishing client.
    id_type!(PublisherId);
    // Protocol session enlisted on a transaction branch.
    id_type!(SessionId);
}

const DEFAULT_INGRESS_CAPACITY: usize = 1024;
const DEFAULT_WRITER_QUEUE_DEPTH: usize = 1024;
const DEFAULT_DIRECTORY_QUERY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DTX_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_DTX_SWEEP_INTERVAL_MS: u64 = 1_000;

/// Tunables for the message kernel.
///
/// ```
/// use mira_common::KernelConfig;
///
/// let config = KernelConfig::new("node-a");
/// assert_eq!(config.node_id, "node-a");
/// assert!(config.ingress_capacity > 0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub node_id: String,
    // Slot folded into generated message ids; unique per node in a cluster.
    pub node_slot: u16,
    pub clustering_enabled: bool,
    pub cluster_node_addresses: Vec<String>,
    // Bounded ordered ring between publishers and the pre-processor.
    pub ingress_capacity: usize,
    pub writer_queue_depth: usize,
    pub directory_query_timeout_ms: u64,
    // Default deadline for new transaction branches; 0 disables expiry.
    pub dtx_timeout_ms: u64,
    pub dtx_sweep_interval_ms: u64,
}

impl KernelConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::Config("node_id must not be empty".into()));
        }
        if self.ingress_capacity == 0 || self.writer_queue_depth == 0 {
            return Err(Error::Config("queue capacities must be non-zero".into()));
        }
        if self.node_slot > 1023 {
            return Err(Error::Config(format!(
                "node_slot {} out of range (0..=1023)",
                self.node_slot
            )));
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".into(),
            node_slot: 0,
            clustering_enabled: false,
            cluster_node_addresses: Vec::new(),
            ingress_capacity: DEFAULT_INGRESS_CAPACITY,
            writer_queue_depth: DEFAULT_WRITER_QUEUE_DEPTH,
            directory_query_timeout_ms: DEFAULT_DIRECTORY_QUERY_TIMEOUT_MS,
            dtx_timeout_ms: DEFAULT_DTX_TIMEOUT_MS,
            dtx_sweep_interval_ms: DEFAULT_DTX_SWEEP_INTERVAL_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, KernelConfig, ids::ChannelId};
    use std::str::FromStr;

    #[test]
    fn channel_id_round_trip() {
        let id = ChannelId::new();
        let parsed = ChannelId::from_str(&id.to_string()).expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn channel_id_rejects_invalid_input() {
        let err = ChannelId::from_str("not-a-uuid").expect_err("invalid");
        assert!(matches!(err, Error::InvalidId(s) if s == "not-a-uuid"));
    }

    #[test]
    fn default_config_is_valid() {
        let config = KernelConfig::default();
        config.validate().expect("valid");
        assert!(config.dtx_timeout_ms > 0);
        assert!(!config.clustering_enabled);
    }

    #[test]
    fn config_rejects_out_of_range_slot() {
        let config = KernelConfig {
            node_slot: 4096,
            ..KernelConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: KernelConfig =
            serde_json::from_str(r#"{"node_id":"n7","dtx_timeout_ms":0}"#).expect("parse");
        assert_eq!(config.node_id, "n7");
        assert_eq!(config.dtx_timeout_ms, 0);
        assert_eq!(config.ingress_capacity, 1024);
    }
}
