// Node identity and the read-only cluster view exposed to management tools.
use mira_common::KernelConfig;
use mira_storage::MessageStore;
use serde::Serialize;

pub trait ClusterIdentity: Send + Sync {
    fn my_node_id(&self) -> &str;

    fn is_clustering_enabled(&self) -> bool;

    /// `host:port` of every member, this node included.
    fn all_cluster_node_addresses(&self) -> Vec<String>;
}

/// Membership fixed at startup from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticClusterIdentity {
    node_id: String,
    clustering_enabled: bool,
    node_addresses: Vec<String>,
}

impl StaticClusterIdentity {
    pub fn new(
        node_id: impl Into<String>,
        clustering_enabled: bool,
        node_addresses: Vec<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            clustering_enabled,
            node_addresses,
        }
    }

    pub fn from_config(config: &KernelConfig) -> Self {
        Self::new(
            config.node_id.clone(),
            config.clustering_enabled,
            config.cluster_node_addresses.clone(),
        )
    }
}

impl ClusterIdentity for StaticClusterIdentity {
    fn my_node_id(&self) -> &str {
        &self.node_id
    }

    fn is_clustering_enabled(&self) -> bool {
        self.clustering_enabled
    }

    fn all_cluster_node_addresses(&self) -> Vec<String> {
        if self.clustering_enabled {
            self.node_addresses.clone()
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterManagementInformation {
    pub clustering_enabled: bool,
    pub my_node_id: String,
    pub cluster_node_addresses: Vec<String>,
    pub store_healthy: bool,
}

impl ClusterManagementInformation {
    pub async fn collect(cluster: &dyn ClusterIdentity, store: &dyn MessageStore) -> Self {
        Self {
            clustering_enabled: cluster.is_clustering_enabled(),
            my_node_id: cluster.my_node_id().to_string(),
            cluster_node_addresses: cluster.all_cluster_node_addresses(),
            store_healthy: store.is_healthy().await,
        }
    }
}
