use anyhow::{Context, Result};
use mira_common::KernelConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // Admin HTTP listener (/metrics, /live, /ready, /cluster).
    pub admin_bind: SocketAddr,
    pub kernel: KernelConfig,
}

const DEFAULT_ADMIN_BIND: &str = "0.0.0.0:8080";

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    admin_bind: Option<String>,
    node_id: Option<String>,
    node_slot: Option<u16>,
    clustering_enabled: Option<bool>,
    cluster_node_addresses: Option<Vec<String>>,
    ingress_capacity: Option<usize>,
    writer_queue_depth: Option<usize>,
    directory_query_timeout_ms: Option<u64>,
    dtx_timeout_ms: Option<u64>,
    dtx_sweep_interval_ms: Option<u64>,
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        let admin_bind = std::env::var("MIRA_BROKER_ADMIN_BIND")
            .unwrap_or_else(|_| DEFAULT_ADMIN_BIND.to_string())
            .parse()
            .with_context(|| "parse MIRA_BROKER_ADMIN_BIND")?;

        let mut kernel = KernelConfig::default();
        if let Ok(node_id) = std::env::var("MIRA_NODE_ID") {
            kernel.node_id = node_id;
        }
        if let Some(value) = env_parsed("MIRA_NODE_SLOT") {
            kernel.node_slot = value;
        }
        if let Some(value) = env_flag("MIRA_CLUSTERING_ENABLED") {
            kernel.clustering_enabled = value;
        }
        if let Ok(nodes) = std::env::var("MIRA_CLUSTER_NODES") {
            // Comma-separated host:port list.
            kernel.cluster_node_addresses = nodes
                .split(',')
                .map(str::trim)
                .filter(|node| !node.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = env_parsed::<usize>("MIRA_INGRESS_CAPACITY").filter(|v| *v > 0) {
            kernel.ingress_capacity = value;
        }
        if let Some(value) = env_parsed::<usize>("MIRA_WRITER_QUEUE_DEPTH").filter(|v| *v > 0) {
            kernel.writer_queue_depth = value;
        }
        if let Some(value) =
            env_parsed::<u64>("MIRA_DIRECTORY_QUERY_TIMEOUT_MS").filter(|v| *v > 0)
        {
            kernel.directory_query_timeout_ms = value;
        }
        // Zero is meaningful here: branches never expire.
        if let Some(value) = env_parsed("MIRA_DTX_TIMEOUT_MS") {
            kernel.dtx_timeout_ms = value;
        }
        if let Some(value) = env_parsed("MIRA_DTX_SWEEP_INTERVAL_MS") {
            kernel.dtx_sweep_interval_ms = value;
        }
        Ok(Self { admin_bind, kernel })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("MIRA_BROKER_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read MIRA_BROKER_CONFIG: {path}"))?;
            let override_cfg: BrokerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse broker config yaml")?;
            config.apply(override_cfg)?;
        }
        config
            .kernel
            .validate()
            .with_context(|| "validate kernel config")?;
        Ok(config)
    }

    fn apply(&mut self, override_cfg: BrokerConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.admin_bind {
            self.admin_bind = value.parse().with_context(|| "parse admin_bind")?;
        }
        let kernel = &mut self.kernel;
        if let Some(value) = override_cfg.node_id {
            kernel.node_id = value;
        }
        if let Some(value) = override_cfg.node_slot {
            kernel.node_slot = value;
        }
        if let Some(value) = override_cfg.clustering_enabled {
            kernel.clustering_enabled = value;
        }
        if let Some(value) = override_cfg.cluster_node_addresses {
            kernel.cluster_node_addresses = value;
        }
        if let Some(value) = override_cfg.ingress_capacity
            && value > 0
        {
            kernel.ingress_capacity = value;
        }
        if let Some(value) = override_cfg.writer_queue_depth
            && value > 0
        {
            kernel.writer_queue_depth = value;
        }
        if let Some(value) = override_cfg.directory_query_timeout_ms
            && value > 0
        {
            kernel.directory_query_timeout_ms = value;
        }
        if let Some(value) = override_cfg.dtx_timeout_ms {
            kernel.dtx_timeout_ms = value;
        }
        if let Some(value) = override_cfg.dtx_sweep_interval_ms {
            kernel.dtx_sweep_interval_ms = value;
        }
        Ok(())
    }
}
