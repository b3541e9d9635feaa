//! Per-cluster VNet config cache (memory only)

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::client_application::ClusterClient;
use super::error::{ResultExt, VnetError};
use super::types::ClusterConfig;

struct CacheEntry {
    config: ClusterConfig,
    fetched_at: Instant,
}

/// Key: cluster name. Failed fetches are never cached.
pub struct ClusterConfigCache {
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl ClusterConfigCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Cached config for the client's cluster, fetched when missing or expired.
    pub async fn get(&self, client: &dyn ClusterClient) -> Result<ClusterConfig, VnetError> {
        let cluster = client.cluster_name().to_string();
        if let Some(entry) = self.cache.get(&cluster) {
            if entry.fetched_at.elapsed() < self.ttl {
                debug!(cluster = %cluster, "Cluster config cache hit");
                return Ok(entry.config.clone());
            }
            // Expired
            drop(entry);
            self.cache.remove(&cluster);
        }

        let config = client
            .vnet_config()
            .await
            .with_context(|| format!("fetching VNet config for cluster {cluster}"))?;
        self.cache.insert(
            cluster,
            CacheEntry {
                config: config.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(config)
    }

    pub fn invalidate(&self, cluster: &str) {
        self.cache.remove(cluster);
    }
}
