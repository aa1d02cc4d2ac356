//! Runner notification
//!
//! How the coordinator tells a runner to start or stop serving a shard.
//! Both calls are idempotent on the runner; the coordinator retries them
//! until acknowledged or the runner's lease expires.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::coordinator::state::{RunnerAddress, ShardId};
use crate::error::{Result, ShardLeaseError};

/// Delivers assign/unassign notifications to runners
#[async_trait]
pub trait RunnerNotifier: Send + Sync {
    /// Tell `address` to start serving `shard`
    async fn notify_assign(&self, address: &RunnerAddress, shard: ShardId) -> Result<()>;

    /// Tell `address` to stop serving `shard`
    async fn notify_unassign(&self, address: &RunnerAddress, shard: ShardId) -> Result<()>;
}

/// Configuration for the HTTP notifier
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// URL scheme used to reach runners
    pub scheme: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Request timeout
    pub request_timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            scheme: "http".into(),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Notifier posting to `/shards/{id}/assign|unassign` on each runner
pub struct HttpNotifier {
    client: Client,
    config: NotifierConfig,
}

impl HttpNotifier {
    /// Create a new HTTP notifier
    pub fn new(config: NotifierConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ShardLeaseError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    fn shard_url(&self, address: &RunnerAddress, shard: ShardId, action: &str) -> String {
        format!("{}://{}/shards/{}/{}", self.config.scheme, address, shard, action)
    }

    async fn post(&self, address: &RunnerAddress, shard: ShardId, action: &str) -> Result<()> {
        let url = self.shard_url(address, shard, action);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| ShardLeaseError::NotificationFailed {
                address: address.encode(),
                reason: format!("{} shard {}: {}", action, shard, e),
            })?;

        if !resp.status().is_success() {
            return Err(ShardLeaseError::NotificationFailed {
                address: address.encode(),
                reason: format!("{} shard {}: status {}", action, shard, resp.status()),
            });
        }

        debug!("Runner {} acknowledged {} of shard {}", address, action, shard);
        Ok(())
    }
}

#[async_trait]
impl RunnerNotifier for HttpNotifier {
    async fn notify_assign(&self, address: &RunnerAddress, shard: ShardId) -> Result<()> {
        self.post(address, shard, "assign").await
    }

    async fn notify_unassign(&self, address: &RunnerAddress, shard: ShardId) -> Result<()> {
        self.post(address, shard, "unassign").await
    }
}
