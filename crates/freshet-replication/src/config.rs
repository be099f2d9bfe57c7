//! Fetcher pool configuration

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration shared by every fetcher in the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Tag carried on every metric emitted by the pool
    pub client_id: String,

    /// Delay applied to no-op cycles and to partitions that hit a
    /// retriable error
    pub fetch_backoff: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            client_id: "replica-fetcher".to_string(),
            fetch_backoff: Duration::from_millis(1000),
        }
    }
}

impl FetcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(ReplicationError::InvalidConfig(
                "client_id must not be empty".to_string(),
            ));
        }
        if self.fetch_backoff.is_zero() {
            return Err(ReplicationError::InvalidConfig(
                "fetch_backoff must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Manager-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Number of fetchers per source broker; partitions hash onto them
    pub num_fetchers: u32,

    /// Per-fetcher configuration
    pub fetcher: FetcherConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            num_fetchers: 1,
            fetcher: FetcherConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_fetchers == 0 {
            return Err(ReplicationError::InvalidConfig(
                "num_fetchers must be at least 1".to_string(),
            ));
        }
        self.fetcher.validate()
    }
}
