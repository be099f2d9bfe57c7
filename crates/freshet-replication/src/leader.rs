//! Leader-side collaborator interface
//!
//! The fetcher core is parameterized by this trait instead of owning a
//! network client; the concrete RPC implementation (framing, connection
//! management, timeouts) lives behind it.

use crate::error::Result;
use crate::partition::{BrokerEndpoint, PartitionId};
use crate::protocol::{EpochData, EpochEndOffset, FetchRequest, PartitionData};
use async_trait::async_trait;
use std::collections::HashMap;

/// RPC surface of the source broker a fetcher replicates from
///
/// Timeouts are this layer's responsibility; the core treats any error as a
/// transport failure and backs off. The offset lookups may fail with the
/// epoch/ownership errors of
/// [`ReplicationError`](crate::error::ReplicationError), which the core maps
/// to its fencing and reset policies.
#[async_trait]
pub trait LeaderClient: Send + Sync {
    /// Issue one aggregated fetch and return per-partition payloads
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<(PartitionId, PartitionData)>>;

    /// Resolve end offsets for the requested leader epochs
    async fn fetch_epoch_end_offsets(
        &self,
        partitions: &HashMap<PartitionId, EpochData>,
    ) -> Result<HashMap<PartitionId, EpochEndOffset>>;

    /// Leader's log end offset for a partition
    async fn fetch_latest_offset(&self, tp: &PartitionId, current_leader_epoch: i32)
        -> Result<i64>;

    /// Leader's log start offset for a partition
    async fn fetch_earliest_offset(
        &self,
        tp: &PartitionId,
        current_leader_epoch: i32,
    ) -> Result<i64>;

    /// Whether the peer speaks the epoch end offset protocol; when it does
    /// not, truncation falls back to the local high watermark
    fn supports_epoch_end_offsets(&self) -> bool {
        true
    }

    /// Endpoint this client talks to
    fn endpoint(&self) -> &BrokerEndpoint;
}

/// Builds [`LeaderClient`]s on demand as the manager spins up fetchers for
/// new source brokers
pub trait LeaderClientProvider: Send + Sync {
    fn client_for(&self, source: &BrokerEndpoint) -> std::sync::Arc<dyn LeaderClient>;
}
