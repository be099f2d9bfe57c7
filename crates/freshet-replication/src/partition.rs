//! Partition and broker identifier types

use serde::{Deserialize, Serialize};

/// Unique partition identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId {
    pub topic: String,
    pub partition: u32,
}

impl PartitionId {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Endpoint of a source broker that fetchers replicate from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    /// Broker identifier (unique across the cluster)
    pub id: u32,
    /// Hostname or address
    pub host: String,
    /// Replication port
    pub port: u16,
}

impl BrokerEndpoint {
    pub fn new(id: u32, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

/// An offset paired with the leader epoch it was observed under.
///
/// A negative `offset` means "no initial offset known"; the fetcher derives
/// one from the leader before it starts replicating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetAndEpoch {
    pub offset: i64,
    pub leader_epoch: i32,
}

impl OffsetAndEpoch {
    pub fn new(offset: i64, leader_epoch: i32) -> Self {
        Self {
            offset,
            leader_epoch,
        }
    }

    /// Whether the offset carries a usable starting position
    pub fn has_offset(&self) -> bool {
        self.offset >= 0
    }
}

impl std::fmt::Display for OffsetAndEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(offset={}, leaderEpoch={})", self.offset, self.leader_epoch)
    }
}
