//! Replication error types

use crate::partition::PartitionId;
use thiserror::Error;

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors surfaced by the fetcher core and its collaborators
#[derive(Debug, Error)]
pub enum ReplicationError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== Epoch / Ownership Errors ====================
    #[error("fenced leader epoch for {partition}: requested epoch {requested_epoch} is stale")]
    FencedLeaderEpoch {
        partition: PartitionId,
        requested_epoch: i32,
    },

    #[error("unknown leader epoch for {partition}")]
    UnknownLeaderEpoch { partition: PartitionId },

    #[error("not leader for partition {partition}")]
    NotLeaderForPartition { partition: PartitionId },

    #[error("unknown topic or partition: {partition}")]
    UnknownTopicOrPartition { partition: PartitionId },

    #[error("fetch offset {offset} out of range for {partition}")]
    OffsetOutOfRange {
        partition: PartitionId,
        offset: i64,
    },

    // ==================== Data Errors ====================
    #[error("corrupt record batch: {0}")]
    CorruptRecord(String),

    #[error("storage error: {0}")]
    Storage(String),

    // ==================== Network Errors ====================
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timeout")]
    Timeout,

    // ==================== Internal Errors ====================
    #[error("channel closed")]
    ChannelClosed,

    #[error("shutdown in progress")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Check if this error is retriable on the same partition without
    /// operator intervention
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ReplicationError::UnknownLeaderEpoch { .. }
                | ReplicationError::NotLeaderForPartition { .. }
                | ReplicationError::UnknownTopicOrPartition { .. }
                | ReplicationError::CorruptRecord(_)
                | ReplicationError::Transport(_)
                | ReplicationError::Timeout
        )
    }

    /// Check if this error quarantines the partition until it is re-added
    /// by a control event
    pub fn is_partition_fatal(&self) -> bool {
        matches!(self, ReplicationError::Storage(_))
    }
}

// Conversion from channel errors
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ReplicationError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ReplicationError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ReplicationError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ReplicationError::ChannelClosed
    }
}
