//! Value types exchanged with the partition leader
//!
//! Only the request/response payloads the fetcher core reasons about live
//! here. The concrete wire codec and network client are collaborators behind
//! the [`LeaderClient`](crate::leader::LeaderClient) trait.

use crate::partition::PartitionId;
use serde::{Deserialize, Serialize};

/// Sentinel epoch for responses from peers that cannot name one
pub const UNDEFINED_EPOCH: i32 = -1;

/// Sentinel end offset for epochs the leader cannot resolve
pub const UNDEFINED_EPOCH_OFFSET: i64 = -1;

/// Partition-level error codes carried in leader responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    None = 0,
    Unknown = 1,
    OffsetOutOfRange = 2,
    CorruptMessage = 3,
    UnknownTopicOrPartition = 4,
    NotLeaderForPartition = 5,
    UnknownLeaderEpoch = 6,
    FencedLeaderEpoch = 7,
    StorageError = 8,
}

impl ErrorCode {
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorCode::OffsetOutOfRange
                | ErrorCode::CorruptMessage
                | ErrorCode::UnknownTopicOrPartition
                | ErrorCode::NotLeaderForPartition
                | ErrorCode::UnknownLeaderEpoch
                | ErrorCode::FencedLeaderEpoch
        )
    }
}

/// Epoch query sent to the leader's OffsetsForLeaderEpoch endpoint
///
/// `leader_epoch` is the follower's latest locally-known epoch (the one we
/// want the end offset for); `current_leader_epoch` is the epoch the
/// follower currently believes is authoritative and is used by the leader
/// for fencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochData {
    pub leader_epoch: i32,
    pub current_leader_epoch: i32,
}

/// Per-partition response from the OffsetsForLeaderEpoch endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochEndOffset {
    pub error: ErrorCode,
    pub leader_epoch: i32,
    pub end_offset: i64,
}

impl EpochEndOffset {
    pub fn new(leader_epoch: i32, end_offset: i64) -> Self {
        Self {
            error: ErrorCode::None,
            leader_epoch,
            end_offset,
        }
    }

    pub fn error(error: ErrorCode) -> Self {
        Self {
            error,
            leader_epoch: UNDEFINED_EPOCH,
            end_offset: UNDEFINED_EPOCH_OFFSET,
        }
    }

    pub fn has_undefined_epoch_or_offset(&self) -> bool {
        self.leader_epoch == UNDEFINED_EPOCH || self.end_offset == UNDEFINED_EPOCH_OFFSET
    }
}

/// Per-partition slice of a fetch request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPartition {
    /// Next offset the follower wants
    pub fetch_offset: i64,
    /// Follower's current leader epoch, for fencing
    pub current_leader_epoch: i32,
    /// Upper bound on bytes returned for this partition
    pub max_bytes: u32,
}

/// A fetch request aggregating every partition eligible this cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub partitions: Vec<(PartitionId, FetchPartition)>,
}

impl FetchRequest {
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Epoch the request carried for a partition, if it was part of the
    /// request
    pub fn requested_epoch(&self, tp: &PartitionId) -> Option<i32> {
        self.partitions
            .iter()
            .find(|(p, _)| p == tp)
            .map(|(_, f)| f.current_leader_epoch)
    }
}

/// Per-partition payload of a fetch response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionData {
    pub error: ErrorCode,
    /// Leader's high watermark at response time
    pub high_watermark: i64,
    /// Raw record batch bytes; interpreted only by the log layer
    pub records: Vec<u8>,
}

impl PartitionData {
    pub fn new(high_watermark: i64, records: Vec<u8>) -> Self {
        Self {
            error: ErrorCode::None,
            high_watermark,
            records,
        }
    }

    pub fn error(error: ErrorCode) -> Self {
        Self {
            error,
            high_watermark: -1,
            records: Vec::new(),
        }
    }
}
