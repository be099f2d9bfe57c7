//! Follower-side log collaborator interface

use crate::error::Result;
use crate::partition::{OffsetAndEpoch, PartitionId};
use crate::protocol::{FetchRequest, PartitionData};
use crate::state::PartitionFetchState;
use async_trait::async_trait;

/// Outcome of appending one fetch response slice to the local log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogAppendInfo {
    /// Offset of the last record appended
    pub last_offset: i64,
    /// Bytes that passed validation and were appended
    pub valid_bytes: i64,
}

/// A truncation decision: cut the log here, and whether that decision is
/// final or another epoch round-trip is needed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetTruncationState {
    pub offset: i64,
    pub truncation_completed: bool,
}

impl std::fmt::Display for OffsetTruncationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(offset={}, completed={})",
            self.offset, self.truncation_completed
        )
    }
}

/// Local log and epoch-cache access for the follower
///
/// Disk layout, segment management and the epoch checkpoint live behind this
/// trait. Append and truncate may block on disk I/O; the core treats them as
/// non-cancellable.
#[async_trait]
pub trait LogAccessor: Send + Sync {
    /// Validate and append one partition's fetched records at `fetch_offset`.
    ///
    /// Returns `None` when there was nothing to apply. Fails with
    /// `CorruptRecord` on validation errors and `Storage` on I/O errors.
    async fn append_fetched(
        &self,
        tp: &PartitionId,
        fetch_offset: i64,
        data: &PartitionData,
    ) -> Result<Option<LogAppendInfo>>;

    /// Truncate the partition's log to the decided offset
    async fn truncate(&self, tp: &PartitionId, truncation: &OffsetTruncationState) -> Result<()>;

    /// Discard the whole log and restart it at `offset` (the follower fell
    /// behind the leader's retention window)
    async fn truncate_fully_and_start_at(&self, tp: &PartitionId, offset: i64) -> Result<()>;

    /// Latest epoch in the local epoch cache, if any
    fn latest_epoch(&self, tp: &PartitionId) -> Option<i32>;

    /// Next offset to be appended locally
    fn log_end_offset(&self, tp: &PartitionId) -> i64;

    /// Local end offset for the largest cached epoch `<=` the requested one
    fn end_offset_for_epoch(&self, tp: &PartitionId, leader_epoch: i32) -> Option<OffsetAndEpoch>;

    /// Aggregate eligible partitions into at most one fetch request.
    ///
    /// Returns the request (if any partition is ready) and the partitions
    /// rejected with a recoverable build error, which the core backs off.
    fn build_fetch(
        &self,
        states: &[(PartitionId, PartitionFetchState)],
    ) -> (Option<FetchRequest>, Vec<PartitionId>);
}
