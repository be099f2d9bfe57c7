//! Per-partition fetch state and the ordered state table
//!
//! The table is the fetcher's single source of truth for which partitions it
//! replicates and where each one stands in the truncate/fetch protocol. It is
//! owned by exactly one event loop and never shared (see the concurrency
//! notes on [`FetcherCore`](crate::fetcher::FetcherCore)); the concurrent-safe
//! pieces here are [`FailedPartitions`], which the manager may read while the
//! loop runs.

use crate::partition::PartitionId;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Phase of the replication protocol a partition is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchPhase {
    /// Assigned but divergence with the leader not yet reconciled; no
    /// appends happen in this phase
    Truncating,
    /// Reconciled; the partition contributes to fetch requests
    Fetching,
}

/// Backoff marker attached to a partition state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayedItem {
    due: Instant,
}

impl DelayedItem {
    pub fn new(delay: Duration) -> Self {
        Self {
            due: Instant::now() + delay,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.due
    }
}

/// Fetch state of a single partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFetchState {
    /// Next offset the follower intends to request
    pub fetch_offset: i64,
    /// Leader epoch the follower believes is authoritative
    pub current_leader_epoch: i32,
    /// If set and unexpired, the partition contributes no requests
    pub delay: Option<DelayedItem>,
    /// Protocol phase
    pub phase: FetchPhase,
}

impl PartitionFetchState {
    pub fn truncating(fetch_offset: i64, current_leader_epoch: i32) -> Self {
        Self {
            fetch_offset,
            current_leader_epoch,
            delay: None,
            phase: FetchPhase::Truncating,
        }
    }

    pub fn fetching(fetch_offset: i64, current_leader_epoch: i32) -> Self {
        Self {
            fetch_offset,
            current_leader_epoch,
            delay: None,
            phase: FetchPhase::Fetching,
        }
    }

    pub fn with_delay(mut self, delay: DelayedItem) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn is_truncating(&self) -> bool {
        self.phase == FetchPhase::Truncating
    }

    pub fn is_delayed(&self) -> bool {
        self.delay.map_or(false, |d| !d.expired())
    }

    pub fn is_ready_for_fetch(&self) -> bool {
        self.phase == FetchPhase::Fetching && !self.is_delayed()
    }
}

impl std::fmt::Display for PartitionFetchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(offset={}, leaderEpoch={}, phase={:?}, delayed={})",
            self.fetch_offset,
            self.current_leader_epoch,
            self.phase,
            self.is_delayed()
        )
    }
}

#[derive(Debug, Clone)]
struct TableSlot {
    seq: u64,
    state: PartitionFetchState,
}

/// Insertion-ordered map from partition to fetch state with move-to-end
///
/// Move-to-end after servicing a partition realizes approximate round-robin
/// fairness: the partition just serviced goes to the tail so the others
/// drain first when request-size limits cut a cycle short. Ordering is kept
/// in a sequence index rather than relying on any map's iteration order.
#[derive(Debug, Default)]
pub struct PartitionStateTable {
    states: HashMap<PartitionId, TableSlot>,
    order: BTreeMap<u64, PartitionId>,
    next_seq: u64,
}

impl PartitionStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn contains(&self, tp: &PartitionId) -> bool {
        self.states.contains_key(tp)
    }

    /// Current state of a partition, if tracked
    pub fn get(&self, tp: &PartitionId) -> Option<&PartitionFetchState> {
        self.states.get(tp).map(|slot| &slot.state)
    }

    /// Insert or overwrite; a new partition lands at the tail, an existing
    /// one keeps its position
    pub fn update(&mut self, tp: PartitionId, state: PartitionFetchState) {
        match self.states.get_mut(&tp) {
            Some(slot) => slot.state = state,
            None => self.insert_at_tail(tp, state),
        }
    }

    /// Upsert and move the partition to the tail
    pub fn update_and_move_to_end(&mut self, tp: PartitionId, state: PartitionFetchState) {
        if let Some(slot) = self.states.remove(&tp) {
            self.order.remove(&slot.seq);
        }
        self.insert_at_tail(tp, state);
    }

    /// Idempotent removal
    pub fn remove(&mut self, tp: &PartitionId) -> Option<PartitionFetchState> {
        let slot = self.states.remove(tp)?;
        self.order.remove(&slot.seq);
        Some(slot.state)
    }

    /// Iterate in insertion-tail order
    pub fn iter(&self) -> impl Iterator<Item = (&PartitionId, &PartitionFetchState)> {
        self.order
            .values()
            .map(move |tp| (tp, &self.states[tp].state))
    }

    /// Partition ids in insertion-tail order
    pub fn partitions(&self) -> Vec<PartitionId> {
        self.order.values().cloned().collect()
    }

    /// Ordered snapshot of the whole table
    pub fn snapshot(&self) -> Vec<(PartitionId, PartitionFetchState)> {
        self.iter().map(|(tp, s)| (tp.clone(), s.clone())).collect()
    }

    /// Replace the backing map wholesale, rewriting each state through `f`
    /// while preserving order. Partitions are neither added nor removed.
    pub fn rebuild<F>(&mut self, mut f: F)
    where
        F: FnMut(&PartitionId, &PartitionFetchState) -> PartitionFetchState,
    {
        let mut next = HashMap::with_capacity(self.states.len());
        for (seq, tp) in &self.order {
            let state = f(tp, &self.states[tp].state);
            next.insert(tp.clone(), TableSlot { seq: *seq, state });
        }
        self.states = next;
    }

    fn insert_at_tail(&mut self, tp: PartitionId, state: PartitionFetchState) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, tp.clone());
        self.states.insert(tp, TableSlot { seq, state });
    }
}

/// Partitions the fetcher has given up on until they are re-added
///
/// Safe for concurrent reads; the manager inspects this set for status
/// queries while the event loop mutates it.
#[derive(Debug, Default)]
pub struct FailedPartitions {
    inner: DashSet<PartitionId>,
}

impl FailedPartitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tp: PartitionId) {
        self.inner.insert(tp);
    }

    pub fn remove(&self, tp: &PartitionId) {
        self.inner.remove(tp);
    }

    pub fn remove_all<'a>(&self, partitions: impl IntoIterator<Item = &'a PartitionId>) {
        for tp in partitions {
            self.inner.remove(tp);
        }
    }

    pub fn contains(&self, tp: &PartitionId) -> bool {
        self.inner.contains(tp)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn snapshot(&self) -> HashSet<PartitionId> {
        self.inner.iter().map(|tp| tp.key().clone()).collect()
    }
}
