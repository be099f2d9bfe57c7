//! The truncate → fetch → append state machine and its event loop
//!
//! [`FetcherCore`] owns all mutable fetch state for one
//! (source broker, fetcher id) pair and is driven by exactly one consumer
//! task draining a [`FetcherEventBus`]. Concurrency exists only *between*
//! fetchers; within a fetcher the model is single-threaded cooperative, so
//! none of the core's state needs locking. Do not parallelize partition
//! processing inside one fetcher: the stale-response and epoch-fencing
//! checks rely on nothing else mutating the table between an RPC and the
//! handling of its response.

use crate::config::FetcherConfig;
use crate::error::{ReplicationError, Result};
use crate::event::{FetcherEvent, FetcherEventBus, InitialFetchState};
use crate::leader::LeaderClient;
use crate::log::{LogAccessor, OffsetTruncationState};
use crate::observability::{FetcherLagRegistry, FetcherMetrics};
use crate::partition::{BrokerEndpoint, PartitionId};
use crate::protocol::{
    EpochData, EpochEndOffset, ErrorCode, FetchRequest, PartitionData, UNDEFINED_EPOCH,
    UNDEFINED_EPOCH_OFFSET,
};
use crate::state::{
    DelayedItem, FailedPartitions, FetchPhase, PartitionFetchState, PartitionStateTable,
};
use std::cmp;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Replication state machine for one (source broker, fetcher id) pair
pub struct FetcherCore {
    name: String,
    config: FetcherConfig,
    source: BrokerEndpoint,
    fetcher_id: u32,
    leader: Arc<dyn LeaderClient>,
    log: Arc<dyn LogAccessor>,
    bus: Arc<FetcherEventBus>,
    table: PartitionStateTable,
    failed: Arc<FailedPartitions>,
    lag: Arc<FetcherLagRegistry>,
    // Mirror of table.len() readable outside the event loop
    shared_count: Arc<AtomicUsize>,
}

impl FetcherCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FetcherConfig,
        source: BrokerEndpoint,
        fetcher_id: u32,
        leader: Arc<dyn LeaderClient>,
        log: Arc<dyn LogAccessor>,
        bus: Arc<FetcherEventBus>,
        failed: Arc<FailedPartitions>,
        lag: Arc<FetcherLagRegistry>,
    ) -> Self {
        let name = format!(
            "{}-fetcher-{}-to-broker-{}",
            config.client_id, fetcher_id, source.id
        );
        Self {
            name,
            config,
            source,
            fetcher_id,
            leader,
            log,
            bus,
            table: PartitionStateTable::new(),
            failed,
            lag,
            shared_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of partitions currently tracked
    pub fn partition_count(&self) -> usize {
        self.table.len()
    }

    /// Dispatch one event. Called only from the owning event loop.
    pub async fn process(&mut self, event: FetcherEvent) {
        self.dispatch(event).await;
        self.shared_count.store(self.table.len(), Ordering::Relaxed);
    }

    async fn dispatch(&mut self, event: FetcherEvent) {
        match event {
            FetcherEvent::ModifyPartitions {
                remove,
                add,
                completion,
            } => {
                self.remove_partitions(&remove);
                let filtered: HashMap<PartitionId, InitialFetchState> = add
                    .into_iter()
                    .filter(|(tp, init)| {
                        let ours = init.source_broker == self.source.id
                            && init.fetcher_id == self.fetcher_id;
                        if !ours {
                            debug!(
                                partition = %tp,
                                source_broker = init.source_broker,
                                fetcher_id = init.fetcher_id,
                                "ignoring add addressed to a different fetcher"
                            );
                        }
                        ours
                    })
                    .collect();
                let added = self.add_partitions(filtered).await;
                debug!(
                    fetcher = %self.name,
                    added = added.len(),
                    removed = remove.len(),
                    partitions = self.table.len(),
                    "applied partition modifications"
                );
                let _ = completion.send(self.table.len());
            }
            FetcherEvent::TruncateAndFetch => {
                if self.bus.is_closed() {
                    debug!(fetcher = %self.name, "skipping fetch cycle during shutdown");
                    return;
                }
                self.truncate_and_fetch().await;
            }
        }
    }

    /// One full cycle; always leaves exactly one pending `TruncateAndFetch`
    /// on the bus (immediate on progress, delayed on a no-op cycle)
    async fn truncate_and_fetch(&mut self) {
        self.maybe_truncate().await;
        let backoff = self.maybe_fetch().await;
        if backoff {
            self.bus
                .schedule(FetcherEvent::TruncateAndFetch, self.config.fetch_backoff);
        } else {
            self.bus.put(FetcherEvent::TruncateAndFetch);
        }
    }

    /// Install new partitions, deriving an initial offset from the leader
    /// when the assignment does not carry one. Returns the partitions now
    /// tracked because of this call.
    async fn add_partitions(
        &mut self,
        initial: HashMap<PartitionId, InitialFetchState>,
    ) -> HashSet<PartitionId> {
        let mut added = HashSet::new();
        for (tp, assignment) in initial {
            self.failed.remove(&tp);
            let init = assignment.init;
            if let Some(current) = self.table.get(&tp) {
                // An equal epoch means the assignment is not news and
                // re-truncating would discard progress; an older epoch is a
                // stale control event.
                if current.current_leader_epoch >= init.leader_epoch {
                    debug!(
                        partition = %tp,
                        epoch = init.leader_epoch,
                        current_epoch = current.current_leader_epoch,
                        "keeping existing fetch state for re-added partition"
                    );
                    added.insert(tp);
                    continue;
                }
            }
            let fetch_offset = if init.has_offset() {
                init.offset
            } else {
                match self.fetch_offset_and_truncate(&tp, init.leader_epoch).await {
                    Ok(offset) => offset,
                    Err(e) => {
                        warn!(
                            partition = %tp,
                            error = %e,
                            "failed to derive initial fetch offset; quarantining partition"
                        );
                        self.mark_partition_failed(&tp);
                        continue;
                    }
                }
            };
            self.table.update_and_move_to_end(
                tp.clone(),
                PartitionFetchState::truncating(fetch_offset, init.leader_epoch),
            );
            added.insert(tp);
        }
        added
    }

    /// Reconcile every partition still in the truncating phase
    async fn maybe_truncate(&mut self) {
        let (with_epochs, without_epochs) = self.truncating_partitions();
        if !with_epochs.is_empty() {
            self.truncate_to_epoch_end_offsets(with_epochs).await;
        }
        if !without_epochs.is_empty() {
            self.truncate_to_high_watermark(without_epochs).await;
        }
    }

    /// Split truncating partitions into those we can reconcile through the
    /// epoch protocol and those that fall back to the high watermark
    fn truncating_partitions(&self) -> (HashMap<PartitionId, EpochData>, Vec<PartitionId>) {
        let epochs_supported = self.leader.supports_epoch_end_offsets();
        let mut with_epochs = HashMap::new();
        let mut without_epochs = Vec::new();
        for (tp, state) in self.table.iter() {
            if !state.is_truncating() {
                continue;
            }
            match self.log.latest_epoch(tp) {
                Some(latest) if epochs_supported => {
                    with_epochs.insert(
                        tp.clone(),
                        EpochData {
                            leader_epoch: latest,
                            current_leader_epoch: state.current_leader_epoch,
                        },
                    );
                }
                _ => without_epochs.push(tp.clone()),
            }
        }
        (with_epochs, without_epochs)
    }

    async fn truncate_to_epoch_end_offsets(&mut self, requested: HashMap<PartitionId, EpochData>) {
        let responses = match self.leader.fetch_epoch_end_offsets(&requested).await {
            Ok(responses) => responses,
            Err(e) => {
                warn!(
                    fetcher = %self.name,
                    error = %e,
                    "epoch end offset request failed; backing off truncating partitions"
                );
                let retry: Vec<PartitionId> = requested.keys().cloned().collect();
                self.delay_partitions(retry.iter(), self.config.fetch_backoff);
                return;
            }
        };

        let mut fetch_offsets = HashMap::new();
        let mut partitions_with_error = HashSet::new();
        for (tp, leader_epoch_offset) in responses {
            let Some(epoch_data) = requested.get(&tp) else {
                debug!(partition = %tp, "dropping unsolicited epoch end offset");
                continue;
            };
            // The partition may have been removed or its epoch bumped by a
            // control event while the request was outstanding; such
            // responses must not be applied and the partition is retried.
            let Some(current) = self.table.get(&tp).cloned() else {
                continue;
            };
            if current.current_leader_epoch != epoch_data.current_leader_epoch {
                debug!(
                    partition = %tp,
                    requested_epoch = epoch_data.current_leader_epoch,
                    current_epoch = current.current_leader_epoch,
                    "leader epoch changed while epoch request was in flight"
                );
                continue;
            }
            match leader_epoch_offset.error {
                ErrorCode::None => {
                    let truncation =
                        self.offset_truncation_state(&tp, &current, &leader_epoch_offset);
                    match self.log.truncate(&tp, &truncation).await {
                        Ok(()) => {
                            info!(
                                partition = %tp,
                                truncation = %truncation,
                                "truncated to leader epoch end offset"
                            );
                            fetch_offsets.insert(tp, truncation);
                        }
                        Err(e) => {
                            error!(partition = %tp, error = %e, "truncation failed");
                            self.mark_partition_failed(&tp);
                        }
                    }
                }
                ErrorCode::FencedLeaderEpoch => {
                    if self.on_partition_fenced(&tp, Some(epoch_data.current_leader_epoch)) {
                        partitions_with_error.insert(tp);
                    }
                }
                code => {
                    warn!(
                        partition = %tp,
                        code = ?code,
                        "error resolving leader epoch end offset"
                    );
                    partitions_with_error.insert(tp);
                }
            }
        }
        self.update_fetch_offset_and_maybe_mark_truncation_complete(fetch_offsets);
        self.delay_partitions(partitions_with_error.iter(), self.config.fetch_backoff);
    }

    /// Divergence policy: where to cut the local log given the leader's
    /// answer for our latest epoch, and whether that decision is final
    fn offset_truncation_state(
        &self,
        tp: &PartitionId,
        state: &PartitionFetchState,
        leader_epoch_offset: &EpochEndOffset,
    ) -> OffsetTruncationState {
        if leader_epoch_offset.end_offset == UNDEFINED_EPOCH_OFFSET {
            // Leader could not resolve an end offset; fall back to the
            // follower's last committed checkpoint.
            warn!(
                partition = %tp,
                fetch_offset = state.fetch_offset,
                "leader returned no epoch end offset; truncating to current fetch offset"
            );
            OffsetTruncationState {
                offset: state.fetch_offset,
                truncation_completed: true,
            }
        } else if leader_epoch_offset.leader_epoch == UNDEFINED_EPOCH {
            // Pre-epoch peer: it answered with its log end offset only
            OffsetTruncationState {
                offset: cmp::min(leader_epoch_offset.end_offset, self.log.log_end_offset(tp)),
                truncation_completed: true,
            }
        } else {
            let replica_end_offset = self.log.log_end_offset(tp);
            match self
                .log
                .end_offset_for_epoch(tp, leader_epoch_offset.leader_epoch)
            {
                Some(follower) if follower.leader_epoch == leader_epoch_offset.leader_epoch => {
                    OffsetTruncationState {
                        offset: follower
                            .offset
                            .min(leader_epoch_offset.end_offset)
                            .min(replica_end_offset),
                        truncation_completed: true,
                    }
                }
                Some(follower) => {
                    // Our epoch cache answered for an older epoch; truncate
                    // conservatively and ask again next cycle.
                    info!(
                        partition = %tp,
                        leader_epoch = leader_epoch_offset.leader_epoch,
                        follower_epoch = follower.leader_epoch,
                        "follower epoch differs from leader epoch; truncation needs another round"
                    );
                    OffsetTruncationState {
                        offset: follower.offset.min(replica_end_offset),
                        truncation_completed: false,
                    }
                }
                None => OffsetTruncationState {
                    offset: leader_epoch_offset.end_offset.min(replica_end_offset),
                    truncation_completed: true,
                },
            }
        }
    }

    /// Truncate partitions whose peer cannot answer epoch queries to the
    /// locally known safe checkpoint
    async fn truncate_to_high_watermark(&mut self, partitions: Vec<PartitionId>) {
        let mut fetch_offsets = HashMap::new();
        for tp in partitions {
            let Some(state) = self.table.get(&tp).cloned() else {
                continue;
            };
            let truncation = OffsetTruncationState {
                offset: state.fetch_offset,
                truncation_completed: true,
            };
            match self.log.truncate(&tp, &truncation).await {
                Ok(()) => {
                    info!(
                        partition = %tp,
                        offset = truncation.offset,
                        "truncated to local high watermark"
                    );
                    fetch_offsets.insert(tp, truncation);
                }
                Err(e) => {
                    error!(partition = %tp, error = %e, "truncation failed");
                    self.mark_partition_failed(&tp);
                }
            }
        }
        self.update_fetch_offset_and_maybe_mark_truncation_complete(fetch_offsets);
    }

    /// Rewrite the table with decided truncation offsets; partitions whose
    /// truncation completed move to the fetching phase. The backing map is
    /// replaced wholesale so the change lands as one unit.
    fn update_fetch_offset_and_maybe_mark_truncation_complete(
        &mut self,
        fetch_offsets: HashMap<PartitionId, OffsetTruncationState>,
    ) {
        if fetch_offsets.is_empty() {
            return;
        }
        self.table.rebuild(|tp, state| match fetch_offsets.get(tp) {
            Some(truncation) => PartitionFetchState {
                fetch_offset: truncation.offset,
                current_leader_epoch: state.current_leader_epoch,
                delay: state.delay,
                phase: if truncation.truncation_completed {
                    FetchPhase::Fetching
                } else {
                    FetchPhase::Truncating
                },
            },
            None => state.clone(),
        });
    }

    /// Build and issue at most one fetch. Returns whether the cycle was a
    /// no-op and the loop should back off before re-arming.
    async fn maybe_fetch(&mut self) -> bool {
        let snapshot = self.table.snapshot();
        let (request, build_errors) = self.log.build_fetch(&snapshot);
        if !build_errors.is_empty() {
            debug!(
                fetcher = %self.name,
                partitions = build_errors.len(),
                "backing off partitions with fetch build errors"
            );
            self.delay_partitions(build_errors.iter(), self.config.fetch_backoff);
        }
        match request {
            None => true,
            Some(request) if request.is_empty() => true,
            Some(request) => {
                let snapshot: HashMap<PartitionId, PartitionFetchState> =
                    snapshot.into_iter().collect();
                self.process_fetch_request(&snapshot, request).await
            }
        }
    }

    /// Issue the fetch and fold every partition's response into the table.
    /// `snapshot` is the table as of request build time; it is what detects
    /// responses made stale by concurrent control events.
    async fn process_fetch_request(
        &mut self,
        snapshot: &HashMap<PartitionId, PartitionFetchState>,
        request: FetchRequest,
    ) -> bool {
        let responses = match self.leader.fetch(&request).await {
            Ok(responses) => responses,
            Err(e) => {
                warn!(
                    fetcher = %self.name,
                    error = %e,
                    "fetch to leader failed; backing off all partitions"
                );
                FetcherMetrics::increment_request_failures(&self.config.client_id, &self.source);
                let all = self.table.partitions();
                self.delay_partitions(all.iter(), self.config.fetch_backoff);
                return true;
            }
        };
        FetcherMetrics::increment_requests(&self.config.client_id, &self.source);

        let mut partitions_with_error = HashSet::new();
        for (tp, data) in responses {
            let Some(current) = self.table.get(&tp).cloned() else {
                continue;
            };
            let Some(request_state) = snapshot.get(&tp) else {
                continue;
            };
            if request_state.fetch_offset != current.fetch_offset || !current.is_ready_for_fetch()
            {
                // Removed, re-added or truncated while the request was in
                // flight; the response no longer applies.
                debug!(partition = %tp, "dropping stale fetch response");
                continue;
            }
            let request_epoch = Some(request_state.current_leader_epoch);
            match data.error {
                ErrorCode::None => {
                    self.process_partition_data(&tp, &current, &data, &mut partitions_with_error)
                        .await
                }
                ErrorCode::OffsetOutOfRange => {
                    if self.handle_out_of_range(&tp, &current, request_epoch).await {
                        partitions_with_error.insert(tp);
                    }
                }
                ErrorCode::UnknownLeaderEpoch => {
                    debug!(
                        partition = %tp,
                        epoch = current.current_leader_epoch,
                        "leader does not know our epoch yet; retrying"
                    );
                    partitions_with_error.insert(tp);
                }
                ErrorCode::FencedLeaderEpoch => {
                    if self.on_partition_fenced(&tp, request_epoch) {
                        partitions_with_error.insert(tp);
                    }
                }
                ErrorCode::NotLeaderForPartition | ErrorCode::UnknownTopicOrPartition => {
                    info!(
                        partition = %tp,
                        code = ?data.error,
                        "partition ownership moved; retrying after backoff"
                    );
                    partitions_with_error.insert(tp);
                }
                code => {
                    error!(
                        partition = %tp,
                        code = ?code,
                        "unexpected error code in fetch response"
                    );
                    partitions_with_error.insert(tp);
                }
            }
        }
        self.delay_partitions(partitions_with_error.iter(), self.config.fetch_backoff);
        false
    }

    /// Append one partition's records and advance its fetch offset
    async fn process_partition_data(
        &mut self,
        tp: &PartitionId,
        current: &PartitionFetchState,
        data: &PartitionData,
        partitions_with_error: &mut HashSet<PartitionId>,
    ) {
        match self.log.append_fetched(tp, current.fetch_offset, data).await {
            Ok(Some(append)) => {
                let next_offset = if append.valid_bytes > 0 {
                    append.last_offset + 1
                } else {
                    current.fetch_offset
                };
                let lag = cmp::max(0, data.high_watermark - next_offset);
                self.lag.record(tp, lag);
                if append.valid_bytes > 0 && self.table.contains(tp) {
                    self.table.update_and_move_to_end(
                        tp.clone(),
                        PartitionFetchState::fetching(next_offset, current.current_leader_epoch),
                    );
                    FetcherMetrics::add_bytes(
                        &self.config.client_id,
                        &self.source,
                        append.valid_bytes as u64,
                    );
                }
            }
            Ok(None) => {}
            Err(ReplicationError::CorruptRecord(reason)) => {
                warn!(
                    partition = %tp,
                    offset = current.fetch_offset,
                    reason = %reason,
                    "corrupt records in fetch response; retrying"
                );
                partitions_with_error.insert(tp.clone());
            }
            Err(e) => {
                error!(
                    partition = %tp,
                    error = %e,
                    "error appending fetched records; quarantining partition"
                );
                self.mark_partition_failed(tp);
            }
        }
    }

    /// Out-of-range reconciliation. Returns whether to retry with backoff.
    async fn handle_out_of_range(
        &mut self,
        tp: &PartitionId,
        state: &PartitionFetchState,
        request_epoch: Option<i32>,
    ) -> bool {
        match self
            .fetch_offset_and_truncate(tp, state.current_leader_epoch)
            .await
        {
            Ok(new_offset) => {
                self.table.update_and_move_to_end(
                    tp.clone(),
                    PartitionFetchState::fetching(new_offset, state.current_leader_epoch),
                );
                info!(
                    partition = %tp,
                    old_offset = state.fetch_offset,
                    new_offset,
                    "reset fetch offset after out-of-range response"
                );
                false
            }
            Err(ReplicationError::FencedLeaderEpoch { .. }) => {
                self.on_partition_fenced(tp, request_epoch)
            }
            Err(
                e @ (ReplicationError::UnknownTopicOrPartition { .. }
                | ReplicationError::UnknownLeaderEpoch { .. }
                | ReplicationError::NotLeaderForPartition { .. }),
            ) => {
                info!(partition = %tp, error = %e, "could not reset out-of-range offset; retrying");
                true
            }
            Err(e) => {
                error!(partition = %tp, error = %e, "error resetting out-of-range offset; retrying");
                true
            }
        }
    }

    /// Derive a safe restart offset by comparing our log against the
    /// leader's bounds, truncating as needed
    async fn fetch_offset_and_truncate(
        &mut self,
        tp: &PartitionId,
        current_leader_epoch: i32,
    ) -> Result<i64> {
        let replica_end_offset = self.log.log_end_offset(tp);
        let leader_end_offset = self
            .leader
            .fetch_latest_offset(tp, current_leader_epoch)
            .await?;
        if leader_end_offset < replica_end_offset {
            // The leader holds less data than we do: an unclean election
            // promoted a lagging replica. Follow the new leader; the
            // divergent records are dropped, not re-replicated.
            warn!(
                partition = %tp,
                leader_end_offset,
                replica_end_offset,
                "leader's log ends below ours (possible unclean leader election); truncating to leader offset"
            );
            FetcherMetrics::increment_unclean_resets(&self.config.client_id);
            self.log
                .truncate(
                    tp,
                    &OffsetTruncationState {
                        offset: leader_end_offset,
                        truncation_completed: true,
                    },
                )
                .await?;
            Ok(leader_end_offset)
        } else {
            let leader_start_offset = self
                .leader
                .fetch_earliest_offset(tp, current_leader_epoch)
                .await?;
            if leader_start_offset > replica_end_offset {
                // Entirely behind the leader's retention window
                warn!(
                    partition = %tp,
                    leader_start_offset,
                    replica_end_offset,
                    "follower log is behind the leader's retention window; restarting at leader start offset"
                );
                self.log
                    .truncate_fully_and_start_at(tp, leader_start_offset)
                    .await?;
                Ok(leader_start_offset)
            } else {
                Ok(cmp::max(leader_start_offset, replica_end_offset))
            }
        }
    }

    /// Fencing policy. Returns whether the partition should be retried.
    fn on_partition_fenced(&mut self, tp: &PartitionId, request_epoch: Option<i32>) -> bool {
        let Some(state) = self.table.get(tp).cloned() else {
            return false;
        };
        let current_epoch = state.current_leader_epoch;
        if request_epoch == Some(current_epoch) {
            // The follower has no newer information; only a fresh control
            // event can unblock this partition.
            warn!(
                partition = %tp,
                epoch = current_epoch,
                "leader fenced our epoch and no newer epoch is known; quarantining partition"
            );
            self.mark_partition_failed(tp);
            false
        } else {
            debug!(
                partition = %tp,
                request_epoch = ?request_epoch,
                current_epoch,
                "fenced response for an epoch we already advanced past; retrying"
            );
            true
        }
    }

    /// Back off partitions after a retriable error; already-delayed
    /// partitions keep their earlier deadline
    fn delay_partitions<'a>(
        &mut self,
        partitions: impl IntoIterator<Item = &'a PartitionId>,
        delay: Duration,
    ) {
        for tp in partitions {
            let Some(state) = self.table.get(tp).cloned() else {
                continue;
            };
            if !state.is_delayed() {
                self.table
                    .update_and_move_to_end(tp.clone(), state.with_delay(DelayedItem::new(delay)));
            }
        }
    }

    /// Idempotent removal; also clears the partitions' lag gauges
    fn remove_partitions(&mut self, partitions: &HashSet<PartitionId>) {
        for tp in partitions {
            self.table.remove(tp);
            self.lag.remove(tp);
        }
    }

    /// Quarantine a partition until a control event re-adds it
    fn mark_partition_failed(&mut self, tp: &PartitionId) {
        self.table.remove(tp);
        self.lag.remove(tp);
        self.failed.insert(tp.clone());
        warn!(partition = %tp, fetcher = %self.name, "partition marked failed; awaiting re-add");
    }
}

/// Handle to a spawned fetcher: its bus, its consumer task and the shared
/// views the manager reads
pub struct ReplicaFetcher {
    name: String,
    source: BrokerEndpoint,
    bus: Arc<FetcherEventBus>,
    failed: Arc<FailedPartitions>,
    lag: Arc<FetcherLagRegistry>,
    partition_count: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl ReplicaFetcher {
    /// Spawn the single consumer task for a new fetcher. The loop idles
    /// until [`start`](ReplicaFetcher::start) arms the first cycle.
    pub fn spawn(
        config: FetcherConfig,
        source: BrokerEndpoint,
        fetcher_id: u32,
        leader: Arc<dyn LeaderClient>,
        log: Arc<dyn LogAccessor>,
    ) -> Self {
        let bus = Arc::new(FetcherEventBus::new());
        let failed = Arc::new(FailedPartitions::new());
        let lag = Arc::new(FetcherLagRegistry::new(config.client_id.clone()));
        let mut core = FetcherCore::new(
            config,
            source.clone(),
            fetcher_id,
            leader,
            log,
            bus.clone(),
            failed.clone(),
            lag.clone(),
        );
        let name = core.name.clone();
        let partition_count = core.shared_count.clone();
        let loop_bus = bus.clone();
        let loop_name = name.clone();
        let task = tokio::spawn(async move {
            debug!(fetcher = %loop_name, "fetcher event loop started");
            while let Some(event) = loop_bus.take().await {
                core.process(event).await;
            }
            debug!(fetcher = %loop_name, "fetcher event loop exited");
        });
        Self {
            name,
            source,
            bus,
            failed,
            lag,
            partition_count,
            task,
        }
    }

    /// Arm the self-rearming truncate/fetch cycle
    pub fn start(&self) {
        self.bus.put(FetcherEvent::TruncateAndFetch);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &BrokerEndpoint {
        &self.source
    }

    /// Post a partition modification; the returned receiver yields the
    /// fetcher's partition count once the change is applied
    pub fn submit_modify(
        &self,
        remove: HashSet<PartitionId>,
        add: HashMap<PartitionId, InitialFetchState>,
    ) -> oneshot::Receiver<usize> {
        let (completion, receiver) = oneshot::channel();
        self.bus.put(FetcherEvent::ModifyPartitions {
            remove,
            add,
            completion,
        });
        receiver
    }

    /// Apply a partition modification and wait for it. Returns the
    /// resulting partition count (0 if the fetcher is already gone).
    pub async fn modify_partitions(
        &self,
        remove: HashSet<PartitionId>,
        add: HashMap<PartitionId, InitialFetchState>,
    ) -> usize {
        self.submit_modify(remove, add).await.unwrap_or(0)
    }

    /// Partitions this fetcher has quarantined
    pub fn failed_partitions(&self) -> HashSet<PartitionId> {
        self.failed.snapshot()
    }

    /// Partition count as of the last processed event
    pub fn partition_count(&self) -> usize {
        self.partition_count.load(Ordering::Relaxed)
    }

    /// Worst replication lag across this fetcher's partitions
    pub fn max_lag(&self) -> i64 {
        self.lag.max_lag()
    }

    /// Current lag for one partition, if tracked
    pub fn lag(&self, tp: &PartitionId) -> Option<i64> {
        self.lag.get(tp)
    }

    /// Cooperative shutdown: stop accepting events, let queued control
    /// events drain, join the consumer task
    pub async fn shutdown(self) {
        self.bus.close();
        match self.task.await {
            Ok(()) => info!(fetcher = %self.name, "fetcher shut down"),
            Err(e) => error!(fetcher = %self.name, error = %e, "fetcher task terminated abnormally"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogAppendInfo;
    use crate::partition::OffsetAndEpoch;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn tp(name: &str) -> PartitionId {
        PartitionId::new(name, 0)
    }

    fn assignment(offset: i64, epoch: i32) -> InitialFetchState {
        InitialFetchState {
            source_broker: 1,
            fetcher_id: 0,
            init: OffsetAndEpoch::new(offset, epoch),
        }
    }

    struct FakeLeader {
        endpoint: BrokerEndpoint,
        no_epoch_support: bool,
        epoch_end_offsets: Mutex<HashMap<PartitionId, EpochEndOffset>>,
        fetch_response: Mutex<Vec<(PartitionId, PartitionData)>>,
        fail_fetch: AtomicBool,
        latest_offsets: Mutex<HashMap<PartitionId, i64>>,
        earliest_offsets: Mutex<HashMap<PartitionId, i64>>,
        fenced: Mutex<HashSet<PartitionId>>,
        latest_offset_calls: AtomicUsize,
    }

    impl FakeLeader {
        fn new() -> Self {
            Self {
                endpoint: BrokerEndpoint::new(1, "localhost", 9092),
                no_epoch_support: false,
                epoch_end_offsets: Mutex::new(HashMap::new()),
                fetch_response: Mutex::new(Vec::new()),
                fail_fetch: AtomicBool::new(false),
                latest_offsets: Mutex::new(HashMap::new()),
                earliest_offsets: Mutex::new(HashMap::new()),
                fenced: Mutex::new(HashSet::new()),
                latest_offset_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LeaderClient for FakeLeader {
        async fn fetch(
            &self,
            _request: &FetchRequest,
        ) -> Result<Vec<(PartitionId, PartitionData)>> {
            if self.fail_fetch.load(Ordering::Relaxed) {
                return Err(ReplicationError::Transport("injected fetch failure".into()));
            }
            Ok(self.fetch_response.lock().clone())
        }

        async fn fetch_epoch_end_offsets(
            &self,
            partitions: &HashMap<PartitionId, EpochData>,
        ) -> Result<HashMap<PartitionId, EpochEndOffset>> {
            let scripted = self.epoch_end_offsets.lock();
            Ok(partitions
                .keys()
                .filter_map(|tp| scripted.get(tp).map(|resp| (tp.clone(), *resp)))
                .collect())
        }

        async fn fetch_latest_offset(
            &self,
            tp: &PartitionId,
            current_leader_epoch: i32,
        ) -> Result<i64> {
            self.latest_offset_calls.fetch_add(1, Ordering::Relaxed);
            if self.fenced.lock().contains(tp) {
                return Err(ReplicationError::FencedLeaderEpoch {
                    partition: tp.clone(),
                    requested_epoch: current_leader_epoch,
                });
            }
            self.latest_offsets
                .lock()
                .get(tp)
                .copied()
                .ok_or_else(|| ReplicationError::UnknownTopicOrPartition {
                    partition: tp.clone(),
                })
        }

        async fn fetch_earliest_offset(
            &self,
            tp: &PartitionId,
            current_leader_epoch: i32,
        ) -> Result<i64> {
            if self.fenced.lock().contains(tp) {
                return Err(ReplicationError::FencedLeaderEpoch {
                    partition: tp.clone(),
                    requested_epoch: current_leader_epoch,
                });
            }
            self.earliest_offsets
                .lock()
                .get(tp)
                .copied()
                .ok_or_else(|| ReplicationError::UnknownTopicOrPartition {
                    partition: tp.clone(),
                })
        }

        fn supports_epoch_end_offsets(&self) -> bool {
            !self.no_epoch_support
        }

        fn endpoint(&self) -> &BrokerEndpoint {
            &self.endpoint
        }
    }

    #[derive(Default)]
    struct FakeLog {
        end_offsets: Mutex<HashMap<PartitionId, i64>>,
        latest_epochs: Mutex<HashMap<PartitionId, i32>>,
        epoch_cache: Mutex<HashMap<(PartitionId, i32), OffsetAndEpoch>>,
        appends: Mutex<HashMap<PartitionId, LogAppendInfo>>,
        corrupt: Mutex<HashSet<PartitionId>>,
        storage_fail: Mutex<HashSet<PartitionId>>,
        truncations: Mutex<Vec<(PartitionId, OffsetTruncationState)>>,
        full_truncations: Mutex<Vec<(PartitionId, i64)>>,
        build_errors: Mutex<Vec<PartitionId>>,
    }

    #[async_trait]
    impl LogAccessor for FakeLog {
        async fn append_fetched(
            &self,
            tp: &PartitionId,
            _fetch_offset: i64,
            _data: &PartitionData,
        ) -> Result<Option<LogAppendInfo>> {
            if self.corrupt.lock().contains(tp) {
                return Err(ReplicationError::CorruptRecord("crc mismatch".into()));
            }
            if self.storage_fail.lock().contains(tp) {
                return Err(ReplicationError::Storage("append io error".into()));
            }
            Ok(self.appends.lock().get(tp).copied())
        }

        async fn truncate(
            &self,
            tp: &PartitionId,
            truncation: &OffsetTruncationState,
        ) -> Result<()> {
            self.truncations.lock().push((tp.clone(), *truncation));
            Ok(())
        }

        async fn truncate_fully_and_start_at(&self, tp: &PartitionId, offset: i64) -> Result<()> {
            self.full_truncations.lock().push((tp.clone(), offset));
            self.end_offsets.lock().insert(tp.clone(), offset);
            Ok(())
        }

        fn latest_epoch(&self, tp: &PartitionId) -> Option<i32> {
            self.latest_epochs.lock().get(tp).copied()
        }

        fn log_end_offset(&self, tp: &PartitionId) -> i64 {
            self.end_offsets.lock().get(tp).copied().unwrap_or(0)
        }

        fn end_offset_for_epoch(
            &self,
            tp: &PartitionId,
            leader_epoch: i32,
        ) -> Option<OffsetAndEpoch> {
            self.epoch_cache.lock().get(&(tp.clone(), leader_epoch)).copied()
        }

        fn build_fetch(
            &self,
            states: &[(PartitionId, PartitionFetchState)],
        ) -> (Option<FetchRequest>, Vec<PartitionId>) {
            let errors = self.build_errors.lock().clone();
            let partitions: Vec<_> = states
                .iter()
                .filter(|(tp, state)| state.is_ready_for_fetch() && !errors.contains(tp))
                .map(|(tp, state)| {
                    (
                        tp.clone(),
                        crate::protocol::FetchPartition {
                            fetch_offset: state.fetch_offset,
                            current_leader_epoch: state.current_leader_epoch,
                            max_bytes: 1024 * 1024,
                        },
                    )
                })
                .collect();
            let request = if partitions.is_empty() {
                None
            } else {
                Some(FetchRequest { partitions })
            };
            (request, errors)
        }
    }

    fn test_core(leader: Arc<FakeLeader>, log: Arc<FakeLog>) -> FetcherCore {
        let config = FetcherConfig {
            client_id: "test-fetcher".to_string(),
            fetch_backoff: Duration::from_millis(100),
        };
        FetcherCore::new(
            config,
            BrokerEndpoint::new(1, "localhost", 9092),
            0,
            leader,
            log,
            Arc::new(FetcherEventBus::new()),
            Arc::new(FailedPartitions::new()),
            Arc::new(FetcherLagRegistry::new("test-fetcher")),
        )
    }

    #[tokio::test]
    async fn test_add_partitions_starts_truncating() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        let mut core = test_core(leader, log);

        let added = core
            .add_partitions(HashMap::from([(tp("a"), assignment(100, 5))]))
            .await;

        assert_eq!(added, HashSet::from([tp("a")]));
        let state = core.table.get(&tp("a")).unwrap();
        assert!(state.is_truncating());
        assert_eq!(state.fetch_offset, 100);
        assert_eq!(state.current_leader_epoch, 5);
    }

    #[tokio::test]
    async fn test_add_with_same_epoch_keeps_state() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        let mut core = test_core(leader, log);

        core.table
            .update(tp("a"), PartitionFetchState::fetching(250, 5));
        core.add_partitions(HashMap::from([(tp("a"), assignment(100, 5))]))
            .await;

        // Progress at epoch 5 is preserved; no re-truncation
        let state = core.table.get(&tp("a")).unwrap();
        assert_eq!(state.fetch_offset, 250);
        assert!(state.is_ready_for_fetch());
    }

    #[tokio::test]
    async fn test_add_with_newer_epoch_restarts_truncation() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        let mut core = test_core(leader, log);

        core.table
            .update(tp("a"), PartitionFetchState::fetching(250, 5));
        core.add_partitions(HashMap::from([(tp("a"), assignment(300, 6))]))
            .await;

        let state = core.table.get(&tp("a")).unwrap();
        assert_eq!(state.current_leader_epoch, 6);
        assert_eq!(state.fetch_offset, 300);
        assert!(state.is_truncating());
    }

    #[tokio::test]
    async fn test_add_without_offset_bootstraps_from_leader() {
        // B1: a negative initial offset derives the start position from the
        // leader exactly once before insertion
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader.latest_offsets.lock().insert(tp("a"), 1000);
        leader.earliest_offsets.lock().insert(tp("a"), 200);
        let mut core = test_core(leader.clone(), log.clone());

        core.add_partitions(HashMap::from([(tp("a"), assignment(-1, 4))]))
            .await;

        // replica LEO 0 is behind the leader's start offset 200
        assert_eq!(*log.full_truncations.lock(), vec![(tp("a"), 200)]);
        let state = core.table.get(&tp("a")).unwrap();
        assert_eq!(state.fetch_offset, 200);
        assert!(state.is_truncating());
        assert_eq!(leader.latest_offset_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_add_clears_failed_mark() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        let mut core = test_core(leader, log);

        core.failed.insert(tp("a"));
        core.add_partitions(HashMap::from([(tp("a"), assignment(10, 1))]))
            .await;

        assert!(!core.failed.contains(&tp("a")));
        assert!(core.table.contains(&tp("a")));
    }

    #[tokio::test]
    async fn test_truncate_to_matching_epoch_end_offset() {
        // Scenario 1, first half: truncate to
        // min(follower end, leader end, replica LEO) and start fetching
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader
            .epoch_end_offsets
            .lock()
            .insert(tp("t0"), EpochEndOffset::new(5, 120));
        log.latest_epochs.lock().insert(tp("t0"), 5);
        log.end_offsets.lock().insert(tp("t0"), 150);
        log.epoch_cache
            .lock()
            .insert((tp("t0"), 5), OffsetAndEpoch::new(150, 5));
        let mut core = test_core(leader, log.clone());

        core.add_partitions(HashMap::from([(tp("t0"), assignment(100, 5))]))
            .await;
        core.maybe_truncate().await;

        assert_eq!(
            *log.truncations.lock(),
            vec![(
                tp("t0"),
                OffsetTruncationState {
                    offset: 120,
                    truncation_completed: true
                }
            )]
        );
        let state = core.table.get(&tp("t0")).unwrap();
        assert_eq!(state.fetch_offset, 120);
        assert!(state.is_ready_for_fetch());
    }

    #[tokio::test]
    async fn test_truncate_undefined_end_offset_uses_fetch_offset() {
        // B2: an undefined end offset truncates to the partition's current
        // fetch offset and completes
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader.epoch_end_offsets.lock().insert(
            tp("a"),
            EpochEndOffset {
                error: ErrorCode::None,
                leader_epoch: 5,
                end_offset: UNDEFINED_EPOCH_OFFSET,
            },
        );
        log.latest_epochs.lock().insert(tp("a"), 5);
        let mut core = test_core(leader, log.clone());

        core.add_partitions(HashMap::from([(tp("a"), assignment(100, 5))]))
            .await;
        core.maybe_truncate().await;

        assert_eq!(
            *log.truncations.lock(),
            vec![(
                tp("a"),
                OffsetTruncationState {
                    offset: 100,
                    truncation_completed: true
                }
            )]
        );
        assert!(core.table.get(&tp("a")).unwrap().is_ready_for_fetch());
    }

    #[tokio::test]
    async fn test_truncate_pre_epoch_peer_uses_min_of_leo() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader.epoch_end_offsets.lock().insert(
            tp("a"),
            EpochEndOffset {
                error: ErrorCode::None,
                leader_epoch: UNDEFINED_EPOCH,
                end_offset: 80,
            },
        );
        log.latest_epochs.lock().insert(tp("a"), 5);
        log.end_offsets.lock().insert(tp("a"), 60);
        let mut core = test_core(leader, log.clone());

        core.add_partitions(HashMap::from([(tp("a"), assignment(100, 5))]))
            .await;
        core.maybe_truncate().await;

        assert_eq!(
            *log.truncations.lock(),
            vec![(
                tp("a"),
                OffsetTruncationState {
                    offset: 60,
                    truncation_completed: true
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_truncate_epoch_mismatch_needs_another_round() {
        // Follower's cache answers for an older epoch: truncate
        // conservatively and stay in the truncating phase
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader
            .epoch_end_offsets
            .lock()
            .insert(tp("a"), EpochEndOffset::new(5, 120));
        log.latest_epochs.lock().insert(tp("a"), 5);
        log.end_offsets.lock().insert(tp("a"), 150);
        log.epoch_cache
            .lock()
            .insert((tp("a"), 5), OffsetAndEpoch::new(130, 3));
        let mut core = test_core(leader, log.clone());

        core.add_partitions(HashMap::from([(tp("a"), assignment(100, 5))]))
            .await;
        core.maybe_truncate().await;

        assert_eq!(
            *log.truncations.lock(),
            vec![(
                tp("a"),
                OffsetTruncationState {
                    offset: 130,
                    truncation_completed: false
                }
            )]
        );
        let state = core.table.get(&tp("a")).unwrap();
        assert_eq!(state.fetch_offset, 130);
        assert!(state.is_truncating());
    }

    #[tokio::test]
    async fn test_truncate_without_follower_epoch_uses_leader_end() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader
            .epoch_end_offsets
            .lock()
            .insert(tp("a"), EpochEndOffset::new(5, 120));
        log.latest_epochs.lock().insert(tp("a"), 5);
        log.end_offsets.lock().insert(tp("a"), 150);
        // epoch cache has no answer for epoch 5
        let mut core = test_core(leader, log.clone());

        core.add_partitions(HashMap::from([(tp("a"), assignment(100, 5))]))
            .await;
        core.maybe_truncate().await;

        assert_eq!(
            *log.truncations.lock(),
            vec![(
                tp("a"),
                OffsetTruncationState {
                    offset: 120,
                    truncation_completed: true
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_truncate_to_high_watermark_without_epoch_support() {
        let leader = Arc::new(FakeLeader {
            no_epoch_support: true,
            ..FakeLeader::new()
        });
        let log = Arc::new(FakeLog::default());
        log.latest_epochs.lock().insert(tp("a"), 5);
        let mut core = test_core(leader, log.clone());

        core.add_partitions(HashMap::from([(tp("a"), assignment(100, 5))]))
            .await;
        core.maybe_truncate().await;

        assert_eq!(
            *log.truncations.lock(),
            vec![(
                tp("a"),
                OffsetTruncationState {
                    offset: 100,
                    truncation_completed: true
                }
            )]
        );
        assert!(core.table.get(&tp("a")).unwrap().is_ready_for_fetch());
    }

    #[tokio::test]
    async fn test_epoch_response_dropped_when_epoch_changed() {
        // The partition's epoch was bumped by a control event while the
        // epoch request was in flight; the response must not be applied
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader
            .epoch_end_offsets
            .lock()
            .insert(tp("a"), EpochEndOffset::new(7, 120));
        let mut core = test_core(leader, log.clone());

        core.table
            .update(tp("a"), PartitionFetchState::truncating(100, 8));
        let requested = HashMap::from([(
            tp("a"),
            EpochData {
                leader_epoch: 7,
                current_leader_epoch: 7,
            },
        )]);
        core.truncate_to_epoch_end_offsets(requested).await;

        assert!(log.truncations.lock().is_empty());
        let state = core.table.get(&tp("a")).unwrap();
        assert_eq!(state.fetch_offset, 100);
        assert!(state.is_truncating());
    }

    #[tokio::test]
    async fn test_fenced_epoch_response_quarantines_partition() {
        // Fenced with no newer epoch known: only a fresh control event can
        // unblock the partition
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader
            .epoch_end_offsets
            .lock()
            .insert(tp("a"), EpochEndOffset::error(ErrorCode::FencedLeaderEpoch));
        log.latest_epochs.lock().insert(tp("a"), 7);
        let mut core = test_core(leader, log);

        core.add_partitions(HashMap::from([(tp("a"), assignment(100, 7))]))
            .await;
        core.maybe_truncate().await;

        assert!(!core.table.contains(&tp("a")));
        assert!(core.failed.contains(&tp("a")));
    }

    #[tokio::test]
    async fn test_fenced_after_epoch_advanced_retries() {
        // Scenario 3: the fenced response refers to an epoch we already
        // advanced past; the partition stays and is retried
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        let mut core = test_core(leader, log);

        core.table
            .update(tp("t2"), PartitionFetchState::fetching(50, 8));
        let retry = core.on_partition_fenced(&tp("t2"), Some(7));

        assert!(retry);
        assert!(core.table.contains(&tp("t2")));
        assert!(!core.failed.contains(&tp("t2")));
    }

    #[tokio::test]
    async fn test_fenced_unknown_partition_is_ignored() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        let mut core = test_core(leader, log);

        assert!(!core.on_partition_fenced(&tp("gone"), Some(3)));
    }

    #[tokio::test]
    async fn test_fetch_appends_and_advances_offset() {
        // Scenario 1, second half: valid bytes advance the offset and
        // update lag from the leader's high watermark
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader
            .fetch_response
            .lock()
            .push((tp("t0"), PartitionData::new(130, vec![1u8; 8])));
        log.appends.lock().insert(
            tp("t0"),
            LogAppendInfo {
                last_offset: 127,
                valid_bytes: 8,
            },
        );
        let mut core = test_core(leader, log);

        core.table
            .update(tp("t0"), PartitionFetchState::fetching(120, 5));
        let backoff = core.maybe_fetch().await;

        assert!(!backoff);
        let state = core.table.get(&tp("t0")).unwrap();
        assert_eq!(state.fetch_offset, 128);
        assert_eq!(state.current_leader_epoch, 5);
        assert!(state.is_ready_for_fetch());
        assert_eq!(core.lag.get(&tp("t0")), Some(2));
    }

    #[tokio::test]
    async fn test_empty_append_keeps_offset() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader
            .fetch_response
            .lock()
            .push((tp("a"), PartitionData::new(120, Vec::new())));
        log.appends.lock().insert(
            tp("a"),
            LogAppendInfo {
                last_offset: 119,
                valid_bytes: 0,
            },
        );
        let mut core = test_core(leader, log);

        core.table
            .update(tp("a"), PartitionFetchState::fetching(120, 5));
        core.maybe_fetch().await;

        let state = core.table.get(&tp("a")).unwrap();
        assert_eq!(state.fetch_offset, 120);
        assert_eq!(core.lag.get(&tp("a")), Some(0));
    }

    #[tokio::test]
    async fn test_stale_fetch_response_is_dropped() {
        // B4: the partition was re-added at a different offset between
        // request and response; the response is discarded
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader
            .fetch_response
            .lock()
            .push((tp("a"), PartitionData::new(500, vec![1u8; 8])));
        log.appends.lock().insert(
            tp("a"),
            LogAppendInfo {
                last_offset: 127,
                valid_bytes: 8,
            },
        );
        let mut core = test_core(leader, log);

        core.table
            .update(tp("a"), PartitionFetchState::fetching(120, 5));
        let snapshot = HashMap::from([(tp("a"), PartitionFetchState::fetching(90, 5))]);
        let (request, _) = core.log.build_fetch(&core.table.snapshot());

        core.process_fetch_request(&snapshot, request.unwrap()).await;

        // No state change: snapshot offset 90 != current offset 120
        let state = core.table.get(&tp("a")).unwrap();
        assert_eq!(state.fetch_offset, 120);
        assert_eq!(core.lag.get(&tp("a")), None);
    }

    #[tokio::test]
    async fn test_out_of_range_resets_to_leader_start() {
        // Scenario 4: follower entirely behind the retention window
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader
            .fetch_response
            .lock()
            .push((tp("t3"), PartitionData::error(ErrorCode::OffsetOutOfRange)));
        leader.latest_offsets.lock().insert(tp("t3"), 1000);
        leader.earliest_offsets.lock().insert(tp("t3"), 200);
        log.end_offsets.lock().insert(tp("t3"), 50);
        let mut core = test_core(leader, log.clone());

        core.table
            .update(tp("t3"), PartitionFetchState::fetching(50, 3));
        core.maybe_fetch().await;

        assert_eq!(*log.full_truncations.lock(), vec![(tp("t3"), 200)]);
        let state = core.table.get(&tp("t3")).unwrap();
        assert_eq!(state.fetch_offset, 200);
        assert!(state.is_ready_for_fetch());
        assert!(state.delay.is_none());
    }

    #[tokio::test]
    async fn test_unclean_leader_election_truncates_to_leader_end() {
        // Scenario 2 / B3: leader's log ends below ours; truncate to the
        // leader offset and resume there
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader.latest_offsets.lock().insert(tp("t1"), 400);
        log.end_offsets.lock().insert(tp("t1"), 500);
        let mut core = test_core(leader, log.clone());

        let offset = core.fetch_offset_and_truncate(&tp("t1"), 7).await.unwrap();

        assert_eq!(offset, 400);
        assert_eq!(
            *log.truncations.lock(),
            vec![(
                tp("t1"),
                OffsetTruncationState {
                    offset: 400,
                    truncation_completed: true
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_fetch_offset_within_leader_bounds_keeps_segments() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader.latest_offsets.lock().insert(tp("a"), 1000);
        leader.earliest_offsets.lock().insert(tp("a"), 100);
        log.end_offsets.lock().insert(tp("a"), 300);
        let mut core = test_core(leader, log.clone());

        let offset = core.fetch_offset_and_truncate(&tp("a"), 2).await.unwrap();

        assert_eq!(offset, 300);
        assert!(log.truncations.lock().is_empty());
        assert!(log.full_truncations.lock().is_empty());
    }

    #[tokio::test]
    async fn test_storage_error_quarantines_partition() {
        // P4: a failed partition leaves the table and enters the failed set
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader
            .fetch_response
            .lock()
            .push((tp("a"), PartitionData::new(100, vec![1u8; 4])));
        log.storage_fail.lock().insert(tp("a"));
        let mut core = test_core(leader, log);

        core.table
            .update(tp("a"), PartitionFetchState::fetching(10, 1));
        core.maybe_fetch().await;

        assert!(!core.table.contains(&tp("a")));
        assert!(core.failed.contains(&tp("a")));
    }

    #[tokio::test]
    async fn test_corrupt_records_delay_partition() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader
            .fetch_response
            .lock()
            .push((tp("a"), PartitionData::new(100, vec![1u8; 4])));
        log.corrupt.lock().insert(tp("a"));
        let mut core = test_core(leader, log);

        core.table
            .update(tp("a"), PartitionFetchState::fetching(10, 1));
        let backoff = core.maybe_fetch().await;

        assert!(!backoff);
        let state = core.table.get(&tp("a")).unwrap();
        assert!(state.is_delayed());
        assert!(core.table.contains(&tp("a")));
        assert!(!core.failed.contains(&tp("a")));
    }

    #[tokio::test]
    async fn test_fetch_failure_delays_all_partitions() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader.fail_fetch.store(true, Ordering::Relaxed);
        let mut core = test_core(leader, log);

        core.table
            .update(tp("a"), PartitionFetchState::fetching(10, 1));
        core.table
            .update(tp("b"), PartitionFetchState::fetching(20, 1));
        let backoff = core.maybe_fetch().await;

        assert!(backoff);
        assert!(core.table.get(&tp("a")).unwrap().is_delayed());
        assert!(core.table.get(&tp("b")).unwrap().is_delayed());
    }

    #[tokio::test]
    async fn test_cycle_rearms_immediately_on_progress() {
        // P1: after a cycle there is exactly one pending tick
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        leader
            .fetch_response
            .lock()
            .push((tp("a"), PartitionData::new(100, vec![1u8; 4])));
        log.appends.lock().insert(
            tp("a"),
            LogAppendInfo {
                last_offset: 10,
                valid_bytes: 4,
            },
        );
        let mut core = test_core(leader, log);

        core.table
            .update(tp("a"), PartitionFetchState::fetching(10, 1));
        core.process(FetcherEvent::TruncateAndFetch).await;

        assert_eq!(core.bus.ready_len(), 1);
        assert_eq!(core.bus.delayed_len(), 0);
    }

    #[tokio::test]
    async fn test_idle_cycle_rearms_with_backoff() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        let mut core = test_core(leader, log);

        core.process(FetcherEvent::TruncateAndFetch).await;

        assert_eq!(core.bus.ready_len(), 0);
        assert_eq!(core.bus.delayed_len(), 1);
    }

    #[tokio::test]
    async fn test_modify_partitions_filters_wrong_destination() {
        // Scenario 5: adds addressed to another fetcher are ignored
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        let mut core = test_core(leader, log);

        core.table
            .update(tp("a"), PartitionFetchState::fetching(10, 1));
        core.table
            .update(tp("b"), PartitionFetchState::fetching(20, 1));

        let (completion, receiver) = oneshot::channel();
        let wrong_destination = InitialFetchState {
            source_broker: 1,
            fetcher_id: 9,
            init: OffsetAndEpoch::new(0, 1),
        };
        core.process(FetcherEvent::ModifyPartitions {
            remove: HashSet::from([tp("a")]),
            add: HashMap::from([
                (tp("c"), assignment(5, 1)),
                (tp("d"), wrong_destination),
            ]),
            completion,
        })
        .await;

        assert_eq!(receiver.await.unwrap(), 2);
        assert!(!core.table.contains(&tp("a")));
        assert!(core.table.contains(&tp("b")));
        assert!(core.table.get(&tp("c")).unwrap().is_truncating());
        assert!(!core.table.contains(&tp("d")));
    }

    #[tokio::test]
    async fn test_add_then_remove_roundtrip() {
        // P5: the table size is unchanged from before the pair of calls
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        let mut core = test_core(leader, log);

        core.table
            .update(tp("existing"), PartitionFetchState::fetching(10, 1));
        let before = core.table.len();

        core.add_partitions(HashMap::from([(tp("x"), assignment(0, 1))]))
            .await;
        core.remove_partitions(&HashSet::from([tp("x")]));

        assert_eq!(core.table.len(), before);
    }

    #[tokio::test]
    async fn test_remove_partitions_is_idempotent_and_clears_lag() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        let mut core = test_core(leader, log);

        core.table
            .update(tp("a"), PartitionFetchState::fetching(10, 1));
        core.lag.record(&tp("a"), 7);

        core.remove_partitions(&HashSet::from([tp("a")]));
        core.remove_partitions(&HashSet::from([tp("a")]));

        assert!(core.table.is_empty());
        assert_eq!(core.lag.get(&tp("a")), None);
    }

    #[tokio::test]
    async fn test_build_errors_are_backed_off() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        log.build_errors.lock().push(tp("bad"));
        let mut core = test_core(leader, log);

        core.table
            .update(tp("bad"), PartitionFetchState::fetching(10, 1));
        let backoff = core.maybe_fetch().await;

        assert!(backoff);
        assert!(core.table.get(&tp("bad")).unwrap().is_delayed());
    }

    #[tokio::test]
    async fn test_delayed_partition_not_fetched() {
        let leader = Arc::new(FakeLeader::new());
        let log = Arc::new(FakeLog::default());
        let mut core = test_core(leader, log);

        core.table.update(
            tp("a"),
            PartitionFetchState::fetching(10, 1)
                .with_delay(DelayedItem::new(Duration::from_secs(60))),
        );
        let backoff = core.maybe_fetch().await;

        // Nothing eligible: the cycle is a no-op
        assert!(backoff);
    }
}
