//! Fetcher pool management
//!
//! The manager owns one [`ReplicaFetcher`] per (source broker, fetcher id)
//! pair, hashes partitions onto fetcher ids, and turns cluster-level
//! partition-assignment deltas into per-fetcher control events. It never
//! touches fetch state directly: every mutation travels through a fetcher's
//! event bus.

use crate::config::ManagerConfig;
use crate::error::Result;
use crate::event::InitialFetchState;
use crate::fetcher::ReplicaFetcher;
use crate::leader::LeaderClientProvider;
use crate::log::LogAccessor;
use crate::partition::{BrokerEndpoint, OffsetAndEpoch, PartitionId};
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, info};

/// Identity of one fetcher within the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetcherKey {
    pub source_broker: u32,
    pub fetcher_id: u32,
}

/// A partition this broker should replicate, and from where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerAssignment {
    /// Leader's endpoint
    pub source: BrokerEndpoint,
    /// Starting offset and epoch; a negative offset means "derive one from
    /// the leader"
    pub init: OffsetAndEpoch,
}

/// One batch of partition-assignment changes from the controller
#[derive(Debug, Clone, Default)]
pub struct PartitionModifications {
    /// Partitions this broker no longer replicates
    pub to_remove: HashSet<PartitionId>,
    /// Partitions this broker now follows
    pub to_make_follower: HashMap<PartitionId, FollowerAssignment>,
}

/// Map from (source broker, fetcher id) to a running fetcher
pub struct FetcherManager {
    config: ManagerConfig,
    log: Arc<dyn LogAccessor>,
    clients: Arc<dyn LeaderClientProvider>,
    fetchers: DashMap<FetcherKey, ReplicaFetcher>,
}

impl FetcherManager {
    pub fn new(
        config: ManagerConfig,
        log: Arc<dyn LogAccessor>,
        clients: Arc<dyn LeaderClientProvider>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            log,
            clients,
            fetchers: DashMap::new(),
        })
    }

    /// Fetcher index a partition hashes onto; stable for a given pool size
    pub fn fetcher_id(&self, tp: &PartitionId) -> u32 {
        let mut hasher = DefaultHasher::new();
        tp.hash(&mut hasher);
        (hasher.finish() % u64::from(self.config.num_fetchers)) as u32
    }

    /// Apply one batch of assignment changes and reap empty fetchers.
    ///
    /// Adds are grouped by destination fetcher; missing fetchers are
    /// created and armed. Removals go to every live fetcher so a partition
    /// that moved between fetchers leaves its old owner. Waits until every
    /// fetcher has applied its control event, then shuts down fetchers left
    /// with no partitions.
    pub async fn modify_partitions_and_shutdown_idle_fetchers(
        &self,
        mods: PartitionModifications,
    ) {
        let mut grouped: HashMap<FetcherKey, (BrokerEndpoint, HashMap<PartitionId, InitialFetchState>)> =
            HashMap::new();
        for (tp, assignment) in mods.to_make_follower {
            let fetcher_id = self.fetcher_id(&tp);
            let key = FetcherKey {
                source_broker: assignment.source.id,
                fetcher_id,
            };
            let entry = grouped
                .entry(key)
                .or_insert_with(|| (assignment.source.clone(), HashMap::new()));
            entry.1.insert(
                tp,
                InitialFetchState {
                    source_broker: key.source_broker,
                    fetcher_id,
                    init: assignment.init,
                },
            );
        }

        for (key, (source, _)) in &grouped {
            if !self.fetchers.contains_key(key) {
                self.create_fetcher(*key, source.clone());
            }
        }

        let mut pending = Vec::new();
        for entry in self.fetchers.iter() {
            let key = *entry.key();
            let add = grouped
                .get(&key)
                .map(|(_, adds)| adds.clone())
                .unwrap_or_default();
            pending.push((key, entry.value().submit_modify(mods.to_remove.clone(), add)));
        }

        let mut idle = Vec::new();
        for (key, receiver) in pending {
            let count = receiver.await.unwrap_or(0);
            if count == 0 {
                idle.push(key);
            }
        }
        for key in idle {
            if let Some((_, fetcher)) = self.fetchers.remove(&key) {
                info!(fetcher = fetcher.name(), "shutting down idle fetcher");
                fetcher.shutdown().await;
            }
        }
    }

    /// Stop replicating the given partitions wherever they currently live
    pub async fn remove_partitions(&self, partitions: HashSet<PartitionId>) {
        let mut pending = Vec::new();
        for entry in self.fetchers.iter() {
            pending.push(entry.value().submit_modify(partitions.clone(), HashMap::new()));
        }
        for receiver in pending {
            let _ = receiver.await;
        }
    }

    /// Shut every fetcher down cooperatively
    pub async fn close_all(&self) {
        let keys: Vec<FetcherKey> = self.fetchers.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, fetcher)) = self.fetchers.remove(&key) {
                fetcher.shutdown().await;
            }
        }
        info!("all fetchers shut down");
    }

    pub fn fetcher_count(&self) -> usize {
        self.fetchers.len()
    }

    /// Partitions quarantined across the whole pool
    pub fn failed_partitions(&self) -> HashSet<PartitionId> {
        let mut failed = HashSet::new();
        for entry in self.fetchers.iter() {
            failed.extend(entry.value().failed_partitions());
        }
        failed
    }

    /// Worst replication lag across the whole pool
    pub fn max_lag(&self) -> i64 {
        self.fetchers
            .iter()
            .map(|entry| entry.value().max_lag())
            .max()
            .unwrap_or(0)
    }

    fn create_fetcher(&self, key: FetcherKey, source: BrokerEndpoint) {
        let client = self.clients.client_for(&source);
        let fetcher = ReplicaFetcher::spawn(
            self.config.fetcher.clone(),
            source,
            key.fetcher_id,
            client,
            self.log.clone(),
        );
        fetcher.start();
        debug!(fetcher = fetcher.name(), "created fetcher");
        self.fetchers.insert(key, fetcher);
    }
}
