//! # Freshet Replication
//!
//! Follower-side replication engine for Freshet's partitioned, append-only
//! log. Each data partition has one leader accepting writes; follower
//! brokers run a pool of *fetchers* that pull the leader's records and apply
//! them locally, honoring the epoch-based consistency rules of the
//! replication protocol:
//!
//! - **Leader-epoch fencing**: stale state is detected, never applied
//! - **Divergence reconciliation**: followers truncate to the leader's
//!   epoch end offsets before fetching
//! - **Out-of-range recovery**: offsets are re-derived from the leader's
//!   bounds, including after unclean leader elections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       FetcherManager                        │
//! │        (source broker, fetcher id) → ReplicaFetcher         │
//! ├────────────────────────────┬────────────────────────────────┤
//! │      ReplicaFetcher        │         ReplicaFetcher         │
//! │  ┌──────────────────────┐  │   ┌──────────────────────┐     │
//! │  │   FetcherEventBus    │  │   │   FetcherEventBus    │ ... │
//! │  │ control ≻ data, delay│  │   │                      │     │
//! │  └──────────┬───────────┘  │   └──────────┬───────────┘     │
//! │  ┌──────────▼───────────┐  │   ┌──────────▼───────────┐     │
//! │  │     FetcherCore      │  │   │     FetcherCore      │     │
//! │  │ truncate→fetch→append│  │   │                      │     │
//! │  └──────────────────────┘  │   └──────────────────────┘     │
//! ├────────────────────────────┴────────────────────────────────┤
//! │     LeaderClient (RPC)      │      LogAccessor (local log)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per fetcher, exactly one task drains one event bus and owns all mutable
//! fetch state; concurrency exists only between fetchers. Control events
//! (partition add/remove) preempt the self-rearming truncate/fetch cycle at
//! the bus, and their completions report the fetcher's resulting partition
//! count.
//!
//! ## Example
//!
//! ```rust,ignore
//! use freshet_replication::{
//!     BrokerEndpoint, FetcherManager, FollowerAssignment, ManagerConfig,
//!     OffsetAndEpoch, PartitionId, PartitionModifications,
//! };
//!
//! let manager = FetcherManager::new(ManagerConfig::default(), log, clients)?;
//! let mut mods = PartitionModifications::default();
//! mods.to_make_follower.insert(
//!     PartitionId::new("events", 0),
//!     FollowerAssignment {
//!         source: BrokerEndpoint::new(1, "broker-1", 9092),
//!         init: OffsetAndEpoch::new(0, 3),
//!     },
//! );
//! manager.modify_partitions_and_shutdown_idle_fetchers(mods).await;
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod fetcher;
pub mod leader;
pub mod log;
pub mod manager;
pub mod observability;
pub mod partition;
pub mod protocol;
pub mod state;

// Re-export main types
pub use config::{FetcherConfig, ManagerConfig};
pub use error::{ReplicationError, Result};
pub use event::{EventPriority, FetcherEvent, FetcherEventBus, InitialFetchState};
pub use fetcher::{FetcherCore, ReplicaFetcher};
pub use leader::{LeaderClient, LeaderClientProvider};
pub use log::{LogAccessor, LogAppendInfo, OffsetTruncationState};
pub use manager::{FetcherKey, FetcherManager, FollowerAssignment, PartitionModifications};
pub use observability::{FetcherLagRegistry, FetcherMetrics};
pub use partition::{BrokerEndpoint, OffsetAndEpoch, PartitionId};
pub use protocol::{
    EpochData, EpochEndOffset, ErrorCode, FetchPartition, FetchRequest, PartitionData,
    UNDEFINED_EPOCH, UNDEFINED_EPOCH_OFFSET,
};
pub use state::{
    DelayedItem, FailedPartitions, FetchPhase, PartitionFetchState, PartitionStateTable,
};

#[cfg(feature = "metrics-prometheus")]
pub use observability::init_prometheus_exporter;
