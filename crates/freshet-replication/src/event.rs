//! Fetcher events and the per-fetcher event bus
//!
//! Each fetcher owns one bus and one consumer task; every state transition
//! flows through [`FetcherEventBus::take`], which is what makes the fetch
//! state single-writer. The bus merges two queues: immediately-eligible
//! events ordered by descending priority (control preempts data) and
//! delayed events ordered by deadline. One mutex guards both; the consumer
//! parks on a notify with a timed wait on the earliest deadline.

use crate::partition::{OffsetAndEpoch, PartitionId};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

/// Event priority; higher value wins at the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// The self-rearming truncate/fetch tick
    Data = 1,
    /// Partition add/remove control events
    Control = 2,
}

/// Initial state for a partition handed to a fetcher
///
/// The `(source_broker, fetcher_id)` pair names the destination; a fetcher
/// ignores adds addressed to a different destination, so a racing
/// reassignment cannot land a partition on the wrong fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialFetchState {
    pub source_broker: u32,
    pub fetcher_id: u32,
    pub init: OffsetAndEpoch,
}

/// Events processed by a fetcher's event loop
#[derive(Debug)]
pub enum FetcherEvent {
    /// One cycle of the truncate → fetch → append loop
    TruncateAndFetch,
    /// Serialized partition membership change. The completion sender is
    /// fired with the resulting partition count once the change is applied;
    /// it never fails.
    ModifyPartitions {
        remove: HashSet<PartitionId>,
        add: HashMap<PartitionId, InitialFetchState>,
        completion: oneshot::Sender<usize>,
    },
}

impl FetcherEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            FetcherEvent::TruncateAndFetch => EventPriority::Data,
            FetcherEvent::ModifyPartitions { .. } => EventPriority::Control,
        }
    }
}

struct ReadyEvent {
    priority: EventPriority,
    seq: u64,
    event: FetcherEvent,
}

impl PartialEq for ReadyEvent {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ReadyEvent {}

impl PartialOrd for ReadyEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEvent {
    // Max-heap: highest priority first, FIFO within a priority
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct DelayedEvent {
    due: Instant,
    seq: u64,
    event: FetcherEvent,
}

impl PartialEq for DelayedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for DelayedEvent {}

impl PartialOrd for DelayedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEvent {
    // Max-heap inverted: earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct BusInner {
    ready: BinaryHeap<ReadyEvent>,
    delayed: BinaryHeap<DelayedEvent>,
    next_seq: u64,
    closed: bool,
}

impl BusInner {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    // Promote every expired delayed event into the ready queue
    fn promote_expired(&mut self, now: Instant) {
        while matches!(self.delayed.peek(), Some(d) if d.due <= now) {
            let delayed = self.delayed.pop().expect("peeked");
            let seq = self.next_seq();
            self.ready.push(ReadyEvent {
                priority: delayed.event.priority(),
                seq,
                event: delayed.event,
            });
        }
    }
}

/// Priority + delay queue feeding one fetcher's event loop
#[derive(Default)]
pub struct FetcherEventBus {
    inner: Mutex<BusInner>,
    notify: Notify,
}

impl FetcherEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an immediately-eligible event. Dropped if the bus is closed.
    pub fn put(&self, event: FetcherEvent) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            let seq = inner.next_seq();
            inner.ready.push(ReadyEvent {
                priority: event.priority(),
                seq,
                event,
            });
        }
        self.notify.notify_one();
    }

    /// Enqueue an event that becomes eligible after `delay`. Dropped if the
    /// bus is closed.
    pub fn schedule(&self, event: FetcherEvent, delay: Duration) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            let seq = inner.next_seq();
            inner.delayed.push(DelayedEvent {
                due: Instant::now() + delay,
                seq,
                event,
            });
        }
        self.notify.notify_one();
    }

    /// Next event, blocking until one is eligible.
    ///
    /// Returns the highest-priority eligible event; an immediate event beats
    /// a just-expired delayed one of the same priority. After [`close`], the
    /// remaining ready events are drained (so queued control events still
    /// complete) and then `None` is returned; pending delayed events are
    /// discarded.
    ///
    /// [`close`]: FetcherEventBus::close
    pub async fn take(&self) -> Option<FetcherEvent> {
        loop {
            let wait_until = {
                let mut inner = self.inner.lock();
                inner.promote_expired(Instant::now());
                if let Some(ready) = inner.ready.pop() {
                    return Some(ready.event);
                }
                if inner.closed {
                    return None;
                }
                inner.delayed.peek().map(|d| d.due)
            };
            match wait_until {
                Some(due) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Stop accepting events and wake the consumer. Already-queued ready
    /// events remain takeable; delayed events are dropped.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.delayed.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of immediately-eligible events
    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// Number of events waiting on a deadline
    pub fn delayed_len(&self) -> usize {
        self.inner.lock().delayed.len()
    }
}
