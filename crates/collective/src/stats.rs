//! Per-operation collective call counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Call counters for one rank's process group
#[derive(Debug, Default)]
pub struct CollectiveStats {
    all_gather: AtomicU64,
    all_gather_object: AtomicU64,
    broadcast: AtomicU64,
    broadcast_object: AtomicU64,
    all_reduce: AtomicU64,
    /// Elements received by tensor collectives
    elements_received: AtomicU64,
}

/// Point-in-time copy of [`CollectiveStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub all_gather: u64,
    pub all_gather_object: u64,
    pub broadcast: u64,
    pub broadcast_object: u64,
    pub all_reduce: u64,
    pub elements_received: u64,
}

impl StatsSnapshot {
    /// Total number of collective calls
    pub fn total_calls(&self) -> u64 {
        self.all_gather
            + self.all_gather_object
            + self.broadcast
            + self.broadcast_object
            + self.all_reduce
    }
}

impl CollectiveStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_all_gather(&self, elements: usize) {
        self.all_gather.fetch_add(1, Ordering::Relaxed);
        self.elements_received
            .fetch_add(elements as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_all_gather_object(&self) {
        self.all_gather_object.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_broadcast(&self, elements: usize) {
        self.broadcast.fetch_add(1, Ordering::Relaxed);
        self.elements_received
            .fetch_add(elements as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_broadcast_object(&self) {
        self.broadcast_object.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_all_reduce(&self) {
        self.all_reduce.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            all_gather: self.all_gather.load(Ordering::Relaxed),
            all_gather_object: self.all_gather_object.load(Ordering::Relaxed),
            broadcast: self.broadcast.load(Ordering::Relaxed),
            broadcast_object: self.broadcast_object.load(Ordering::Relaxed),
            all_reduce: self.all_reduce.load(Ordering::Relaxed),
            elements_received: self.elements_received.load(Ordering::Relaxed),
        }
    }
}
