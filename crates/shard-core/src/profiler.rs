//! Scoped profiler for one conversion call
//!
//! A `Profiler` is created by the caller and passed into a conversion. It is
//! reset when the call starts and reported when the call ends, so timings
//! never leak across unrelated calls.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::debug;

/// Timing bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ProfileKind {
    All,
    Preprocessing,
    PreprocessingWithComm,
    StateConverting,
    Resharding,
    AllGather,
    AllGatherObj,
    D2H,
    NonManagedCopy,
}

#[derive(Debug, Default)]
struct ProfilerState {
    totals: BTreeMap<ProfileKind, Duration>,
    counts: BTreeMap<ProfileKind, u64>,
    active: BTreeSet<ProfileKind>,
}

/// Accumulates time per bucket for the duration of one call
#[derive(Debug, Default)]
pub struct Profiler {
    state: Mutex<ProfilerState>,
}

/// Snapshot of accumulated timings
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileReport {
    pub totals: BTreeMap<ProfileKind, Duration>,
    pub counts: BTreeMap<ProfileKind, u64>,
}

impl ProfileReport {
    pub fn count(&self, kind: ProfileKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time the enclosing scope under `kind`
    ///
    /// A bucket that is already being timed is not timed again by a nested
    /// scope.
    pub fn scope(&self, kind: ProfileKind) -> ProfileScope<'_> {
        let nested = !self.state.lock().active.insert(kind);
        ProfileScope {
            profiler: self,
            kind,
            start: Instant::now(),
            nested,
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = ProfilerState::default();
    }

    pub fn report(&self) -> ProfileReport {
        let state = self.state.lock();
        ProfileReport {
            totals: state.totals.clone(),
            counts: state.counts.clone(),
        }
    }

    /// Log the accumulated timings
    pub fn dump(&self, prefix: &str) -> ProfileReport {
        let report = self.report();
        for (kind, total) in &report.totals {
            debug!(
                bucket = ?kind,
                elapsed_ms = total.as_secs_f64() * 1000.0,
                count = report.count(*kind),
                "{}",
                prefix
            );
        }
        report
    }

    fn record(&self, kind: ProfileKind, elapsed: Duration) {
        let mut state = self.state.lock();
        state.active.remove(&kind);
        *state.totals.entry(kind).or_default() += elapsed;
        *state.counts.entry(kind).or_default() += 1;
    }
}

/// Guard returned by [`Profiler::scope`]
pub struct ProfileScope<'a> {
    profiler: &'a Profiler,
    kind: ProfileKind,
    start: Instant,
    nested: bool,
}

impl Drop for ProfileScope<'_> {
    fn drop(&mut self) {
        if !self.nested {
            self.profiler.record(self.kind, self.start.elapsed());
        }
    }
}
