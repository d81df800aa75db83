//! In-process process group
//!
//! Ranks are threads of one process sharing a rendezvous. The Nth collective
//! issued by each rank meets the Nth collective of every other rank; a rank
//! that issues a different operation at the same position gets a
//! `CollectiveMismatch` error, and a rank whose peers never arrive gets a
//! `Timeout`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use shard_core::{CollectiveConfig, Device, Error, Rank, Result, Tensor};
use tracing::{debug, instrument, warn};

use crate::group::ProcessGroup;
use crate::stats::{CollectiveStats, StatsSnapshot};

/// Collective operation kind, used to detect diverging call sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectiveOp {
    AllGather,
    Broadcast { src: Rank },
    AllReduce,
    AllGatherBytes,
    BroadcastBytes { src: Rank },
}

/// One rank's contribution to a round
#[derive(Debug, Clone)]
enum Payload {
    Tensor(Tensor),
    Bytes(Vec<u8>),
    Count(i64),
    Empty,
}

#[derive(Debug)]
struct RoundState {
    slots: Vec<Option<Payload>>,
    arrived: usize,
    departed: usize,
}

/// Active collective round tracking
#[derive(Debug)]
struct Round {
    op: CollectiveOp,
    /// Expected participants
    expected: usize,
    state: Mutex<RoundState>,
    ready: Condvar,
}

impl Round {
    fn new(op: CollectiveOp, expected: usize) -> Self {
        Self {
            op,
            expected,
            state: Mutex::new(RoundState {
                slots: vec![None; expected],
                arrived: 0,
                departed: 0,
            }),
            ready: Condvar::new(),
        }
    }
}

/// Rendezvous shared by all ranks of one local group
#[derive(Debug)]
struct Rendezvous {
    world_size: usize,
    timeout: Duration,
    /// Active rounds: sequence number -> Round
    rounds: DashMap<u64, Arc<Round>>,
}

/// Thread-backed process group
///
/// Create one handle per rank with [`LocalGroup::create`] and move each handle
/// into the thread that plays that rank.
#[derive(Debug)]
pub struct LocalGroup {
    rank: Rank,
    device: Device,
    rendezvous: Arc<Rendezvous>,
    /// Number of collectives this rank has issued
    seq: AtomicU64,
    stats: CollectiveStats,
}

impl LocalGroup {
    /// Create handles for every rank of a new group
    pub fn create(world_size: usize, config: &CollectiveConfig) -> Result<Vec<LocalGroup>> {
        if world_size == 0 {
            return Err(Error::InvalidConfig {
                message: "world size must be positive".to_string(),
            });
        }
        config.validate()?;
        let rendezvous = Arc::new(Rendezvous {
            world_size,
            timeout: config.timeout,
            rounds: DashMap::new(),
        });
        Ok((0..world_size)
            .map(|rank| LocalGroup {
                rank,
                device: Device::Accelerator(rank as u32),
                rendezvous: rendezvous.clone(),
                seq: AtomicU64::new(0),
                stats: CollectiveStats::new(),
            })
            .collect())
    }

    /// Collective call counters for this rank
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn op_name(op: CollectiveOp) -> String {
        format!("{:?}", op)
    }

    /// Drop a round that can no longer complete
    ///
    /// Only the round this call joined is removed; a later round reusing the
    /// sequence number is left alone.
    fn abandon(&self, seq: u64, round: &Arc<Round>) {
        let removed = self
            .rendezvous
            .rounds
            .remove_if(&seq, |_, current| Arc::ptr_eq(current, round));
        if removed.is_some() {
            debug!(rank = self.rank, seq, "Abandoned collective round");
        }
    }

    /// Contribute `payload` to the next round and wait for every rank's payload
    fn exchange(&self, op: CollectiveOp, payload: Payload) -> Result<Vec<Payload>> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let world_size = self.rendezvous.world_size;

        // Get or create round state - avoid holding the map entry lock
        let round = self
            .rendezvous
            .rounds
            .entry(seq)
            .or_insert_with(|| Arc::new(Round::new(op, world_size)))
            .clone();

        if round.op != op {
            self.abandon(seq, &round);
            warn!(
                rank = self.rank,
                seq,
                issued = ?op,
                expected = ?round.op,
                "Diverging collective call sequence"
            );
            return Err(Error::CollectiveMismatch {
                seq,
                rank: self.rank,
                actual: Self::op_name(op),
                expected: Self::op_name(round.op),
            });
        }

        let deadline = Instant::now() + self.rendezvous.timeout;
        let mut state = round.state.lock();
        state.slots[self.rank] = Some(payload);
        state.arrived += 1;

        if state.arrived == round.expected {
            round.ready.notify_all();
        } else {
            while state.arrived < round.expected {
                if round.ready.wait_until(&mut state, deadline).timed_out()
                    && state.arrived < round.expected
                {
                    drop(state);
                    self.abandon(seq, &round);
                    return Err(Error::Timeout {
                        operation: format!("{} (call {}, rank {})", Self::op_name(op), seq, self.rank),
                        timeout_ms: self.rendezvous.timeout.as_millis() as u64,
                    });
                }
            }
        }

        let collected = state
            .slots
            .iter()
            .enumerate()
            .map(|(rank, slot)| {
                slot.clone().ok_or_else(|| Error::Internal {
                    message: format!("rank {} left no payload in call {}", rank, seq),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        state.departed += 1;
        if state.departed == round.expected {
            drop(state);
            self.rendezvous.rounds.remove(&seq);
        }
        Ok(collected)
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.rendezvous.world_size
    }

    fn default_device(&self) -> Device {
        self.device
    }

    #[instrument(skip_all, fields(rank = self.rank, numel = input.numel()))]
    fn all_gather_into_tensor(&self, output: &mut Tensor, input: &Tensor) -> Result<()> {
        let payloads = self.exchange(CollectiveOp::AllGather, Payload::Tensor(input.clone()))?;
        let parts = payloads
            .into_iter()
            .map(|payload| match payload {
                Payload::Tensor(t) => Ok(t),
                other => Err(Error::Collective {
                    op: "all_gather_into_tensor".to_string(),
                    rank: self.rank,
                    message: format!("unexpected payload {:?}", other),
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        let gathered = Tensor::cat(&parts)?;
        if gathered.numel() != output.numel() {
            return Err(Error::Collective {
                op: "all_gather_into_tensor".to_string(),
                rank: self.rank,
                message: format!(
                    "gathered {} elements into a buffer of {}",
                    gathered.numel(),
                    output.numel()
                ),
            });
        }
        output.copy_from(&gathered)?;
        self.stats.record_all_gather(gathered.numel());
        debug!(elements = gathered.numel(), "all_gather_into_tensor complete");
        Ok(())
    }

    #[instrument(skip_all, fields(rank = self.rank, src = src))]
    fn broadcast(&self, tensor: &mut Tensor, src: Rank) -> Result<()> {
        let payload = if self.rank == src {
            Payload::Tensor(tensor.clone())
        } else {
            Payload::Empty
        };
        let mut payloads = self.exchange(CollectiveOp::Broadcast { src }, payload)?;
        match payloads.swap_remove(src) {
            Payload::Tensor(t) => {
                if self.rank != src {
                    tensor.copy_from(&t)?;
                }
                self.stats.record_broadcast(t.numel());
                Ok(())
            }
            other => Err(Error::Collective {
                op: "broadcast".to_string(),
                rank: self.rank,
                message: format!("source rank {} sent {:?}", src, other),
            }),
        }
    }

    fn all_reduce_sum(&self, value: i64) -> Result<i64> {
        let payloads = self.exchange(CollectiveOp::AllReduce, Payload::Count(value))?;
        self.stats.record_all_reduce();
        payloads.into_iter().try_fold(0i64, |acc, payload| match payload {
            Payload::Count(v) => Ok(acc + v),
            other => Err(Error::Collective {
                op: "all_reduce".to_string(),
                rank: self.rank,
                message: format!("unexpected payload {:?}", other),
            }),
        })
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let payloads = self.exchange(CollectiveOp::AllGatherBytes, Payload::Bytes(payload))?;
        self.stats.record_all_gather_object();
        payloads
            .into_iter()
            .map(|payload| match payload {
                Payload::Bytes(bytes) => Ok(bytes),
                other => Err(Error::Collective {
                    op: "all_gather_object".to_string(),
                    rank: self.rank,
                    message: format!("unexpected payload {:?}", other),
                }),
            })
            .collect()
    }

    fn broadcast_bytes(&self, payload: Option<Vec<u8>>, src: Rank) -> Result<Vec<u8>> {
        let payload = match payload {
            Some(bytes) if self.rank == src => Payload::Bytes(bytes),
            _ => Payload::Empty,
        };
        let mut payloads = self.exchange(CollectiveOp::BroadcastBytes { src }, payload)?;
        self.stats.record_broadcast_object();
        match payloads.swap_remove(src) {
            Payload::Bytes(bytes) => Ok(bytes),
            other => Err(Error::Collective {
                op: "broadcast_object".to_string(),
                rank: self.rank,
                message: format!("source rank {} sent {:?}", src, other),
            }),
        }
    }
}
