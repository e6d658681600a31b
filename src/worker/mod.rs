//! Worker threads: per-worker counters, stop signalling and role dispatch.
//!
//! A worker is either a transmitter ([`tx`]) or a receiver ([`rx`]). Both
//! finish their own setup, meet every other worker and the coordinator at
//! the start barrier, then loop until their [`StopFlag`] is raised.

pub mod affinity;
pub mod rx;
pub mod tx;

use std::iter::Sum;
use std::ops::Add;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::packet::{BurstError, PacketKind};
use crate::pktio::{PacketPool, PktIn, PktOut, TxChecksum};
use crate::timer::{Timer, TimerError};

// ─────────────────────────────────────────────────────────────────────────────
// Counters
// ─────────────────────────────────────────────────────────────────────────────

/// Per-worker counters.
///
/// Written only by the owning worker thread; the coordinator reads them
/// concurrently. Updates are a relaxed load followed by a relaxed store, so a
/// reader may see a slightly stale value but never a torn one.
#[derive(Debug, Default)]
pub struct Counters {
    sent: AtomicU64,
    send_drops: AtomicU64,
    received: AtomicU64,
    seq: AtomicU64,
    udp_received: AtomicU64,
    icmp_replies: AtomicU64,
}

#[inline]
fn bump(cell: &AtomicU64, n: u64) {
    cell.store(cell.load(Ordering::Relaxed) + n, Ordering::Relaxed);
}

impl Counters {
    pub fn add_sent(&self, n: u64) {
        bump(&self.sent, n);
    }

    pub fn add_send_drops(&self, n: u64) {
        bump(&self.send_drops, n);
    }

    pub fn add_received(&self, n: u64) {
        bump(&self.received, n);
    }

    pub fn add_udp_received(&self, n: u64) {
        bump(&self.udp_received, n);
    }

    pub fn add_icmp_replies(&self, n: u64) {
        bump(&self.icmp_replies, n);
    }

    pub fn set_seq(&self, seq: u64) {
        self.seq.store(seq, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            send_drops: self.send_drops.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            seq: self.seq.load(Ordering::Relaxed),
            udp_received: self.udp_received.load(Ordering::Relaxed),
            icmp_replies: self.icmp_replies.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Counters`]. Summing snapshots adds every field
/// except `seq`, which keeps the largest value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub sent: u64,
    pub send_drops: u64,
    pub received: u64,
    pub seq: u64,
    pub udp_received: u64,
    pub icmp_replies: u64,
}

impl Add for CounterSnapshot {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            sent: self.sent + rhs.sent,
            send_drops: self.send_drops + rhs.send_drops,
            received: self.received + rhs.received,
            seq: self.seq.max(rhs.seq),
            udp_received: self.udp_received + rhs.udp_received,
            icmp_replies: self.icmp_replies + rhs.icmp_replies,
        }
    }
}

impl Sum for CounterSnapshot {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stop flag
// ─────────────────────────────────────────────────────────────────────────────

/// Cooperative stop signal, raised once by the coordinator.
#[derive(Debug, Default)]
pub struct StopFlag {
    raised: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.cond.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Sleep for up to `timeout`, waking early if the flag is raised.
    /// Returns whether the flag is raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self
            .cond
            .wait_timeout_while(guard, timeout, |_| !self.is_raised())
            .unwrap_or_else(|e| e.into_inner());
        self.is_raised()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker description
// ─────────────────────────────────────────────────────────────────────────────

/// What a worker does, fixed at construction.
pub enum WorkerRole {
    Transmit {
        kind: Arc<dyn PacketKind>,
        output: Arc<dyn PktOut>,
        offload: TxChecksum,
        /// First sequence number this worker stamps.
        start_seq: u64,
    },
    Receive {
        inputs: Vec<Arc<dyn PktIn>>,
    },
}

impl WorkerRole {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transmit { .. } => "transmit",
            Self::Receive { .. } => "receive",
        }
    }
}

impl std::fmt::Debug for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transmit { kind, offload, start_seq, .. } => f
                .debug_struct("Transmit")
                .field("kind", &kind.name())
                .field("offload", offload)
                .field("start_seq", start_seq)
                .finish(),
            Self::Receive { inputs } => {
                f.debug_struct("Receive").field("inputs", &inputs.len()).finish()
            }
        }
    }
}

/// Settings shared by every worker of a run.
#[derive(Debug, Clone)]
pub struct WorkerParams {
    pub pool: PacketPool,
    /// Packets per transmitted burst.
    pub tx_burst: usize,
    /// Per transmit worker packet ceiling.
    pub pkt_count_max: Option<u64>,
    pub seq_step: u64,
    /// Pause after each burst; zero floods.
    pub interval: Duration,
    /// Back-off once the packet ceiling is reached.
    pub idle: Duration,
    pub rx_burst: usize,
}

/// Everything one worker thread owns.
#[derive(Debug)]
pub struct WorkerState {
    pub index: usize,
    /// CPU to pin to, if pinning is enabled.
    pub cpu: Option<usize>,
    pub role: WorkerRole,
    pub timer: Timer,
    pub stop: Arc<StopFlag>,
    pub counters: Arc<Counters>,
}

/// Error that ends a worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker {index}: failed to create reference packets: {source}")]
    Setup { index: usize, source: BurstError },

    #[error("worker {index}: pacing timer failed: {source}")]
    Timer { index: usize, source: TimerError },
}

/// Final account of one worker, returned through its join handle.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub index: usize,
    pub role: &'static str,
    pub cpu: Option<usize>,
    pub pinned: bool,
    pub counters: CounterSnapshot,
    /// Transmit: bursts handed to the output queue.
    pub bursts: u64,
    /// Transmit: bursts abandoned because clones could not be allocated.
    pub burst_failures: u64,
    /// Transmit: send calls that returned an error.
    pub send_errors: u64,
    /// Receive: packets dropped for a parse/protocol error.
    pub rx_errors: u64,
    /// Receive: polls that returned an error.
    pub poll_errors: u64,
}

impl WorkerReport {
    fn new(state: &WorkerState, pinned: bool) -> Self {
        Self {
            index: state.index,
            role: state.role.name(),
            cpu: state.cpu,
            pinned,
            counters: CounterSnapshot::default(),
            bursts: 0,
            burst_failures: 0,
            send_errors: 0,
            rx_errors: 0,
            poll_errors: 0,
        }
    }
}

/// Result of a worker thread plus its timer, which the coordinator drops
/// only after the join.
pub struct WorkerExit {
    pub result: Result<WorkerReport, WorkerError>,
    pub timer: Timer,
}

/// Thread body: pin, run the role, hand back the report and the timer.
pub fn run_worker(mut state: WorkerState, params: &WorkerParams, barrier: &Barrier) -> WorkerExit {
    let pinned = match state.cpu {
        Some(cpu) => match affinity::pin_current_thread(cpu) {
            Ok(()) => true,
            Err(e) => {
                warn!(worker = state.index, cpu, error = %e, "failed to pin worker");
                false
            }
        },
        None => false,
    };
    info!(worker = state.index, role = state.role.name(), cpu = ?state.cpu, "worker started");

    let mut report = WorkerReport::new(&state, pinned);
    let result = match &state.role {
        WorkerRole::Transmit { kind, output, offload, start_seq } => tx::run_transmit(
            tx::Transmit {
                index: state.index,
                kind: kind.as_ref(),
                output: output.as_ref(),
                offload: *offload,
                start_seq: *start_seq,
            },
            params,
            &mut state.timer,
            &state.stop,
            &state.counters,
            barrier,
            &mut report,
        ),
        WorkerRole::Receive { inputs } => {
            rx::run_receive(
                state.index,
                inputs,
                params,
                &state.stop,
                &state.counters,
                barrier,
                &mut report,
            );
            Ok(())
        }
    };
    report.counters = state.counters.snapshot();
    info!(
        worker = state.index,
        sent = report.counters.sent,
        received = report.counters.received,
        "worker finished"
    );

    WorkerExit {
        result: result.map(|()| report),
        timer: state.timer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_counters_single_writer_many_readers() {
        let counters = Arc::new(Counters::default());
        let writer = {
            let counters = Arc::clone(&counters);
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    counters.add_sent(1);
                }
            })
        };
        let mut last = 0;
        while !writer.is_finished() {
            let now = counters.snapshot().sent;
            assert!(now >= last, "single-writer counter must never go backwards");
            last = now;
        }
        writer.join().unwrap();
        assert_eq!(counters.sent(), 10_000);
    }

    #[test]
    fn test_snapshot_sum_adds_counts_and_keeps_max_seq() {
        let a = CounterSnapshot { sent: 4, send_drops: 1, seq: 12, ..Default::default() };
        let b = CounterSnapshot {
            sent: 6,
            received: 3,
            seq: 7,
            icmp_replies: 2,
            ..Default::default()
        };
        let total: CounterSnapshot = [a, b].into_iter().sum();
        assert_eq!(total.sent, 10);
        assert_eq!(total.send_drops, 1);
        assert_eq!(total.received, 3);
        assert_eq!(total.icmp_replies, 2);
        assert_eq!(total.seq, 12);
    }

    #[test]
    fn test_stop_flag_wakes_waiter_early() {
        let stop = Arc::new(StopFlag::new());
        let waiter = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let start = Instant::now();
                let raised = stop.wait_timeout(Duration::from_secs(10));
                (raised, start.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        stop.raise();
        let (raised, waited) = waiter.join().unwrap();
        assert!(raised);
        assert!(waited < Duration::from_secs(5), "waiter must not sleep the full timeout");
    }

    #[test]
    fn test_stop_flag_timeout_without_raise() {
        let stop = StopFlag::new();
        assert!(!stop.wait_timeout(Duration::from_millis(5)));
        stop.raise();
        assert!(stop.is_raised());
        assert!(stop.wait_timeout(Duration::from_secs(10)), "already raised returns at once");
    }
}
