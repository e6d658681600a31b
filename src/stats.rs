//! Periodic throughput summaries derived from summed worker counters.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::worker::CounterSnapshot;
use crate::Mode;

/// One periodic statistics sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsLine {
    pub sent: u64,
    pub drops: u64,
    /// Packets per second since the previous sample.
    pub send_rate: u64,
    pub max_send_rate: u64,
    pub rcv: u64,
    pub recv_rate: u64,
    pub max_recv_rate: u64,
}

impl fmt::Display for StatsLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent: {}, drops: {}, send rate: {} pps, max send rate: {} pps, rcv: {}, recv rate: {} pps, max recv rate: {} pps",
            self.sent,
            self.drops,
            self.send_rate,
            self.max_send_rate,
            self.rcv,
            self.recv_rate,
            self.max_recv_rate
        )
    }
}

/// Pick the (sent, drops, received) figures a mode reports.
///
/// Receive mode reports only received packets; ping reports echo replies as
/// received; UDP mode reports no receive side.
pub fn select_counters(mode: Mode, totals: &CounterSnapshot) -> (u64, u64, u64) {
    match mode {
        Mode::Receive => (0, 0, totals.received),
        Mode::Ping => (totals.sent, totals.send_drops, totals.icmp_replies),
        Mode::SendUdp => (totals.sent, totals.send_drops, 0),
    }
}

/// Calculate a packet rate from a counter delta over `elapsed`.
pub fn rate(delta: u64, elapsed: Duration) -> u64 {
    let nanos = elapsed.as_nanos();
    if nanos == 0 {
        return 0;
    }
    (delta as u128 * 1_000_000_000 / nanos) as u64
}

/// Tracks the previous sample and running maxima between samples.
#[derive(Debug, Clone, Default)]
pub struct RateTracker {
    prev_sent: u64,
    prev_rcv: u64,
    max_send_rate: u64,
    max_recv_rate: u64,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next line from `totals` taken `elapsed` after the previous one.
    pub fn sample(&mut self, mode: Mode, totals: &CounterSnapshot, elapsed: Duration) -> StatsLine {
        let (sent, drops, rcv) = select_counters(mode, totals);

        let send_rate = rate(sent.saturating_sub(self.prev_sent), elapsed);
        let recv_rate = rate(rcv.saturating_sub(self.prev_rcv), elapsed);
        self.prev_sent = sent;
        self.prev_rcv = rcv;
        self.max_send_rate = self.max_send_rate.max(send_rate);
        self.max_recv_rate = self.max_recv_rate.max(recv_rate);

        StatsLine {
            sent,
            drops,
            send_rate,
            max_send_rate: self.max_send_rate,
            rcv,
            recv_rate,
            max_recv_rate: self.max_recv_rate,
        }
    }
}
