//! Receive worker: poll input queues, classify, count, report echo RTT.

use std::sync::{Arc, Barrier};

use tracing::{debug, info, warn};

use super::{Counters, StopFlag, WorkerParams, WorkerReport};
use crate::packet::icmp::decode_echo;
use crate::packet::{timestamp_ns, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST};
use crate::pktio::{ChecksumStatus, Packet, PktIn, PktioError};

/// Round-robin poller over a worker's input queues.
pub struct InputScheduler<'a> {
    inputs: &'a [Arc<dyn PktIn>],
    next: usize,
}

impl<'a> InputScheduler<'a> {
    pub fn new(inputs: &'a [Arc<dyn PktIn>]) -> Self {
        Self { inputs, next: 0 }
    }

    /// Receive up to `max` packets from the first non-empty queue, starting
    /// after the queue that was served last. Never blocks.
    pub fn poll(&mut self, out: &mut Vec<Packet>, max: usize) -> Result<usize, PktioError> {
        let n = self.inputs.len();
        for _ in 0..n {
            let input = &self.inputs[self.next];
            self.next = (self.next + 1) % n;
            let got = input.recv(out, max)?;
            if got > 0 {
                return Ok(got);
            }
        }
        Ok(0)
    }
}

/// Split a round-trip time in nanoseconds into whole milliseconds and the
/// microsecond remainder.
pub fn rtt_parts(ns: u64) -> (u64, u64) {
    let ms = ns / 1_000_000;
    let us = ns / 1_000 - ms * 1_000;
    (ms, us)
}

/// Classify and release every packet in `batch`.
pub fn classify_batch(
    index: usize,
    batch: &mut Vec<Packet>,
    counters: &Counters,
    report: &mut WorkerReport,
) {
    for pkt in batch.drain(..) {
        let meta = *pkt.meta();
        if meta.l3_checksum == ChecksumStatus::Bad {
            warn!(worker = index, "L3 checksum error detected");
        }
        if meta.l4_checksum == ChecksumStatus::Bad {
            warn!(worker = index, "L4 checksum error detected");
        }
        if meta.has_error {
            report.rx_errors += 1;
            continue;
        }
        if !meta.has_ipv4 {
            continue;
        }

        counters.add_received(1);
        if meta.has_udp {
            counters.add_udp_received(1);
        } else if meta.has_icmp {
            let Some(l4) = meta.l4_offset else {
                continue;
            };
            match decode_echo(pkt.data(), l4 as usize) {
                Some(echo) if echo.icmp_type == ICMP_ECHO_REPLY => {
                    counters.add_icmp_replies(1);
                    match echo.timestamp_ns {
                        Some(sent_at) => {
                            let (ms, us) = rtt_parts(timestamp_ns().saturating_sub(sent_at));
                            info!(
                                worker = index,
                                "ICMP Echo Reply seq {} time {}.{:03} ms",
                                echo.sequence,
                                ms,
                                us
                            );
                        }
                        None => info!(worker = index, "ICMP Echo Reply seq {}", echo.sequence),
                    }
                }
                Some(echo) if echo.icmp_type == ICMP_ECHO_REQUEST => {
                    debug!(worker = index, seq = echo.sequence, "ICMP Echo Request");
                }
                _ => {}
            }
        }
    }
}

pub(super) fn run_receive(
    index: usize,
    inputs: &[Arc<dyn PktIn>],
    params: &WorkerParams,
    stop: &StopFlag,
    counters: &Counters,
    barrier: &Barrier,
    report: &mut WorkerReport,
) {
    barrier.wait();

    let mut scheduler = InputScheduler::new(inputs);
    let mut batch = Vec::with_capacity(params.rx_burst);
    while !stop.is_raised() {
        match scheduler.poll(&mut batch, params.rx_burst) {
            Ok(0) => std::thread::yield_now(),
            Ok(_) => classify_batch(index, &mut batch, counters, report),
            Err(e) => {
                report.poll_errors += 1;
                batch.clear();
                debug!(worker = index, error = %e, "receive poll failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::packet::parse::parse_bytes;
    use crate::packet::{IcmpPacketKind, PacketKind, UdpPacketKind};
    use crate::pktio::{PacketPool, RxChecksum, TxChecksum};
    use crate::timer::TimerPool;
    use crate::worker::{run_worker, WorkerRole, WorkerState};
    use crate::AddressConfig;

    struct QueuedIn {
        queue: Mutex<VecDeque<Packet>>,
    }

    impl QueuedIn {
        fn new(pkts: Vec<Packet>) -> Self {
            Self { queue: Mutex::new(pkts.into()) }
        }
    }

    impl PktIn for QueuedIn {
        fn recv(&self, out: &mut Vec<Packet>, max: usize) -> Result<usize, PktioError> {
            let mut queue = self.queue.lock().unwrap();
            let n = max.min(queue.len());
            out.extend(queue.drain(..n));
            Ok(n)
        }
    }

    fn empty_report() -> WorkerReport {
        WorkerReport {
            index: 0,
            role: "receive",
            cpu: None,
            pinned: false,
            counters: Default::default(),
            bursts: 0,
            burst_failures: 0,
            send_errors: 0,
            rx_errors: 0,
            poll_errors: 0,
        }
    }

    fn parsed(pool: &PacketPool, kind: &dyn PacketKind) -> Packet {
        let mut pkt = kind.build_reference(pool, &TxChecksum::default()).unwrap();
        *pkt.meta_mut() = parse_bytes(pkt.data(), &RxChecksum::default());
        pkt
    }

    #[test]
    fn test_rtt_parts() {
        assert_eq!(rtt_parts(0), (0, 0));
        assert_eq!(rtt_parts(1_234_567), (1, 234));
        assert_eq!(rtt_parts(999_999), (0, 999));
        assert_eq!(rtt_parts(12_000_500), (12, 0));
    }

    #[test]
    fn test_error_packet_dropped_udp_counted() {
        let pool = PacketPool::new(8, 2048);
        let udp = parsed(&pool, &UdpPacketKind::new(AddressConfig::default(), 56));
        assert!(udp.meta().has_udp);

        let mut bad = pool.alloc(10).unwrap();
        *bad.meta_mut() = parse_bytes(bad.data(), &RxChecksum::default());
        assert!(bad.meta().has_error, "truncated frame must be flagged");

        let counters = Counters::default();
        let mut report = empty_report();
        let mut batch = vec![udp, bad];
        classify_batch(0, &mut batch, &counters, &mut report);

        let snap = counters.snapshot();
        assert_eq!(snap.udp_received, 1);
        assert_eq!(snap.received, 1, "error packet must not count as received");
        assert_eq!(report.rx_errors, 1);
        assert!(batch.is_empty());
        assert_eq!(pool.stats().in_use, 0, "every packet in the batch is released");
    }

    #[test]
    fn test_non_ipv4_skipped_without_counting() {
        let pool = PacketPool::new(2, 2048);
        let mut arp = pool.alloc(60).unwrap();
        arp.data_mut()[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        *arp.meta_mut() = parse_bytes(arp.data(), &RxChecksum::default());

        let counters = Counters::default();
        let mut report = empty_report();
        classify_batch(0, &mut vec![arp], &counters, &mut report);
        assert_eq!(counters.snapshot().received, 0);
        assert_eq!(report.rx_errors, 0);
    }

    #[test]
    fn test_echo_reply_counted_request_ignored() {
        let pool = PacketPool::new(4, 2048);
        let kind = IcmpPacketKind::new(AddressConfig::default());

        let mut request = kind.build_reference(&pool, &TxChecksum::default()).unwrap();
        kind.prepare(&mut request, &TxChecksum::default(), 7);
        let mut reply = pool.copy(&request).unwrap();
        crate::packet::icmp::make_echo_reply(reply.data_mut(), 14, 34);
        for pkt in [&mut request, &mut reply] {
            *pkt.meta_mut() = parse_bytes(pkt.data(), &RxChecksum::default());
        }

        let counters = Counters::default();
        let mut report = empty_report();
        classify_batch(0, &mut vec![request, reply], &counters, &mut report);
        let snap = counters.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.icmp_replies, 1, "only the echo reply counts");
    }

    #[test]
    fn test_scheduler_round_robins_inputs() {
        let pool = PacketPool::new(8, 2048);
        let kind = UdpPacketKind::new(AddressConfig::default(), 56);
        let a: Arc<dyn PktIn> =
            Arc::new(QueuedIn::new(vec![parsed(&pool, &kind), parsed(&pool, &kind)]));
        let b: Arc<dyn PktIn> = Arc::new(QueuedIn::new(vec![parsed(&pool, &kind)]));
        let inputs = vec![a, b];
        let mut sched = InputScheduler::new(&inputs);
        let mut out = Vec::new();

        assert_eq!(sched.poll(&mut out, 1).unwrap(), 1);
        assert_eq!(sched.poll(&mut out, 1).unwrap(), 1);
        assert_eq!(sched.poll(&mut out, 1).unwrap(), 1);
        assert_eq!(sched.poll(&mut out, 1).unwrap(), 0, "all queues drained");
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_receive_worker_drains_until_stopped() {
        let pool = PacketPool::new(16, 2048);
        let kind = UdpPacketKind::new(AddressConfig::default(), 56);
        let queued = (0..5).map(|_| parsed(&pool, &kind)).collect();
        let input: Arc<dyn PktIn> = Arc::new(QueuedIn::new(queued));
        let timers = TimerPool::new(1, Duration::from_millis(1)).unwrap();
        let stop = Arc::new(StopFlag::new());
        let counters = Arc::new(Counters::default());
        let state = WorkerState {
            index: 1,
            cpu: None,
            role: WorkerRole::Receive { inputs: vec![input] },
            timer: timers.alloc().unwrap(),
            stop: Arc::clone(&stop),
            counters: Arc::clone(&counters),
        };
        let params = WorkerParams {
            pool: pool.clone(),
            tx_burst: 0,
            pkt_count_max: None,
            seq_step: 0,
            interval: Duration::ZERO,
            idle: Duration::from_millis(1),
            rx_burst: 2,
        };
        let barrier = Arc::new(Barrier::new(2));
        let handle = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || run_worker(state, &params, &barrier))
        };
        barrier.wait();
        while counters.snapshot().received < 5 {
            std::thread::sleep(Duration::from_millis(1));
        }
        stop.raise();
        let report = handle.join().unwrap().result.unwrap();
        assert_eq!(report.role, "receive");
        assert_eq!(report.counters.udp_received, 5);
        assert_eq!(pool.stats().in_use, 0);
    }
}
