//! Transmit worker: build a burst, push it through the output queue, pace.

use std::sync::Barrier;

use tracing::{debug, info, warn};

use super::{Counters, StopFlag, WorkerError, WorkerParams, WorkerReport};
use crate::packet::{build_burst, build_reference_array, wrapped_seq, PacketKind};
use crate::pktio::{Packet, PktOut, TxChecksum};
use crate::timer::Timer;

/// Transmit-side inputs borrowed from the worker's role.
pub struct Transmit<'a> {
    pub index: usize,
    pub kind: &'a dyn PacketKind,
    pub output: &'a dyn PktOut,
    pub offload: TxChecksum,
    pub start_seq: u64,
}

/// Accounting for one burst handed to [`send_with_retry`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SendOutcome {
    /// Packets the output queue accepted.
    pub sent: u64,
    /// Sum of the unaccepted tails over every partial send.
    pub drops: u64,
    /// Packets released without being sent.
    pub freed: u64,
    pub error: Option<String>,
}

/// Offer `burst` to `output` until every packet is accepted.
///
/// Each partial send adds the unaccepted tail to `drops` and retries only
/// that tail. A send error or a raised stop flag abandons the burst: the
/// remaining packets are released and counted in `freed`. On return `burst`
/// is empty and `sent + freed` equals the original burst length.
pub fn send_with_retry(
    output: &dyn PktOut,
    burst: &mut Vec<Packet>,
    stop: &StopFlag,
) -> SendOutcome {
    let attempted = burst.len() as u64;
    let mut outcome = SendOutcome::default();

    while !burst.is_empty() {
        let offered = burst.len();
        match output.send(burst) {
            Ok(accepted) if accepted >= offered => break,
            Ok(accepted) => {
                outcome.drops += (offered - accepted) as u64;
                if stop.is_raised() {
                    break;
                }
                if accepted == 0 {
                    std::thread::yield_now();
                }
            }
            Err(e) => {
                outcome.error = Some(e.to_string());
                break;
            }
        }
    }

    outcome.freed = burst.len() as u64;
    outcome.sent = attempted - outcome.freed;
    burst.clear();
    outcome
}

/// First sequence number of the burst after the one starting at `burst_start`.
///
/// Worker `i` of `W` starts at `i * burst` and steps by `burst * (W - 1)`,
/// so the ranges of different workers interleave without overlapping.
pub fn next_burst_seq(burst_start: u64, burst: usize, seq_step: u64) -> u64 {
    burst_start + burst as u64 + seq_step
}

pub(super) fn run_transmit(
    job: Transmit<'_>,
    params: &WorkerParams,
    timer: &mut Timer,
    stop: &StopFlag,
    counters: &Counters,
    barrier: &Barrier,
    report: &mut WorkerReport,
) -> Result<(), WorkerError> {
    let references = build_reference_array(job.kind, &params.pool, &job.offload, params.tx_burst);
    // Release the barrier even when setup failed so nobody deadlocks.
    barrier.wait();
    let mut references =
        references.map_err(|source| WorkerError::Setup { index: job.index, source })?;

    let burst_len = references.len();
    let paced = !params.interval.is_zero();
    let mut seq = job.start_seq;
    let mut burst = Vec::with_capacity(burst_len);
    counters.set_seq(seq);

    while !stop.is_raised() {
        if params.pkt_count_max.is_some_and(|max| counters.sent() >= max) {
            stop.wait_timeout(params.idle);
            continue;
        }

        let burst_start = seq;
        let built = build_burst(
            job.kind,
            &params.pool,
            &mut references,
            &job.offload,
            &mut seq,
            &mut burst,
        );
        match built {
            Ok(()) => {
                let outcome = send_with_retry(job.output, &mut burst, stop);
                counters.add_sent(outcome.sent);
                counters.add_send_drops(outcome.drops);
                report.bursts += 1;
                if let Some(error) = outcome.error {
                    // The freed tail never left the worker.
                    counters.add_send_drops(outcome.freed);
                    report.send_errors += 1;
                    warn!(
                        worker = job.index,
                        freed = outcome.freed,
                        error = %error,
                        "packet send failed"
                    );
                }
            }
            Err(e) => {
                counters.add_send_drops(burst_len as u64);
                report.burst_failures += 1;
                debug!(worker = job.index, error = %e, "burst abandoned");
            }
        }

        if paced {
            info!(worker = job.index, seq, wrapped = wrapped_seq(seq), "send pkt");
            timer
                .sleep(params.interval)
                .map_err(|source| WorkerError::Timer { index: job.index, source })?;
        }

        seq = next_burst_seq(burst_start, burst_len, params.seq_step);
        counters.set_seq(seq);
    }

    debug!(worker = job.index, references = references.len(), "releasing reference packets");
    Ok(())
}
