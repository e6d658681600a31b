//! Run orchestration.
//!
//! [`run`] validates the configuration, creates the packet pool and timer
//! pool, opens and starts every interface, hands each worker its role and
//! launches the workers. The calling thread then becomes the coordinator: it
//! joins the start barrier, samples the summed counters on a fixed interval,
//! detects the stop condition (with the ping graceful stop), raises every
//! worker's stop flag, joins them and tears everything down in order.

use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{
    ConfigError, GeneratorConfig, RunPlan, MAX_RX_BURST, POOL_NUM_PKT, POOL_PKT_LEN,
};
use crate::packet::{kind_for, PacketKind};
use crate::pktio::{
    ChecksumOffload, Interface, PacketPool, PktIn, PktOut, PktioBackend, PktioError, PoolStats,
};
use crate::stats::{RateTracker, StatsLine};
use crate::timer::{TimerError, TimerPool, MIN_RESOLUTION};
use crate::worker::{
    run_worker, CounterSnapshot, Counters, StopFlag, WorkerError, WorkerExit, WorkerParams,
    WorkerReport, WorkerRole, WorkerState,
};
use crate::Mode;

/// Error that ends a run.
#[derive(Debug, thiserror::Error)]
pub enum GenError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("packet I/O error: {0}")]
    Pktio(#[from] PktioError),

    #[error("timer error: {0}")]
    Timer(#[from] TimerError),

    #[error("{0}")]
    Worker(#[from] WorkerError),

    #[error("interface {0} has no output queues")]
    NoOutputQueue(String),

    #[error("failed to spawn worker {index}: {source}")]
    Spawn { index: usize, source: std::io::Error },

    #[error("worker {0} panicked")]
    WorkerPanicked(usize),
}

/// How the ping graceful stop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GracefulStop {
    /// Not a ping run, or the run ended before the packet count was reached.
    NotApplicable,
    /// Every echo request was answered.
    RepliesReceived,
    /// The reply budget ran out with requests still unanswered.
    TimedOut,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// From the start barrier to the last join, in milliseconds.
    pub duration_ms: u64,
    pub mode: Mode,
    pub interfaces: Vec<String>,
    pub plan: RunPlan,
    pub workers: Vec<WorkerReport>,
    pub totals: CounterSnapshot,
    pub graceful_stop: GracefulStop,
    pub pool: PoolStats,
}

// ─────────────────────────────────────────────────────────────────────────────
// Interface setup
// ─────────────────────────────────────────────────────────────────────────────

/// A started interface and its queue handles. Dropping it closes the interface.
struct OpenInterface {
    handle: Box<dyn Interface>,
    offload: ChecksumOffload,
    outputs: Vec<Arc<dyn PktOut>>,
    inputs: Vec<Arc<dyn PktIn>>,
}

fn open_interface(
    backend: &dyn PktioBackend,
    name: &str,
    pool: &PacketPool,
    plan: &RunPlan,
    checksum_offload: bool,
) -> Result<OpenInterface, GenError> {
    let mut handle = backend.open(name, pool)?;
    let capa = handle.capability();

    let offload = ChecksumOffload::negotiate(&capa.checksum, checksum_offload);
    handle.configure(&offload)?;

    let rx_queues = plan.rx_queues.min(capa.max_input_queues);
    if rx_queues < plan.rx_queues {
        warn!(
            interface = %name,
            requested = plan.rx_queues,
            max = capa.max_input_queues,
            "input queues clamped"
        );
    }
    handle.config_input_queues(rx_queues)?;

    // Fewer output queues than workers: queues are shared and must be MT safe.
    let (tx_queues, mt_safe) = if plan.tx_queues > capa.max_output_queues {
        warn!(
            interface = %name,
            requested = plan.tx_queues,
            max = capa.max_output_queues,
            "output queues clamped"
        );
        (capa.max_output_queues, true)
    } else {
        (plan.tx_queues, false)
    };
    handle.config_output_queues(tx_queues, mt_safe)?;

    handle.start()?;
    let outputs = handle.output_queues()?;
    let inputs = handle.input_queues()?;
    info!(
        interface = %name,
        rx_queues = inputs.len(),
        tx_queues = outputs.len(),
        tx_ipv4_csum = offload.tx.ipv4,
        tx_udp_csum = offload.tx.udp,
        "interface started"
    );

    Ok(OpenInterface {
        handle,
        offload,
        outputs,
        inputs,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Role fan-out
// ─────────────────────────────────────────────────────────────────────────────

/// Decide each worker's role and CPU.
///
/// * UDP: worker `i` transmits on interface `i % ifs`, output queue
///   `(i / ifs) % queues`, starting at sequence `i * burst`.
/// * Ping: worker 0 transmits on the first queue of the first interface,
///   worker 1 receives from every input queue. The receiver takes the first CPU.
/// * Receive: worker `i` polls input queue `i % queues` of every interface.
fn assign_roles(
    mode: Mode,
    plan: &RunPlan,
    kind: Option<Arc<dyn PacketKind>>,
    ifaces: &[OpenInterface],
    names: &[String],
) -> Result<Vec<(WorkerRole, usize)>, GenError> {
    let Some(kind) = kind else {
        return Ok((0..plan.workers)
            .map(|i| {
                let inputs = ifaces
                    .iter()
                    .filter(|iface| !iface.inputs.is_empty())
                    .map(|iface| Arc::clone(&iface.inputs[i % iface.inputs.len()]))
                    .collect();
                (WorkerRole::Receive { inputs }, plan.cpus[i])
            })
            .collect());
    };

    if mode == Mode::Ping {
        let output = ifaces[0]
            .outputs
            .first()
            .cloned()
            .ok_or_else(|| GenError::NoOutputQueue(names[0].clone()))?;
        let inputs = ifaces.iter().flat_map(|iface| iface.inputs.iter().cloned()).collect();
        return Ok(vec![
            (
                WorkerRole::Transmit {
                    kind,
                    output,
                    offload: ifaces[0].offload.tx,
                    start_seq: 0,
                },
                plan.cpus[1],
            ),
            (WorkerRole::Receive { inputs }, plan.cpus[0]),
        ]);
    }

    let if_count = ifaces.len();
    (0..plan.workers)
        .map(|i| {
            let if_idx = i % if_count;
            let iface = &ifaces[if_idx];
            if iface.outputs.is_empty() {
                return Err(GenError::NoOutputQueue(names[if_idx].clone()));
            }
            let queue = (i / if_count) % iface.outputs.len();
            let role = WorkerRole::Transmit {
                kind: Arc::clone(&kind),
                output: Arc::clone(&iface.outputs[queue]),
                offload: iface.offload.tx,
                start_seq: (i * plan.tx_burst) as u64,
            };
            Ok((role, plan.cpus[i]))
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Stop conditions
// ─────────────────────────────────────────────────────────────────────────────

fn summed(counters: &[Arc<Counters>]) -> CounterSnapshot {
    counters.iter().map(|c| c.snapshot()).sum()
}

/// Wait for outstanding echo replies.
///
/// With a budget of `t` seconds the check runs up to `t + 1` times with one
/// poll interval between attempts; without a budget it runs once.
fn wait_for_replies(
    counters: &[Arc<Counters>],
    timeout_secs: Option<u64>,
    poll: Duration,
) -> GracefulStop {
    let answered = || {
        let totals = summed(counters);
        totals.icmp_replies >= totals.sent
    };
    if let Some(budget) = timeout_secs {
        for remaining in (0..=budget).rev() {
            if answered() {
                return GracefulStop::RepliesReceived;
            }
            debug!(remaining, "waiting for echo replies");
            std::thread::sleep(poll);
        }
    }
    if answered() {
        GracefulStop::RepliesReceived
    } else {
        GracefulStop::TimedOut
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────────────

type WorkerHandle = JoinHandle<Option<WorkerExit>>;

/// Run the generator to completion.
///
/// `on_sample` receives every periodic statistics line. Setup errors are
/// returned before any worker starts; a worker that fails after setup ends
/// the run and its error is returned once everything is torn down.
pub fn run(
    config: &GeneratorConfig,
    backend: &dyn PktioBackend,
    on_sample: &mut dyn FnMut(&StatsLine),
) -> Result<RunReport, GenError> {
    let plan = config.plan()?;
    let run_id = Uuid::new_v4();
    info!(
        run_id = %run_id,
        mode = %config.mode,
        workers = plan.workers,
        interfaces = ?config.interfaces,
        "starting run"
    );

    let pool = PacketPool::new(POOL_NUM_PKT, POOL_PKT_LEN);
    let timer_pool = TimerPool::new(plan.workers, MIN_RESOLUTION)?;

    let mut ifaces = config
        .interfaces
        .iter()
        .map(|name| open_interface(backend, name, &pool, &plan, config.checksum_offload))
        .collect::<Result<Vec<_>, _>>()?;

    let kind = kind_for(config.mode, &config.addresses, config.payload_len);
    let roles = assign_roles(config.mode, &plan, kind, &ifaces, &config.interfaces)?;

    let mut states = Vec::with_capacity(roles.len());
    for (index, (role, cpu)) in roles.into_iter().enumerate() {
        states.push(WorkerState {
            index,
            cpu: config.pin_cpus.then_some(cpu),
            role,
            timer: timer_pool.alloc()?,
            stop: Arc::new(StopFlag::new()),
            counters: Arc::new(Counters::default()),
        });
    }
    let stops: Vec<Arc<StopFlag>> = states.iter().map(|s| Arc::clone(&s.stop)).collect();
    let counters: Vec<Arc<Counters>> = states.iter().map(|s| Arc::clone(&s.counters)).collect();

    let params = Arc::new(WorkerParams {
        pool: pool.clone(),
        tx_burst: plan.tx_burst,
        pkt_count_max: plan.pkt_count_max,
        seq_step: plan.seq_step,
        interval: Duration::from_millis(config.interval_ms),
        idle: Duration::from_millis(config.tick_ms),
        rx_burst: MAX_RX_BURST,
    });

    // Workers plus the coordinator.
    let barrier = Arc::new(Barrier::new(states.len() + 1));
    let handles = spawn_workers(states, &params, &barrier)?;

    let started_at = Utc::now();
    barrier.wait();
    let start = Instant::now();
    info!(run_id = %run_id, "all workers at the start line");

    let graceful_stop = monitor(config, &counters, &handles, on_sample);

    for stop in &stops {
        stop.raise();
    }

    let mut reports = Vec::with_capacity(handles.len());
    let mut timers = Vec::with_capacity(handles.len());
    let mut failure = None;
    for (index, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Some(exit)) => {
                timers.push(exit.timer);
                match exit.result {
                    Ok(report) => reports.push(report),
                    Err(e) => {
                        warn!(worker = index, error = %e, "worker failed");
                        failure.get_or_insert(GenError::Worker(e));
                    }
                }
            }
            Ok(None) => {}
            Err(_) => {
                failure.get_or_insert(GenError::WorkerPanicked(index));
            }
        }
    }
    let duration = start.elapsed();

    for (iface, name) in ifaces.iter_mut().zip(&config.interfaces) {
        if let Err(e) = iface.handle.stop() {
            warn!(interface = %name, error = %e, "failed to stop interface");
        }
    }
    drop(timers);
    drop(timer_pool);
    drop(ifaces);

    if let Some(e) = failure {
        return Err(e);
    }

    let totals = summed(&counters);
    info!(
        run_id = %run_id,
        sent = totals.sent,
        drops = totals.send_drops,
        received = totals.received,
        duration_ms = duration.as_millis() as u64,
        "run complete"
    );

    Ok(RunReport {
        run_id,
        started_at,
        duration_ms: duration.as_millis() as u64,
        mode: config.mode,
        interfaces: config.interfaces.clone(),
        plan,
        workers: reports,
        totals,
        graceful_stop,
        pool: pool.stats(),
    })
}

/// Spawn one named thread per worker.
///
/// Threads wait on a private go signal before touching the barrier, so if a
/// spawn fails the threads already created are released without ever
/// joining a barrier that can no longer fill.
fn spawn_workers(
    states: Vec<WorkerState>,
    params: &Arc<WorkerParams>,
    barrier: &Arc<Barrier>,
) -> Result<Vec<WorkerHandle>, GenError> {
    let mut handles = Vec::with_capacity(states.len());
    let mut gates = Vec::with_capacity(states.len());

    for state in states {
        let index = state.index;
        let (go, gate) = mpsc::channel::<()>();
        let params = Arc::clone(params);
        let barrier = Arc::clone(barrier);
        let spawned = std::thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || gate.recv().ok().map(|()| run_worker(state, &params, &barrier)));
        match spawned {
            Ok(handle) => {
                handles.push(handle);
                gates.push(go);
            }
            Err(source) => {
                drop(gates);
                for handle in handles {
                    let _ = handle.join();
                }
                return Err(GenError::Spawn { index, source });
            }
        }
    }

    for go in gates {
        // A closed gate means the thread is already gone; the join reports it.
        let _ = go.send(());
    }
    Ok(handles)
}

/// Coordinator loop: sample statistics and return once the run should stop.
fn monitor(
    config: &GeneratorConfig,
    counters: &[Arc<Counters>],
    handles: &[WorkerHandle],
    on_sample: &mut dyn FnMut(&StatsLine),
) -> GracefulStop {
    let tick = Duration::from_millis(config.tick_ms);
    let stats_every = Duration::from_millis(config.stats_interval_ms);
    let mut tracker = RateTracker::new();
    let mut last_sample = Instant::now();

    loop {
        if handles.iter().any(|h| h.is_finished()) {
            warn!("worker exited early, stopping run");
            return GracefulStop::NotApplicable;
        }

        if config.mode != Mode::Receive {
            if let Some(count) = config.count {
                if summed(counters).sent >= count {
                    if config.mode != Mode::Ping {
                        return GracefulStop::NotApplicable;
                    }
                    let poll = Duration::from_millis(config.reply_poll_ms);
                    let outcome = wait_for_replies(counters, config.reply_timeout_secs, poll);
                    info!(outcome = ?outcome, "ping graceful stop");
                    return outcome;
                }
            }
        }

        let now = Instant::now();
        let next = last_sample + stats_every;
        if now < next {
            std::thread::sleep((next - now).min(tick));
            continue;
        }
        let line = tracker.sample(config.mode, &summed(counters), now - last_sample);
        last_sample = now;
        on_sample(&line);
    }
}
