//! One-shot relative timers served by a single background thread.
//!
//! Each [`Timer`] owns a private event queue and exactly one pre-allocated
//! [`Timeout`] event. Arming a timer moves the event into the pool; when the
//! deadline passes the service thread sends it back through the timer's
//! queue, and [`Timer::wait`] blocks until it arrives. A timer can therefore
//! never be armed twice, and a worker's pacing wait never allocates.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

/// Finest supported resolution.
pub const MIN_RESOLUTION: Duration = Duration::from_millis(1);
/// Longest relative timeout accepted by [`Timer::set_rel`].
pub const MAX_TIMEOUT: Duration = Duration::from_secs(10_000);

/// Error from the timer collaborator.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("timer pool exhausted ({capacity} timers)")]
    Exhausted { capacity: usize },

    #[error("timer already armed")]
    InFlight,

    #[error("timeout of {requested:?} exceeds maximum {max:?}")]
    OutOfRange { requested: Duration, max: Duration },

    #[error("timer pool closed")]
    PoolClosed,

    #[error("failed to spawn timer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// The event a timer delivers to its own queue on expiry.
#[derive(Debug)]
pub struct Timeout {
    timer: usize,
    fired_at: Option<Instant>,
}

impl Timeout {
    /// Slot of the owning timer.
    pub fn timer(&self) -> usize {
        self.timer
    }

    /// When the service thread delivered this event, if it has fired.
    pub fn fired_at(&self) -> Option<Instant> {
        self.fired_at
    }
}

struct Slot {
    queue: Sender<Timeout>,
    /// Generation and event of the pending expiry, if armed.
    armed: Option<(u64, Timeout)>,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Deadline {
    at: Instant,
    generation: u64,
    slot: usize,
}

struct PoolState {
    heap: BinaryHeap<Reverse<Deadline>>,
    slots: Vec<Option<Slot>>,
    next_generation: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Pool of timers sharing one service thread.
pub struct TimerPool {
    shared: Arc<Shared>,
    resolution: Duration,
    thread: Option<JoinHandle<()>>,
}

impl TimerPool {
    /// Create a pool with room for `num_timers` timers.
    ///
    /// `resolution` is clamped to at least [`MIN_RESOLUTION`]; shorter
    /// relative timeouts are rounded up to it.
    pub fn new(num_timers: usize, resolution: Duration) -> Result<Self, TimerError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                heap: BinaryHeap::with_capacity(num_timers),
                slots: (0..num_timers).map(|_| None).collect(),
                next_generation: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let thread = std::thread::Builder::new().name("timer".into()).spawn({
            let shared = Arc::clone(&shared);
            move || service(&shared)
        })?;
        debug!(num_timers, "timer pool started");
        Ok(Self {
            shared,
            resolution: resolution.max(MIN_RESOLUTION),
            thread: Some(thread),
        })
    }

    /// Allocate a timer with its private queue and timeout event.
    pub fn alloc(&self) -> Result<Timer, TimerError> {
        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(TimerError::PoolClosed);
        }
        let capacity = state.slots.len();
        let slot = state
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(TimerError::Exhausted { capacity })?;
        let (tx, rx) = mpsc::channel();
        state.slots[slot] = Some(Slot { queue: tx, armed: None });
        Ok(Timer {
            slot,
            shared: Arc::clone(&self.shared),
            resolution: self.resolution,
            queue: rx,
            timeout: Some(Timeout { timer: slot, fired_at: None }),
        })
    }
}

impl Drop for TimerPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.heap.clear();
            // Dropping the senders wakes any timer blocked in wait().
            for slot in state.slots.iter_mut() {
                *slot = None;
            }
        }
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn service(shared: &Shared) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        while state.heap.peek().is_some_and(|Reverse(d)| d.at <= now) {
            let Some(Reverse(due)) = state.heap.pop() else {
                break;
            };
            fire(&mut state, due, now);
        }
        let next = state.heap.peek().map(|Reverse(d)| d.at);
        state = match next {
            Some(at) => {
                let wait = at.saturating_duration_since(now);
                shared
                    .cond
                    .wait_timeout(state, wait)
                    .unwrap_or_else(|e| e.into_inner())
                    .0
            }
            None => shared.cond.wait(state).unwrap_or_else(|e| e.into_inner()),
        };
    }
}

/// Deliver the event for `due` unless the timer was cancelled or re-armed.
fn fire(state: &mut PoolState, due: Deadline, now: Instant) {
    let Some(Some(slot)) = state.slots.get_mut(due.slot) else {
        return;
    };
    if !matches!(slot.armed, Some((generation, _)) if generation == due.generation) {
        return;
    }
    if let Some((_, mut timeout)) = slot.armed.take() {
        timeout.fired_at = Some(now);
        // A closed receiver means the timer is being dropped.
        let _ = slot.queue.send(timeout);
    }
}

/// A one-shot timer bound to its own event queue.
pub struct Timer {
    slot: usize,
    shared: Arc<Shared>,
    resolution: Duration,
    queue: Receiver<Timeout>,
    /// The timeout event while it is not in flight.
    timeout: Option<Timeout>,
}

impl Timer {
    /// Arm the timer to fire `ns` nanoseconds from now.
    pub fn set_rel(&mut self, ns: u64) -> Result<(), TimerError> {
        let requested = Duration::from_nanos(ns);
        if requested > MAX_TIMEOUT {
            return Err(TimerError::OutOfRange { requested, max: MAX_TIMEOUT });
        }
        let Some(timeout) = self.timeout.take() else {
            return Err(TimerError::InFlight);
        };

        let at = Instant::now() + requested.max(self.resolution);
        let mut state = self.shared.lock();
        if state.shutdown {
            drop(state);
            self.timeout = Some(timeout);
            return Err(TimerError::PoolClosed);
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        match state.slots.get_mut(self.slot) {
            Some(Some(slot)) => slot.armed = Some((generation, timeout)),
            _ => {
                drop(state);
                self.timeout = Some(timeout);
                return Err(TimerError::PoolClosed);
            }
        }
        state.heap.push(Reverse(Deadline { at, generation, slot: self.slot }));
        drop(state);
        self.shared.cond.notify_one();
        Ok(())
    }

    /// Block until this timer's timeout event is back in its queue.
    pub fn wait(&mut self) -> Result<&Timeout, TimerError> {
        if self.timeout.is_none() {
            let timeout = self.queue.recv().map_err(|_| TimerError::PoolClosed)?;
            self.timeout = Some(timeout);
        }
        self.timeout.as_ref().ok_or(TimerError::PoolClosed)
    }

    /// Arm for `duration` and wait for expiry.
    pub fn sleep(&mut self, duration: Duration) -> Result<(), TimerError> {
        self.set_rel(duration.as_nanos().min(u64::MAX as u128) as u64)?;
        self.wait()?;
        Ok(())
    }

    /// True while the timeout event is in flight.
    pub fn is_armed(&self) -> bool {
        self.timeout.is_none()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let Some(slot) = state.slots.get_mut(self.slot) {
            *slot = None;
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("slot", &self.slot)
            .field("armed", &self.is_armed())
            .finish()
    }
}
