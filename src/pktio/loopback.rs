//! In-memory interfaces.
//!
//! Every transmitted frame is handed to a [`Responder`] which may deliver it
//! (or an answer to it) to the same interface's input queues. Offload
//! capability, queue limits and per-call accept limits are configurable so
//! tests can exercise checksum negotiation and partial sends without a NIC.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::{
    Capability, ChecksumOffload, Interface, Packet, PacketPool, PktIn, PktOut, PktioBackend,
    PktioError,
};
use crate::packet::icmp::{decode_echo, make_echo_reply};
use crate::packet::parse::{parse_bytes, parse_frame};
use crate::packet::{fill_ipv4_checksum, fill_udp_checksum, ICMP_ECHO_REQUEST};

/// What happens to a frame after it is transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Responder {
    /// Discard it. Echo requests go unanswered.
    #[default]
    Sink,
    /// Deliver it back unchanged to this interface's input.
    Reflect,
    /// Answer ICMP echo requests with echo replies; discard everything else.
    EchoReply,
}

/// Behaviour of every interface opened through one [`LoopbackBackend`].
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Advertised checksum offload capability.
    pub checksum: ChecksumOffload,
    pub max_input_queues: usize,
    pub max_output_queues: usize,
    /// Accept at most this many packets per send call.
    pub accept_limit: Option<usize>,
    pub responder: Responder,
    /// Keep a copy of every transmitted frame.
    pub capture: bool,
    /// Per input queue; frames beyond this are dropped.
    pub rx_ring_size: usize,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            checksum: ChecksumOffload::default(),
            max_input_queues: 8,
            max_output_queues: 8,
            accept_limit: None,
            responder: Responder::Sink,
            capture: false,
            rx_ring_size: 1024,
        }
    }
}

/// Opens in-memory interfaces and keeps a handle to each for inspection.
#[derive(Debug, Default)]
pub struct LoopbackBackend {
    options: LoopbackOptions,
    links: Mutex<HashMap<String, Arc<Link>>>,
}

impl LoopbackBackend {
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            options,
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Handle to the most recently opened interface called `name`.
    pub fn link(&self, name: &str) -> Option<LoopbackLink> {
        let links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        links.get(name).map(|link| LoopbackLink { link: Arc::clone(link) })
    }
}

impl PktioBackend for LoopbackBackend {
    fn open(&self, name: &str, pool: &PacketPool) -> Result<Box<dyn Interface>, PktioError> {
        if name.is_empty() {
            return Err(PktioError::Open {
                name: name.to_string(),
                reason: "empty interface name".into(),
            });
        }
        let link = Arc::new(Link {
            name: name.to_string(),
            pool: pool.clone(),
            options: self.options.clone(),
            state: Mutex::new(LinkState {
                offload: ChecksumOffload::default(),
                started: false,
                rx_rings: vec![Arc::new(RxRing::default())],
                num_output: 1,
            }),
            captured: Mutex::new(Vec::new()),
            transmitted: AtomicU64::new(0),
            rx_next: AtomicUsize::new(0),
        });
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::clone(&link));
        debug!(interface = %name, "loopback interface opened");
        Ok(Box::new(LoopbackInterface { link }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared link state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RxRing {
    queue: Mutex<VecDeque<Packet>>,
}

struct LinkState {
    offload: ChecksumOffload,
    started: bool,
    rx_rings: Vec<Arc<RxRing>>,
    num_output: usize,
}

struct Link {
    name: String,
    pool: PacketPool,
    options: LoopbackOptions,
    state: Mutex<LinkState>,
    captured: Mutex<Vec<Vec<u8>>>,
    transmitted: AtomicU64,
    rx_next: AtomicUsize,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.name)
            .field("transmitted", &self.transmitted.load(Ordering::Relaxed))
            .finish()
    }
}

impl Link {
    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transmit(&self, mut pkt: Packet, state: &LinkState) {
        let meta = *pkt.meta();
        if let Some(l3) = meta.l3_offset {
            let l3 = l3 as usize;
            if state.offload.tx.ipv4 && meta.insert_ipv4_checksum {
                fill_ipv4_checksum(pkt.data_mut(), l3);
            }
            if let Some(l4) = meta.l4_offset {
                if state.offload.tx.udp && meta.insert_udp_checksum && meta.has_udp {
                    fill_udp_checksum(pkt.data_mut(), l3, l4 as usize);
                }
            }
        }
        self.transmitted.fetch_add(1, Ordering::Relaxed);
        if self.options.capture {
            self.captured
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(pkt.data().to_vec());
        }

        match self.options.responder {
            Responder::Sink => {}
            Responder::Reflect => self.deliver(pkt, state),
            Responder::EchoReply => {
                let parsed = parse_bytes(pkt.data(), &Default::default());
                let (Some(l3), Some(l4)) = (parsed.l3_offset, parsed.l4_offset) else {
                    return;
                };
                let is_request = parsed.has_icmp
                    && decode_echo(pkt.data(), l4 as usize)
                        .is_some_and(|echo| echo.icmp_type == ICMP_ECHO_REQUEST);
                if is_request {
                    make_echo_reply(pkt.data_mut(), l3 as usize, l4 as usize);
                    self.deliver(pkt, state);
                }
            }
        }
    }

    fn deliver(&self, mut pkt: Packet, state: &LinkState) {
        if !state.started || state.rx_rings.is_empty() {
            return;
        }
        parse_frame(&mut pkt, &state.offload.rx);
        let idx = self.rx_next.fetch_add(1, Ordering::Relaxed) % state.rx_rings.len();
        let mut queue = state.rx_rings[idx]
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if queue.len() < self.options.rx_ring_size {
            queue.push_back(pkt);
        }
    }
}

/// Test-side view of an opened loopback interface.
#[derive(Debug, Clone)]
pub struct LoopbackLink {
    link: Arc<Link>,
}

impl LoopbackLink {
    /// Deliver `frame` to the interface input as if it arrived on the wire.
    /// Returns false if the pool is empty or the interface is not started.
    pub fn inject(&self, frame: &[u8]) -> bool {
        let Some(mut pkt) = self.link.pool.alloc(frame.len()) else {
            return false;
        };
        pkt.data_mut().copy_from_slice(frame);
        let state = self.link.state();
        if !state.started {
            return false;
        }
        self.link.deliver(pkt, &state);
        true
    }

    /// Frames transmitted so far (only when capture is enabled).
    pub fn captured(&self) -> Vec<Vec<u8>> {
        self.link
            .captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn transmitted(&self) -> u64 {
        self.link.transmitted.load(Ordering::Relaxed)
    }

    /// Effective offload configuration.
    pub fn offload(&self) -> ChecksumOffload {
        self.link.state().offload
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interface and queues
// ─────────────────────────────────────────────────────────────────────────────

struct LoopbackInterface {
    link: Arc<Link>,
}

impl LoopbackInterface {
    fn config_error(&self, reason: String) -> PktioError {
        PktioError::Config {
            name: self.link.name.clone(),
            reason,
        }
    }
}

fn exceeds(requested: &ChecksumOffload, capa: &ChecksumOffload) -> bool {
    let rx = &requested.rx;
    let crx = &capa.rx;
    (rx.ipv4 && !crx.ipv4)
        || (rx.udp && !crx.udp)
        || (rx.drop_ipv4_err && !crx.drop_ipv4_err)
        || (rx.drop_udp_err && !crx.drop_udp_err)
        || (requested.tx.ipv4 && !capa.tx.ipv4)
        || (requested.tx.udp && !capa.tx.udp)
}

impl Interface for LoopbackInterface {
    fn name(&self) -> &str {
        &self.link.name
    }

    fn capability(&self) -> Capability {
        Capability {
            max_input_queues: self.link.options.max_input_queues,
            max_output_queues: self.link.options.max_output_queues,
            checksum: self.link.options.checksum,
        }
    }

    fn configure(&mut self, config: &ChecksumOffload) -> Result<(), PktioError> {
        if exceeds(config, &self.link.options.checksum) {
            return Err(self.config_error("requested checksum offload not supported".into()));
        }
        self.link.state().offload = *config;
        Ok(())
    }

    fn config_input_queues(&mut self, num: usize) -> Result<(), PktioError> {
        let max = self.link.options.max_input_queues;
        if num == 0 || num > max {
            let reason = format!("{num} input queues requested, 1..={max} supported");
            return Err(self.config_error(reason));
        }
        let mut state = self.link.state();
        if state.started {
            return Err(self.config_error("cannot reconfigure input queues while started".into()));
        }
        state.rx_rings = (0..num).map(|_| Arc::new(RxRing::default())).collect();
        Ok(())
    }

    fn config_output_queues(&mut self, num: usize, _mt_safe: bool) -> Result<(), PktioError> {
        let max = self.link.options.max_output_queues;
        if num == 0 || num > max {
            let reason = format!("{num} output queues requested, 1..={max} supported");
            return Err(self.config_error(reason));
        }
        let mut state = self.link.state();
        if state.started {
            return Err(self.config_error("cannot reconfigure output queues while started".into()));
        }
        state.num_output = num;
        Ok(())
    }

    fn start(&mut self) -> Result<(), PktioError> {
        self.link.state().started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PktioError> {
        self.link.state().started = false;
        Ok(())
    }

    fn output_queues(&self) -> Result<Vec<Arc<dyn PktOut>>, PktioError> {
        let num = self.link.state().num_output;
        Ok((0..num)
            .map(|_| Arc::new(LoopbackOut { link: Arc::clone(&self.link) }) as Arc<dyn PktOut>)
            .collect())
    }

    fn input_queues(&self) -> Result<Vec<Arc<dyn PktIn>>, PktioError> {
        Ok(self
            .link
            .state()
            .rx_rings
            .iter()
            .map(|ring| Arc::new(LoopbackIn { ring: Arc::clone(ring) }) as Arc<dyn PktIn>)
            .collect())
    }
}

impl Drop for LoopbackInterface {
    fn drop(&mut self) {
        let mut state = self.link.state();
        state.started = false;
        for ring in &state.rx_rings {
            ring.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }
}

struct LoopbackOut {
    link: Arc<Link>,
}

impl PktOut for LoopbackOut {
    fn send(&self, pkts: &mut Vec<Packet>) -> Result<usize, PktioError> {
        let state = self.link.state();
        if !state.started {
            return Err(PktioError::State {
                name: self.link.name.clone(),
                reason: "send on stopped interface".into(),
            });
        }
        let accepted = self
            .link
            .options
            .accept_limit
            .map_or(pkts.len(), |limit| limit.min(pkts.len()));
        for pkt in pkts.drain(..accepted) {
            self.link.transmit(pkt, &state);
        }
        Ok(accepted)
    }
}

struct LoopbackIn {
    ring: Arc<RxRing>,
}

impl PktIn for LoopbackIn {
    fn recv(&self, out: &mut Vec<Packet>, max: usize) -> Result<usize, PktioError> {
        let mut queue = self.ring.queue.lock().unwrap_or_else(|e| e.into_inner());
        let n = max.min(queue.len());
        out.extend(queue.drain(..n));
        Ok(n)
    }
}
