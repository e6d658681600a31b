//! Linux `AF_PACKET` raw socket interfaces.
//!
//! One `SOCK_RAW` socket per queue, bound to the interface by index. Output
//! queues batch a burst into a single `sendmmsg()` call; a full socket buffer
//! (`EAGAIN`) is reported as a zero-packet partial send. Input queues read
//! with `MSG_DONTWAIT` and, when more than one is configured, join a
//! `PACKET_FANOUT` hash group so each flow lands on one queue. Frames this
//! host transmitted (`PACKET_OUTGOING`) are skipped.
//!
//! Requires `CAP_NET_RAW`. No checksum offload is advertised: the kernel
//! sends frames exactly as built.

use super::{Capability, ChecksumOffload, Interface, PacketPool, PktioBackend, PktioError};

/// Upper bound on queues per direction (one per worker).
const MAX_QUEUES: usize = 32;

const ETH_P_ALL: u16 = 0x0003;

/// Opens `AF_PACKET` interfaces by kernel interface name.
#[derive(Debug, Default, Clone, Copy)]
pub struct AfPacketBackend;

impl PktioBackend for AfPacketBackend {
    #[cfg(target_os = "linux")]
    fn open(&self, name: &str, pool: &PacketPool) -> Result<Box<dyn Interface>, PktioError> {
        Ok(Box::new(linux::AfPacketInterface::open(name, pool)?))
    }

    #[cfg(not(target_os = "linux"))]
    fn open(&self, _name: &str, _pool: &PacketPool) -> Result<Box<dyn Interface>, PktioError> {
        Err(PktioError::Unsupported("AF_PACKET"))
    }
}

/// `PACKET_FANOUT` socket option argument: group id in the low half, mode in
/// the high half.
fn fanout_arg(group_id: u16, mode: u16) -> u32 {
    ((mode as u32) << 16) | group_id as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

/// Socket protocol for a queue, in network byte order. Output sockets use 0
/// so the kernel never queues inbound frames on them.
fn socket_protocol(direction: Direction) -> u16 {
    match direction {
        Direction::Input => ETH_P_ALL.to_be(),
        Direction::Output => 0,
    }
}

fn capability() -> Capability {
    Capability {
        max_input_queues: MAX_QUEUES,
        max_output_queues: MAX_QUEUES,
        checksum: ChecksumOffload::default(),
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CString;
    use std::io;
    use std::mem;
    use std::sync::Arc;

    use tracing::{debug, info};

    use super::{capability, fanout_arg, socket_protocol, Direction};
    use crate::packet::parse::parse_frame;
    use crate::pktio::{
        Capability, ChecksumOffload, Interface, Packet, PacketPool, PktIn, PktOut, PktioError,
        RxChecksum,
    };

    // Not exported by every libc version.
    const PACKET_FANOUT: libc::c_int = 18;
    const PACKET_FANOUT_HASH: u16 = 0;
    const PACKET_OUTGOING: u8 = 4;

    /// Largest batch handed to one `sendmmsg()` call.
    const MAX_TX_BATCH: usize = 512;

    struct Socket {
        fd: libc::c_int,
    }

    impl Socket {
        /// Open a raw socket bound to `ifindex`. Input sockets receive every
        /// ethertype; output sockets receive nothing.
        fn bind(ifindex: libc::c_int, direction: Direction) -> io::Result<Self> {
            let protocol = socket_protocol(direction);
            let fd =
                unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol as libc::c_int) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let sock = Self { fd };

            let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
            sll.sll_family = libc::AF_PACKET as u16;
            sll.sll_protocol = protocol;
            sll.sll_ifindex = ifindex;
            let ret = unsafe {
                libc::bind(
                    sock.fd,
                    &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(sock)
        }

        fn join_fanout(&self, group_id: u16) -> io::Result<()> {
            let arg = fanout_arg(group_id, PACKET_FANOUT_HASH);
            let ret = unsafe {
                libc::setsockopt(
                    self.fd,
                    libc::SOL_PACKET,
                    PACKET_FANOUT,
                    &arg as *const u32 as *const libc::c_void,
                    mem::size_of::<u32>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    impl Drop for Socket {
        fn drop(&mut self) {
            if self.fd >= 0 {
                unsafe { libc::close(self.fd) };
            }
        }
    }

    pub(super) struct AfPacketInterface {
        name: String,
        ifindex: libc::c_int,
        pool: PacketPool,
        rx_config: RxChecksum,
        num_input: usize,
        num_output: usize,
        inputs: Vec<Arc<AfPacketIn>>,
        outputs: Vec<Arc<AfPacketOut>>,
    }

    impl AfPacketInterface {
        pub(super) fn open(name: &str, pool: &PacketPool) -> Result<Self, PktioError> {
            let open_err = |reason: String| PktioError::Open { name: name.to_string(), reason };
            let c_name = CString::new(name)
                .map_err(|_| open_err("interface name contains NUL".into()))?;
            let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
            if ifindex == 0 {
                return Err(open_err(format!("no such interface: {}", io::Error::last_os_error())));
            }
            info!(interface = %name, ifindex, "AF_PACKET interface opened");
            Ok(Self {
                name: name.to_string(),
                ifindex: ifindex as libc::c_int,
                pool: pool.clone(),
                rx_config: RxChecksum::default(),
                num_input: 1,
                num_output: 1,
                inputs: Vec::new(),
                outputs: Vec::new(),
            })
        }

        fn error(&self, reason: String) -> PktioError {
            PktioError::Config { name: self.name.clone(), reason }
        }

        fn check_queue_count(&self, num: usize, max: usize, dir: &str) -> Result<(), PktioError> {
            if num == 0 || num > max {
                return Err(
                    self.error(format!("{num} {dir} queues requested, 1..={max} supported"))
                );
            }
            if !self.inputs.is_empty() || !self.outputs.is_empty() {
                return Err(self.error(format!("cannot reconfigure {dir} queues while started")));
            }
            Ok(())
        }

        fn started(&self) -> Result<(), PktioError> {
            if self.outputs.is_empty() {
                return Err(PktioError::State {
                    name: self.name.clone(),
                    reason: "interface not started".into(),
                });
            }
            Ok(())
        }
    }

    impl Interface for AfPacketInterface {
        fn name(&self) -> &str {
            &self.name
        }

        fn capability(&self) -> Capability {
            capability()
        }

        fn configure(&mut self, config: &ChecksumOffload) -> Result<(), PktioError> {
            if *config != ChecksumOffload::default() {
                return Err(self.error("checksum offload not supported".into()));
            }
            self.rx_config = config.rx;
            Ok(())
        }

        fn config_input_queues(&mut self, num: usize) -> Result<(), PktioError> {
            self.check_queue_count(num, capability().max_input_queues, "input")?;
            self.num_input = num;
            Ok(())
        }

        fn config_output_queues(&mut self, num: usize, _mt_safe: bool) -> Result<(), PktioError> {
            self.check_queue_count(num, capability().max_output_queues, "output")?;
            self.num_output = num;
            Ok(())
        }

        fn start(&mut self) -> Result<(), PktioError> {
            let sock_err = |e: io::Error| PktioError::State {
                name: self.name.clone(),
                reason: format!("AF_PACKET socket setup failed (requires CAP_NET_RAW): {e}"),
            };
            let group_id = ((std::process::id() ^ self.ifindex as u32) & 0xffff) as u16;

            let mut inputs = Vec::with_capacity(self.num_input);
            for _ in 0..self.num_input {
                let sock = Socket::bind(self.ifindex, Direction::Input).map_err(sock_err)?;
                if self.num_input > 1 {
                    sock.join_fanout(group_id).map_err(sock_err)?;
                }
                inputs.push(Arc::new(AfPacketIn {
                    sock,
                    pool: self.pool.clone(),
                    rx_config: self.rx_config,
                }));
            }
            let mut outputs = Vec::with_capacity(self.num_output);
            for _ in 0..self.num_output {
                let sock = Socket::bind(self.ifindex, Direction::Output).map_err(sock_err)?;
                outputs.push(Arc::new(AfPacketOut { sock }));
            }

            self.inputs = inputs;
            self.outputs = outputs;
            debug!(
                interface = %self.name,
                inputs = self.num_input,
                outputs = self.num_output,
                "AF_PACKET interface started"
            );
            Ok(())
        }

        fn stop(&mut self) -> Result<(), PktioError> {
            self.inputs.clear();
            self.outputs.clear();
            Ok(())
        }

        fn output_queues(&self) -> Result<Vec<Arc<dyn PktOut>>, PktioError> {
            self.started()?;
            Ok(self.outputs.iter().map(|q| Arc::clone(q) as Arc<dyn PktOut>).collect())
        }

        fn input_queues(&self) -> Result<Vec<Arc<dyn PktIn>>, PktioError> {
            self.started()?;
            Ok(self.inputs.iter().map(|q| Arc::clone(q) as Arc<dyn PktIn>).collect())
        }
    }

    struct AfPacketOut {
        sock: Socket,
    }

    impl PktOut for AfPacketOut {
        fn send(&self, pkts: &mut Vec<Packet>) -> Result<usize, PktioError> {
            let n = pkts.len().min(MAX_TX_BATCH);
            if n == 0 {
                return Ok(0);
            }

            let mut iovecs: Vec<libc::iovec> = pkts[..n]
                .iter()
                .map(|p| libc::iovec {
                    iov_base: p.data().as_ptr() as *mut libc::c_void,
                    iov_len: p.len(),
                })
                .collect();
            let mut msgs: Vec<libc::mmsghdr> = iovecs
                .iter_mut()
                .map(|iov| {
                    let mut msg: libc::mmsghdr = unsafe { mem::zeroed() };
                    msg.msg_hdr.msg_iov = iov as *mut libc::iovec;
                    msg.msg_hdr.msg_iovlen = 1;
                    msg
                })
                .collect();

            let ret = unsafe {
                libc::sendmmsg(
                    self.sock.fd,
                    msgs.as_mut_ptr(),
                    n as libc::c_uint,
                    libc::MSG_DONTWAIT as _,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(0);
                }
                return Err(PktioError::Send(err.to_string()));
            }
            let sent = ret as usize;
            pkts.drain(..sent);
            Ok(sent)
        }
    }

    struct AfPacketIn {
        sock: Socket,
        pool: PacketPool,
        rx_config: RxChecksum,
    }

    impl PktIn for AfPacketIn {
        fn recv(&self, out: &mut Vec<Packet>, max: usize) -> Result<usize, PktioError> {
            let mut received = 0;
            while received < max {
                let Some(mut pkt) = self.pool.alloc(self.pool.seg_len()) else {
                    break;
                };
                let mut from: libc::sockaddr_ll = unsafe { mem::zeroed() };
                let mut from_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
                let ret = unsafe {
                    libc::recvfrom(
                        self.sock.fd,
                        pkt.data_mut().as_mut_ptr() as *mut libc::c_void,
                        pkt.len(),
                        libc::MSG_DONTWAIT,
                        &mut from as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                        &mut from_len,
                    )
                };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::WouldBlock {
                        break;
                    }
                    return Err(PktioError::Recv(err.to_string()));
                }
                if from.sll_pkttype == PACKET_OUTGOING {
                    continue;
                }
                pkt.truncate(ret as usize);
                parse_frame(&mut pkt, &self.rx_config);
                out.push(pkt);
                received += 1;
            }
            Ok(received)
        }
    }
}
