//! Reference arrays and burst cloning.
//!
//! Each transmit worker keeps `burst` reference packets. For every send it
//! stamps the next sequence number into each reference in place and copies
//! the result into a fresh pool packet, so clones in flight never share a
//! buffer with each other or with the reference.

use super::{BurstError, PacketKind};
use crate::pktio::{Packet, PacketPool, TxChecksum};

/// Build `count` reference packets. On failure every packet already built is
/// released before the error is returned.
pub fn build_reference_array(
    kind: &dyn PacketKind,
    pool: &PacketPool,
    offload: &TxChecksum,
    count: usize,
) -> Result<Vec<Packet>, BurstError> {
    let len = kind.frame_len();
    if len > pool.seg_len() {
        return Err(BurstError::FrameTooLarge {
            kind: kind.name(),
            len,
            seg_len: pool.seg_len(),
        });
    }

    let mut refs = Vec::with_capacity(count);
    for slot in 0..count {
        match kind.build_reference(pool, offload) {
            Some(pkt) => refs.push(pkt),
            // `refs` drops here, returning its buffers.
            None => return Err(BurstError::PoolExhausted { slot, burst: count }),
        }
    }
    Ok(refs)
}

/// Fill `out` with one send-ready clone per reference packet.
///
/// `seq` is the worker's running sequence number; it advances once per
/// mutated reference. If a clone cannot be allocated at slot `k`, the `k`
/// clones already produced are released, `out` is left empty and the error is
/// returned.
pub fn build_burst(
    kind: &dyn PacketKind,
    pool: &PacketPool,
    references: &mut [Packet],
    offload: &TxChecksum,
    seq: &mut u64,
    out: &mut Vec<Packet>,
) -> Result<(), BurstError> {
    out.clear();
    let burst = references.len();
    if burst == 0 {
        return Err(BurstError::EmptyBurst);
    }

    for (slot, reference) in references.iter_mut().enumerate() {
        kind.prepare(reference, offload, *seq);
        *seq += 1;
        match pool.copy(reference) {
            Some(clone) => out.push(clone),
            None => {
                out.clear();
                return Err(BurstError::PoolExhausted { slot, burst });
            }
        }
    }
    Ok(())
}
