//! Receive-side frame parser.
//!
//! Fills [`PacketMeta`] for an inbound Ethernet frame: header offsets,
//! protocol flags, checksum validation status and the error flag. Frames
//! that are not IPv4 parse cleanly with `has_ipv4 == false`.

use super::{ipv4_addr, ETHERTYPE_IPV4, ETH_HLEN, ICMP_HLEN, IPPROTO_ICMP, IPPROTO_UDP, UDP_HLEN};
use crate::checksum;
use crate::pktio::{ChecksumStatus, Packet, PacketMeta, RxChecksum};

/// Parse `pkt` in place and replace its metadata.
pub fn parse_frame(pkt: &mut Packet, rx: &RxChecksum) {
    let meta = parse_bytes(pkt.data(), rx);
    *pkt.meta_mut() = meta;
}

/// Parse raw frame bytes into fresh metadata.
pub fn parse_bytes(frame: &[u8], rx: &RxChecksum) -> PacketMeta {
    let mut meta = PacketMeta::default();
    if frame.len() < ETH_HLEN {
        meta.has_error = true;
        return meta;
    }
    meta.l2_offset = Some(0);

    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype != ETHERTYPE_IPV4 {
        return meta;
    }

    let l3 = ETH_HLEN;
    let Some(&ver_ihl) = frame.get(l3) else {
        meta.has_error = true;
        return meta;
    };
    let ihl = ((ver_ihl & 0x0f) as usize) * 4;
    if ver_ihl >> 4 != 4 || ihl < 20 || frame.len() < l3 + ihl {
        meta.has_error = true;
        return meta;
    }
    let total_len = u16::from_be_bytes([frame[l3 + 2], frame[l3 + 3]]) as usize;
    if total_len < ihl || frame.len() < l3 + total_len {
        meta.has_error = true;
        return meta;
    }

    meta.l3_offset = Some(l3 as u16);
    meta.has_ipv4 = true;

    if rx.ipv4 {
        if checksum::verify(&frame[l3..l3 + ihl]) {
            meta.l3_checksum = ChecksumStatus::Good;
        } else {
            meta.l3_checksum = ChecksumStatus::Bad;
            meta.has_error |= rx.drop_ipv4_err;
        }
    }

    let l4 = l3 + ihl;
    let l4_end = l3 + total_len;
    meta.l4_offset = Some(l4 as u16);
    match frame[l3 + 9] {
        IPPROTO_UDP => {
            if l4_end - l4 < UDP_HLEN {
                meta.has_error = true;
                return meta;
            }
            meta.has_udp = true;
            let csum_field = u16::from_be_bytes([frame[l4 + 6], frame[l4 + 7]]);
            // A zero UDP checksum means the sender did not compute one.
            if rx.udp && csum_field != 0 {
                let seg = &frame[l4..l4_end];
                let sum = checksum::pseudo_header_sum(
                    ipv4_addr(frame, l3 + 12),
                    ipv4_addr(frame, l3 + 16),
                    IPPROTO_UDP,
                    seg.len() as u16,
                ) + checksum::partial_sum(seg, 0);
                if checksum::finalize(sum) == 0xffff {
                    meta.l4_checksum = ChecksumStatus::Good;
                } else {
                    meta.l4_checksum = ChecksumStatus::Bad;
                    meta.has_error |= rx.drop_udp_err;
                }
            }
        }
        IPPROTO_ICMP => {
            if l4_end - l4 < ICMP_HLEN {
                meta.has_error = true;
                return meta;
            }
            meta.has_icmp = true;
        }
        _ => {}
    }
    meta
}
