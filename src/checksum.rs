//! RFC 1071 Internet checksum over arbitrary byte ranges.
//!
//! The engine is split in two steps so that several segments of one logical
//! header (pseudo-header, transport header, payload) can be summed
//! independently and combined before the final fold:
//!
//! * [`partial_sum`] folds a byte range into a 64-bit accumulator. Carries are
//!   deferred by the width of the accumulator; the caller passes the byte
//!   offset of the range from the start of the logical header because an odd
//!   offset shifts every byte into the other half of its 16-bit word.
//! * [`finalize`] folds an accumulator (or a sum of accumulators) down to the
//!   16-bit ones' complement sum. Invert it to obtain the value transmitted in
//!   a checksum field; compare it against `0xFFFF` to validate a header whose
//!   checksum field is already populated.
//!
//! Values are network-order words: write a finished checksum with
//! `to_be_bytes()`.
//!
//! Two internal paths exist. Targets with cheap unaligned loads read 32-bit
//! words straight from the start of the slice; the others first consume up to
//! three leading bytes so that the bulk loop starts on a 4-byte boundary.
//! Both produce bit-identical accumulators after the final fold.

use std::net::Ipv4Addr;

/// Whether the target handles unaligned 32-bit loads without penalty.
const UNALIGNED_LOADS: bool = cfg!(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "aarch64"
));

/// Fold `data` into a 64-bit partial ones' complement sum.
///
/// `offset` is the position of `data[0]` relative to the start of the
/// logical header being checksummed. Only its parity matters.
pub fn partial_sum(data: &[u8], offset: usize) -> u64 {
    if UNALIGNED_LOADS {
        sum_unaligned(data, offset)
    } else {
        sum_aligned(data, offset)
    }
}

/// Fold a 64-bit accumulator to the 16-bit ones' complement sum.
pub fn finalize(sum: u64) -> u16 {
    let mut sum = (sum & 0xffff_ffff) + (sum >> 32);
    sum = (sum & 0xffff_ffff) + (sum >> 32);
    sum = (sum & 0xffff) + (sum >> 16);
    sum = (sum & 0xffff) + (sum >> 16);
    sum as u16
}

/// Ones' complement sum of a complete buffer starting at an even offset.
pub fn ones_complement_sum(data: &[u8]) -> u16 {
    finalize(partial_sum(data, 0))
}

/// Checksum value to store in a header whose checksum field is zero.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !ones_complement_sum(data)
}

/// True when `data` (checksum field included) sums to all ones.
pub fn verify(data: &[u8]) -> bool {
    ones_complement_sum(data) == 0xffff
}

/// Partial sum of the IPv4 pseudo-header used by UDP and TCP.
pub fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, l4_len: u16) -> u64 {
    let mut hdr = [0u8; 12];
    hdr[0..4].copy_from_slice(&src.octets());
    hdr[4..8].copy_from_slice(&dst.octets());
    hdr[9] = protocol;
    hdr[10..12].copy_from_slice(&l4_len.to_be_bytes());
    partial_sum(&hdr, 0)
}

/// Checksum of an IPv4 transport segment (header + payload) including the
/// pseudo-header. The segment's own checksum field must be zero.
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src, dst, protocol, segment.len() as u16) + partial_sum(segment, 0);
    !finalize(sum)
}

fn sum_unaligned(data: &[u8], offset: usize) -> u64 {
    swap_if_odd(sum_dwords(data, 0), offset & 1 == 1)
}

fn sum_aligned(data: &[u8], offset: usize) -> u64 {
    let mut odd = offset & 1 == 1;
    let mut sum = 0u64;
    let mut b = data;

    if b.as_ptr() as usize & 1 != 0 {
        if let Some((&first, rest)) = b.split_first() {
            // The leading byte lands in the low half of its word, shifting
            // everything after it by one byte.
            sum += first as u64;
            b = rest;
            odd = !odd;
        }
    }

    if b.as_ptr() as usize & 2 != 0 && b.len() >= 2 {
        sum += u16::from_be_bytes([b[0], b[1]]) as u64;
        b = &b[2..];
    }

    swap_if_odd(sum_dwords(b, sum), odd)
}

/// Sum 32-bit big-endian words, then a trailing word and byte.
fn sum_dwords(data: &[u8], mut sum: u64) -> u64 {
    let mut blocks = data.chunks_exact(32);
    for block in &mut blocks {
        for dw in block.chunks_exact(4) {
            sum += read_u32(dw);
        }
    }

    let mut dwords = blocks.remainder().chunks_exact(4);
    for dw in &mut dwords {
        sum += read_u32(dw);
    }

    let mut tail = dwords.remainder();
    if tail.len() >= 2 {
        sum += u16::from_be_bytes([tail[0], tail[1]]) as u64;
        tail = &tail[2..];
    }
    if let [last] = tail {
        sum += (*last as u64) << 8;
    }
    sum
}

#[inline(always)]
fn read_u32(dw: &[u8]) -> u64 {
    u32::from_be_bytes([dw[0], dw[1], dw[2], dw[3]]) as u64
}

#[inline(always)]
fn swap_if_odd(sum: u64, odd: bool) -> u64 {
    if odd {
        ((sum & 0x00ff_00ff_00ff_00ff) << 8) | ((sum & 0xff00_ff00_ff00_ff00) >> 8)
    } else {
        sum
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    /// Byte-at-a-time RFC 1071 sum with end-around carry.
    fn reference_sum(data: &[u8], offset: usize) -> u16 {
        let mut sum: u32 = 0;
        for (i, &b) in data.iter().enumerate() {
            if (i + offset) % 2 == 0 {
                sum += (b as u32) << 8;
            } else {
                sum += b as u32;
            }
            while sum >> 16 != 0 {
                sum = (sum & 0xffff) + (sum >> 16);
            }
        }
        sum as u16
    }

    /// Wikipedia's worked example, checksum field zeroed.
    const SAMPLE_IPV4_HEADER: [u8; 20] = [
        0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
        0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
    ];

    #[test]
    fn test_known_ipv4_header_checksum() {
        assert_eq!(internet_checksum(&SAMPLE_IPV4_HEADER), 0xb861);
    }

    #[test]
    fn test_checksum_self_verifies_after_insertion() {
        let mut hdr = SAMPLE_IPV4_HEADER;
        let csum = internet_checksum(&hdr);
        hdr[10..12].copy_from_slice(&csum.to_be_bytes());
        assert_eq!(internet_checksum(&hdr), 0, "re-checksumming a valid header must yield zero");
        assert!(verify(&hdr));
    }

    #[test]
    fn test_empty_buffer_sums_to_zero() {
        assert_eq!(finalize(partial_sum(&[], 0)), 0);
        assert_eq!(finalize(partial_sum(&[], 1)), 0);
    }

    #[test]
    fn test_single_byte_even_and_odd_offset() {
        assert_eq!(finalize(partial_sum(&[0xab], 0)), 0xab00);
        assert_eq!(finalize(partial_sum(&[0xab], 1)), 0x00ab);
    }

    #[test]
    fn test_all_lengths_and_offsets_match_reference() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let buf: Vec<u8> = (0..300).map(|_| rng.gen()).collect();
        for len in 0..=256 {
            for offset in 0..2 {
                let data = &buf[..len];
                assert_eq!(
                    finalize(partial_sum(data, offset)),
                    reference_sum(data, offset),
                    "len={len} offset={offset}"
                );
            }
        }
    }

    #[test]
    fn test_both_paths_agree_at_every_alignment() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let backing: Vec<u8> = (0..512).map(|_| rng.gen()).collect();
        for start in 0..8 {
            for len in [0usize, 1, 2, 3, 4, 5, 7, 31, 32, 33, 63, 64, 65, 127, 255, 400] {
                let data = &backing[start..start + len];
                for offset in 0..2 {
                    let expected = reference_sum(data, offset);
                    assert_eq!(
                        finalize(sum_aligned(data, offset)),
                        expected,
                        "aligned path start={start} len={len} offset={offset}"
                    );
                    assert_eq!(
                        finalize(sum_unaligned(data, offset)),
                        expected,
                        "unaligned path start={start} len={len} offset={offset}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_split_segments_combine_to_whole() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let data: Vec<u8> = (0..173).map(|_| rng.gen()).collect();
        let whole = finalize(partial_sum(&data, 0));
        for split in [1usize, 2, 3, 17, 20, 86, 172] {
            let (a, b) = data.split_at(split);
            let combined = finalize(partial_sum(a, 0) + partial_sum(b, split));
            assert_eq!(combined, whole, "split at {split}");
        }
    }

    #[test]
    fn test_all_ones_buffer_folds_to_ffff() {
        let data = [0xffu8; 1500];
        assert_eq!(finalize(partial_sum(&data, 0)), 0xffff);
    }

    #[test]
    fn test_finalize_handles_carry_chains() {
        assert_eq!(finalize(0x1_ffff), 0x0001);
        assert_eq!(finalize(0x1_0000_ffff), 0x0001);
        assert_eq!(finalize(u64::MAX), 0xffff);
    }

    #[test]
    fn test_udp_checksum_with_pseudo_header_verifies() {
        let src = Ipv4Addr::new(192, 168, 0, 1);
        let dst = Ipv4Addr::new(192, 168, 0, 2);
        let mut seg = vec![0u8; 8 + 11];
        seg[0..2].copy_from_slice(&1234u16.to_be_bytes());
        seg[2..4].copy_from_slice(&5678u16.to_be_bytes());
        let seg_len = seg.len() as u16;
        seg[4..6].copy_from_slice(&seg_len.to_be_bytes());
        seg[8..].copy_from_slice(b"hello world");

        let csum = transport_checksum(src, dst, 17, &seg);
        seg[6..8].copy_from_slice(&csum.to_be_bytes());

        let total = pseudo_header_sum(src, dst, 17, seg.len() as u16) + partial_sum(&seg, 0);
        assert_eq!(finalize(total), 0xffff, "segment with inserted checksum must verify");
    }
}
