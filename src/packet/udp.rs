//! Ethernet + IPv4 + UDP template.

use super::{
    fill_ipv4_checksum, fill_udp_checksum, set_ipv4_id, wrapped_seq, write_eth, write_ipv4,
    PacketKind, ETH_HLEN, IPPROTO_UDP, IPV4_HLEN, UDP_HLEN,
};
use crate::pktio::{Packet, PacketPool, TxChecksum};
use crate::AddressConfig;

/// UDP datagrams of a fixed payload length between the configured endpoints.
#[derive(Debug, Clone)]
pub struct UdpPacketKind {
    addr: AddressConfig,
    payload_len: usize,
}

impl UdpPacketKind {
    pub fn new(addr: AddressConfig, payload_len: usize) -> Self {
        Self { addr, payload_len }
    }
}

impl PacketKind for UdpPacketKind {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn frame_len(&self) -> usize {
        ETH_HLEN + IPV4_HLEN + UDP_HLEN + self.payload_len
    }

    fn build_reference(&self, pool: &PacketPool, offload: &TxChecksum) -> Option<Packet> {
        let mut pkt = pool.alloc(self.frame_len())?;
        let l3 = ETH_HLEN;
        let l4 = l3 + IPV4_HLEN;
        let udp_len = (UDP_HLEN + self.payload_len) as u16;

        let data = pkt.data_mut();
        write_eth(&mut data[..l3], self.addr.src_mac, self.addr.dst_mac);
        write_ipv4(
            &mut data[l3..l4],
            self.addr.src_ip,
            self.addr.dst_ip,
            IPPROTO_UDP,
            IPV4_HLEN as u16 + udp_len,
        );
        data[l4..l4 + 2].copy_from_slice(&self.addr.src_port.to_be_bytes());
        data[l4 + 2..l4 + 4].copy_from_slice(&self.addr.dst_port.to_be_bytes());
        data[l4 + 4..l4 + 6].copy_from_slice(&udp_len.to_be_bytes());
        data[l4 + 6..l4 + 8].fill(0);

        if !offload.ipv4 {
            fill_ipv4_checksum(data, l3);
        }
        // The pseudo-header does not include the IPv4 id, so the UDP checksum
        // stays valid for every sequence number.
        if !offload.udp {
            fill_udp_checksum(data, l3, l4);
        }

        let meta = pkt.meta_mut();
        meta.set_offsets(0, l3 as u16, l4 as u16);
        meta.has_ipv4 = true;
        meta.has_udp = true;
        meta.insert_ipv4_checksum = offload.ipv4;
        meta.insert_udp_checksum = offload.udp;
        Some(pkt)
    }

    fn prepare(&self, pkt: &mut Packet, offload: &TxChecksum, seq: u64) {
        let data = pkt.data_mut();
        set_ipv4_id(data, ETH_HLEN, wrapped_seq(seq));
        if !offload.ipv4 {
            fill_ipv4_checksum(data, ETH_HLEN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;
    use crate::packet::ipv4_id;
    use std::net::Ipv4Addr;

    fn addr() -> AddressConfig {
        AddressConfig {
            src_mac: "02:00:00:00:00:01".parse().unwrap(),
            dst_mac: "02:00:00:00:00:02".parse().unwrap(),
            src_ip: Ipv4Addr::new(192, 168, 0, 1),
            dst_ip: Ipv4Addr::new(192, 168, 0, 2),
            src_port: 1234,
            dst_port: 5678,
        }
    }

    fn udp_verifies(frame: &[u8]) -> bool {
        let l3 = ETH_HLEN;
        let l4 = l3 + IPV4_HLEN;
        let seg = &frame[l4..];
        let sum = checksum::pseudo_header_sum(
            Ipv4Addr::new(192, 168, 0, 1),
            Ipv4Addr::new(192, 168, 0, 2),
            IPPROTO_UDP,
            seg.len() as u16,
        ) + checksum::partial_sum(seg, 0);
        checksum::finalize(sum) == 0xffff
    }

    #[test]
    fn test_reference_headers_populated() {
        let pool = PacketPool::new(4, 2048);
        let kind = UdpPacketKind::new(addr(), 56);
        let pkt = kind.build_reference(&pool, &TxChecksum::default()).unwrap();
        let d = pkt.data();

        assert_eq!(pkt.len(), 14 + 20 + 8 + 56);
        assert_eq!(&d[0..6], &[2, 0, 0, 0, 0, 2], "destination MAC first");
        assert_eq!(&d[6..12], &[2, 0, 0, 0, 0, 1]);
        assert_eq!(&d[12..14], &[0x08, 0x00]);
        assert_eq!(d[14], 0x45);
        assert_eq!(u16::from_be_bytes([d[16], d[17]]), 20 + 8 + 56, "IPv4 total length");
        assert_eq!(d[22], 64, "TTL");
        assert_eq!(d[23], IPPROTO_UDP);
        assert_eq!(ipv4_id(d, ETH_HLEN), 0);
        assert_eq!(u16::from_be_bytes([d[34], d[35]]), 1234);
        assert_eq!(u16::from_be_bytes([d[36], d[37]]), 5678);
        assert_eq!(u16::from_be_bytes([d[38], d[39]]), 8 + 56, "UDP length");

        let meta = pkt.meta();
        assert!(meta.has_ipv4 && meta.has_udp);
        assert_eq!(meta.l4_offset, Some(34));
    }

    #[test]
    fn test_software_checksums_verify() {
        let pool = PacketPool::new(4, 2048);
        let kind = UdpPacketKind::new(addr(), 57);
        let pkt = kind.build_reference(&pool, &TxChecksum::default()).unwrap();
        assert!(checksum::verify(&pkt.data()[14..34]), "IPv4 header checksum");
        assert!(udp_verifies(pkt.data()), "UDP checksum over pseudo-header");
    }

    #[test]
    fn test_offloaded_checksums_left_zero_and_flagged() {
        let pool = PacketPool::new(4, 2048);
        let kind = UdpPacketKind::new(addr(), 56);
        let offload = TxChecksum { ipv4: true, udp: true };
        let pkt = kind.build_reference(&pool, &offload).unwrap();
        assert_eq!(&pkt.data()[24..26], &[0, 0], "IPv4 checksum left for the interface");
        assert_eq!(&pkt.data()[40..42], &[0, 0], "UDP checksum left for the interface");
        assert!(pkt.meta().insert_ipv4_checksum);
        assert!(pkt.meta().insert_udp_checksum);
    }

    #[test]
    fn test_prepare_sets_id_and_keeps_checksums_valid() {
        let pool = PacketPool::new(4, 2048);
        let kind = UdpPacketKind::new(addr(), 56);
        let offload = TxChecksum::default();
        let mut pkt = kind.build_reference(&pool, &offload).unwrap();
        for seq in [1u64, 77, 0xfffe, 0xffff, 0x1_2345] {
            kind.prepare(&mut pkt, &offload, seq);
            assert_eq!(ipv4_id(pkt.data(), ETH_HLEN), wrapped_seq(seq));
            assert!(checksum::verify(&pkt.data()[14..34]), "seq {seq}: IPv4 checksum");
            assert!(udp_verifies(pkt.data()), "seq {seq}: UDP checksum");
        }
    }

    #[test]
    fn test_oversized_frame_not_built() {
        let pool = PacketPool::new(4, 100);
        let kind = UdpPacketKind::new(addr(), 100);
        assert!(kind.build_reference(&pool, &TxChecksum::default()).is_none());
    }
}
