//! The translation engine.
//!
//! Packets enter by family and leave as zero or more datagrams of the
//! other family, or as an ICMP reply back toward the sender, or not at
//! all. There is no inter-packet state here beyond the address map and its
//! pool; every datagram is translated on its own.

pub mod checksum;
mod icmp;
mod ipv4;
mod ipv6;

use std::net::{Ipv4Addr, Ipv6Addr};

use family_tun::Family;

use crate::config::Config;
use crate::map::{AddrMap, MapError};

pub(crate) const IPV4_HEADER_LEN: usize = 20;
pub(crate) const IPV6_HEADER_LEN: usize = 40;
pub(crate) const FRAG_HEADER_LEN: usize = 8;

pub(crate) const PROTO_ICMP: u8 = 1;
pub(crate) const PROTO_TCP: u8 = 6;
pub(crate) const PROTO_UDP: u8 = 17;
pub(crate) const PROTO_FRAGMENT: u8 = 44;
pub(crate) const PROTO_ICMPV6: u8 = 58;

/// Why a packet did not come out the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    BadChecksum,
    NoMapping,
    Reserved,
    PrivateUnderWkpf,
    Hairpin,
    PoolExhausted,
    HopLimitExceeded,
    Policy,
    UnsupportedIcmp(u8),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Malformed => write!(f, "malformed header"),
            DropReason::BadChecksum => write!(f, "invalid checksum"),
            DropReason::NoMapping => write!(f, "no address mapping"),
            DropReason::Reserved => write!(f, "reserved address"),
            DropReason::PrivateUnderWkpf => write!(f, "private address under well-known prefix"),
            DropReason::Hairpin => write!(f, "would hairpin"),
            DropReason::PoolExhausted => write!(f, "dynamic pool exhausted"),
            DropReason::HopLimitExceeded => write!(f, "hop limit exceeded"),
            DropReason::Policy => write!(f, "administratively untranslatable"),
            DropReason::UnsupportedIcmp(ty) => write!(f, "unsupported ICMP type {ty}"),
        }
    }
}

impl From<MapError> for DropReason {
    fn from(err: MapError) -> Self {
        match err {
            MapError::NoMatch => DropReason::NoMapping,
            MapError::PrivateUnderWkpf(_) => DropReason::PrivateUnderWkpf,
            MapError::Reserved(_) => DropReason::Reserved,
            MapError::Hairpin(_) => DropReason::Hairpin,
            MapError::Pool(_) => DropReason::PoolExhausted,
        }
    }
}

/// What to do with one ingress datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Emit these datagrams (usually one; more after fragmentation)
    Forward(Family, Vec<Vec<u8>>),
    /// Send an ICMP message back toward the sender
    Reply(Family, Vec<u8>),
    Drop(DropReason),
}

/// Counters reported at shutdown.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub translated_4to6: u64,
    pub translated_6to4: u64,
    pub icmp_replies: u64,
    pub dropped: u64,
}

/// Per-process translator state: the address map plus the handful of
/// scalars the rewrite paths need.
pub struct Translator {
    map: AddrMap,
    local4: Ipv4Addr,
    local6: Ipv6Addr,
    mtu: usize,
    strict_frag_hdr: bool,
    stats: Stats,
}

impl Translator {
    pub fn new(map: AddrMap, config: &Config, egress_mtu: u32) -> Self {
        Self {
            map,
            local4: config.local4,
            local6: config.local6,
            mtu: egress_mtu as usize,
            strict_frag_hdr: config.strict_frag_hdr,
            stats: Stats::default(),
        }
    }

    /// Translate one ingress datagram.
    pub fn handle(&mut self, family: Family, packet: &[u8], now: u64) -> Outcome {
        let outcome = match family {
            Family::Ipv4 => ipv4::handle(self, packet, now),
            Family::Ipv6 => ipv6::handle(self, packet, now),
        };
        match &outcome {
            Outcome::Forward(..) => match family {
                Family::Ipv4 => self.stats.translated_4to6 += 1,
                Family::Ipv6 => self.stats.translated_6to4 += 1,
            },
            Outcome::Reply(..) => self.stats.icmp_replies += 1,
            Outcome::Drop(reason) => {
                self.stats.dropped += 1;
                log::debug!("Dropping {family} packet: {reason}");
            }
        }
        outcome
    }

    pub fn map(&self) -> &AddrMap {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut AddrMap {
        &mut self.map
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }
}

/// Build a 20-byte IPv4 header, checksum included. `frag_off` is in
/// 8-octet units.
#[allow(clippy::too_many_arguments)]
pub(crate) fn ipv4_header(
    tos: u8,
    total_len: u16,
    id: u16,
    df: bool,
    mf: bool,
    frag_off: u16,
    ttl: u8,
    proto: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> [u8; IPV4_HEADER_LEN] {
    let mut header = [0u8; IPV4_HEADER_LEN];
    header[0] = 0x45;
    header[1] = tos;
    header[2..4].copy_from_slice(&total_len.to_be_bytes());
    header[4..6].copy_from_slice(&id.to_be_bytes());
    let flags = (u16::from(df) << 14) | (u16::from(mf) << 13) | (frag_off & 0x1fff);
    header[6..8].copy_from_slice(&flags.to_be_bytes());
    header[8] = ttl;
    header[9] = proto;
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());
    let csum = checksum::Sum16::new().add_slice(&header).finish();
    header[10..12].copy_from_slice(&csum.to_be_bytes());
    header
}

/// Build a 40-byte IPv6 header. The flow label is always zero.
pub(crate) fn ipv6_header(
    traffic_class: u8,
    payload_len: u16,
    next_header: u8,
    hop_limit: u8,
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
) -> [u8; IPV6_HEADER_LEN] {
    let mut header = [0u8; IPV6_HEADER_LEN];
    header[0] = 0x60 | (traffic_class >> 4);
    header[1] = traffic_class << 4;
    header[4..6].copy_from_slice(&payload_len.to_be_bytes());
    header[6] = next_header;
    header[7] = hop_limit;
    header[8..24].copy_from_slice(&src.octets());
    header[24..40].copy_from_slice(&dst.octets());
    header
}

/// Build an IPv6 fragment extension header. `frag_off` is in 8-octet
/// units.
pub(crate) fn frag_header(next_header: u8, frag_off: u16, mf: bool, id: u32) -> [u8; FRAG_HEADER_LEN] {
    let mut header = [0u8; FRAG_HEADER_LEN];
    header[0] = next_header;
    let off_flags = (frag_off << 3) | u16::from(mf);
    header[2..4].copy_from_slice(&off_flags.to_be_bytes());
    header[4..8].copy_from_slice(&id.to_be_bytes());
    header
}

#[cfg(test)]
mod tests {
    use super::checksum::Sum16;
    use super::*;
    use crate::map::AddrMap;
    use pnet::packet::icmpv6::Icmpv6Packet;
    use pnet::packet::ipv4::Ipv4Packet;
    use pnet::packet::ipv6::Ipv6Packet;
    use pnet::packet::tcp::TcpPacket;
    use pnet::packet::udp::UdpPacket;
    use pnet::packet::Packet;

    const NOW: u64 = 1_000;

    fn config() -> Config {
        Config {
            tun_device: "nat64".to_string(),
            local4: "192.0.2.254".parse().unwrap(),
            local6: "2001:db8::ff".parse().unwrap(),
            static_maps: vec![("203.0.113.5".parse().unwrap(), "2001:db8:1::5".parse().unwrap())],
            prefix: Some("64:ff9b::/96".parse().unwrap()),
            dynamic_pool: Some("198.51.100.0/24".parse().unwrap()),
            ..Config::default()
        }
    }

    fn translator(mtu: u32) -> Translator {
        let config = config();
        Translator::new(AddrMap::new(&config), &config, mtu)
    }

    fn build_ipv4(proto: u8, src: &str, dst: &str, df: bool, mf: bool, frag_off: u16, id: u16, l4: &[u8]) -> Vec<u8> {
        let header = ipv4_header(
            0,
            (IPV4_HEADER_LEN + l4.len()) as u16,
            id,
            df,
            mf,
            frag_off,
            64,
            proto,
            src.parse().unwrap(),
            dst.parse().unwrap(),
        );
        [&header[..], l4].concat()
    }

    fn build_ipv6(proto: u8, src: &str, dst: &str, l4: &[u8]) -> Vec<u8> {
        let header = ipv6_header(
            0,
            l4.len() as u16,
            proto,
            64,
            &src.parse().unwrap(),
            &dst.parse().unwrap(),
        );
        [&header[..], l4].concat()
    }

    /// A UDP datagram with a checksum valid under the given pseudo-header
    /// sum (pass 0 to leave the checksum empty).
    fn build_udp(sport: u16, dport: u16, payload: &[u8], pseudo: u32) -> Vec<u8> {
        let len = (8 + payload.len()) as u16;
        let mut udp = Vec::with_capacity(usize::from(len));
        udp.extend_from_slice(&sport.to_be_bytes());
        udp.extend_from_slice(&dport.to_be_bytes());
        udp.extend_from_slice(&len.to_be_bytes());
        udp.extend_from_slice(&[0, 0]);
        udp.extend_from_slice(payload);
        if pseudo != 0 {
            let csum = Sum16::new().add_u32(pseudo).add_slice(&udp).finish();
            let csum = if csum == 0 { 0xffff } else { csum };
            udp[6..8].copy_from_slice(&csum.to_be_bytes());
        }
        udp
    }

    fn forwarded(outcome: Outcome, family: Family) -> Vec<u8> {
        match outcome {
            Outcome::Forward(got, mut packets) => {
                assert_eq!(got, family);
                assert_eq!(packets.len(), 1, "expected exactly one datagram");
                packets.pop().unwrap()
            }
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    fn replied(outcome: Outcome, family: Family) -> Vec<u8> {
        match outcome {
            Outcome::Reply(got, packet) => {
                assert_eq!(got, family);
                packet
            }
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[test]
    fn test_udp_6to4_assigns_first_pool_address() {
        let mut tx = translator(1500);
        let src6 = "2001:db8::1";
        let dst6 = "64:ff9b::c000:201"; // 192.0.2.1
        let pseudo = checksum::pseudo_sum6(
            &src6.parse().unwrap(),
            &dst6.parse().unwrap(),
            PROTO_UDP,
            9,
        );
        let packet = build_ipv6(PROTO_UDP, src6, dst6, &build_udp(1000, 53, b"Q", pseudo));

        let out = forwarded(tx.handle(Family::Ipv6, &packet, NOW), Family::Ipv4);
        let ip = Ipv4Packet::new(&out).unwrap();
        assert_eq!(ip.get_source(), "198.51.100.1".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(ip.get_destination(), "192.0.2.1".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(ip.get_ttl(), 63);
        assert_eq!(ip.get_checksum(), pnet::packet::ipv4::checksum(&ip));

        let udp = UdpPacket::new(ip.payload()).unwrap();
        assert_eq!(udp.get_source(), 1000);
        assert_eq!(udp.get_destination(), 53);
        assert_eq!(udp.payload(), b"Q");
        assert_eq!(
            udp.get_checksum(),
            pnet::packet::udp::ipv4_checksum(&udp, &ip.get_source(), &ip.get_destination())
        );
    }

    #[test]
    fn test_tcp_4to6_static_map() {
        let mut tx = translator(1500);
        // Give 198.51.100.1 an owner on the IPv6 side first
        let bound6: std::net::Ipv6Addr = "2001:db8::77".parse().unwrap();
        assert_eq!(
            tx.map_mut().host_6to4(bound6, true, NOW),
            Ok("198.51.100.1".parse().unwrap())
        );

        // SYN-ACK from the statically mapped host toward the binding
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&443u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&50000u16.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = 0x12; // SYN|ACK
        let pseudo = checksum::pseudo_sum4(
            "203.0.113.5".parse().unwrap(),
            "198.51.100.1".parse().unwrap(),
            PROTO_TCP,
            20,
        );
        let csum = Sum16::new().add_u32(pseudo).add_slice(&tcp).finish();
        tcp[16..18].copy_from_slice(&csum.to_be_bytes());

        let packet = build_ipv4(PROTO_TCP, "203.0.113.5", "198.51.100.1", true, false, 0, 0, &tcp);
        let out = forwarded(tx.handle(Family::Ipv4, &packet, NOW), Family::Ipv6);

        let ip = Ipv6Packet::new(&out).unwrap();
        assert_eq!(ip.get_source(), "2001:db8:1::5".parse::<std::net::Ipv6Addr>().unwrap());
        assert_eq!(ip.get_destination(), bound6);
        assert_eq!(ip.get_next_header().0, PROTO_TCP); // DF=1: no fragment header
        assert_eq!(ip.get_hop_limit(), 63);

        let out_tcp = TcpPacket::new(ip.payload()).unwrap();
        assert_eq!(out_tcp.get_source(), 443);
        assert_eq!(out_tcp.get_destination(), 50000);
        assert_eq!(out_tcp.get_flags(), 0x12);
        assert_eq!(
            out_tcp.get_checksum(),
            pnet::packet::tcp::ipv6_checksum(&out_tcp, &ip.get_source(), &ip.get_destination())
        );
    }

    #[test]
    fn test_icmp_echo_4to6() {
        let mut tx = translator(1500);
        tx.map_mut().host_6to4("2001:db8::1".parse().unwrap(), true, NOW).unwrap();

        let mut icmp = vec![8u8, 0, 0, 0, 0x12, 0x34, 0, 1];
        icmp.extend_from_slice(&[0xa5; 32]);
        let csum = Sum16::new().add_slice(&icmp).finish();
        icmp[2..4].copy_from_slice(&csum.to_be_bytes());

        let packet = build_ipv4(PROTO_ICMP, "192.0.2.1", "198.51.100.1", true, false, 0, 0, &icmp);
        let out = forwarded(tx.handle(Family::Ipv4, &packet, NOW), Family::Ipv6);

        let ip = Ipv6Packet::new(&out).unwrap();
        assert_eq!(ip.get_next_header().0, PROTO_ICMPV6);
        let echo = ip.payload();
        assert_eq!(echo[0], 128);
        assert_eq!(echo[1], 0);
        assert_eq!(&echo[4..8], &[0x12, 0x34, 0, 1]); // identifier and sequence
        assert_eq!(&echo[8..], &[0xa5; 32][..]);
        let oracle = pnet::packet::icmpv6::checksum(
            &Icmpv6Packet::new(echo).unwrap(),
            &ip.get_source(),
            &ip.get_destination(),
        );
        assert_eq!(u16::from_be_bytes([echo[2], echo[3]]), oracle);
    }

    #[test]
    fn test_fragment_4to6_preserves_identification() {
        let mut tx = translator(1600);
        tx.map_mut().host_6to4("2001:db8::1".parse().unwrap(), true, NOW).unwrap();

        // The checksum covers the whole (unseen) datagram; any nonzero
        // value stands in for it here
        let mut udp = build_udp(2000, 2001, &[0x42; 1472], 0);
        udp[6..8].copy_from_slice(&[0xbe, 0xef]);
        let packet = build_ipv4(
            PROTO_UDP,
            "192.0.2.1",
            "198.51.100.1",
            false,
            true,
            0,
            0xabcd,
            &udp,
        );
        let out = forwarded(tx.handle(Family::Ipv4, &packet, NOW), Family::Ipv6);

        let ip = Ipv6Packet::new(&out).unwrap();
        assert_eq!(ip.get_next_header().0, PROTO_FRAGMENT);
        let frag = ip.payload();
        assert_eq!(frag[0], PROTO_UDP); // chain 44 -> 17
        let off_flags = u16::from_be_bytes([frag[2], frag[3]]);
        assert_eq!(off_flags >> 3, 0, "offset");
        assert_eq!(off_flags & 1, 1, "more-fragments");
        assert_eq!(&frag[4..8], &0x0000_abcdu32.to_be_bytes());

        // Payload bytes are identical apart from the adjusted checksum
        let out_udp = &frag[8..];
        assert_eq!(out_udp.len(), udp.len());
        assert_eq!(&out_udp[..6], &udp[..6]);
        assert_eq!(&out_udp[8..], &udp[8..]);
        let expected = checksum::adjust(
            0xbeef,
            ipv4::pseudo4("192.0.2.1".parse().unwrap(), "198.51.100.1".parse().unwrap()),
            ipv4::pseudo6(&ip.get_source(), &ip.get_destination()),
        );
        assert_eq!(u16::from_be_bytes([out_udp[6], out_udp[7]]), expected);
    }

    #[test]
    fn test_packet_too_big_reply() {
        let mut tx = translator(1280);
        let src6 = "2001:db8::1";
        let dst6 = "64:ff9b::c000:201";
        let udp = build_udp(1000, 53, &[0x11; 1452], 1);
        let packet = build_ipv6(PROTO_UDP, src6, dst6, &udp);
        assert_eq!(packet.len(), 1500);

        let out = replied(tx.handle(Family::Ipv6, &packet, NOW), Family::Ipv6);
        let ip = Ipv6Packet::new(&out).unwrap();
        assert_eq!(ip.get_source(), "2001:db8::ff".parse::<std::net::Ipv6Addr>().unwrap());
        assert_eq!(ip.get_destination(), src6.parse::<std::net::Ipv6Addr>().unwrap());
        let icmp = ip.payload();
        assert_eq!((icmp[0], icmp[1]), (2, 0)); // Packet Too Big
        assert_eq!(u32::from_be_bytes([icmp[4], icmp[5], icmp[6], icmp[7]]), 1260);
        assert!(out.len() <= 1280);
        let oracle = pnet::packet::icmpv6::checksum(
            &Icmpv6Packet::new(icmp).unwrap(),
            &ip.get_source(),
            &ip.get_destination(),
        );
        assert_eq!(u16::from_be_bytes([icmp[2], icmp[3]]), oracle);
    }

    #[test]
    fn test_wkpf_strict_drops_private_destination() {
        let mut config = config();
        config.wkpf_strict = true;
        let mut tx = Translator::new(AddrMap::new(&config), &config, 1500);

        let pseudo = checksum::pseudo_sum6(
            &"2001:db8::1".parse().unwrap(),
            &"64:ff9b::a00:1".parse().unwrap(),
            PROTO_UDP,
            9,
        );
        let packet = build_ipv6(
            PROTO_UDP,
            "2001:db8::1",
            "64:ff9b::a00:1", // 10.0.0.1
            &build_udp(1000, 53, b"Q", pseudo),
        );
        assert_eq!(
            tx.handle(Family::Ipv6, &packet, NOW),
            Outcome::Drop(DropReason::PrivateUnderWkpf)
        );
    }

    #[test]
    fn test_round_trip_between_static_pairs() {
        let mut config = config();
        config.static_maps.push(("203.0.113.6".parse().unwrap(), "2001:db8:1::6".parse().unwrap()));
        let mut tx = Translator::new(AddrMap::new(&config), &config, 1500);

        let pseudo = checksum::pseudo_sum6(
            &"2001:db8:1::5".parse().unwrap(),
            &"2001:db8:1::6".parse().unwrap(),
            PROTO_UDP,
            13,
        );
        let original = build_ipv6(
            PROTO_UDP,
            "2001:db8:1::5",
            "2001:db8:1::6",
            &build_udp(4000, 4001, b"hello", pseudo),
        );

        let v4 = forwarded(tx.handle(Family::Ipv6, &original, NOW), Family::Ipv4);
        let back = forwarded(tx.handle(Family::Ipv4, &v4, NOW), Family::Ipv6);

        // Identical apart from the hop limit, which dropped once per leg
        let mut expected = original.clone();
        expected[7] -= 2;
        assert_eq!(back, expected);
    }

    #[test]
    fn test_icmp_error_quotes_translated_datagram() {
        let mut tx = translator(1500);
        tx.map_mut().host_6to4("2001:db8::1".parse().unwrap(), true, NOW).unwrap();

        // A router on the v4 side bounced our translated UDP datagram
        let quoted_udp = build_udp(1000, 53, b"Q", 1);
        let mut quoted_udp = quoted_udp;
        quoted_udp[6..8].copy_from_slice(&[0x12, 0x21]);
        let quoted = build_ipv4(
            PROTO_UDP,
            "198.51.100.1",
            "192.0.2.1",
            true,
            false,
            0,
            0,
            &quoted_udp,
        );
        let mut icmp = vec![11u8, 0, 0, 0, 0, 0, 0, 0];
        icmp.extend_from_slice(&quoted);
        let csum = Sum16::new().add_slice(&icmp).finish();
        icmp[2..4].copy_from_slice(&csum.to_be_bytes());
        let packet = build_ipv4(PROTO_ICMP, "192.0.2.50", "198.51.100.1", true, false, 0, 0, &icmp);

        let out = forwarded(tx.handle(Family::Ipv4, &packet, NOW), Family::Ipv6);
        let ip = Ipv6Packet::new(&out).unwrap();
        assert_eq!(ip.get_next_header().0, PROTO_ICMPV6);
        let body = ip.payload();
        assert_eq!((body[0], body[1]), (3, 0)); // Time Exceeded

        // The quoted datagram is itself translated, with roles reversed
        let inner = Ipv6Packet::new(&body[8..]).unwrap();
        assert_eq!(inner.get_source(), "2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap());
        assert_eq!(
            inner.get_destination(),
            "64:ff9b::c000:201".parse::<std::net::Ipv6Addr>().unwrap()
        );
        assert_eq!(inner.get_next_header().0, PROTO_UDP);
        let inner_udp = UdpPacket::new(inner.payload()).unwrap();
        assert_eq!(inner_udp.get_source(), 1000);
        assert_eq!(inner_udp.get_destination(), 53);
    }

    #[test]
    fn test_error_quoting_error_is_dropped() {
        let mut tx = translator(1500);
        tx.map_mut().host_6to4("2001:db8::1".parse().unwrap(), true, NOW).unwrap();

        // Quoted datagram is itself an ICMP error: translating it would
        // recurse past the depth cap
        let mut quoted_icmp = vec![11u8, 0, 0, 0, 0, 0, 0, 0];
        quoted_icmp.extend_from_slice(&[0u8; 28]);
        let quoted = build_ipv4(
            PROTO_ICMP,
            "198.51.100.1",
            "192.0.2.1",
            true,
            false,
            0,
            0,
            &quoted_icmp,
        );
        let mut icmp = vec![11u8, 0, 0, 0, 0, 0, 0, 0];
        icmp.extend_from_slice(&quoted);
        let csum = Sum16::new().add_slice(&icmp).finish();
        icmp[2..4].copy_from_slice(&csum.to_be_bytes());
        let packet = build_ipv4(PROTO_ICMP, "192.0.2.50", "198.51.100.1", true, false, 0, 0, &icmp);

        assert_eq!(
            tx.handle(Family::Ipv4, &packet, NOW),
            Outcome::Drop(DropReason::Policy)
        );
    }

    #[test]
    fn test_neighbor_discovery_is_not_forwarded() {
        let mut tx = translator(1500);
        // Neighbor solicitation for the prefix address
        let ns = vec![135u8, 0, 0, 0, 0, 0, 0, 0];
        let packet = build_ipv6(PROTO_ICMPV6, "fe80::1", "64:ff9b::c000:201", &ns);
        assert_eq!(
            tx.handle(Family::Ipv6, &packet, NOW),
            Outcome::Drop(DropReason::Policy)
        );
    }

    #[test]
    fn test_hop_limit_expiry_generates_time_exceeded() {
        let mut tx = translator(1500);
        let pseudo = checksum::pseudo_sum6(
            &"2001:db8::1".parse().unwrap(),
            &"64:ff9b::c000:201".parse().unwrap(),
            PROTO_UDP,
            9,
        );
        let mut packet = build_ipv6(
            PROTO_UDP,
            "2001:db8::1",
            "64:ff9b::c000:201",
            &build_udp(1000, 53, b"Q", pseudo),
        );
        packet[7] = 1; // hop limit about to expire

        let out = replied(tx.handle(Family::Ipv6, &packet, NOW), Family::Ipv6);
        let ip = Ipv6Packet::new(&out).unwrap();
        assert_eq!(ip.get_destination(), "2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap());
        assert_eq!((ip.payload()[0], ip.payload()[1]), (3, 0)); // Time Exceeded, hop limit
    }

    #[test]
    fn test_echo_to_translator_is_answered() {
        let mut tx = translator(1500);
        let mut echo = vec![128u8, 0, 0, 0, 0x77, 0x01, 0, 9];
        echo.extend_from_slice(b"ping-data");
        let pseudo = checksum::pseudo_sum6(
            &"2001:db8::1".parse().unwrap(),
            &"2001:db8::ff".parse().unwrap(),
            PROTO_ICMPV6,
            echo.len() as u32,
        );
        let csum = Sum16::new().add_u32(pseudo).add_slice(&echo).finish();
        echo[2..4].copy_from_slice(&csum.to_be_bytes());
        let packet = build_ipv6(PROTO_ICMPV6, "2001:db8::1", "2001:db8::ff", &echo);

        let out = replied(tx.handle(Family::Ipv6, &packet, NOW), Family::Ipv6);
        let ip = Ipv6Packet::new(&out).unwrap();
        assert_eq!(ip.get_source(), "2001:db8::ff".parse::<std::net::Ipv6Addr>().unwrap());
        assert_eq!(ip.get_destination(), "2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap());
        let body = ip.payload();
        assert_eq!(body[0], 129);
        assert_eq!(&body[4..8], &[0x77, 0x01, 0, 9]);
        let oracle = pnet::packet::icmpv6::checksum(
            &Icmpv6Packet::new(body).unwrap(),
            &ip.get_source(),
            &ip.get_destination(),
        );
        assert_eq!(u16::from_be_bytes([body[2], body[3]]), oracle);
    }

    #[test]
    fn test_strict_frag_order_rejected() {
        let mut config = config();
        config.strict_frag_hdr = true;
        let mut tx = Translator::new(AddrMap::new(&config), &config, 1500);

        // destination-options header before the fragment header
        let mut l4 = Vec::new();
        l4.extend_from_slice(&[PROTO_FRAGMENT, 0, 1, 4, 0, 0, 0, 0]); // dest-opts, PadN
        l4.extend_from_slice(&frag_header(PROTO_UDP, 0, true, 7));
        l4.extend_from_slice(&build_udp(1, 2, b"x", 1));
        let packet = build_ipv6(60, "2001:db8::1", "64:ff9b::c000:201", &l4);

        assert_eq!(
            tx.handle(Family::Ipv6, &packet, NOW),
            Outcome::Drop(DropReason::Malformed)
        );
    }
}
