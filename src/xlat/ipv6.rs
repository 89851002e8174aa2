//! IPv6 ingress: extension-header walk, validation, and rewrite into IPv4.

use std::net::{Ipv4Addr, Ipv6Addr};

use family_tun::Family;

use super::checksum;
use super::ipv4::{pseudo4, pseudo6};
use super::{
    icmp, ipv4_header, DropReason, Outcome, Translator, IPV4_HEADER_LEN, IPV6_HEADER_LEN,
    PROTO_FRAGMENT, PROTO_ICMP, PROTO_ICMPV6, PROTO_TCP, PROTO_UDP,
};

const EXT_HOP_BY_HOP: u8 = 0;
const EXT_ROUTING: u8 = 43;
const EXT_DEST_OPTS: u8 = 60;
const EXT_NO_NEXT_HEADER: u8 = 59;

/// Cap on chained extension headers; real traffic has one or two.
const MAX_EXT_HEADERS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub(crate) struct FragInfo {
    pub id: u32,
    /// In 8-octet units, as on the wire
    pub offset: u16,
    pub mf: bool,
}

/// The IPv6 header chain summarized for the rewrite.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ipv6Meta {
    pub traffic_class: u8,
    pub hop_limit: u8,
    /// Upper-layer protocol at the end of the extension chain
    pub proto: u8,
    pub header_len: usize,
    pub total_len: usize,
    pub frag: Option<FragInfo>,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

impl Ipv6Meta {
    pub fn is_first_fragment(&self) -> bool {
        self.frag.is_none_or(|frag| frag.offset == 0)
    }
}

/// Parse an IPv6 header and walk its extension chain.
pub(crate) fn parse(packet: &[u8], strict_frag_hdr: bool) -> Result<Ipv6Meta, DropReason> {
    parse_inner(packet, strict_frag_hdr, false)
}

/// Relaxed parse for the datagram embedded in an ICMPv6 error, where the
/// tail (and with it the stated payload length) is usually truncated.
pub(crate) fn parse_embedded(packet: &[u8]) -> Result<Ipv6Meta, DropReason> {
    parse_inner(packet, false, true)
}

fn parse_inner(packet: &[u8], strict_frag_hdr: bool, embedded: bool) -> Result<Ipv6Meta, DropReason> {
    if packet.len() < IPV6_HEADER_LEN {
        return Err(DropReason::Malformed);
    }
    if packet[0] >> 4 != 6 {
        return Err(DropReason::Malformed);
    }
    let payload_len = usize::from(u16::from_be_bytes([packet[4], packet[5]]));
    let total_len = IPV6_HEADER_LEN + payload_len;
    if !embedded && total_len > packet.len() {
        return Err(DropReason::Malformed);
    }

    let mut meta = Ipv6Meta {
        traffic_class: (packet[0] << 4) | (packet[1] >> 4),
        hop_limit: packet[7],
        proto: packet[6],
        header_len: IPV6_HEADER_LEN,
        total_len,
        frag: None,
        src: slice_to_v6(&packet[8..24]),
        dst: slice_to_v6(&packet[24..40]),
    };

    let walk_end = packet.len().min(total_len);
    let mut saw_non_hbh = false;
    for _ in 0..MAX_EXT_HEADERS {
        let offset = meta.header_len;
        let ext_len = match meta.proto {
            EXT_NO_NEXT_HEADER => {
                meta.total_len = offset;
                return Ok(meta);
            }
            EXT_HOP_BY_HOP => {
                // Hop-by-hop is only legal immediately after the fixed header
                if offset != IPV6_HEADER_LEN {
                    return Err(DropReason::Malformed);
                }
                let len = ext_header_len(packet, offset, walk_end)?;
                check_options(&packet[offset + 2..offset + len])?;
                len
            }
            EXT_DEST_OPTS => {
                saw_non_hbh = true;
                ext_header_len(packet, offset, walk_end)?
            }
            EXT_ROUTING => {
                if offset + 4 > walk_end {
                    return Err(DropReason::Malformed);
                }
                // A routing header with segments left would route through
                // us twice; we are not that kind of router
                if packet[offset + 3] != 0 {
                    return Err(DropReason::Policy);
                }
                saw_non_hbh = true;
                ext_header_len(packet, offset, walk_end)?
            }
            PROTO_FRAGMENT => {
                if offset + 8 > walk_end {
                    return Err(DropReason::Malformed);
                }
                if meta.frag.is_some() {
                    return Err(DropReason::Malformed);
                }
                if strict_frag_hdr && saw_non_hbh {
                    return Err(DropReason::Malformed);
                }
                let off_flags = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]);
                meta.frag = Some(FragInfo {
                    id: u32::from_be_bytes([
                        packet[offset + 4],
                        packet[offset + 5],
                        packet[offset + 6],
                        packet[offset + 7],
                    ]),
                    offset: off_flags >> 3,
                    mf: off_flags & 1 != 0,
                });
                8
            }
            _ => return Ok(meta),
        };
        meta.proto = packet[offset];
        meta.header_len = offset + ext_len;
    }
    Err(DropReason::Malformed)
}

fn ext_header_len(packet: &[u8], offset: usize, walk_end: usize) -> Result<usize, DropReason> {
    if offset + 2 > walk_end {
        return Err(DropReason::Malformed);
    }
    let len = (usize::from(packet[offset + 1]) + 1) * 8;
    if offset + len > walk_end {
        return Err(DropReason::Malformed);
    }
    Ok(len)
}

/// Walk a TLV option block; an option we would have to act on (action
/// bits other than skip-and-continue) kills the packet.
fn check_options(options: &[u8]) -> Result<(), DropReason> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            0 => i += 1, // Pad1
            ty if ty >> 6 == 0 => {
                if i + 1 >= options.len() {
                    return Err(DropReason::Malformed);
                }
                i += 2 + usize::from(options[i + 1]);
            }
            _ => return Err(DropReason::Policy),
        }
    }
    Ok(())
}

fn slice_to_v6(slice: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(slice);
    Ipv6Addr::from(octets)
}

/// Translate one IPv6 ingress datagram into IPv4.
pub(super) fn handle(tx: &mut Translator, packet: &[u8], now: u64) -> Outcome {
    let meta = match parse(packet, tx.strict_frag_hdr) {
        Ok(meta) => meta,
        Err(reason) => return Outcome::Drop(reason),
    };
    let payload = &packet[meta.header_len..meta.total_len];

    // Neighbor discovery and router chatter is link business, not ours
    if meta.proto == PROTO_ICMPV6 && meta.is_first_fragment() {
        if let Some(&ty) = payload.first() {
            if (133..=137).contains(&ty) {
                return Outcome::Drop(DropReason::Policy);
            }
        }
    }
    if meta.dst.is_multicast() {
        return Outcome::Drop(DropReason::Policy);
    }

    // Traffic for the translator itself terminates here
    if meta.dst == tx.local6 {
        return icmp::local6(tx, &meta, payload);
    }

    if meta.hop_limit <= 1 {
        return icmp::time_exceeded6(tx, packet, &meta);
    }

    let src4 = match tx.map.host_6to4(meta.src, true, now) {
        Ok(addr) => addr,
        Err(err) => return Outcome::Drop(err.into()),
    };
    let dst4 = match tx.map.extract_6to4(meta.dst, now) {
        Ok(addr) => addr,
        Err(err) => return Outcome::Drop(err.into()),
    };

    let (proto, l4) = match translate_payload(tx, &meta, payload, src4, dst4, now) {
        Ok(translated) => translated,
        Err(reason) => return Outcome::Drop(reason),
    };

    if IPV4_HEADER_LEN + l4.len() > tx.mtu {
        match meta.frag {
            // DF on the IPv4 side is implied: tell the sender to shrink
            None => return icmp::packet_too_big(tx, packet, &meta),
            Some(frag) => {
                return Outcome::Forward(
                    Family::Ipv4,
                    fragment4(tx.mtu, &meta, &frag, proto, src4, dst4, &l4),
                )
            }
        }
    }

    let (id, df, mf, frag_off) = match meta.frag {
        Some(frag) => (frag.id as u16, false, frag.mf, frag.offset),
        None => (0, true, false, 0),
    };
    let header = ipv4_header(
        meta.traffic_class,
        (IPV4_HEADER_LEN + l4.len()) as u16,
        id,
        df,
        mf,
        frag_off,
        meta.hop_limit - 1,
        proto,
        src4,
        dst4,
    );
    let mut out = Vec::with_capacity(IPV4_HEADER_LEN + l4.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&l4);
    Outcome::Forward(Family::Ipv4, vec![out])
}

/// Rewrite the transport payload for its new pseudo-header. Returns the
/// IPv4 protocol value and the payload bytes.
fn translate_payload(
    tx: &mut Translator,
    meta: &Ipv6Meta,
    payload: &[u8],
    src4: Ipv4Addr,
    dst4: Ipv4Addr,
    now: u64,
) -> Result<(u8, Vec<u8>), DropReason> {
    match meta.proto {
        PROTO_TCP => {
            let mut data = payload.to_vec();
            if meta.is_first_fragment() {
                if data.len() < 20 {
                    return Err(DropReason::Malformed);
                }
                let old = u16::from_be_bytes([data[16], data[17]]);
                let new = checksum::adjust(
                    old,
                    pseudo6(&meta.src, &meta.dst),
                    pseudo4(src4, dst4),
                );
                data[16..18].copy_from_slice(&new.to_be_bytes());
            }
            Ok((PROTO_TCP, data))
        }
        PROTO_UDP => {
            let mut data = payload.to_vec();
            if meta.is_first_fragment() {
                if data.len() < 8 {
                    return Err(DropReason::Malformed);
                }
                let old = u16::from_be_bytes([data[6], data[7]]);
                // UDP over IPv6 must carry a checksum
                if old == 0 {
                    return Err(DropReason::BadChecksum);
                }
                let new = checksum::adjust(
                    old,
                    pseudo6(&meta.src, &meta.dst),
                    pseudo4(src4, dst4),
                );
                let new = if new == 0 { 0xffff } else { new };
                data[6..8].copy_from_slice(&new.to_be_bytes());
            }
            Ok((PROTO_UDP, data))
        }
        PROTO_ICMPV6 => {
            if meta.frag.is_some() {
                return Err(DropReason::Policy);
            }
            icmp::translate_6to4(tx, payload, &meta.src, &meta.dst, now)
                .map(|data| (PROTO_ICMP, data))
        }
        proto => {
            log::debug!("Passing through unsupported protocol {proto}");
            Ok((proto, payload.to_vec()))
        }
    }
}

/// Split an oversized fragmented translation into IPv4 fragments. Only
/// reached for traffic that already carried a fragment header, so DF stays
/// clear.
fn fragment4(
    mtu: usize,
    meta: &Ipv6Meta,
    frag: &FragInfo,
    proto: u8,
    src4: Ipv4Addr,
    dst4: Ipv4Addr,
    l4: &[u8],
) -> Vec<Vec<u8>> {
    let chunk = (mtu - IPV4_HEADER_LEN) & !7;
    let ttl = meta.hop_limit - 1;
    let mut fragments = Vec::with_capacity(l4.len().div_ceil(chunk));
    let mut sent = 0;
    while sent < l4.len() {
        let take = chunk.min(l4.len() - sent);
        let last = sent + take == l4.len();
        let header = ipv4_header(
            meta.traffic_class,
            (IPV4_HEADER_LEN + take) as u16,
            frag.id as u16,
            false,
            if last { frag.mf } else { true },
            frag.offset + (sent / 8) as u16,
            ttl,
            proto,
            src4,
            dst4,
        );
        let mut out = Vec::with_capacity(IPV4_HEADER_LEN + take);
        out.extend_from_slice(&header);
        out.extend_from_slice(&l4[sent..sent + take]);
        fragments.push(out);
        sent += take;
    }
    fragments
}
