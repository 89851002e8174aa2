//! IPv4 ingress: parse, validate, and rewrite into IPv6.

use std::net::{Ipv4Addr, Ipv6Addr};

use family_tun::Family;

use super::checksum::{self, Sum16};
use super::{
    frag_header, icmp, ipv6_header, DropReason, Outcome, Translator, FRAG_HEADER_LEN,
    IPV4_HEADER_LEN, IPV6_HEADER_LEN, PROTO_FRAGMENT, PROTO_ICMP, PROTO_ICMPV6, PROTO_TCP,
    PROTO_UDP,
};

/// The IPv4 header fields the rewrite needs, cursor-style.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ipv4Meta {
    pub tos: u8,
    pub total_len: usize,
    pub id: u16,
    pub df: bool,
    pub mf: bool,
    /// In 8-octet units, as on the wire
    pub frag_off: u16,
    pub ttl: u8,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub header_len: usize,
}

impl Ipv4Meta {
    pub fn is_fragment(&self) -> bool {
        self.mf || self.frag_off != 0
    }
}

/// Parse and fully validate an IPv4 header at the start of `packet`.
pub(crate) fn parse(packet: &[u8]) -> Result<Ipv4Meta, DropReason> {
    let meta = parse_embedded(packet)?;
    if meta.total_len > packet.len() {
        return Err(DropReason::Malformed);
    }
    if !checksum::verify(&packet[..meta.header_len]) {
        return Err(DropReason::BadChecksum);
    }
    // No translation for optioned packets; we never originate them and a
    // router is not obliged to carry them
    if meta.header_len > IPV4_HEADER_LEN {
        return Err(DropReason::Policy);
    }
    Ok(meta)
}

/// Relaxed header parse for the datagram embedded in an ICMP error: the
/// trailing bytes are usually truncated and the checksum is not trusted.
pub(crate) fn parse_embedded(packet: &[u8]) -> Result<Ipv4Meta, DropReason> {
    if packet.len() < IPV4_HEADER_LEN {
        return Err(DropReason::Malformed);
    }
    if packet[0] >> 4 != 4 {
        return Err(DropReason::Malformed);
    }
    let header_len = usize::from(packet[0] & 0x0f) * 4;
    if header_len < IPV4_HEADER_LEN || header_len > packet.len() {
        return Err(DropReason::Malformed);
    }
    let total_len = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
    if total_len < header_len {
        return Err(DropReason::Malformed);
    }
    let flags_off = u16::from_be_bytes([packet[6], packet[7]]);
    Ok(Ipv4Meta {
        tos: packet[1],
        total_len,
        id: u16::from_be_bytes([packet[4], packet[5]]),
        df: flags_off & 0x4000 != 0,
        mf: flags_off & 0x2000 != 0,
        frag_off: flags_off & 0x1fff,
        ttl: packet[8],
        proto: packet[9],
        src: Ipv4Addr::from([packet[12], packet[13], packet[14], packet[15]]),
        dst: Ipv4Addr::from([packet[16], packet[17], packet[18], packet[19]]),
        header_len,
    })
}

/// Translate one IPv4 ingress datagram into IPv6.
pub(super) fn handle(tx: &mut Translator, packet: &[u8], now: u64) -> Outcome {
    let meta = match parse(packet) {
        Ok(meta) => meta,
        Err(reason) => return Outcome::Drop(reason),
    };
    let payload = &packet[meta.header_len..meta.total_len];

    // Traffic for the translator itself terminates here
    if meta.dst == tx.local4 {
        return icmp::local4(tx, &meta, payload);
    }

    if meta.ttl <= 1 {
        return icmp::time_exceeded4(tx, packet, &meta);
    }

    let src6 = match tx.map.embed_4to6(meta.src, now) {
        Ok(addr) => addr,
        Err(err) => return Outcome::Drop(err.into()),
    };
    let dst6 = match tx.map.host_4to6(meta.dst, now) {
        Ok(addr) => addr,
        Err(err) => return Outcome::Drop(err.into()),
    };

    let (proto, l4) = match translate_payload(tx, &meta, payload, &src6, &dst6, now) {
        Ok(translated) => translated,
        Err(reason) => return Outcome::Drop(reason),
    };

    // RFC6145: the identification survives the translation (widened to 32
    // bits) whenever the packet is or may yet be fragmented
    let needs_frag_header = !meta.df && (meta.id != 0 || meta.is_fragment());
    let ext_len = if needs_frag_header { FRAG_HEADER_LEN } else { 0 };

    if IPV6_HEADER_LEN + ext_len + l4.len() > tx.mtu {
        if meta.df {
            return icmp::frag_needed(tx, packet, &meta);
        }
        return Outcome::Forward(
            Family::Ipv6,
            fragment6(tx.mtu, &meta, proto, &src6, &dst6, &l4),
        );
    }

    let hop_limit = meta.ttl - 1;
    let mut out = Vec::with_capacity(IPV6_HEADER_LEN + ext_len + l4.len());
    if needs_frag_header {
        out.extend_from_slice(&ipv6_header(
            meta.tos,
            (ext_len + l4.len()) as u16,
            PROTO_FRAGMENT,
            hop_limit,
            &src6,
            &dst6,
        ));
        out.extend_from_slice(&frag_header(
            proto,
            meta.frag_off,
            meta.mf,
            u32::from(meta.id),
        ));
    } else {
        out.extend_from_slice(&ipv6_header(
            meta.tos,
            l4.len() as u16,
            proto,
            hop_limit,
            &src6,
            &dst6,
        ));
    }
    out.extend_from_slice(&l4);
    Outcome::Forward(Family::Ipv6, vec![out])
}

/// Rewrite the transport payload for its new pseudo-header. Returns the
/// IPv6 next-header value and the payload bytes.
fn translate_payload(
    tx: &mut Translator,
    meta: &Ipv4Meta,
    payload: &[u8],
    src6: &Ipv6Addr,
    dst6: &Ipv6Addr,
    now: u64,
) -> Result<(u8, Vec<u8>), DropReason> {
    match meta.proto {
        PROTO_TCP => {
            let mut data = payload.to_vec();
            if meta.frag_off == 0 {
                // A first fragment must carry the whole transport header
                if data.len() < 20 {
                    return Err(DropReason::Malformed);
                }
                let old = u16::from_be_bytes([data[16], data[17]]);
                let new = checksum::adjust(
                    old,
                    pseudo4(meta.src, meta.dst),
                    pseudo6(src6, dst6),
                );
                data[16..18].copy_from_slice(&new.to_be_bytes());
            }
            Ok((PROTO_TCP, data))
        }
        PROTO_UDP => {
            let mut data = payload.to_vec();
            if meta.frag_off == 0 {
                if data.len() < 8 {
                    return Err(DropReason::Malformed);
                }
                let old = u16::from_be_bytes([data[6], data[7]]);
                let new = if old == 0 {
                    // IPv6 forbids the no-checksum escape; computing one
                    // requires the whole datagram
                    if meta.mf {
                        return Err(DropReason::BadChecksum);
                    }
                    Sum16::new()
                        .add_u32(checksum::pseudo_sum6(src6, dst6, PROTO_UDP, data.len() as u32))
                        .add_slice(&data)
                        .finish()
                } else {
                    checksum::adjust(old, pseudo4(meta.src, meta.dst), pseudo6(src6, dst6))
                };
                // Zero means "no checksum" in UDP, so a computed zero is
                // sent as all-ones
                let new = if new == 0 { 0xffff } else { new };
                data[6..8].copy_from_slice(&new.to_be_bytes());
            }
            Ok((PROTO_UDP, data))
        }
        PROTO_ICMP => {
            // An ICMP checksum cannot be fixed up without the whole body
            if meta.is_fragment() {
                return Err(DropReason::Policy);
            }
            icmp::translate_4to6(tx, payload, src6, dst6, now).map(|data| (PROTO_ICMPV6, data))
        }
        proto => {
            log::debug!("Passing through unsupported protocol {proto}");
            Ok((proto, payload.to_vec()))
        }
    }
}

/// Split an oversized DF=0 translation into IPv6 fragments.
fn fragment6(
    mtu: usize,
    meta: &Ipv4Meta,
    proto: u8,
    src6: &Ipv6Addr,
    dst6: &Ipv6Addr,
    l4: &[u8],
) -> Vec<Vec<u8>> {
    // Every fragment carries the 8-byte fragment header; offsets must stay
    // 8-octet aligned
    let chunk = (mtu - IPV6_HEADER_LEN - FRAG_HEADER_LEN) & !7;
    let hop_limit = meta.ttl - 1;
    let mut fragments = Vec::with_capacity(l4.len().div_ceil(chunk));
    let mut sent = 0;
    while sent < l4.len() {
        let take = chunk.min(l4.len() - sent);
        let last = sent + take == l4.len();
        let mut out = Vec::with_capacity(IPV6_HEADER_LEN + FRAG_HEADER_LEN + take);
        out.extend_from_slice(&ipv6_header(
            meta.tos,
            (FRAG_HEADER_LEN + take) as u16,
            PROTO_FRAGMENT,
            hop_limit,
            src6,
            dst6,
        ));
        out.extend_from_slice(&frag_header(
            proto,
            meta.frag_off + (sent / 8) as u16,
            if last { meta.mf } else { true },
            u32::from(meta.id),
        ));
        out.extend_from_slice(&l4[sent..sent + take]);
        fragments.push(out);
        sent += take;
    }
    fragments
}

/// Sum of the address words of the IPv4 pseudo-header. The protocol and
/// length words are identical on both sides of the translation, so they
/// cancel out of the incremental update.
pub(super) fn pseudo4(src: Ipv4Addr, dst: Ipv4Addr) -> u32 {
    Sum16::new()
        .add_u32(u32::from(src))
        .add_u32(u32::from(dst))
        .value()
}

/// Sum of the address words of the IPv6 pseudo-header.
pub(super) fn pseudo6(src: &Ipv6Addr, dst: &Ipv6Addr) -> u32 {
    Sum16::new()
        .add_slice(&src.octets())
        .add_slice(&dst.octets())
        .value()
}
