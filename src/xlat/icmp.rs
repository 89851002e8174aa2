//! ICMP and ICMPv6: type/code translation, embedded-datagram rewriting,
//! error generation, and the translator's own echo responder.
//!
//! Checksums on this path are recomputed rather than adjusted: ICMPv4 has
//! no pseudo-header and ICMPv6 does, so there is no cheap delta for the
//! outer message. The embedded datagram inside an error message is
//! translated exactly once; an error quoting another error is dropped.

use std::net::{Ipv4Addr, Ipv6Addr};

use family_tun::Family;
use pnet::packet::icmp::{destination_unreachable::IcmpCodes, IcmpCode, IcmpType, IcmpTypes};
use pnet::packet::icmpv6::{Icmpv6Code, Icmpv6Type, Icmpv6Types};

use super::checksum::{self, Sum16};
use super::ipv4::{self, pseudo4, pseudo6, Ipv4Meta};
use super::ipv6::{self, Ipv6Meta};
use super::{
    frag_header, ipv4_header, ipv6_header, DropReason, Outcome, Translator, FRAG_HEADER_LEN,
    IPV4_HEADER_LEN, IPV6_HEADER_LEN, PROTO_FRAGMENT, PROTO_ICMP, PROTO_ICMPV6, PROTO_TCP,
    PROTO_UDP,
};

/// ICMPv4 errors must not exceed this total packet size (RFC1812).
const ICMP4_MAX_PACKET: usize = 576;
/// ICMPv6 errors must fit the minimum link MTU (RFC4443).
const ICMP6_MAX_PACKET: usize = 1280;

/// Translate an ICMPv4 message body into ICMPv6, quoting datagram
/// included. `src6`/`dst6` form the new pseudo-header.
pub(super) fn translate_4to6(
    tx: &mut Translator,
    icmp: &[u8],
    src6: &Ipv6Addr,
    dst6: &Ipv6Addr,
    now: u64,
) -> Result<Vec<u8>, DropReason> {
    if icmp.len() < 8 {
        return Err(DropReason::Malformed);
    }
    if !checksum::verify(icmp) {
        return Err(DropReason::BadChecksum);
    }

    let rest = u32::from_be_bytes([icmp[4], icmp[5], icmp[6], icmp[7]]);
    let (ty, code, rest) = match (IcmpType(icmp[0]), IcmpCode(icmp[1])) {
        (IcmpTypes::EchoRequest, _) => (Icmpv6Types::EchoRequest, Icmpv6Code(0), rest),
        (IcmpTypes::EchoReply, _) => (Icmpv6Types::EchoReply, Icmpv6Code(0), rest),

        // Fragmentation needed becomes Packet Too Big; the advertised MTU
        // grows with the headers
        (IcmpTypes::DestinationUnreachable, IcmpCodes::FragmentationRequiredAndDFFlagSet) => {
            let mtu = (rest & 0xffff).saturating_add(20).max(1280);
            (Icmpv6Types::PacketTooBig, Icmpv6Code(0), mtu)
        }
        // Protocol unreachable has no unreachable equivalent; RFC6145
        // maps it to a parameter problem pointing at the next header
        (IcmpTypes::DestinationUnreachable, IcmpCodes::DestinationProtocolUnreachable) => {
            (Icmpv6Types::ParameterProblem, Icmpv6Code(1), 6)
        }
        (IcmpTypes::DestinationUnreachable, IcmpCodes::DestinationPortUnreachable) => {
            (Icmpv6Types::DestinationUnreachable, Icmpv6Code(4), 0)
        }
        (IcmpTypes::DestinationUnreachable, code) => (
            Icmpv6Types::DestinationUnreachable,
            Icmpv6Code(match code {
                IcmpCodes::NetworkAdministrativelyProhibited
                | IcmpCodes::HostAdministrativelyProhibited
                | IcmpCodes::CommunicationAdministrativelyProhibited
                | IcmpCodes::PrecedenceCutoffInEffect => 1,
                IcmpCodes::HostPrecedenceViolation => {
                    return Err(DropReason::UnsupportedIcmp(icmp[0]))
                }
                // The remaining unreachable flavors collapse to
                // "no route to destination"
                _ => 0,
            }),
            0,
        ),

        (IcmpTypes::TimeExceeded, code) => {
            (Icmpv6Types::TimeExceeded, Icmpv6Code(code.0), 0)
        }

        (IcmpTypes::ParameterProblem, IcmpCode(0 | 2)) => {
            let pointer = pointer_4to6((rest >> 24) as u8)
                .ok_or(DropReason::UnsupportedIcmp(icmp[0]))?;
            (Icmpv6Types::ParameterProblem, Icmpv6Code(0), u32::from(pointer))
        }

        // Single-hop business with no cross-family meaning
        (IcmpTypes::SourceQuench | IcmpTypes::RedirectMessage, _)
        | (IcmpTypes::RouterAdvertisement | IcmpTypes::RouterSolicitation, _) => {
            return Err(DropReason::Policy)
        }

        (ty, _) => return Err(DropReason::UnsupportedIcmp(ty.0)),
    };

    let is_error = ty.0 < 128;
    let body = if is_error {
        embedded_4to6(tx, &icmp[8..], now)?
    } else {
        icmp[8..].to_vec()
    };

    let mut out = vec![ty.0, code.0, 0, 0];
    out.extend_from_slice(&rest.to_be_bytes());
    out.extend_from_slice(&body);
    if is_error {
        out.truncate(ICMP6_MAX_PACKET.min(tx.mtu) - IPV6_HEADER_LEN);
    }

    let csum = Sum16::new()
        .add_u32(checksum::pseudo_sum6(src6, dst6, PROTO_ICMPV6, out.len() as u32))
        .add_slice(&out)
        .finish();
    out[2..4].copy_from_slice(&csum.to_be_bytes());
    Ok(out)
}

/// Translate an ICMPv6 message body into ICMPv4. `src6`/`dst6` are the
/// addresses of the ingress datagram, needed to verify its checksum.
pub(super) fn translate_6to4(
    tx: &mut Translator,
    icmp: &[u8],
    src6: &Ipv6Addr,
    dst6: &Ipv6Addr,
    now: u64,
) -> Result<Vec<u8>, DropReason> {
    if icmp.len() < 8 {
        return Err(DropReason::Malformed);
    }
    let inbound = Sum16::new()
        .add_u32(checksum::pseudo_sum6(src6, dst6, PROTO_ICMPV6, icmp.len() as u32))
        .add_slice(icmp)
        .value();
    if checksum::fold(inbound) != 0xffff {
        return Err(DropReason::BadChecksum);
    }

    let rest = u32::from_be_bytes([icmp[4], icmp[5], icmp[6], icmp[7]]);
    let (ty, code, rest) = match (Icmpv6Type(icmp[0]), Icmpv6Code(icmp[1])) {
        (Icmpv6Types::EchoRequest, _) => (IcmpTypes::EchoRequest, IcmpCode(0), rest),
        (Icmpv6Types::EchoReply, _) => (IcmpTypes::EchoReply, IcmpCode(0), rest),

        (Icmpv6Types::PacketTooBig, _) => {
            let mtu = (rest.saturating_sub(20)).min(0xffff);
            (
                IcmpTypes::DestinationUnreachable,
                IcmpCodes::FragmentationRequiredAndDFFlagSet,
                mtu,
            )
        }

        (Icmpv6Types::DestinationUnreachable, code) => (
            IcmpTypes::DestinationUnreachable,
            match code.0 {
                1 => IcmpCodes::HostAdministrativelyProhibited,
                4 => IcmpCodes::DestinationPortUnreachable,
                5 | 6 => IcmpCodes::CommunicationAdministrativelyProhibited,
                _ => IcmpCodes::DestinationHostUnreachable,
            },
            0,
        ),

        (Icmpv6Types::TimeExceeded, code) => (IcmpTypes::TimeExceeded, IcmpCode(code.0), 0),

        (Icmpv6Types::ParameterProblem, Icmpv6Code(0)) => {
            let pointer = pointer_6to4(rest).ok_or(DropReason::UnsupportedIcmp(icmp[0]))?;
            (
                IcmpTypes::ParameterProblem,
                IcmpCode(0),
                u32::from(pointer) << 24,
            )
        }
        // Unrecognized next header maps back to protocol unreachable
        (Icmpv6Types::ParameterProblem, Icmpv6Code(1)) => (
            IcmpTypes::DestinationUnreachable,
            IcmpCodes::DestinationProtocolUnreachable,
            0,
        ),

        // Group membership and neighbor discovery stay on their link
        (Icmpv6Type(130..=137), _) => return Err(DropReason::Policy),

        (ty, _) => return Err(DropReason::UnsupportedIcmp(ty.0)),
    };

    let is_error = icmp[0] < 128;
    let body = if is_error {
        embedded_6to4(tx, &icmp[8..], now)?
    } else {
        icmp[8..].to_vec()
    };

    let mut out = vec![ty.0, code.0, 0, 0];
    out.extend_from_slice(&rest.to_be_bytes());
    out.extend_from_slice(&body);
    if is_error {
        out.truncate(ICMP4_MAX_PACKET.min(tx.mtu) - IPV4_HEADER_LEN);
    }

    let csum = Sum16::new().add_slice(&out).finish();
    out[2..4].copy_from_slice(&csum.to_be_bytes());
    Ok(out)
}

/// Rewrite the datagram quoted inside an ICMPv4 error as IPv6. The inner
/// packet was our own 6-to-4 output, so the address roles are reversed.
/// The quoted tail is usually truncated; lengths in the rebuilt header
/// describe the original datagram, not what survives of it.
fn embedded_4to6(tx: &mut Translator, inner: &[u8], now: u64) -> Result<Vec<u8>, DropReason> {
    let meta = ipv4::parse_embedded(inner)?;
    if meta.header_len > IPV4_HEADER_LEN {
        return Err(DropReason::Policy);
    }
    let src6 = tx.map.host_4to6(meta.src, now).map_err(DropReason::from)?;
    let dst6 = tx.map.embed_4to6(meta.dst, now).map_err(DropReason::from)?;

    let mut l4 = inner[meta.header_len..].to_vec();
    let l4_true_len = (meta.total_len - meta.header_len) as u32;
    let mut proto = meta.proto;
    match meta.proto {
        PROTO_TCP if meta.frag_off == 0 && l4.len() >= 18 => {
            let old = u16::from_be_bytes([l4[16], l4[17]]);
            let new = checksum::adjust(old, pseudo4(meta.src, meta.dst), pseudo6(&src6, &dst6));
            l4[16..18].copy_from_slice(&new.to_be_bytes());
        }
        PROTO_UDP if meta.frag_off == 0 && l4.len() >= 8 => {
            let old = u16::from_be_bytes([l4[6], l4[7]]);
            if old != 0 {
                let new = checksum::adjust(old, pseudo4(meta.src, meta.dst), pseudo6(&src6, &dst6));
                let new = if new == 0 { 0xffff } else { new };
                l4[6..8].copy_from_slice(&new.to_be_bytes());
            }
        }
        PROTO_ICMP if meta.frag_off == 0 => {
            if l4.len() < 4 {
                return Err(DropReason::Malformed);
            }
            // Only echoes may be quoted; an error quoting an error would
            // recurse
            let new_type = match l4[0] {
                8 => 128,
                0 => 129,
                _ => return Err(DropReason::Policy),
            };
            let old = u16::from_be_bytes([l4[2], l4[3]]);
            let removed = u16::from_be_bytes([l4[0], l4[1]]);
            let added = Sum16::new()
                .add_u16(u16::from_be_bytes([new_type, l4[1]]))
                .add_u32(checksum::pseudo_sum6(&src6, &dst6, PROTO_ICMPV6, l4_true_len))
                .value();
            let new = checksum::adjust(old, u32::from(removed), added);
            l4[0] = new_type;
            l4[2..4].copy_from_slice(&new.to_be_bytes());
            proto = PROTO_ICMPV6;
        }
        PROTO_ICMP => proto = PROTO_ICMPV6,
        _ => {}
    }

    let needs_frag_header = !meta.df && (meta.id != 0 || meta.is_fragment());
    let mut out = Vec::with_capacity(IPV6_HEADER_LEN + FRAG_HEADER_LEN + l4.len());
    if needs_frag_header {
        out.extend_from_slice(&ipv6_header(
            meta.tos,
            (l4_true_len as usize + FRAG_HEADER_LEN) as u16,
            PROTO_FRAGMENT,
            meta.ttl,
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
            l4_true_len as u16,
            proto,
            meta.ttl,
            &src6,
            &dst6,
        ));
    }
    out.extend_from_slice(&l4);
    Ok(out)
}

/// Rewrite the datagram quoted inside an ICMPv6 error as IPv4.
fn embedded_6to4(tx: &mut Translator, inner: &[u8], now: u64) -> Result<Vec<u8>, DropReason> {
    let meta = ipv6::parse_embedded(inner)?;
    let src4 = tx.map.extract_6to4(meta.src, now).map_err(DropReason::from)?;
    let dst4 = tx.map.host_6to4(meta.dst, false, now).map_err(DropReason::from)?;

    let mut l4 = inner[meta.header_len..].to_vec();
    let l4_true_len = (meta.total_len - meta.header_len) as u32;
    let first_fragment = meta.is_first_fragment();
    let mut proto = meta.proto;
    match meta.proto {
        PROTO_TCP if first_fragment && l4.len() >= 18 => {
            let old = u16::from_be_bytes([l4[16], l4[17]]);
            let new = checksum::adjust(old, pseudo6(&meta.src, &meta.dst), pseudo4(src4, dst4));
            l4[16..18].copy_from_slice(&new.to_be_bytes());
        }
        PROTO_UDP if first_fragment && l4.len() >= 8 => {
            let old = u16::from_be_bytes([l4[6], l4[7]]);
            if old != 0 {
                let new =
                    checksum::adjust(old, pseudo6(&meta.src, &meta.dst), pseudo4(src4, dst4));
                let new = if new == 0 { 0xffff } else { new };
                l4[6..8].copy_from_slice(&new.to_be_bytes());
            }
        }
        PROTO_ICMPV6 if first_fragment => {
            if l4.len() < 4 {
                return Err(DropReason::Malformed);
            }
            let new_type = match l4[0] {
                128 => 8,
                129 => 0,
                _ => return Err(DropReason::Policy),
            };
            let old = u16::from_be_bytes([l4[2], l4[3]]);
            let removed = Sum16::new()
                .add_u16(u16::from_be_bytes([l4[0], l4[1]]))
                .add_u32(checksum::pseudo_sum6(
                    &meta.src,
                    &meta.dst,
                    PROTO_ICMPV6,
                    l4_true_len,
                ))
                .value();
            let added = u16::from_be_bytes([new_type, l4[1]]);
            let new = checksum::adjust(old, removed, u32::from(added));
            l4[0] = new_type;
            l4[2..4].copy_from_slice(&new.to_be_bytes());
            proto = PROTO_ICMP;
        }
        PROTO_ICMPV6 => proto = PROTO_ICMP,
        _ => {}
    }

    let (id, df, mf, frag_off) = match meta.frag {
        Some(frag) => (frag.id as u16, false, frag.mf, frag.offset),
        None => (0, true, false, 0),
    };
    let header = ipv4_header(
        meta.traffic_class,
        u16::try_from(IPV4_HEADER_LEN as u32 + l4_true_len).unwrap_or(u16::MAX),
        id,
        df,
        mf,
        frag_off,
        meta.hop_limit,
        proto,
        src4,
        dst4,
    );
    let mut out = Vec::with_capacity(IPV4_HEADER_LEN + l4.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&l4);
    Ok(out)
}

/// Answer traffic addressed to the translator's own IPv4 address.
pub(super) fn local4(tx: &Translator, meta: &Ipv4Meta, payload: &[u8]) -> Outcome {
    if meta.proto != PROTO_ICMP || meta.is_fragment() {
        return Outcome::Drop(DropReason::Policy);
    }
    if payload.len() < 8 {
        return Outcome::Drop(DropReason::Malformed);
    }
    if !checksum::verify(payload) {
        return Outcome::Drop(DropReason::BadChecksum);
    }
    if (payload[0], payload[1]) != (8, 0) {
        return Outcome::Drop(DropReason::Policy);
    }

    let mut body = payload.to_vec();
    body[0] = 0;
    let old = u16::from_be_bytes([body[2], body[3]]);
    let new = checksum::adjust(old, 0x0800, 0x0000);
    body[2..4].copy_from_slice(&new.to_be_bytes());

    let header = ipv4_header(
        0,
        (IPV4_HEADER_LEN + body.len()) as u16,
        0,
        true,
        false,
        0,
        64,
        PROTO_ICMP,
        tx.local4,
        meta.src,
    );
    let mut out = Vec::with_capacity(IPV4_HEADER_LEN + body.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&body);
    Outcome::Reply(Family::Ipv4, out)
}

/// Answer traffic addressed to the translator's own IPv6 address.
pub(super) fn local6(tx: &Translator, meta: &Ipv6Meta, payload: &[u8]) -> Outcome {
    if meta.proto != PROTO_ICMPV6 || meta.frag.is_some() {
        return Outcome::Drop(DropReason::Policy);
    }
    if payload.len() < 8 {
        return Outcome::Drop(DropReason::Malformed);
    }
    let inbound = Sum16::new()
        .add_u32(checksum::pseudo_sum6(
            &meta.src,
            &meta.dst,
            PROTO_ICMPV6,
            payload.len() as u32,
        ))
        .add_slice(payload)
        .value();
    if checksum::fold(inbound) != 0xffff {
        return Outcome::Drop(DropReason::BadChecksum);
    }
    if (payload[0], payload[1]) != (128, 0) {
        return Outcome::Drop(DropReason::Policy);
    }

    // Swapping source and destination leaves the pseudo-header sum alone,
    // so only the type word moves
    let mut body = payload.to_vec();
    body[0] = 129;
    let old = u16::from_be_bytes([body[2], body[3]]);
    let new = checksum::adjust(old, 128 << 8, 129 << 8);
    body[2..4].copy_from_slice(&new.to_be_bytes());

    let header = ipv6_header(
        0,
        body.len() as u16,
        PROTO_ICMPV6,
        64,
        &tx.local6,
        &meta.src,
    );
    let mut out = Vec::with_capacity(IPV6_HEADER_LEN + body.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&body);
    Outcome::Reply(Family::Ipv6, out)
}

/// TTL ran out on the IPv4 side.
pub(super) fn time_exceeded4(tx: &Translator, packet: &[u8], meta: &Ipv4Meta) -> Outcome {
    if !may_reply4(meta, packet) {
        return Outcome::Drop(DropReason::HopLimitExceeded);
    }
    Outcome::Reply(
        Family::Ipv4,
        icmp4_error(tx, IcmpTypes::TimeExceeded.0, 0, 0, packet, meta.src),
    )
}

/// Hop limit ran out on the IPv6 side.
pub(super) fn time_exceeded6(tx: &Translator, packet: &[u8], meta: &Ipv6Meta) -> Outcome {
    if !may_reply6(tx, meta, packet) {
        return Outcome::Drop(DropReason::HopLimitExceeded);
    }
    Outcome::Reply(
        Family::Ipv6,
        icmp6_error(tx, Icmpv6Types::TimeExceeded.0, 0, 0, packet, meta.src),
    )
}

/// A DF-marked IPv4 datagram would not fit after translation.
pub(super) fn frag_needed(tx: &Translator, packet: &[u8], meta: &Ipv4Meta) -> Outcome {
    if !may_reply4(meta, packet) {
        return Outcome::Drop(DropReason::Policy);
    }
    let mtu = (tx.mtu - 20) as u32;
    Outcome::Reply(
        Family::Ipv4,
        icmp4_error(
            tx,
            IcmpTypes::DestinationUnreachable.0,
            IcmpCodes::FragmentationRequiredAndDFFlagSet.0,
            mtu,
            packet,
            meta.src,
        ),
    )
}

/// An unfragmentable IPv6 datagram would not fit after translation.
pub(super) fn packet_too_big(tx: &Translator, packet: &[u8], meta: &Ipv6Meta) -> Outcome {
    if !may_reply6(tx, meta, packet) {
        return Outcome::Drop(DropReason::Policy);
    }
    let mtu = (tx.mtu - 20) as u32;
    Outcome::Reply(
        Family::Ipv6,
        icmp6_error(tx, Icmpv6Types::PacketTooBig.0, 0, mtu, packet, meta.src),
    )
}

/// ICMP errors are only owed to well-behaved first fragments from
/// speakable sources, and never in response to another ICMP error.
fn may_reply4(meta: &Ipv4Meta, packet: &[u8]) -> bool {
    if meta.frag_off != 0 {
        return false;
    }
    let src = meta.src;
    if src.is_unspecified() || src.is_loopback() || src.is_multicast() || src.is_broadcast() {
        return false;
    }
    if meta.proto == PROTO_ICMP {
        if let Some(&ty) = packet.get(meta.header_len) {
            return matches!(ty, 0 | 8);
        }
    }
    true
}

fn may_reply6(tx: &Translator, meta: &Ipv6Meta, packet: &[u8]) -> bool {
    if !meta.is_first_fragment() {
        return false;
    }
    let src = meta.src;
    if src.is_unspecified() || src.is_loopback() || src.is_multicast() || src == tx.local6 {
        return false;
    }
    if meta.proto == PROTO_ICMPV6 {
        if let Some(&ty) = packet.get(meta.header_len) {
            return ty >= 128;
        }
    }
    true
}

fn icmp4_error(
    tx: &Translator,
    ty: u8,
    code: u8,
    rest: u32,
    original: &[u8],
    dst: Ipv4Addr,
) -> Vec<u8> {
    let quote_max = ICMP4_MAX_PACKET.min(tx.mtu) - IPV4_HEADER_LEN - 8;
    let quote = &original[..original.len().min(quote_max)];

    let mut body = vec![ty, code, 0, 0];
    body.extend_from_slice(&rest.to_be_bytes());
    body.extend_from_slice(quote);
    let csum = Sum16::new().add_slice(&body).finish();
    body[2..4].copy_from_slice(&csum.to_be_bytes());

    let header = ipv4_header(
        0,
        (IPV4_HEADER_LEN + body.len()) as u16,
        0,
        false,
        false,
        0,
        64,
        PROTO_ICMP,
        tx.local4,
        dst,
    );
    let mut out = Vec::with_capacity(IPV4_HEADER_LEN + body.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&body);
    out
}

fn icmp6_error(
    tx: &Translator,
    ty: u8,
    code: u8,
    rest: u32,
    original: &[u8],
    dst: Ipv6Addr,
) -> Vec<u8> {
    let quote_max = ICMP6_MAX_PACKET.min(tx.mtu) - IPV6_HEADER_LEN - 8;
    let quote = &original[..original.len().min(quote_max)];

    let mut body = vec![ty, code, 0, 0];
    body.extend_from_slice(&rest.to_be_bytes());
    body.extend_from_slice(quote);
    let csum = Sum16::new()
        .add_u32(checksum::pseudo_sum6(
            &tx.local6,
            &dst,
            PROTO_ICMPV6,
            body.len() as u32,
        ))
        .add_slice(&body)
        .finish();
    body[2..4].copy_from_slice(&csum.to_be_bytes());

    let header = ipv6_header(0, body.len() as u16, PROTO_ICMPV6, 64, &tx.local6, &dst);
    let mut out = Vec::with_capacity(IPV6_HEADER_LEN + body.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&body);
    out
}

/// RFC6145 section 4.2: parameter-problem pointer, IPv4 header offset to
/// IPv6 header offset. Fields with no IPv6 equivalent are untranslatable.
fn pointer_4to6(pointer: u8) -> Option<u8> {
    match pointer {
        0 => Some(0),
        1 => Some(1),
        2 | 3 => Some(4),
        8 => Some(7),
        9 => Some(6),
        12..=15 => Some(8),
        16..=19 => Some(24),
        _ => None,
    }
}

/// RFC6145 section 5.2: the inverse pointer mapping.
fn pointer_6to4(pointer: u32) -> Option<u8> {
    match pointer {
        0 => Some(0),
        1 => Some(1),
        4 | 5 => Some(2),
        6 => Some(9),
        7 => Some(8),
        8..=23 => Some(12),
        24..=39 => Some(16),
        _ => None,
    }
}
