use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::Error;
use crate::{ALLOWED_PREFIX_LENS, U_BYTE};

/// Extracts the IPv4 address embedded in an IPv6 address, reversing the
/// method defined in [RFC6052 Section 2.2](https://datatracker.ietf.org/doc/html/rfc6052#section-2.2).
///
/// Fails with [`Error::NonZeroUByte`] if bits 64..71 of the address are not
/// zero (for prefix lengths where they fall in the suffix).
pub fn extract(ipv6_addr: Ipv6Addr, prefix_len: u8) -> Result<Ipv4Addr, Error> {
    if !ALLOWED_PREFIX_LENS.contains(&prefix_len) {
        return Err(Error::InvalidPrefixLength(prefix_len));
    }
    let v6 = ipv6_addr.octets();
    if prefix_len != 96 && v6[U_BYTE] != 0 {
        return Err(Error::NonZeroUByte(ipv6_addr));
    }

    let mut v4 = [0u8; 4];
    match prefix_len {
        32 => v4.copy_from_slice(&v6[4..8]),
        40 => {
            v4[..3].copy_from_slice(&v6[5..8]);
            v4[3] = v6[9];
        }
        48 => {
            v4[..2].copy_from_slice(&v6[6..8]);
            v4[2..].copy_from_slice(&v6[9..11]);
        }
        56 => {
            v4[0] = v6[7];
            v4[1..].copy_from_slice(&v6[9..12]);
        }
        64 => v4.copy_from_slice(&v6[9..13]),
        96 => v4.copy_from_slice(&v6[12..16]),
        _ => unreachable!(),
    }

    Ok(Ipv4Addr::from(v4))
}
