use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::Ipv6Net;

use crate::error::Error;
use crate::{ALLOWED_PREFIX_LENS, U_BYTE};

/// Embeds an IPv4 address into an IPv6 prefix following the method defined
/// in [RFC6052 Section 2.2](https://datatracker.ietf.org/doc/html/rfc6052#section-2.2).
///
/// The `u` byte (bits 64..71) of the result is always zero.
pub fn embed(ipv4_addr: Ipv4Addr, ipv6_prefix: Ipv6Net) -> Result<Ipv6Addr, Error> {
    if !ALLOWED_PREFIX_LENS.contains(&ipv6_prefix.prefix_len()) {
        return Err(Error::InvalidPrefixLength(ipv6_prefix.prefix_len()));
    }

    // Start from the network address so host bits of a sloppily written
    // prefix don't leak into the suffix.
    let mut out = ipv6_prefix.network().octets();
    let v4 = ipv4_addr.octets();

    // The 32 bits of the IPv4 address land immediately after the prefix,
    // except that they skip the u byte at octet 8.
    match ipv6_prefix.prefix_len() {
        32 => out[4..8].copy_from_slice(&v4),
        40 => {
            out[5..8].copy_from_slice(&v4[..3]);
            out[9] = v4[3];
        }
        48 => {
            out[6..8].copy_from_slice(&v4[..2]);
            out[9..11].copy_from_slice(&v4[2..]);
        }
        56 => {
            out[7] = v4[0];
            out[9..12].copy_from_slice(&v4[1..]);
        }
        64 => out[9..13].copy_from_slice(&v4),
        96 => out[12..16].copy_from_slice(&v4),
        _ => unreachable!(),
    }
    // Octet 8 is a suffix bit for every length except /96, so starting from
    // the network address already left the u byte zero.

    Ok(Ipv6Addr::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Worked examples from RFC6052 Section 2.4, all embedding 192.0.2.33.

    #[test]
    fn test_embed_len_32() {
        assert_eq!(
            embed("192.0.2.33".parse().unwrap(), "2001:db8::/32".parse().unwrap()),
            Ok("2001:db8:c000:221::".parse::<Ipv6Addr>().unwrap())
        );
    }

    #[test]
    fn test_embed_len_40() {
        assert_eq!(
            embed("192.0.2.33".parse().unwrap(), "2001:db8:100::/40".parse().unwrap()),
            Ok("2001:db8:1c0:2:21::".parse::<Ipv6Addr>().unwrap())
        );
    }

    #[test]
    fn test_embed_len_48() {
        assert_eq!(
            embed("192.0.2.33".parse().unwrap(), "2001:db8:122::/48".parse().unwrap()),
            Ok("2001:db8:122:c000:2:2100::".parse::<Ipv6Addr>().unwrap())
        );
    }

    #[test]
    fn test_embed_len_56() {
        assert_eq!(
            embed("192.0.2.33".parse().unwrap(), "2001:db8:122:300::/56".parse().unwrap()),
            Ok("2001:db8:122:3c0:0:221::".parse::<Ipv6Addr>().unwrap())
        );
    }

    #[test]
    fn test_embed_len_64() {
        assert_eq!(
            embed("192.0.2.33".parse().unwrap(), "2001:db8:122:344::/64".parse().unwrap()),
            Ok("2001:db8:122:344:c0:2:2100::".parse::<Ipv6Addr>().unwrap())
        );
    }

    #[test]
    fn test_embed_len_96() {
        assert_eq!(
            embed("192.0.2.33".parse().unwrap(), "2001:db8:122:344::/96".parse().unwrap()),
            Ok("2001:db8:122:344::c000:221".parse::<Ipv6Addr>().unwrap())
        );
    }

    #[test]
    fn test_embed_rejects_bad_length() {
        assert_eq!(
            embed("192.0.2.33".parse().unwrap(), "2001:db8::/33".parse().unwrap()),
            Err(Error::InvalidPrefixLength(33))
        );
    }

    #[test]
    fn test_u_byte_is_zero() {
        for len in ALLOWED_PREFIX_LENS {
            let prefix = Ipv6Net::new("64:ff9b::".parse().unwrap(), len).unwrap();
            let embedded = embed("203.0.113.200".parse().unwrap(), prefix).unwrap();
            assert_eq!(embedded.octets()[U_BYTE], 0, "u byte set for /{len}");
        }
    }
}
