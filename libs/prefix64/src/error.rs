//! Error types for this library

use std::net::Ipv6Addr;

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum Error {
    #[error("Invalid IPv6 prefix length: {0}. Must be one of 32, 40, 48, 56, 64, or 96")]
    InvalidPrefixLength(u8),
    #[error("Bits 64..71 of {0} are not zero")]
    NonZeroUByte(Ipv6Addr),
}
