#![doc = include_str!("../README.md")]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod error;

mod embed;
mod extract;
pub use embed::embed;
pub use extract::extract;

/// All allowed IPv6 prefix lengths according to [RFC6052 Section 2.2](https://datatracker.ietf.org/doc/html/rfc6052#section-2.2)
pub const ALLOWED_PREFIX_LENS: [u8; 6] = [32, 40, 48, 56, 64, 96];

/// Index of the `u` byte, which RFC6052 requires to be zero in any
/// IPv4-embedded IPv6 address.
pub(crate) const U_BYTE: usize = 8;
