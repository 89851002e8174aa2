#![doc = include_str!("../README.md")]

mod error;
mod persist;
mod pool;

pub use error::Error;
pub use persist::{load, save};
pub use pool::Ipv4Pool;
