#![doc = include_str!("../README.md")]

pub mod args;
pub mod config;
pub mod eventloop;
pub mod logging;
pub mod map;
pub mod xlat;
