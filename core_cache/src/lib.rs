//! Direct-mapped cache controllers between a request producer and a flat,
//! caller-owned main memory.

mod bin;
pub mod address;
pub mod config;
pub mod memory;
pub mod single_line;
pub mod trace;
pub mod write_back;

#[cfg(feature = "stat")]
pub mod stat;
