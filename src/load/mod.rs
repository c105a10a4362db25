//! Load generation: fill a pool-backed filesystem by a known number of bytes.

pub mod driver;
pub mod file_writer;
