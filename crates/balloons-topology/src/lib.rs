#![doc = include_str!("../readme.md")]

pub mod cpuset;
pub mod discovery;
pub mod error;
pub mod fake;
pub mod sst;
pub mod system;
