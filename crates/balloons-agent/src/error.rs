//! Agent error kinds.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A runtime or control-plane call failed; retried with backoff on a
    /// detached task, never blocking the event loop.
    #[error("transient i/o failure: {0}")]
    TransientIo(String),
    /// Startup cannot continue (topology discovery mismatch, invalid
    /// registration). Terminates the process after flushing.
    #[error("fatal: {0}")]
    Fatal(String),
    #[error(transparent)]
    Policy(#[from] balloons_policy::core::error::Error),
    #[error(transparent)]
    Topology(#[from] balloons_topology::error::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
