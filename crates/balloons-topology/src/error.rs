//! Topology discovery errors.

use thiserror::Error;

/// Errors produced while reading or validating the host topology.
///
/// All of these are fatal for the agent: a host whose topology cannot be
/// trusted must not make placement decisions.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {what} in {path}: {detail}")]
    Parse {
        what: &'static str,
        path: String,
        detail: String,
    },
    #[error("inconsistent topology: {0}")]
    Inconsistent(String),
}

impl Error {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(what: &'static str, path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Parse {
            what,
            path: path.into(),
            detail: detail.into(),
        }
    }
}
