//! Policy error kinds.

use thiserror::Error;

/// Errors surfaced by the policy engine.
///
/// `InvalidConfiguration` never mutates policy state; `Unassignable` fails a
/// single container admission and leaves no partial changes behind;
/// `InsufficientCpus` from a reconfiguration aborts it with the previous
/// state restored; `TuningFailed` is reported but the placement decision it
/// accompanied stays in effect.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("cannot assign container {container}: {reason}")]
    Unassignable { container: String, reason: String },
    #[error("not enough cpus: requested {requested}, available {available}")]
    InsufficientCpus { requested: usize, available: usize },
    #[error("cpu tuning failed: {0}")]
    TuningFailed(String),
}

impl Error {
    pub fn unassignable(container: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unassignable {
            container: container.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
