//! Failure taxonomy for supervisor operations.
//!
//! Residual listeners after a stop and status inconsistencies are not errors;
//! they are surfaced as warning data in the operation outcomes instead.

use thiserror::Error;

/// Errors that can occur while supervising a service.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested key is not present in the registry.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// Launch was issued but neither observed signal confirmed the service
    /// within the polling budget. The stored pid has been cleared.
    #[error("{service} did not confirm startup after {attempts} attempts")]
    StartupTimeout { service: String, attempts: u32 },

    /// A launch or pre-step command could not be run or exited non-zero.
    #[error("failed to launch {service}: {detail}")]
    Launch { service: String, detail: String },

    /// IO operation failed.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
