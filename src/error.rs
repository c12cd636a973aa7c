//! Error types for the execution relay.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong while admitting, staging, launching or
/// relaying a single execution.
///
/// None of these are fatal to the relay itself; each is reported on the
/// connection that caused it.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed request: no session is created.
    #[error("invalid request: {0}")]
    Protocol(String),

    /// Admission control refused the request.
    #[error("server busy: {0} sandboxes already running")]
    Busy(usize),

    /// The script could not be written to the scratch directory.
    #[error("failed to stage script: {0}")]
    Staging(#[source] std::io::Error),

    /// The sandbox runtime could not start the program.
    #[error("failed to launch sandbox: {0}")]
    Launch(String),

    /// Reading from or writing to the sandbox's pipes failed.
    #[error("relay i/o failed: {0}")]
    Relay(#[source] std::io::Error),

    /// The scratch directory cannot be used at all.
    #[error("scratch directory {path} is unusable: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire-level classification of a [`RelayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Protocol,
    Busy,
    Staging,
    Launch,
    Relay,
    Internal,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Protocol(_) => ErrorKind::Protocol,
            RelayError::Busy(_) => ErrorKind::Busy,
            RelayError::Staging(_) => ErrorKind::Staging,
            RelayError::Launch(_) => ErrorKind::Launch,
            RelayError::Relay(_) => ErrorKind::Relay,
            RelayError::Scratch { .. } | RelayError::Io(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(RelayError::Protocol("x".into()).kind(), ErrorKind::Protocol);
        assert_eq!(RelayError::Busy(4).kind(), ErrorKind::Busy);
        assert_eq!(
            RelayError::Staging(std::io::Error::other("disk full")).kind(),
            ErrorKind::Staging
        );
        assert_eq!(RelayError::Launch("no docker".into()).kind(), ErrorKind::Launch);
    }

    #[test]
    fn messages_carry_the_cause() {
        let err = RelayError::Busy(8);
        assert_eq!(err.to_string(), "server busy: 8 sandboxes already running");

        let err = RelayError::Staging(std::io::Error::other("disk full"));
        assert_eq!(err.to_string(), "failed to stage script: disk full");
    }
}
