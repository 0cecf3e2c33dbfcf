//! Error types for the relay.
//!
//! [`RelayError`] covers everything that can go wrong while a single inbound
//! request is duplicated, dispatched and relayed. Backend variants carry the
//! configured host so log lines can tell the primary and shadow apart.
//! [`ConfigError`] covers startup failures.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure of one step of the duplicate → dispatch → relay pipeline.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Copying the inbound request body failed partway.
    #[error("failed to read inbound request body: {0}")]
    BodyRead(#[source] io::Error),

    /// TCP connect to the backend failed or timed out.
    #[error("failed to connect to {host}: {source}")]
    Dial {
        host: String,
        #[source]
        source: io::Error,
    },

    /// TLS handshake with the backend failed or timed out.
    #[error("TLS handshake with {host} failed: {source}")]
    TlsHandshake {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Writing the forward request to the backend failed.
    #[error("failed to write request to {host}: {source}")]
    Write {
        host: String,
        #[source]
        source: io::Error,
    },

    /// The backend response was malformed, incomplete or timed out.
    #[error("failed to read response from {host}: {source}")]
    Read {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Writing the relayed response back to the caller failed.
    #[error("failed to write response to caller: {0}")]
    RelayWrite(#[source] io::Error),
}

impl RelayError {
    /// Returns true for failures on the backend side of the relay.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            RelayError::Dial { .. }
                | RelayError::TlsHandshake { .. }
                | RelayError::Write { .. }
                | RelayError::Read { .. }
        )
    }
}

/// Builds the `io::Error` used when a backend operation exceeds its timeout.
pub(crate) fn timed_out(what: &str, after: std::time::Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{what} timed out after {after:?}"),
    )
}

/// Configuration could not be loaded or is inconsistent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid TLS material: {0}")]
    Tls(String),
}
