//! Error types for module configuration and agent communication.
//!
//! Invalid configuration is the only error surfaced to callers at
//! construction time. Everything that can go wrong while talking to the
//! agent is an [`InspectorError`], and every inspector error on the request
//! path results in failing open, never in a failed response.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while applying configuration options.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The socket network was neither `unix` nor `tcp`.
    #[error(r#"network must be "tcp" or "unix", got {0:?}"#)]
    InvalidNetwork(String),

    /// A `unix` socket address must be an absolute filesystem path.
    #[error(r#"address must be an absolute path for network="unix", got {0:?}"#)]
    UnixAddressNotAbsolute(String),

    /// A `tcp` socket address must be in `host:port` form.
    #[error(r#"address must be in "host:port" form for network="tcp", got {0:?}"#)]
    InvalidTcpAddress(String),
}

/// Errors raised by an [`Inspector`](crate::inspector::Inspector)
/// implementation.
///
/// These never propagate to the HTTP client: the request lifecycle treats
/// every variant as a signal to fail open.
#[derive(Debug, Error)]
pub enum InspectorError {
    /// The deadline covering connect, send, and receive expired.
    #[error("agent call {method:?} timed out after {timeout:?}")]
    Timeout {
        /// RPC method name
        method: &'static str,
        /// The configured per-call deadline
        timeout: Duration,
    },

    /// The connection could not be established or the exchange failed.
    #[error("agent i/o failed: {0}")]
    Io(#[from] io::Error),

    /// The agent's reply did not follow the expected framing or schema.
    #[error("malformed agent response: {0}")]
    Protocol(String),

    /// The agent answered the call with an error payload.
    #[error("agent returned an error: {0}")]
    Remote(String),
}

impl InspectorError {
    /// Returns `true` if the call failed because the deadline expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, InspectorError::Timeout { .. })
    }
}
