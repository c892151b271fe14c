//! Error types for connection routing.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

/// Per-connection routing errors with standardized reason codes.
///
/// Every variant is local to one connection: the client (and backend, if
/// already dialed) is closed without sending anything to either peer.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Client did not finish its ClientHello within the sniff deadline.
    #[error("sniff_timeout: no ClientHello within {0:?}")]
    SniffTimeout(Duration),

    /// ClientHello would not fit into the sniff byte budget.
    #[error("handshake_too_large: ClientHello exceeds {limit} bytes")]
    HandshakeTooLarge { limit: usize },

    /// A length field points past the data that encloses it.
    #[error("malformed_client_hello: {0}")]
    MalformedClientHello(&'static str),

    /// First record is not a handshake record, or message is not a ClientHello.
    #[error("not_handshake: {0}")]
    NotHandshake(String),

    /// No SNI and no default hostname configured.
    #[error("no_hostname: client sent no SNI and no default hostname is configured")]
    NoHostname,

    /// Hostname rejected by the backend policy before any side effect.
    #[error("invalid_hostname: {0:?}")]
    InvalidHostname(String),

    /// Hostname is a valid address but outside the allow-list.
    #[error("backend_not_allowed: {0} is not in the backend allow-list")]
    BackendNotAllowed(IpAddr),

    /// Connecting to the backend failed or timed out.
    #[error("backend_unreachable: {target}: {source}")]
    BackendUnreachable {
        target: String,
        #[source]
        source: io::Error,
    },

    /// PROXY header could not be written; no client bytes were forwarded.
    #[error("proxy_header_write_failed: {0}")]
    ProxyHeaderWriteFailed(#[source] io::Error),

    /// IO error (client reads during sniffing, relay setup).
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConnectionError::SniffTimeout(_) => "sniff_timeout",
            ConnectionError::HandshakeTooLarge { .. } => "handshake_too_large",
            ConnectionError::MalformedClientHello(_) => "malformed_client_hello",
            ConnectionError::NotHandshake(_) => "not_handshake",
            ConnectionError::NoHostname => "no_hostname",
            ConnectionError::InvalidHostname(_) => "invalid_hostname",
            ConnectionError::BackendNotAllowed(_) => "backend_not_allowed",
            ConnectionError::BackendUnreachable { .. } => "backend_unreachable",
            ConnectionError::ProxyHeaderWriteFailed(_) => "proxy_header_write_failed",
            ConnectionError::Io(_) => "io_error",
        }
    }

    /// Whether this failure is expected client or policy noise rather than
    /// an operational problem on our side.
    pub fn is_routine(&self) -> bool {
        !matches!(
            self,
            ConnectionError::BackendUnreachable { .. } | ConnectionError::ProxyHeaderWriteFailed(_)
        )
    }
}
