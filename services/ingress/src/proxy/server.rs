//! Connection orchestration.
//!
//! Drives one accepted connection through:
//!
//! ```text
//! Accepted -> Sniffing -> Resolving -> Dialing -> (HeaderWrite) -> Relaying -> Closed
//! ```
//!
//! Any failure ends the connection by dropping both streams. Nothing is ever
//! sent to the client to explain why.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::backend::BackendDialer;
use super::listener::ListenerStats;
use super::proxy_protocol::{ProxyHeader, ProxyProtocol};
use super::relay::{self, RelayStats};
use super::sni::{SniConfig, SniInspector};
use crate::error::ConnectionError;

/// Routing configuration shared by every connection.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Hostname used when the client sends no SNI. Empty means none.
    pub default_hostname: String,
    /// PROXY header written to the backend before any client byte.
    pub proxy_protocol: ProxyProtocol,
    /// Sniffing budgets.
    pub sni: SniConfig,
    /// Per-direction idle timeout while relaying. `None` relays forever.
    pub idle_timeout: Option<Duration>,
}

/// The connection orchestrator.
pub struct Server {
    config: ServerConfig,
    inspector: SniInspector,
    dialer: Arc<dyn BackendDialer>,
}

impl Server {
    /// Create a server routing through `dialer`.
    pub fn new(config: ServerConfig, dialer: Arc<dyn BackendDialer>) -> Self {
        Self {
            inspector: SniInspector::with_config(config.sni.clone()),
            config,
            dialer,
        }
    }

    /// Route one accepted connection to completion.
    ///
    /// `peer_addr` and `local_addr` are the client's remote address and the
    /// listener-side address, used only for the PROXY header. Outcomes are
    /// counted into `stats`.
    pub async fn handle_connection<S>(
        &self,
        mut client: S,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        stats: &ListenerStats,
    ) -> Result<RelayStats, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Sniffing
        let mut sniff_buffer = Vec::new();
        let sni = match self.inspector.inspect(&mut client, &mut sniff_buffer).await {
            Ok(sni) => sni,
            Err(e) => {
                stats.sniff_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        // Resolving
        match &sni {
            Some(hostname) => {
                stats.sni_found.fetch_add(1, Ordering::Relaxed);
                debug!(hostname = %hostname, "SNI extracted");
            }
            None => {
                stats.sni_absent.fetch_add(1, Ordering::Relaxed);
                debug!("No SNI in ClientHello");
            }
        }
        let hostname = self.resolve_hostname(sni)?;

        // Dialing
        let mut backend = match self.dialer.dial(&hostname).await {
            Ok(backend) => {
                stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                backend
            }
            Err(e) => {
                stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        debug!(hostname = %hostname, "Connected to backend");

        // HeaderWrite
        if self.config.proxy_protocol.is_enabled() {
            ProxyHeader::new(peer_addr, local_addr)
                .write_to(&mut backend, self.config.proxy_protocol)
                .await?;
            debug!(version = %self.config.proxy_protocol, "PROXY header sent");
        }

        // Relaying
        let relayed = relay::relay(client, backend, &sniff_buffer, self.config.idle_timeout).await?;

        stats
            .bytes_to_backend
            .fetch_add(relayed.to_backend, Ordering::Relaxed);
        stats
            .bytes_from_backend
            .fetch_add(relayed.from_backend, Ordering::Relaxed);

        Ok(relayed)
    }

    /// SNI if present, else the default hostname if non-empty.
    fn resolve_hostname(&self, sni: Option<String>) -> Result<String, ConnectionError> {
        match sni {
            Some(hostname) => Ok(hostname),
            None if !self.config.default_hostname.is_empty() => {
                Ok(self.config.default_hostname.clone())
            }
            None => Err(ConnectionError::NoHostname),
        }
    }
}
