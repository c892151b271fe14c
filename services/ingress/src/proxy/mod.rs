//! TLS passthrough proxy.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Server -> SNI Inspector -> Backend Dialer -> Backend
//!                                                        |
//!                                            PROXY header (if enabled)
//!                                                        |
//!                                                      Relay
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig, LocalSocketDialer, Server, ServerConfig};
//!
//! let dialer = Arc::new(LocalSocketDialer::new("/run/backends"));
//! let server = Arc::new(Server::new(ServerConfig::default(), dialer));
//!
//! let config = ListenerConfig::new("[::]:443".parse()?);
//! let listener = Arc::new(Listener::bind(config, server).await?);
//! listener.run().await?;
//! ```

mod backend;
mod listener;
mod proxy_protocol;
mod relay;
mod server;
mod sni;

pub use backend::{
    BackendConn, BackendDialer, BackendStream, BackendTarget, LocalSocketDialer, Nat64Dialer,
    RestrictedDirectDialer, DEFAULT_CONNECT_TIMEOUT,
};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use proxy_protocol::{ProxyHeader, ProxyProtocol, PROXY_V2_SIGNATURE};
pub use relay::{relay, RelayStats, RELAY_BUFFER_SIZE};
pub use server::{Server, ServerConfig};
pub use sni::{
    ClientHelloView, SniConfig, SniInspector, DEFAULT_MAX_SNIFF_BYTES, DEFAULT_SNIFF_TIMEOUT,
};
