pub mod config;
pub mod error;
pub mod proxy;

pub use config::{Args, BackendPolicy, Config};
pub use error::ConnectionError;
pub use proxy::{
    BackendDialer, BackendTarget, Listener, ListenerConfig, ListenerStats, LocalSocketDialer,
    Nat64Dialer, ProxyHeader, ProxyProtocol, RelayStats, RestrictedDirectDialer, Server,
    ServerConfig, SniConfig, SniInspector,
};
