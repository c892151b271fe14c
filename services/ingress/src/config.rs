//! Router configuration.
//!
//! Command-line flags (with `SNIRELAY_*` environment fallbacks) are parsed by
//! clap into [`Args`], then validated once at startup into an immutable
//! [`Config`]. Nothing here is consulted again after the listeners start.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use snirelay_networking::{AllowList, Nat64Prefix};

use crate::proxy::{
    BackendDialer, ListenerConfig, LocalSocketDialer, Nat64Dialer, ProxyProtocol,
    RestrictedDirectDialer, ServerConfig, SniConfig, DEFAULT_MAX_CONNECTIONS,
};

/// SNI-routing TLS passthrough proxy.
#[derive(Debug, Clone, Parser)]
#[command(name = "snirelay", version, about)]
pub struct Args {
    /// Socket address to accept connections on (repeatable).
    #[arg(long = "listen", env = "SNIRELAY_LISTEN", value_delimiter = ',', required = true)]
    pub listen: Vec<SocketAddr>,

    /// Hostname used when a client sends no SNI.
    #[arg(long, env = "SNIRELAY_DEFAULT_HOSTNAME", default_value = "")]
    pub default_hostname: String,

    /// How hostnames map to backends.
    #[arg(long, env = "SNIRELAY_BACKEND_TYPE", value_enum)]
    pub backend_type: BackendType,

    /// Send a PROXY protocol header to every backend.
    #[arg(long, env = "SNIRELAY_PROXY_PROTO")]
    pub proxy_proto: bool,

    /// PROXY protocol version used with --proxy-proto.
    #[arg(long, env = "SNIRELAY_PROXY_PROTO_VERSION", value_enum, default_value = "v2")]
    pub proxy_proto_version: ProxyVersion,

    /// Directory holding one UNIX socket per hostname (unix backends).
    #[arg(long, env = "SNIRELAY_UNIX_DIRECTORY")]
    pub unix_directory: Option<PathBuf>,

    /// Permitted backend network in CIDR notation (repeatable; tcp, nat64).
    #[arg(long = "backend-cidr", env = "SNIRELAY_BACKEND_CIDR", value_delimiter = ',')]
    pub backend_cidrs: Vec<String>,

    /// Backend port (tcp, nat64).
    #[arg(long, env = "SNIRELAY_BACKEND_PORT")]
    pub backend_port: Option<u16>,

    /// NAT64 /96 prefix (nat64).
    #[arg(long, env = "SNIRELAY_NAT64_PREFIX")]
    pub nat64_prefix: Option<String>,

    /// Time allowed for a complete ClientHello, in milliseconds.
    #[arg(long, env = "SNIRELAY_SNIFF_TIMEOUT_MS", default_value_t = 5000)]
    pub sniff_timeout_ms: u64,

    /// Bytes buffered while sniffing, record headers included.
    #[arg(long, env = "SNIRELAY_MAX_SNIFF_BYTES", default_value_t = 16384)]
    pub max_sniff_bytes: usize,

    /// Backend connect timeout, in milliseconds.
    #[arg(long, env = "SNIRELAY_CONNECT_TIMEOUT_MS", default_value_t = 2000)]
    pub connect_timeout_ms: u64,

    /// Per-direction relay idle timeout, in seconds. Unset relays forever.
    #[arg(long, env = "SNIRELAY_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Maximum concurrent connections per listener.
    #[arg(long, env = "SNIRELAY_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "SNIRELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "SNIRELAY_LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,
}

/// Backend policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendType {
    /// UNIX socket named after the hostname.
    Unix,
    /// Hostname is an IP literal, dialed on a fixed port.
    Tcp,
    /// Hostname is an IPv4 literal, dialed through a NAT64 prefix.
    #[value(alias = "nat46")]
    Nat64,
}

/// PROXY protocol version flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProxyVersion {
    V1,
    V2,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// How hostnames map to backend endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendPolicy {
    LocalSocket {
        directory: PathBuf,
    },
    RestrictedDirect {
        port: u16,
        allow: AllowList,
    },
    Nat64 {
        port: u16,
        allow: AllowList,
        prefix: Nat64Prefix,
    },
}

impl BackendPolicy {
    /// Build the dialer for this policy.
    pub fn into_dialer(self, connect_timeout: Duration) -> Arc<dyn BackendDialer> {
        match self {
            BackendPolicy::LocalSocket { directory } => Arc::new(
                LocalSocketDialer::new(directory).with_connect_timeout(connect_timeout),
            ),
            BackendPolicy::RestrictedDirect { port, allow } => Arc::new(
                RestrictedDirectDialer::new(port, allow).with_connect_timeout(connect_timeout),
            ),
            BackendPolicy::Nat64 {
                port,
                allow,
                prefix,
            } => Arc::new(
                Nat64Dialer::new(port, allow, prefix).with_connect_timeout(connect_timeout),
            ),
        }
    }
}

/// Validated router configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub policy: BackendPolicy,
    pub connect_timeout: Duration,
    pub listeners: Vec<ListenerConfig>,
}

impl Args {
    /// Validate flags into a [`Config`].
    pub fn into_config(self) -> Result<Config> {
        if self.listen.is_empty() {
            bail!("At least one --listen address is required.");
        }
        if self.max_sniff_bytes < 5 {
            bail!("--max-sniff-bytes must be at least 5 (one record header).");
        }
        if self.max_connections == 0 {
            bail!("--max-connections must be at least 1.");
        }

        let policy = self.backend_policy()?;

        let proxy_protocol = match (self.proxy_proto, self.proxy_proto_version) {
            (false, _) => ProxyProtocol::Off,
            (true, ProxyVersion::V1) => ProxyProtocol::V1,
            (true, ProxyVersion::V2) => ProxyProtocol::V2,
        };

        let server = ServerConfig {
            default_hostname: self.default_hostname,
            proxy_protocol,
            sni: SniConfig {
                timeout: Duration::from_millis(self.sniff_timeout_ms),
                max_bytes: self.max_sniff_bytes,
            },
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
        };

        let listeners = self
            .listen
            .iter()
            .map(|&bind_addr| ListenerConfig {
                bind_addr,
                max_connections: self.max_connections,
            })
            .collect();

        Ok(Config {
            server,
            policy,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            listeners,
        })
    }

    fn backend_policy(&self) -> Result<BackendPolicy> {
        match self.backend_type {
            BackendType::Unix => {
                let directory = self
                    .unix_directory
                    .clone()
                    .context("--unix-directory is required for unix backends.")?;
                Ok(BackendPolicy::LocalSocket { directory })
            }
            BackendType::Tcp => Ok(BackendPolicy::RestrictedDirect {
                port: self.backend_port()?,
                allow: self.allow_list()?,
            }),
            BackendType::Nat64 => {
                let prefix = self
                    .nat64_prefix
                    .as_deref()
                    .context("--nat64-prefix is required for nat64 backends.")?;
                let prefix = Nat64Prefix::parse(prefix)
                    .with_context(|| format!("Invalid --nat64-prefix {prefix:?}."))?;
                Ok(BackendPolicy::Nat64 {
                    port: self.backend_port()?,
                    allow: self.allow_list()?,
                    prefix,
                })
            }
        }
    }

    fn backend_port(&self) -> Result<u16> {
        match self.backend_port {
            Some(0) => bail!("--backend-port must be non-zero."),
            Some(port) => Ok(port),
            None => bail!("--backend-port is required for {:?} backends.", self.backend_type),
        }
    }

    fn allow_list(&self) -> Result<AllowList> {
        AllowList::from_cidrs(&self.backend_cidrs)
            .context("--backend-cidr must list at least one valid CIDR.")
    }
}
