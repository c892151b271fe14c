//! Backend dialers.
//!
//! A dialer turns the routing hostname (SNI value or configured default)
//! into a connected backend stream. Three policies exist:
//! - local socket: `<directory>/<hostname>` UNIX socket
//! - restricted direct: hostname is an IP literal inside the allow-list
//! - NAT64: hostname is an IPv4 literal, synthesized into an IPv6 prefix
//!
//! Validation happens in [`BackendDialer::resolve`], which never touches the
//! network or filesystem. Only a resolved target is ever dialed, and no
//! policy performs DNS resolution.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use snirelay_networking::{AllowList, Nat64Prefix};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tracing::debug;

use crate::error::ConnectionError;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A validated backend address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTarget {
    /// UNIX domain socket path.
    Unix(PathBuf),
    /// TCP socket address.
    Tcp(SocketAddr),
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendTarget::Unix(path) => write!(f, "unix:{}", path.display()),
            BackendTarget::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

impl BackendTarget {
    /// Connect to the target, bounded by `connect_timeout`.
    pub async fn connect(
        &self,
        connect_timeout: Duration,
    ) -> Result<BackendStream, ConnectionError> {
        debug!(backend = %self, "Connecting to backend");

        let result = match self {
            BackendTarget::Unix(path) => {
                timeout(connect_timeout, UnixStream::connect(path))
                    .await
                    .map(|r| r.map(|s| Box::new(s) as BackendStream))
            }
            BackendTarget::Tcp(addr) => {
                timeout(connect_timeout, TcpStream::connect(addr))
                    .await
                    .map(|r| r.map(|s| Box::new(s) as BackendStream))
            }
        };

        let result = match result {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        };

        result.map_err(|source| ConnectionError::BackendUnreachable {
            target: self.to_string(),
            source,
        })
    }
}

/// A connected backend: full-duplex bytes, and `shutdown` closes only the
/// write side so the relay can propagate a client half-close while still
/// reading the backend's response. TCP and UNIX streams both qualify.
pub trait BackendConn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BackendConn for T {}

/// Owned backend connection as handed to the relay.
pub type BackendStream = Box<dyn BackendConn>;

/// Backend dialer interface.
#[async_trait]
pub trait BackendDialer: Send + Sync {
    /// Validate `hostname` and map it to a target. No side effects.
    fn resolve(&self, hostname: &str) -> Result<BackendTarget, ConnectionError>;

    /// Connect timeout applied by [`BackendDialer::dial`].
    fn connect_timeout(&self) -> Duration {
        DEFAULT_CONNECT_TIMEOUT
    }

    /// Resolve `hostname` and connect to the result.
    async fn dial(&self, hostname: &str) -> Result<BackendStream, ConnectionError> {
        let target = self.resolve(hostname)?;
        target.connect(self.connect_timeout()).await
    }
}

/// Dials `<directory>/<hostname>` UNIX sockets.
#[derive(Debug, Clone)]
pub struct LocalSocketDialer {
    directory: PathBuf,
    connect_timeout: Duration,
}

impl LocalSocketDialer {
    /// Create a dialer for sockets inside `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl BackendDialer for LocalSocketDialer {
    fn resolve(&self, hostname: &str) -> Result<BackendTarget, ConnectionError> {
        // Keep the joined path a direct child of the directory.
        if hostname.is_empty()
            || hostname == "."
            || hostname == ".."
            || hostname.contains(['/', '\\', '\0'])
        {
            return Err(ConnectionError::InvalidHostname(hostname.to_string()));
        }

        Ok(BackendTarget::Unix(self.directory.join(hostname)))
    }

    fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

/// Dials IP literals inside an allow-list on a fixed port.
#[derive(Debug, Clone)]
pub struct RestrictedDirectDialer {
    port: u16,
    allow: AllowList,
    connect_timeout: Duration,
}

impl RestrictedDirectDialer {
    /// Create a dialer for `allow` on `port`.
    pub fn new(port: u16, allow: AllowList) -> Self {
        Self {
            port,
            allow,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl BackendDialer for RestrictedDirectDialer {
    fn resolve(&self, hostname: &str) -> Result<BackendTarget, ConnectionError> {
        let addr = parse_ip_literal(hostname)?;
        if !self.allow.contains(addr) {
            return Err(ConnectionError::BackendNotAllowed(addr));
        }
        Ok(BackendTarget::Tcp(SocketAddr::new(addr, self.port)))
    }

    fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

/// Dials IPv4 literals through a NAT64 prefix on a fixed port.
#[derive(Debug, Clone)]
pub struct Nat64Dialer {
    port: u16,
    allow: AllowList,
    prefix: Nat64Prefix,
    connect_timeout: Duration,
}

impl Nat64Dialer {
    /// Create a dialer for IPv4 addresses in `allow`, reached via `prefix`.
    pub fn new(port: u16, allow: AllowList, prefix: Nat64Prefix) -> Self {
        Self {
            port,
            allow,
            prefix,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl BackendDialer for Nat64Dialer {
    fn resolve(&self, hostname: &str) -> Result<BackendTarget, ConnectionError> {
        let IpAddr::V4(v4) = parse_ip_literal(hostname)? else {
            return Err(ConnectionError::InvalidHostname(hostname.to_string()));
        };
        if !self.allow.contains(IpAddr::V4(v4)) {
            return Err(ConnectionError::BackendNotAllowed(IpAddr::V4(v4)));
        }

        let synthesized = self.prefix.synthesize(v4);
        Ok(BackendTarget::Tcp(SocketAddr::new(
            IpAddr::V6(synthesized),
            self.port,
        )))
    }

    fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

/// Parse a literal address. DNS names are rejected, never resolved.
/// IPv4-mapped IPv6 literals come back as IPv4.
fn parse_ip_literal(hostname: &str) -> Result<IpAddr, ConnectionError> {
    hostname
        .parse::<IpAddr>()
        .map(|addr| addr.to_canonical())
        .map_err(|_| ConnectionError::InvalidHostname(hostname.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn allow(cidrs: &[&str]) -> AllowList {
        AllowList::from_cidrs(cidrs).unwrap()
    }

    #[test]
    fn test_local_socket_resolves_child_path() {
        let dialer = LocalSocketDialer::new("/sockets");
        assert_eq!(
            dialer.resolve("app1").unwrap(),
            BackendTarget::Unix(PathBuf::from("/sockets/app1"))
        );
        assert_eq!(
            dialer.resolve("www.example.com").unwrap(),
            BackendTarget::Unix(PathBuf::from("/sockets/www.example.com"))
        );
    }

    #[test]
    fn test_local_socket_rejects_traversal() {
        let dialer = LocalSocketDialer::new("/sockets");
        for hostname in ["a/b", "../escape", "", ".", "..", "app\0x", "a\\b", "/etc/passwd"] {
            assert!(
                matches!(
                    dialer.resolve(hostname),
                    Err(ConnectionError::InvalidHostname(_))
                ),
                "{:?} should be rejected",
                hostname
            );
        }
    }

    #[tokio::test]
    async fn test_local_socket_invalid_hostname_never_dials() {
        // Directory does not exist; validation must fail before any connect.
        let dialer = LocalSocketDialer::new("/nonexistent-snirelay-dir");
        let result = dialer.dial("../escape").await;
        assert!(matches!(result, Err(ConnectionError::InvalidHostname(_))));
    }

    #[tokio::test]
    async fn test_local_socket_missing_socket_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let dialer = LocalSocketDialer::new(dir.path());
        let result = dialer.dial("absent").await;
        assert!(matches!(
            result,
            Err(ConnectionError::BackendUnreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_socket_dial() {
        let dir = tempfile::tempdir().unwrap();
        let listener = tokio::net::UnixListener::bind(dir.path().join("app1")).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let dialer = LocalSocketDialer::new(dir.path());
        let mut stream = dialer.dial("app1").await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_restricted_direct_resolve() {
        let dialer = RestrictedDirectDialer::new(443, allow(&["10.0.0.0/8"]));
        assert_eq!(
            dialer.resolve("10.1.2.3").unwrap(),
            BackendTarget::Tcp("10.1.2.3:443".parse().unwrap())
        );
        assert!(matches!(
            dialer.resolve("8.8.8.8"),
            Err(ConnectionError::BackendNotAllowed(_))
        ));
        assert!(matches!(
            dialer.resolve("not-an-ip"),
            Err(ConnectionError::InvalidHostname(_))
        ));
        // DNS names are never resolved, even "localhost"
        assert!(matches!(
            dialer.resolve("localhost"),
            Err(ConnectionError::InvalidHostname(_))
        ));
    }

    #[test]
    fn test_restricted_direct_mapped_and_ipv6() {
        let v4_only = RestrictedDirectDialer::new(443, allow(&["10.0.0.0/8"]));
        assert_eq!(
            v4_only.resolve("::ffff:10.1.2.3").unwrap(),
            BackendTarget::Tcp("10.1.2.3:443".parse().unwrap())
        );
        assert!(matches!(
            v4_only.resolve("2001:db8::1"),
            Err(ConnectionError::BackendNotAllowed(_))
        ));

        let v6 = RestrictedDirectDialer::new(443, allow(&["2001:db8::/32"]));
        assert_eq!(
            v6.resolve("2001:db8::1").unwrap(),
            BackendTarget::Tcp("[2001:db8::1]:443".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_restricted_direct_dial() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let dialer = RestrictedDirectDialer::new(port, allow(&["127.0.0.0/8"]));
        assert!(dialer.dial("127.0.0.1").await.is_ok());
    }

    #[test]
    fn test_nat64_resolve() {
        let dialer = Nat64Dialer::new(
            443,
            allow(&["0.0.0.0/0"]),
            Nat64Prefix::parse("64:ff9b::/96").unwrap(),
        );
        assert_eq!(
            dialer.resolve("1.2.3.4").unwrap(),
            BackendTarget::Tcp("[64:ff9b::102:304]:443".parse().unwrap())
        );
        assert!(matches!(
            dialer.resolve("2001:db8::1"),
            Err(ConnectionError::InvalidHostname(_))
        ));
        assert!(matches!(
            dialer.resolve("example.com"),
            Err(ConnectionError::InvalidHostname(_))
        ));
    }

    #[test]
    fn test_nat64_allow_list_applies_to_ipv4() {
        let dialer = Nat64Dialer::new(
            8443,
            allow(&["192.0.2.0/24"]),
            Nat64Prefix::parse("2001:db8:64::").unwrap(),
        );
        assert_eq!(
            dialer.resolve("192.0.2.33").unwrap(),
            BackendTarget::Tcp("[2001:db8:64::c000:221]:8443".parse().unwrap())
        );
        assert!(matches!(
            dialer.resolve("198.51.100.1"),
            Err(ConnectionError::BackendNotAllowed(_))
        ));
    }

    #[test]
    fn test_target_display() {
        assert_eq!(
            BackendTarget::Unix(PathBuf::from("/sockets/app1")).to_string(),
            "unix:/sockets/app1"
        );
        assert_eq!(
            BackendTarget::Tcp("10.0.0.1:443".parse().unwrap()).to_string(),
            "tcp:10.0.0.1:443"
        );
    }
}
