//! PROXY protocol header generation.
//!
//! This module generates PROXY protocol headers (v1 text or v2 binary) for
//! prepending to backend connections when enabled. The version is a fixed
//! configuration choice, never negotiated per connection.
//!
//! v2 wire format (from the HAProxy PROXY protocol spec):
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length
//! - variable: addresses and ports
//!
//! v1 wire format:
//! `PROXY TCP4 <src> <dst> <sport> <dport>\r\n`

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::ConnectionError;

/// PROXY protocol v2 signature (12 bytes).
pub const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Address family: AF_INET (IPv4).
const AF_INET: u8 = 0x10;

/// Address family: AF_INET6 (IPv6).
const AF_INET6: u8 = 0x20;

/// Transport protocol: STREAM (TCP).
const TRANSPORT_STREAM: u8 = 0x01;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: u16 = 36;

/// PROXY protocol configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyProtocol {
    /// PROXY protocol disabled; no header bytes are ever written.
    #[default]
    Off,
    /// Human-readable v1 header.
    V1,
    /// Binary v2 header.
    V2,
}

impl ProxyProtocol {
    /// Whether a header is written at all.
    pub fn is_enabled(&self) -> bool {
        *self != ProxyProtocol::Off
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyProtocol::Off => f.write_str("off"),
            ProxyProtocol::V1 => f.write_str("v1"),
            ProxyProtocol::V2 => f.write_str("v2"),
        }
    }
}

/// PROXY protocol header for one connection.
#[derive(Debug, Clone)]
pub struct ProxyHeader {
    /// Source (client) address.
    pub src_addr: SocketAddr,
    /// Destination (proxy listener) address.
    pub dst_addr: SocketAddr,
}

/// Addresses after family reconciliation.
enum Endpoints {
    V4(Ipv4Addr, Ipv4Addr),
    V6(Ipv6Addr, Ipv6Addr),
}

impl ProxyHeader {
    /// Create a new PROXY header for the given connection.
    ///
    /// # Arguments
    /// * `src_addr` - Original client source address and port
    /// * `dst_addr` - Destination address as observed at the listener
    pub fn new(src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self { src_addr, dst_addr }
    }

    /// Encode the header in the requested version.
    ///
    /// Returns an empty buffer for [`ProxyProtocol::Off`].
    pub fn encode(&self, version: ProxyProtocol) -> Vec<u8> {
        match version {
            ProxyProtocol::Off => Vec::new(),
            ProxyProtocol::V1 => self.encode_v1().into_bytes(),
            ProxyProtocol::V2 => self.encode_v2(),
        }
    }

    /// Write the header to `backend` and flush it.
    ///
    /// Must complete before any client byte is relayed.
    pub async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        backend: &mut W,
        version: ProxyProtocol,
    ) -> Result<(), ConnectionError> {
        if !version.is_enabled() {
            return Ok(());
        }

        let header = self.encode(version);
        backend
            .write_all(&header)
            .await
            .map_err(ConnectionError::ProxyHeaderWriteFailed)?;
        backend
            .flush()
            .await
            .map_err(ConnectionError::ProxyHeaderWriteFailed)
    }

    /// Both addresses in one family. IPv4-mapped IPv6 is unmapped first;
    /// a remaining mismatch maps the IPv4 side into IPv6.
    fn endpoints(&self) -> Endpoints {
        match (self.src_addr.ip().to_canonical(), self.dst_addr.ip().to_canonical()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => Endpoints::V4(src, dst),
            (IpAddr::V6(src), IpAddr::V6(dst)) => Endpoints::V6(src, dst),
            (IpAddr::V4(src), IpAddr::V6(dst)) => Endpoints::V6(src.to_ipv6_mapped(), dst),
            (IpAddr::V6(src), IpAddr::V4(dst)) => Endpoints::V6(src, dst.to_ipv6_mapped()),
        }
    }

    /// Encode the v1 text header.
    pub fn encode_v1(&self) -> String {
        let (proto, src, dst) = match self.endpoints() {
            Endpoints::V4(src, dst) => ("TCP4", src.to_string(), dst.to_string()),
            Endpoints::V6(src, dst) => ("TCP6", src.to_string(), dst.to_string()),
        };
        format!(
            "PROXY {} {} {} {} {}\r\n",
            proto,
            src,
            dst,
            self.src_addr.port(),
            self.dst_addr.port()
        )
    }

    /// Encode the v2 binary header.
    pub fn encode_v2(&self) -> Vec<u8> {
        match self.endpoints() {
            Endpoints::V4(src, dst) => self.encode_v2_v4(src, dst),
            Endpoints::V6(src, dst) => self.encode_v2_v6(src, dst),
        }
    }

    /// Encode IPv4 PROXY v2 header.
    fn encode_v2_v4(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 12);

        buf.extend_from_slice(&PROXY_V2_SIGNATURE);
        buf.push(VERSION_COMMAND_PROXY);
        buf.push(AF_INET | TRANSPORT_STREAM);
        buf.extend_from_slice(&IPV4_ADDR_LEN.to_be_bytes());

        buf.extend_from_slice(&src_ip.octets());
        buf.extend_from_slice(&dst_ip.octets());
        buf.extend_from_slice(&self.src_addr.port().to_be_bytes());
        buf.extend_from_slice(&self.dst_addr.port().to_be_bytes());

        buf
    }

    /// Encode IPv6 PROXY v2 header.
    fn encode_v2_v6(&self, src_ip: Ipv6Addr, dst_ip: Ipv6Addr) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 36);

        buf.extend_from_slice(&PROXY_V2_SIGNATURE);
        buf.push(VERSION_COMMAND_PROXY);
        buf.push(AF_INET6 | TRANSPORT_STREAM);
        buf.extend_from_slice(&IPV6_ADDR_LEN.to_be_bytes());

        buf.extend_from_slice(&src_ip.octets());
        buf.extend_from_slice(&dst_ip.octets());
        buf.extend_from_slice(&self.src_addr.port().to_be_bytes());
        buf.extend_from_slice(&self.dst_addr.port().to_be_bytes());

        buf
    }
}
