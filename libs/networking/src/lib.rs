//! Address policy primitives for the router.
//!
//! This library provides helpers for:
//! - CIDR prefixes for both address families
//! - Immutable backend allow-lists
//! - NAT64 address synthesis (RFC 6052, /96 prefixes only)

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Allow-list without any entries.
    #[error("allow-list must contain at least one prefix")]
    EmptyAllowList,

    /// NAT64 prefix is not usable for synthesis.
    #[error("invalid NAT64 prefix: {0}")]
    InvalidNat64Prefix(String),
}

// ============================================================================
// CIDR prefixes
// ============================================================================

/// An IP network prefix (e.g. `10.0.0.0/8` or `64:ff9b::/96`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPrefix {
    /// Base address of the prefix, masked to `prefix_len`.
    address: IpAddr,

    /// Prefix length (e.g., 8 for /8).
    prefix_len: u8,
}

impl IpPrefix {
    /// Create a new prefix, masking host bits off the address.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let max = max_prefix_len(address);
        if prefix_len > max {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }

        let address = match address {
            IpAddr::V4(v4) => IpAddr::V4(mask_ipv4(v4, prefix_len)),
            IpAddr::V6(v6) => IpAddr::V6(mask_ipv6(v6, prefix_len)),
        };

        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "10.0.0.0/8").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix.
    ///
    /// IPv4-mapped IPv6 addresses are matched as their IPv4 form, so
    /// `::ffff:10.1.2.3` is inside `10.0.0.0/8`. Families never match
    /// across otherwise.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.address, addr.to_canonical()) {
            (IpAddr::V4(base), IpAddr::V4(v4)) => mask_ipv4(v4, self.prefix_len) == base,
            (IpAddr::V6(base), IpAddr::V6(v6)) => mask_ipv6(v6, self.prefix_len) == base,
            _ => false,
        }
    }
}

impl FromStr for IpPrefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn max_prefix_len(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from(bits & mask)
}

/// Mask an IPv6 address to a prefix length.
fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

// ============================================================================
// Allow-lists
// ============================================================================

/// Immutable set of prefixes a backend address must fall into.
///
/// Built once at startup and shared read-only between connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    prefixes: Vec<IpPrefix>,
}

impl AllowList {
    /// Create an allow-list. At least one prefix is required.
    pub fn new(prefixes: Vec<IpPrefix>) -> Result<Self, NetworkError> {
        if prefixes.is_empty() {
            return Err(NetworkError::EmptyAllowList);
        }
        Ok(Self { prefixes })
    }

    /// Parse a list of CIDR strings.
    pub fn from_cidrs<S: AsRef<str>>(cidrs: &[S]) -> Result<Self, NetworkError> {
        let prefixes = cidrs
            .iter()
            .map(|c| IpPrefix::from_cidr(c.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(prefixes)
    }

    /// Check whether any prefix contains the address.
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.prefixes.iter().any(|p| p.contains(addr))
    }

    /// The configured prefixes.
    pub fn prefixes(&self) -> &[IpPrefix] {
        &self.prefixes
    }
}

impl fmt::Display for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, prefix) in self.prefixes.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", prefix)?;
        }
        Ok(())
    }
}

// ============================================================================
// NAT64
// ============================================================================

/// Well-known NAT64 prefix (RFC 6052).
pub const NAT64_WELL_KNOWN_PREFIX: Ipv6Addr = Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, 0, 0);

/// A /96 IPv6 prefix used to embed IPv4 addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nat64Prefix {
    /// Top 96 bits; the low 32 bits are always zero.
    prefix: Ipv6Addr,
}

impl Nat64Prefix {
    /// Create from an IPv6 address whose low 32 bits are zero.
    pub fn new(prefix: Ipv6Addr) -> Result<Self, NetworkError> {
        if prefix.to_ipv4_mapped().is_some() {
            return Err(NetworkError::InvalidNat64Prefix(format!(
                "{} is an IPv4-mapped address",
                prefix
            )));
        }
        if mask_ipv6(prefix, 96) != prefix {
            return Err(NetworkError::InvalidNat64Prefix(format!(
                "{} has bits set beyond /96",
                prefix
            )));
        }
        Ok(Self { prefix })
    }

    /// Parse from either `64:ff9b::` or `64:ff9b::/96`.
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let addr_str = match s.split_once('/') {
            Some((addr, "96")) => addr,
            Some((_, len)) => {
                return Err(NetworkError::InvalidNat64Prefix(format!(
                    "prefix length must be 96, got {}",
                    len
                )))
            }
            None => s,
        };

        let addr = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        match addr {
            IpAddr::V6(v6) => Self::new(v6),
            IpAddr::V4(_) => Err(NetworkError::InvalidNat64Prefix(format!(
                "{} is not an IPv6 address",
                addr_str
            ))),
        }
    }

    /// Synthesize `prefix || ipv4`.
    pub fn synthesize(&self, v4: Ipv4Addr) -> Ipv6Addr {
        let bits = u128::from_be_bytes(self.prefix.octets()) | u128::from(u32::from(v4));
        Ipv6Addr::from(bits.to_be_bytes())
    }
}

impl Default for Nat64Prefix {
    fn default() -> Self {
        Self {
            prefix: NAT64_WELL_KNOWN_PREFIX,
        }
    }
}

impl FromStr for Nat64Prefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Nat64Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/96", self.prefix)
    }
}
