//! Networking utilities for egress address rotation.
//!
//! This library provides:
//! - IPv6 prefix parsing and masking (CIDR notation)
//! - Randomized host address selection inside a prefix

use std::net::Ipv6Addr;
use std::str::FromStr;

use rand::Rng;
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),
}

// ============================================================================
// Prefixes
// ============================================================================

/// IPv6 network prefix (address + prefix length).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Prefix {
    /// Network address, masked to the prefix length.
    pub address: Ipv6Addr,

    /// Prefix length (e.g., 64 for /64).
    pub prefix_len: u8,
}

impl Ipv6Prefix {
    /// Create a new prefix. Host bits of `address` are cleared.
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 128 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 128",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv6(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "2001:db8::/32").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.trim().split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv6Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Network address of this prefix.
    pub fn network(&self) -> Ipv6Addr {
        self.address
    }

    /// Width of the host portion in bits (128 - prefix length).
    pub fn host_bits(&self) -> u32 {
        128 - u32::from(self.prefix_len)
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        mask_ipv6(addr, self.prefix_len) == self.address
    }

    /// Number of addresses in this prefix, saturating at `u128::MAX` for ::/0.
    pub fn size(&self) -> u128 {
        match self.host_bits() {
            128 => u128::MAX,
            bits => 1u128 << bits,
        }
    }
}

impl FromStr for Ipv6Prefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl std::fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Mask an IPv6 address to a prefix length.
fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from(addr);
    Ipv6Addr::from(bits & network_mask(prefix_len))
}

fn network_mask(prefix_len: u8) -> u128 {
    match prefix_len {
        0 => 0,
        128.. => u128::MAX,
        len => u128::MAX << (128 - u32::from(len)),
    }
}

// ============================================================================
// Address pool
// ============================================================================

/// Source of random host addresses inside a single IPv6 prefix.
///
/// Every call to [`AddressPool::next_address`] is independent: the pool holds
/// no cursor and no record of previous draws, so a shared `&AddressPool` can
/// be used from any number of connections at once. The all-zero and all-ones
/// host values are not excluded; configure a block that avoids them if the
/// upstream network treats them specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    prefix: Ipv6Prefix,
    network: u128,
    host_mask: u128,
}

impl AddressPool {
    /// Create a pool drawing from `prefix`.
    pub fn new(prefix: Ipv6Prefix) -> Self {
        Self {
            network: u128::from(prefix.address),
            host_mask: !network_mask(prefix.prefix_len),
            prefix,
        }
    }

    /// Parse a CIDR block and build a pool from it.
    pub fn try_from_cidr(cidr: &str) -> Result<Self, NetworkError> {
        Ipv6Prefix::from_cidr(cidr).map(Self::new)
    }

    /// The block addresses are drawn from.
    pub fn prefix(&self) -> &Ipv6Prefix {
        &self.prefix
    }

    /// Width of the randomized host portion in bits.
    pub fn host_bits(&self) -> u32 {
        self.prefix.host_bits()
    }

    /// Draw a uniformly random address inside the block.
    pub fn next_address(&self) -> Ipv6Addr {
        self.next_address_with(&mut rand::rng())
    }

    /// Draw an address using the supplied random source.
    pub fn next_address_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Ipv6Addr {
        if self.host_mask == 0 {
            return self.prefix.address;
        }
        let host: u128 = rng.random();
        Ipv6Addr::from(self.network | (host & self.host_mask))
    }
}

impl From<Ipv6Prefix> for AddressPool {
    fn from(prefix: Ipv6Prefix) -> Self {
        Self::new(prefix)
    }
}

impl FromStr for AddressPool {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from_cidr(s)
    }
}
