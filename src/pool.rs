//! Address pool allocation
//!
//! Hands out tunnel addresses from the hub's `ip_pool` CIDR. Candidates are
//! enumerated in ascending order from the network address, so allocation is
//! deterministic for a given set of used addresses. Freed addresses are simply
//! absent from the used set on the next scan.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// How many leading addresses of the pool are withheld from peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    /// Skip the network address and the next two, which the hub keeps for itself
    #[default]
    Hub,
    /// Skip only the network address
    Standard,
}

impl PoolMode {
    /// Number of addresses skipped at the start of the pool
    pub fn reserved_prefix(self) -> u64 {
        match self {
            PoolMode::Hub => 3,
            PoolMode::Standard => 1,
        }
    }
}

/// A parsed allocation pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    net: Ipv4Net,
    mode: PoolMode,
}

impl AddressPool {
    /// Parse a CIDR such as `10.8.0.0/24`
    ///
    /// Host bits are masked off, so `10.8.0.1/24` yields the same pool.
    pub fn parse(cidr: &str, mode: PoolMode) -> Result<Self, PoolError> {
        let net: Ipv4Net = cidr.trim().parse().map_err(|_| PoolError::InvalidPool {
            value: cidr.to_string(),
        })?;
        Ok(Self {
            net: net.trunc(),
            mode,
        })
    }

    pub fn network(&self) -> Ipv4Net {
        self.net
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    /// Number of addresses peers can be given
    pub fn capacity(&self) -> u64 {
        let total = 1u64 << (32 - u32::from(self.net.prefix_len()));
        // Broadcast is always excluded on top of the reserved prefix.
        total.saturating_sub(self.mode.reserved_prefix() + 1)
    }

    /// Usable addresses in ascending order
    pub fn candidates(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u64::from(u32::from(self.net.network())) + self.mode.reserved_prefix();
        (first..first + self.capacity()).map(|n| Ipv4Addr::from(n as u32))
    }

    /// Whether `addr` is one of the usable addresses of this pool
    pub fn is_candidate(&self, addr: Ipv4Addr) -> bool {
        if !self.net.contains(&addr) {
            return false;
        }
        let offset = u64::from(u32::from(addr)) - u64::from(u32::from(self.net.network()));
        let reserved = self.mode.reserved_prefix();
        offset >= reserved && offset < reserved + self.capacity()
    }

    /// Return the lowest usable address that is not in `used`
    pub fn allocate(&self, used: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr, PoolError> {
        self.candidates()
            .find(|addr| !used.contains(addr))
            .ok_or_else(|| PoolError::PoolExhausted {
                cidr: self.net.to_string(),
            })
    }

    /// Check that a caller-chosen address is one of the usable addresses
    ///
    /// Whether it is free is left to the store, which rejects duplicates on insert.
    pub fn claim(&self, addr: Ipv4Addr) -> Result<Ipv4Addr, PoolError> {
        if !self.is_candidate(addr) {
            return Err(PoolError::OutOfPool {
                address: addr,
                cidr: self.net.to_string(),
            });
        }
        Ok(addr)
    }
}

impl fmt::Display for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net)
    }
}
