// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Address pool specifications and their parsing.

use std::{
    fmt,
    net::{IpAddr, Ipv6Addr},
    str::FromStr,
};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// The specification of one address pool, as supplied by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PoolSpec {
    /// Unique name of the pool.
    pub name: String,
    /// Address ranges of the pool. Each entry is either a CIDR
    /// (`10.0.0.0/24`) or an inclusive range (`10.0.0.10-10.0.0.20`).
    pub ranges: Vec<String>,
    /// Optional subnet containing all ranges, handed out together with the
    /// allocated address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    /// Optional aggregation, `default` or a prefix length such as `/31`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<String>,
}

impl PoolSpec {
    /// Creates a pool spec without subnet and aggregation.
    pub fn new<S: Into<String>>(name: S, ranges: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            ranges: ranges.into_iter().map(Into::into).collect(),
            subnet: None,
            aggregation: None,
        }
    }

    /// Sets the subnet.
    pub fn with_subnet(mut self, subnet: impl Into<String>) -> Self {
        self.subnet = Some(subnet.into());
        self
    }

    /// Sets the aggregation.
    pub fn with_aggregation(mut self, aggregation: impl Into<String>) -> Self {
        self.aggregation = Some(aggregation.into());
        self
    }
}

/// A set of pool specifications, the format of pool configuration files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PoolConfig {
    /// The pools, in definition order.
    pub pools: Vec<PoolSpec>,
}

/// Errors in a single pool specification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolSpecError {
    /// The pool has no name.
    #[error("pool name must not be empty")]
    EmptyName,
    /// The pool has no ranges.
    #[error("pool has no address ranges")]
    NoRanges,
    /// A range is neither a CIDR nor a start-end range.
    #[error("invalid address range {0:?}")]
    InvalidRange(String),
    /// The ends of a start-end range are of different families.
    #[error("range {0:?} mixes IPv4 and IPv6 addresses")]
    MixedFamilies(String),
    /// The start of a start-end range is above its end.
    #[error("range {0:?} ends before it starts")]
    ReversedRange(String),
    /// The range reaches into the IPv4-mapped IPv6 space.
    #[error("range {0:?} is IPv4-mapped IPv6, use the IPv4 form")]
    Ipv4Mapped(String),
    /// The range covers the entire IPv6 address space.
    #[error("range {0:?} is too large")]
    RangeTooLarge(String),
    /// Two ranges of the pool overlap.
    #[error("range {0:?} overlaps with range {1:?}")]
    OverlappingRanges(String, String),
    /// The subnet is not a valid CIDR.
    #[error("invalid subnet {0:?}")]
    InvalidSubnet(String),
    /// A range is not contained in the subnet.
    #[error("range {range:?} is not inside subnet {subnet}")]
    RangeOutsideSubnet {
        /// The offending range.
        range: String,
        /// The subnet.
        subnet: IpNet,
    },
    /// The aggregation is not a valid prefix length.
    #[error("invalid aggregation {0:?}")]
    InvalidAggregation(String),
    /// The aggregation does not evenly divide a range.
    #[error("aggregation /{prefix_len} does not evenly divide range {range:?}")]
    MisalignedAggregation {
        /// The offending range.
        range: String,
        /// The aggregation prefix length.
        prefix_len: u8,
    },
    /// The pool holds more than 2^128 units.
    #[error("pools containing more than 2^128 addresses are not supported")]
    CapacityTooLarge,
}

// ::ffff:0.0.0.0 - ::ffff:255.255.255.255, where IPv4 ranges live in bit space.
const IPV4_MAPPED_FIRST: u128 = 0xffff_0000_0000;
const IPV4_MAPPED_LAST: u128 = 0xffff_ffff_ffff;

/// An inclusive range of addresses of one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRange {
    first: IpAddr,
    last: IpAddr,
}

impl AddrRange {
    /// Parses a CIDR or a `start-end` range.
    pub fn parse(raw: &str) -> Result<Self, PoolSpecError> {
        let raw = raw.trim();
        let range = match raw.split_once('-') {
            Some((first, last)) => {
                let first: IpAddr = first
                    .trim()
                    .parse()
                    .map_err(|_| PoolSpecError::InvalidRange(raw.to_string()))?;
                let last: IpAddr = last
                    .trim()
                    .parse()
                    .map_err(|_| PoolSpecError::InvalidRange(raw.to_string()))?;
                if first.is_ipv4() != last.is_ipv4() {
                    return Err(PoolSpecError::MixedFamilies(raw.to_string()));
                }
                if first > last {
                    return Err(PoolSpecError::ReversedRange(raw.to_string()));
                }
                Self { first, last }
            }
            None => {
                let net: IpNet = raw
                    .parse()
                    .map_err(|_| PoolSpecError::InvalidRange(raw.to_string()))?;
                Self {
                    first: net.network(),
                    last: net.broadcast(),
                }
            }
        };

        if range.first.is_ipv6() {
            if range.first_bits() == 0 && range.last_bits() == u128::MAX {
                return Err(PoolSpecError::RangeTooLarge(raw.to_string()));
            }
            if range.first_bits() <= IPV4_MAPPED_LAST && IPV4_MAPPED_FIRST <= range.last_bits() {
                return Err(PoolSpecError::Ipv4Mapped(raw.to_string()));
            }
        }
        Ok(range)
    }

    /// The first address of the range.
    pub fn first(&self) -> IpAddr {
        self.first
    }

    /// The last address of the range.
    pub fn last(&self) -> IpAddr {
        self.last
    }

    /// Number of addresses in the range.
    pub fn len(&self) -> u128 {
        self.last_bits() - self.first_bits() + 1
    }

    /// Always false, a range holds at least one address.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns true if the address lies inside the range.
    pub fn contains(&self, address: IpAddr) -> bool {
        address.is_ipv4() == self.first.is_ipv4()
            && (self.first_bits()..=self.last_bits()).contains(&addr_bits(address))
    }

    /// Returns true if the two ranges share at least one address.
    pub fn overlaps(&self, other: &AddrRange) -> bool {
        self.first_bits() <= other.last_bits() && other.first_bits() <= self.last_bits()
    }

    pub(crate) fn first_bits(&self) -> u128 {
        addr_bits(self.first)
    }

    pub(crate) fn last_bits(&self) -> u128 {
        addr_bits(self.last)
    }

    pub(crate) fn max_prefix_len(&self) -> u8 {
        match self.first {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

impl FromStr for AddrRange {
    type Err = PoolSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// How a pool groups its addresses into allocation units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Aggregation {
    /// Every address is its own unit.
    #[default]
    Default,
    /// Units are blocks of the given prefix length.
    PrefixLen(u8),
}

impl Aggregation {
    /// Parses `default`, `/N` or `N`. A missing value means [Aggregation::Default].
    pub fn parse(raw: Option<&str>) -> Result<Self, PoolSpecError> {
        let Some(raw) = raw.map(str::trim) else {
            return Ok(Aggregation::Default);
        };
        if raw.is_empty() || raw.eq_ignore_ascii_case("default") {
            return Ok(Aggregation::Default);
        }
        let prefix_len = raw
            .strip_prefix('/')
            .unwrap_or(raw)
            .parse::<u8>()
            .map_err(|_| PoolSpecError::InvalidAggregation(raw.to_string()))?;
        if prefix_len > 128 {
            return Err(PoolSpecError::InvalidAggregation(raw.to_string()));
        }
        Ok(Aggregation::PrefixLen(prefix_len))
    }

    /// Number of low address bits covered by one unit of `range`.
    ///
    /// Fails if the aggregation is wider than the range's family or does not
    /// evenly divide the range.
    pub(crate) fn unit_shift(&self, raw: &str, range: &AddrRange) -> Result<u32, PoolSpecError> {
        let Aggregation::PrefixLen(prefix_len) = *self else {
            return Ok(0);
        };
        let max = range.max_prefix_len();
        if prefix_len > max || prefix_len == 0 && max == 128 {
            return Err(PoolSpecError::InvalidAggregation(format!("/{prefix_len}")));
        }
        let shift = u32::from(max - prefix_len);
        let mask = (1u128 << shift) - 1;
        if range.first_bits() & mask != 0 || range.last_bits() & mask != mask {
            return Err(PoolSpecError::MisalignedAggregation {
                range: raw.to_string(),
                prefix_len,
            });
        }
        Ok(shift)
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Default => write!(f, "default"),
            Aggregation::PrefixLen(len) => write!(f, "/{len}"),
        }
    }
}

/// Parses the optional subnet of a pool and checks that it contains all ranges.
pub(crate) fn parse_subnet(
    raw: Option<&str>,
    ranges: &[(String, AddrRange)],
) -> Result<Option<IpNet>, PoolSpecError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let subnet: IpNet = raw
        .trim()
        .parse()
        .map_err(|_| PoolSpecError::InvalidSubnet(raw.to_string()))?;
    let subnet = subnet.trunc();
    for (raw_range, range) in ranges {
        if !subnet.contains(&range.first()) || !subnet.contains(&range.last()) {
            return Err(PoolSpecError::RangeOutsideSubnet {
                range: raw_range.clone(),
                subnet,
            });
        }
    }
    Ok(Some(subnet))
}

/// Maps an address into one 128 bit space. IPv4 addresses are IPv4-mapped,
/// which is why IPv4-mapped IPv6 ranges are rejected.
pub(crate) fn addr_bits(address: IpAddr) -> u128 {
    match address {
        IpAddr::V4(addr) => addr.to_ipv6_mapped().to_bits(),
        IpAddr::V6(addr) => addr.to_bits(),
    }
}

/// Inverse of [addr_bits].
pub(crate) fn addr_from_bits(bits: u128) -> IpAddr {
    let addr = Ipv6Addr::from_bits(bits);
    match addr.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(addr),
    }
}
