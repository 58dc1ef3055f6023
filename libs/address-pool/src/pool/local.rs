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
//! A pool of locally configured address ranges.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};

use ipnet::IpNet;

use crate::{
    allocator::AllocationError,
    pool::{
        sharing::{self, ConflictError, Port, SharingKey},
        unit_set::UnitSet,
    },
    spec::{self, AddrRange, Aggregation, PoolSpec, PoolSpecError},
};

/// One service bound to an allocation unit.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    service: String,
    ports: BTreeSet<Port>,
    key: SharingKey,
}

/// A range together with its free units.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RangeUnits {
    range: AddrRange,
    /// Low address bits covered by one unit, 0 without aggregation.
    shift: u32,
    free: UnitSet,
}

impl RangeUnits {
    fn unit_of(&self, bits: u128) -> u128 {
        bits >> self.shift
    }

    fn base_of(&self, unit: u128) -> u128 {
        unit << self.shift
    }
}

/// A pool of CIDRs and start-end ranges.
///
/// Addresses are handed out first-fit: the lowest unit a request may take
/// wins, whether it is free or already shared under the same sharing key.
// Impl Note:
// `ranges` hold the free units, `usage` the bound ones. A unit is in exactly
// one of the two: it leaves its free set with the first binding and returns
// with the last release.
#[derive(Debug, Clone)]
pub struct LocalPool {
    spec: PoolSpec,
    subnet: Option<IpNet>,
    aggregation: Aggregation,
    /// Non overlapping ranges sorted by first address.
    ranges: Vec<RangeUnits>,
    /// Bindings keyed by the first address (as bits) of the unit they occupy.
    usage: BTreeMap<u128, Vec<Binding>>,
    size: u128,
}

impl LocalPool {
    /// Parses and validates `spec`.
    pub fn new(spec: &PoolSpec) -> Result<Self, PoolSpecError> {
        if spec.name.trim().is_empty() {
            return Err(PoolSpecError::EmptyName);
        }
        if spec.ranges.is_empty() {
            return Err(PoolSpecError::NoRanges);
        }
        let aggregation = Aggregation::parse(spec.aggregation.as_deref())?;

        let mut parsed = spec
            .ranges
            .iter()
            .map(|raw| Ok((raw.clone(), AddrRange::parse(raw)?)))
            .collect::<Result<Vec<_>, PoolSpecError>>()?;
        parsed.sort_by_key(|(_, range)| range.first_bits());
        // sorted, so any overlap shows up between neighbours
        for pair in parsed.windows(2) {
            if pair[0].1.overlaps(&pair[1].1) {
                return Err(PoolSpecError::OverlappingRanges(
                    pair[0].0.clone(),
                    pair[1].0.clone(),
                ));
            }
        }
        // one prefix length cannot describe blocks of both families
        if let Aggregation::PrefixLen(prefix_len) = aggregation {
            let mut families = parsed.iter().map(|(_, range)| range.first().is_ipv4());
            let first = families.next();
            if families.any(|is_ipv4| Some(is_ipv4) != first) {
                return Err(PoolSpecError::InvalidAggregation(format!("/{prefix_len}")));
            }
        }
        let subnet = spec::parse_subnet(spec.subnet.as_deref(), &parsed)?;

        let mut size = 0u128;
        let mut ranges = Vec::with_capacity(parsed.len());
        for (raw, range) in &parsed {
            let shift = aggregation.unit_shift(raw, range)?;
            let free = UnitSet::new(range.first_bits() >> shift, range.last_bits() >> shift);
            size = size
                .checked_add(free.capacity())
                .ok_or(PoolSpecError::CapacityTooLarge)?;
            ranges.push(RangeUnits {
                range: *range,
                shift,
                free,
            });
        }

        Ok(Self {
            spec: spec.clone(),
            subnet,
            aggregation,
            ranges,
            usage: BTreeMap::new(),
            size,
        })
    }

    /// The pool's name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The specification the pool was built from.
    pub fn spec(&self) -> &PoolSpec {
        &self.spec
    }

    /// The configured subnet.
    pub fn subnet(&self) -> Option<IpNet> {
        self.subnet
    }

    /// The configured aggregation.
    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    /// The ranges, lowest first.
    pub fn ranges(&self) -> impl Iterator<Item = AddrRange> + '_ {
        self.ranges.iter().map(|units| units.range)
    }

    /// Returns true if the address is in one of the ranges.
    pub fn contains(&self, address: IpAddr) -> bool {
        self.ranges.iter().any(|units| units.range.contains(address))
    }

    /// Number of allocation units.
    pub fn size(&self) -> u128 {
        self.size
    }

    /// Number of allocation units with at least one binding.
    pub fn in_use(&self) -> usize {
        self.usage.len()
    }

    /// Checks whether `service` may bind `ports` on `address`.
    pub fn available(
        &self,
        address: IpAddr,
        ports: &[Port],
        service: &str,
        key: &SharingKey,
    ) -> Result<(), AllocationError> {
        let (_, _, base) = self
            .locate(address)
            .ok_or(AllocationError::NoPoolForAddress(address))?;
        self.check(base, address, ports, service, key)?;
        Ok(())
    }

    /// Binds `service` to the unit holding `address`.
    pub fn assign(
        &mut self,
        address: IpAddr,
        ports: &[Port],
        service: &str,
        key: &SharingKey,
    ) -> Result<(), AllocationError> {
        let (i, unit, base) = self
            .locate(address)
            .ok_or(AllocationError::NoPoolForAddress(address))?;

        let bindings = self.usage.entry(base).or_default();
        if bindings.is_empty() {
            if let Err(e) = self.ranges[i].free.take(unit) {
                tracing::error!(
                    pool = %self.spec.name,
                    %address,
                    "Free units out of sync with usage - this should not happen: {e}"
                );
            }
        }
        bindings.retain(|binding| binding.service != service);
        bindings.push(Binding {
            service: service.to_string(),
            ports: ports.iter().copied().collect(),
            key: key.clone(),
        });
        Ok(())
    }

    /// Binds `service` to the lowest unit it may take.
    pub fn assign_next(
        &mut self,
        service: &str,
        ports: &[Port],
        key: &SharingKey,
    ) -> Result<IpAddr, AllocationError> {
        let address = self.next_available(service, ports, key)?;
        self.assign(address, ports, service, key)?;
        Ok(address)
    }

    /// Returns the lowest unit `service` may take, without binding it.
    pub fn next_available(
        &self,
        service: &str,
        ports: &[Port],
        key: &SharingKey,
    ) -> Result<IpAddr, AllocationError> {
        let free = self
            .ranges
            .iter()
            .find_map(|units| units.free.first().map(|unit| units.base_of(unit)));
        // A used unit can only win if it lies below the first free one.
        let shared = if key.is_shareable() {
            self.usage
                .keys()
                .copied()
                .take_while(|base| free.is_none_or(|free| *base < free))
                .find(|base| {
                    self.check(*base, spec::addr_from_bits(*base), ports, service, key)
                        .is_ok()
                })
        } else {
            None
        };

        let base = shared.or(free).ok_or_else(|| {
            AllocationError::Exhausted {
                pool: self.spec.name.clone(),
            }
        })?;
        Ok(spec::addr_from_bits(base))
    }

    /// Removes the binding of `service` from the unit holding `address`.
    pub fn release(&mut self, address: IpAddr, service: &str) {
        let Some((i, unit, base)) = self.locate(address) else {
            return;
        };
        let Some(bindings) = self.usage.get_mut(&base) else {
            return;
        };
        bindings.retain(|binding| binding.service != service);
        if bindings.is_empty() {
            self.usage.remove(&base);
            if let Err(e) = self.ranges[i].free.put(unit) {
                tracing::error!(
                    pool = %self.spec.name,
                    %address,
                    "Free units out of sync with usage - this should not happen: {e}"
                );
            }
        }
    }

    /// The sharing key of the unit holding `address`, none if it is free.
    pub fn sharing_key(&self, address: IpAddr) -> Option<SharingKey> {
        let (_, _, base) = self.locate(address)?;
        self.usage
            .get(&base)?
            .first()
            .map(|binding| binding.key.clone())
    }

    /// Returns the range index, unit and unit base of `address`.
    fn locate(&self, address: IpAddr) -> Option<(usize, u128, u128)> {
        let i = self
            .ranges
            .iter()
            .position(|units| units.range.contains(address))?;
        let units = &self.ranges[i];
        let unit = units.unit_of(spec::addr_bits(address));
        Some((i, unit, units.base_of(unit)))
    }

    /// Applies the sharing rule against every other service bound to `base`.
    fn check(
        &self,
        base: u128,
        address: IpAddr,
        ports: &[Port],
        service: &str,
        key: &SharingKey,
    ) -> Result<(), ConflictError> {
        let Some(bindings) = self.usage.get(&base) else {
            return Ok(());
        };
        let others = || {
            bindings
                .iter()
                .filter(move |binding| binding.service != service)
        };

        for binding in others() {
            sharing::check_keys(address, &binding.service, &binding.key, key)?;
        }
        for binding in others() {
            if let Some(port) = ports.iter().find(|port| binding.ports.contains(port)) {
                return Err(ConflictError::PortCollision {
                    address,
                    port: *port,
                    service: binding.service.clone(),
                });
            }
        }
        Ok(())
    }
}
