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
//! Address pools.
//!
//! A [Pool] knows which addresses it owns and which services are bound to
//! each of them. It answers whether a service may take a given address
//! ([Pool::available]) and finds the next address a service may take
//! ([Pool::next_available]), honouring the sharing rule in [sharing].

use std::net::IpAddr;

use ipnet::IpNet;

use crate::{
    allocator::AllocationError,
    pool::sharing::{Port, SharingKey},
    spec::{AddrRange, Aggregation, PoolSpec, PoolSpecError},
};

mod local;
pub mod sharing;
mod unit_set;

pub use local::LocalPool;

/// An address pool.
#[derive(Debug, Clone)]
pub enum Pool {
    /// A pool of locally configured CIDRs and start-end ranges.
    Local(LocalPool),
}

impl Pool {
    /// Builds a pool from its specification.
    pub fn from_spec(spec: &PoolSpec) -> Result<Self, PoolSpecError> {
        Ok(Pool::Local(LocalPool::new(spec)?))
    }

    /// The pool's name.
    pub fn name(&self) -> &str {
        match self {
            Pool::Local(pool) => pool.name(),
        }
    }

    /// The specification the pool was built from.
    pub fn spec(&self) -> &PoolSpec {
        match self {
            Pool::Local(pool) => pool.spec(),
        }
    }

    /// The subnet the pool's addresses belong to, if configured.
    pub fn subnet(&self) -> Option<IpNet> {
        match self {
            Pool::Local(pool) => pool.subnet(),
        }
    }

    /// The pool's aggregation.
    pub fn aggregation(&self) -> Aggregation {
        match self {
            Pool::Local(pool) => pool.aggregation(),
        }
    }

    /// The pool's ranges, lowest first.
    pub fn ranges(&self) -> Vec<AddrRange> {
        match self {
            Pool::Local(pool) => pool.ranges().collect(),
        }
    }

    /// Returns true if the address falls inside one of the pool's ranges.
    pub fn contains(&self, address: IpAddr) -> bool {
        match self {
            Pool::Local(pool) => pool.contains(address),
        }
    }

    /// Returns true if any range of this pool intersects any range of `other`.
    pub fn overlaps(&self, other: &Pool) -> bool {
        let theirs = other.ranges();
        self.ranges()
            .iter()
            .any(|mine| theirs.iter().any(|other| mine.overlaps(other)))
    }

    /// Total number of allocation units: addresses, or blocks if aggregation
    /// is configured.
    pub fn size(&self) -> u128 {
        match self {
            Pool::Local(pool) => pool.size(),
        }
    }

    /// Number of units with at least one bound service.
    pub fn in_use(&self) -> usize {
        match self {
            Pool::Local(pool) => pool.in_use(),
        }
    }

    /// Checks, without modifying the pool, whether `service` may expose
    /// `ports` on `address` with sharing key `key`.
    pub fn available(
        &self,
        address: IpAddr,
        ports: &[Port],
        service: &str,
        key: &SharingKey,
    ) -> Result<(), AllocationError> {
        match self {
            Pool::Local(pool) => pool.available(address, ports, service, key),
        }
    }

    /// Binds `service` to `address`. The caller must have checked
    /// [Pool::available]. Re-assigning a service to the same address replaces
    /// its previous binding there.
    pub fn assign(
        &mut self,
        address: IpAddr,
        ports: &[Port],
        service: &str,
        key: &SharingKey,
    ) -> Result<(), AllocationError> {
        match self {
            Pool::Local(pool) => pool.assign(address, ports, service, key),
        }
    }

    /// Binds `service` to the lowest address it may take and returns it.
    pub fn assign_next(
        &mut self,
        service: &str,
        ports: &[Port],
        key: &SharingKey,
    ) -> Result<IpAddr, AllocationError> {
        match self {
            Pool::Local(pool) => pool.assign_next(service, ports, key),
        }
    }

    /// Returns the lowest address `service` may take without binding it.
    pub fn next_available(
        &self,
        service: &str,
        ports: &[Port],
        key: &SharingKey,
    ) -> Result<IpAddr, AllocationError> {
        match self {
            Pool::Local(pool) => pool.next_available(service, ports, key),
        }
    }

    /// Unbinds `service` from `address`. Does nothing if it is not bound.
    pub fn release(&mut self, address: IpAddr, service: &str) {
        match self {
            Pool::Local(pool) => pool.release(address, service),
        }
    }

    /// The sharing key of the services bound to `address`, if any.
    pub fn sharing_key(&self, address: IpAddr) -> Option<SharingKey> {
        match self {
            Pool::Local(pool) => pool.sharing_key(address),
        }
    }
}
