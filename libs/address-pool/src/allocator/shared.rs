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
//! Thread-safe handle to an [Allocator].

use std::{
    net::IpAddr,
    sync::{Arc, RwLock, RwLockReadGuard},
};

use ipnet::IpNet;

use super::{AllocationError, Allocator, ConfigError, ReplayReport, dto::AllocationRecord};
use crate::{
    allocator::Allocation,
    metrics::PoolStats,
    pool::sharing::{Port, SharingKey},
    spec::PoolSpec,
};

/// An [Allocator] shared between threads. Every method runs as a single
/// critical section, so concurrent callers observe the operations in some
/// serial order.
#[derive(Debug, Clone, Default)]
pub struct SharedAllocator {
    allocator: Arc<RwLock<Allocator>>,
}

impl SharedAllocator {
    /// Wraps `allocator`.
    pub fn new(allocator: Allocator) -> Self {
        Self {
            allocator: Arc::new(RwLock::new(allocator)),
        }
    }

    /// Read access to the allocator, for multiple lookups under one lock.
    pub fn allocator(&self) -> RwLockReadGuard<'_, Allocator> {
        self.allocator.read().unwrap()
    }

    /// See [Allocator::reload].
    pub fn reload(&self, specs: &[PoolSpec]) -> Result<(), ConfigError> {
        self.allocator.write().unwrap().reload(specs)
    }

    /// See [Allocator::add_pool].
    pub fn add_pool(&self, spec: PoolSpec) -> Result<(), ConfigError> {
        self.allocator.write().unwrap().add_pool(spec)
    }

    /// See [Allocator::remove_pool].
    pub fn remove_pool(&self, name: &str) -> bool {
        self.allocator.write().unwrap().remove_pool(name)
    }

    /// See [Allocator::assign_specific].
    pub fn assign_specific(
        &self,
        service: &str,
        address: IpAddr,
        ports: &[Port],
        sharing_key: impl Into<SharingKey>,
    ) -> Result<String, AllocationError> {
        self.allocator
            .write()
            .unwrap()
            .assign_specific(service, address, ports, sharing_key)
    }

    /// See [Allocator::allocate_from_pool].
    pub fn allocate_from_pool(
        &self,
        service: &str,
        pool_name: &str,
        ports: &[Port],
        sharing_key: impl Into<SharingKey>,
    ) -> Result<IpAddr, AllocationError> {
        self.allocator
            .write()
            .unwrap()
            .allocate_from_pool(service, pool_name, ports, sharing_key)
    }

    /// See [Allocator::allocate_default].
    pub fn allocate_default(
        &self,
        service: &str,
        ports: &[Port],
        sharing_key: impl Into<SharingKey>,
    ) -> Result<IpAddr, AllocationError> {
        self.allocator
            .write()
            .unwrap()
            .allocate_default(service, ports, sharing_key)
    }

    /// See [Allocator::release].
    pub fn release(&self, service: &str) -> bool {
        self.allocator.write().unwrap().release(service)
    }

    /// See [Allocator::replay].
    pub fn replay(&self, records: impl IntoIterator<Item = AllocationRecord>) -> ReplayReport {
        self.allocator.write().unwrap().replay(records)
    }

    /// See [Allocator::address_of].
    pub fn address_of(&self, service: &str) -> Option<IpAddr> {
        self.allocator.read().unwrap().address_of(service)
    }

    /// See [Allocator::pool_of].
    pub fn pool_of(&self, service: &str) -> Option<String> {
        self.allocator
            .read()
            .unwrap()
            .pool_of(service)
            .map(str::to_string)
    }

    /// See [Allocator::subnet_of].
    pub fn subnet_of(&self, service: &str) -> Option<IpNet> {
        self.allocator.read().unwrap().subnet_of(service)
    }

    /// See [Allocator::allocation].
    pub fn allocation(&self, service: &str) -> Option<Allocation> {
        self.allocator.read().unwrap().allocation(service).cloned()
    }

    /// See [Allocator::allocations].
    pub fn allocations(&self) -> Vec<AllocationRecord> {
        self.allocator.read().unwrap().allocations()
    }

    /// See [Allocator::pool_stats].
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.allocator.read().unwrap().pool_stats()
    }

    /// Returns the wrapped allocator if this is the last handle.
    pub fn into_inner(self) -> Option<Allocator> {
        Arc::into_inner(self.allocator).map(|lock| lock.into_inner().unwrap())
    }
}

impl From<Allocator> for SharedAllocator {
    fn from(allocator: Allocator) -> Self {
        Self::new(allocator)
    }
}
