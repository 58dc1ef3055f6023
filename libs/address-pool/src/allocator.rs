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
//! Service address allocator.
//!
//! The [Allocator] owns the configured pools and one [Allocation] per
//! service. All mutations keep the two in sync and republish the pool
//! gauges. The allocator holds no durable state, the owner of the service
//! records rebuilds it with [Allocator::replay] at startup.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};

use ipnet::IpNet;
use thiserror::Error;

use crate::{
    metrics::{PoolMetrics, PoolStats},
    pool::{
        Pool,
        sharing::{ConflictError, ConflictKind, Port, SharingKey},
    },
    spec::{PoolSpec, PoolSpecError},
};

pub mod dto;
pub mod shared;

use dto::AllocationRecord;

/// Name of the pool used by [Allocator::allocate_default].
pub const DEFAULT_POOL: &str = "default";

/// Pool configuration errors. A failed reload leaves the allocator untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A pool specification could not be parsed.
    #[error("parsing address pool #{index} ({name:?}): {source}")]
    InvalidPool {
        /// 1-based position of the spec in the list.
        index: usize,
        /// Name of the pool.
        name: String,
        /// The parse error.
        #[source]
        source: PoolSpecError,
    },
    /// Two pools share a name.
    #[error("duplicate definition of pool {0:?}")]
    DuplicatePool(String),
    /// Two pools share addresses.
    #[error("pool {pool:?} overlaps with already defined pool {existing:?}")]
    PoolOverlap {
        /// The pool being added.
        pool: String,
        /// The previously defined pool.
        existing: String,
    },
}

/// Coarse classification of an [AllocationError].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationErrorKind {
    /// The address is taken under incompatible terms.
    Conflict(ConflictKind),
    /// The pool has no address left for the request.
    Exhausted,
    /// The named pool does not exist.
    UnknownPool,
    /// No pool contains the requested address.
    NoPoolForAddress,
}

/// Address allocation errors. A failed allocation leaves the allocator
/// untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// The requested address is in use under incompatible terms.
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    /// No address of the pool can take the request.
    #[error("no addresses available in pool {pool:?}")]
    Exhausted {
        /// The exhausted pool.
        pool: String,
    },
    /// The requested pool does not exist.
    #[error("unknown pool {0:?}")]
    UnknownPool(String),
    /// No pool contains the requested address.
    #[error("{0} is not allowed in config")]
    NoPoolForAddress(IpAddr),
}

impl AllocationError {
    /// Returns the kind of error, for mapping onto API status codes.
    pub fn kind(&self) -> AllocationErrorKind {
        match self {
            AllocationError::Conflict(e) => AllocationErrorKind::Conflict(e.kind()),
            AllocationError::Exhausted { .. } => AllocationErrorKind::Exhausted,
            AllocationError::UnknownPool(_) => AllocationErrorKind::UnknownPool,
            AllocationError::NoPoolForAddress(_) => AllocationErrorKind::NoPoolForAddress,
        }
    }
}

/// The address bound to one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// The pool the address was allocated from.
    pub pool: String,
    /// The allocated address.
    pub address: IpAddr,
    /// The ports the service exposes on the address.
    pub ports: BTreeSet<Port>,
    /// The service's sharing key.
    pub sharing_key: SharingKey,
}

/// Outcome of a warm start.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    /// Number of allocations restored.
    pub restored: usize,
    /// Records that could not be restored, with the reason.
    pub failed: Vec<(AllocationRecord, AllocationError)>,
}

/// Tracks IP address pools and allocates addresses from them.
#[derive(Debug, Default)]
pub struct Allocator {
    pools: BTreeMap<String, Pool>,
    /// Map between service and allocation.
    allocated: BTreeMap<String, Allocation>,
    metrics: Option<PoolMetrics>,
}

impl Allocator {
    /// Returns an allocator managing no pools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an allocator managing no pools that publishes pool gauges.
    pub fn with_metrics(metrics: PoolMetrics) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::default()
        }
    }

    /// Replaces the set of pools.
    ///
    /// The specs are parsed and validated in order; any invalid spec, duplicate
    /// name or overlap between two pools rejects the whole list and leaves the
    /// current pools in place. Gauges of pools that disappear are removed.
    ///
    /// Existing allocations are carried over into the new pool of the same
    /// name when it still contains their address. The others stay tracked so
    /// they can be released, but no longer count towards any pool.
    pub fn reload(&mut self, specs: &[PoolSpec]) -> Result<(), ConfigError> {
        let mut pools = parse_config(specs)?;

        for (service, alloc) in &self.allocated {
            let Some(pool) = pools.get_mut(&alloc.pool) else {
                continue;
            };
            let ports: Vec<Port> = alloc.ports.iter().copied().collect();
            let reseated = pool
                .available(alloc.address, &ports, service, &alloc.sharing_key)
                .and_then(|()| pool.assign(alloc.address, &ports, service, &alloc.sharing_key));
            if let Err(e) = reseated {
                tracing::warn!(
                    %service,
                    pool = %alloc.pool,
                    address = %alloc.address,
                    error = %e,
                    "Allocation no longer fits its pool, leaving it untracked"
                );
            }
        }

        if let Some(metrics) = &self.metrics {
            for name in self.pools.keys().filter(|name| !pools.contains_key(*name)) {
                metrics.remove(name);
            }
        }
        self.pools = pools;
        for name in self.pools.keys() {
            self.publish(name);
        }

        tracing::info!(
            pools = ?self.pools.keys().collect::<Vec<_>>(),
            allocations = self.allocated.len(),
            "Address pools reloaded"
        );
        Ok(())
    }

    /// Adds a pool, or replaces the pool of the same name.
    ///
    /// Validated like [Allocator::reload] against all other pools.
    pub fn add_pool(&mut self, spec: PoolSpec) -> Result<(), ConfigError> {
        let mut specs = self.pool_specs();
        match specs.iter_mut().find(|existing| existing.name == spec.name) {
            Some(existing) => *existing = spec,
            None => specs.push(spec),
        }
        self.reload(&specs)
    }

    /// Removes a pool. Returns false if there was no such pool.
    pub fn remove_pool(&mut self, name: &str) -> bool {
        if !self.pools.contains_key(name) {
            return false;
        }
        let specs: Vec<PoolSpec> = self
            .pool_specs()
            .into_iter()
            .filter(|spec| spec.name != name)
            .collect();
        // the remaining pools were valid together before
        self.reload(&specs).is_ok()
    }

    /// Assigns `address` to `service` if the assignment is permissible by
    /// `sharing_key`. Replaces any previous allocation of `service`.
    ///
    /// Returns the name of the pool containing the address.
    pub fn assign_specific(
        &mut self,
        service: &str,
        address: IpAddr,
        ports: &[Port],
        sharing_key: impl Into<SharingKey>,
    ) -> Result<String, AllocationError> {
        let sharing_key = sharing_key.into();
        let pool = self
            .pool_for(address)
            .ok_or(AllocationError::NoPoolForAddress(address))?;

        // Does the address already have allocations? If so, they need the
        // same sharing key and non-overlapping ports.
        pool.available(address, ports, service, &sharing_key)?;

        let pool_name = pool.name().to_string();
        self.bind(
            service,
            Allocation {
                pool: pool_name.clone(),
                address,
                ports: ports.iter().copied().collect(),
                sharing_key,
            },
        );
        Ok(pool_name)
    }

    /// Allocates the lowest available address of `pool_name` to `service`.
    ///
    /// If `service` already has an allocation its address is returned
    /// unchanged.
    pub fn allocate_from_pool(
        &mut self,
        service: &str,
        pool_name: &str,
        ports: &[Port],
        sharing_key: impl Into<SharingKey>,
    ) -> Result<IpAddr, AllocationError> {
        if let Some(alloc) = self.allocated.get(service) {
            return Ok(alloc.address);
        }

        let sharing_key = sharing_key.into();
        let pool = self
            .pools
            .get(pool_name)
            .ok_or_else(|| AllocationError::UnknownPool(pool_name.to_string()))?;
        let address = pool.next_available(service, ports, &sharing_key)?;

        self.bind(
            service,
            Allocation {
                pool: pool_name.to_string(),
                address,
                ports: ports.iter().copied().collect(),
                sharing_key,
            },
        );
        Ok(address)
    }

    /// Allocates an address of the [DEFAULT_POOL] to `service`.
    pub fn allocate_default(
        &mut self,
        service: &str,
        ports: &[Port],
        sharing_key: impl Into<SharingKey>,
    ) -> Result<IpAddr, AllocationError> {
        self.allocate_from_pool(service, DEFAULT_POOL, ports, sharing_key)
    }

    /// Frees the address of `service`, if any.
    ///
    /// Returns `true` if an allocation existed and was removed, otherwise `false`.
    pub fn release(&mut self, service: &str) -> bool {
        let Some(alloc) = self.allocated.remove(service) else {
            return false;
        };

        // There might not be a pool anymore, e.g. after a reload that removed
        // it.
        if let Some(pool) = self.pools.get_mut(&alloc.pool) {
            pool.release(alloc.address, service);
            self.publish(&alloc.pool);
        }
        tracing::debug!(%service, pool = %alloc.pool, address = %alloc.address, "Released address");
        true
    }

    /// Restores previously persisted allocations.
    ///
    /// Every record is assigned with [Allocator::assign_specific]. Failing
    /// records are logged and reported, they never abort the replay.
    pub fn replay(&mut self, records: impl IntoIterator<Item = AllocationRecord>) -> ReplayReport {
        let mut report = ReplayReport::default();
        for record in records {
            match self.assign_specific(
                &record.service,
                record.address,
                &record.ports,
                record.sharing_key.clone(),
            ) {
                Ok(pool) => {
                    if !record.pool.is_empty() && record.pool != pool {
                        tracing::info!(
                            service = %record.service,
                            address = %record.address,
                            from = %record.pool,
                            to = %pool,
                            "Previously allocated address moved to another pool"
                        );
                    }
                    report.restored += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        service = %record.service,
                        address = %record.address,
                        error = %e,
                        "Error restoring allocation"
                    );
                    report.failed.push((record, e));
                }
            }
        }
        report
    }

    /// Returns the address allocated to `service`.
    pub fn address_of(&self, service: &str) -> Option<IpAddr> {
        self.allocated.get(service).map(|alloc| alloc.address)
    }

    /// Returns the pool `service`'s address was allocated from.
    pub fn pool_of(&self, service: &str) -> Option<&str> {
        self.allocated.get(service).map(|alloc| alloc.pool.as_str())
    }

    /// Returns the subnet configured for the pool of `service`'s address.
    pub fn subnet_of(&self, service: &str) -> Option<IpNet> {
        let alloc = self.allocated.get(service)?;
        self.pools.get(&alloc.pool)?.subnet()
    }

    /// Returns the allocation of `service`.
    pub fn allocation(&self, service: &str) -> Option<&Allocation> {
        self.allocated.get(service)
    }

    /// Returns all allocations, ordered by service.
    pub fn allocations(&self) -> Vec<AllocationRecord> {
        self.allocated
            .iter()
            .map(|(service, alloc)| AllocationRecord::new(service, alloc))
            .collect()
    }

    /// Returns the pool named `name`.
    pub fn pool(&self, name: &str) -> Option<&Pool> {
        self.pools.get(name)
    }

    /// Returns the names of all pools, in order.
    pub fn pool_names(&self) -> Vec<String> {
        self.pools.keys().cloned().collect()
    }

    /// Returns the specs of all pools, ordered by name.
    pub fn pool_specs(&self) -> Vec<PoolSpec> {
        self.pools.values().map(|pool| pool.spec().clone()).collect()
    }

    /// Returns capacity and usage of every pool, ordered by name.
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.values().map(stats_of).collect()
    }

    /// Unconditionally records `alloc` for `service`, releasing its previous
    /// allocation first. The caller must have checked that the binding is
    /// permitted.
    fn bind(&mut self, service: &str, alloc: Allocation) {
        self.release(service);

        let Some(pool) = self.pools.get_mut(&alloc.pool) else {
            tracing::error!(%service, pool = %alloc.pool, "Binding to unknown pool - this should not happen");
            return;
        };
        let ports: Vec<Port> = alloc.ports.iter().copied().collect();
        if let Err(e) = pool.assign(alloc.address, &ports, service, &alloc.sharing_key) {
            tracing::error!(%service, pool = %alloc.pool, "Pool rejected checked binding - this should not happen: {e}");
            return;
        }
        self.publish(&alloc.pool);

        tracing::debug!(
            %service,
            pool = %alloc.pool,
            address = %alloc.address,
            sharing_key = %alloc.sharing_key,
            "Assigned address"
        );
        self.allocated.insert(service.to_string(), alloc);
    }

    /// Returns the pool that owns `address`.
    fn pool_for(&self, address: IpAddr) -> Option<&Pool> {
        self.pools.values().find(|pool| pool.contains(address))
    }

    fn publish(&self, pool: &str) {
        if let (Some(metrics), Some(pool)) = (&self.metrics, self.pools.get(pool)) {
            metrics.publish(&stats_of(pool));
        }
    }
}

fn stats_of(pool: &Pool) -> PoolStats {
    PoolStats {
        name: pool.name().to_string(),
        capacity: pool.size(),
        in_use: pool.in_use(),
    }
}

/// Parses all specs into pools, rejecting duplicates and overlaps.
fn parse_config(specs: &[PoolSpec]) -> Result<BTreeMap<String, Pool>, ConfigError> {
    // definition order, so overlaps are reported against the earlier pool
    let mut pools: Vec<Pool> = Vec::with_capacity(specs.len());

    for (i, spec) in specs.iter().enumerate() {
        let pool = Pool::from_spec(spec).map_err(|source| {
            ConfigError::InvalidPool {
                index: i + 1,
                name: spec.name.clone(),
                source,
            }
        })?;

        // Check that the pool isn't already defined
        if pools.iter().any(|existing| existing.name() == pool.name()) {
            return Err(ConfigError::DuplicatePool(spec.name.clone()));
        }

        // Check that this pool doesn't overlap with any of the previous ones
        if let Some(existing) = pools.iter().find(|existing| pool.overlaps(existing)) {
            return Err(ConfigError::PoolOverlap {
                pool: spec.name.clone(),
                existing: existing.name().to_string(),
            });
        }

        pools.push(pool);
    }

    Ok(pools
        .into_iter()
        .map(|pool| (pool.name().to_string(), pool))
        .collect())
}
