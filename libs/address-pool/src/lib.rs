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
//! # Address Pool
//!
//! Hand out IP addresses from named pools to load-balancer services.
//!
//! A pool is described by a [spec::PoolSpec]: a set of CIDRs or `start-end`
//! ranges, an optional subnet and an optional aggregation. The
//! [allocator::Allocator] keeps the pools and the address of every service.
//! Services may share an address if they present the same non-empty
//! [pool::sharing::SharingKey] and expose disjoint ports.
//!
//! The allocator keeps no durable state. Allocations are restored with
//! [allocator::Allocator::replay] from [allocator::dto::AllocationRecord]s.
//! Use [allocator::shared::SharedAllocator] to use one allocator from several
//! threads.

pub mod allocator;
pub mod metrics;
pub mod pool;
pub mod spec;

pub use allocator::{
    AllocationError, Allocator, ConfigError, DEFAULT_POOL, dto::AllocationRecord,
    shared::SharedAllocator,
};
pub use pool::sharing::{Port, Protocol, SharingKey};
pub use spec::{PoolConfig, PoolSpec};
