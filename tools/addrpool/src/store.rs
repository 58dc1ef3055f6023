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
//! Loading and storing the pool configuration and allocation records.

use std::{fs, io::ErrorKind, path::Path};

use anyhow::Context;
use lb_address_pool::{AllocationRecord, Allocator, PoolConfig, allocator::ReplayReport};

/// Reads a pool configuration file.
pub fn load_config(path: &Path) -> anyhow::Result<PoolConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("error reading pool config {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("error parsing pool config {}", path.display()))
}

/// Reads an allocations file. A missing file holds no allocations.
pub fn load_allocations(path: &Path) -> anyhow::Result<Vec<AllocationRecord>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("error reading allocations {}", path.display()));
        }
    };
    serde_json::from_str(&content)
        .with_context(|| format!("error parsing allocations {}", path.display()))
}

/// Returns the records a warm start could not restore, except the one of
/// `service`.
pub fn unrestored(report: ReplayReport, service: &str) -> Vec<AllocationRecord> {
    report
        .failed
        .into_iter()
        .map(|(record, _)| record)
        .filter(|record| record.service != service)
        .collect()
}

/// Writes the allocations of `allocator` together with `unrestored` records,
/// replacing the file atomically.
///
/// Unrestored records are kept so they can be restored once the pool
/// configuration admits them again. A record is dropped if its service holds
/// a live allocation.
pub fn store_allocations(
    path: &Path,
    allocator: &Allocator,
    unrestored: &[AllocationRecord],
) -> anyhow::Result<()> {
    let mut records = allocator.allocations();
    records.extend(
        unrestored
            .iter()
            .filter(|record| allocator.allocation(&record.service).is_none())
            .cloned(),
    );
    records.sort_by(|a, b| a.service.cmp(&b.service));

    let content = serde_json::to_string_pretty(&records)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)
        .with_context(|| format!("error writing allocations {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("error replacing allocations {}", path.display()))
}

/// Builds an allocator from the configuration and warm-starts it with the
/// stored allocations.
pub fn warm_start(
    mut allocator: Allocator,
    config: &Path,
    allocations: &Path,
) -> anyhow::Result<(Allocator, ReplayReport)> {
    let config = load_config(config)?;
    allocator
        .reload(&config.pools)
        .context("invalid pool config")?;
    let report = allocator.replay(load_allocations(allocations)?);
    Ok((allocator, report))
}
