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
//! addrpool command line tool.

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use lb_address_pool::{
    Allocator, DEFAULT_POOL, allocator::ReplayReport, metrics::PoolMetrics,
};
use lb_observability::{metrics::registry::MetricsRegistry, setup_tracing};

mod cli;
mod store;

use cli::{Commands, Opts, StateFiles};

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    let _guards = setup_tracing(opts.logging.log_dir.as_deref(), opts.logging.stderr)
        .context("error setting up logging")?;

    match opts.command {
        Commands::Check { config } => run_check(&config),
        Commands::Replay { files } => run_replay(&files),
        Commands::Allocate {
            files,
            service,
            pool,
            address,
            ports,
            sharing_key,
        } => {
            let (mut allocator, report) =
                store::warm_start(Allocator::new(), &files.config, &files.allocations)?;
            let unrestored = store::unrestored(report, &service);
            let address = match address {
                Some(address) => {
                    allocator
                        .assign_specific(&service, address, &ports, sharing_key)
                        .with_context(|| format!("error assigning {address} to {service}"))?;
                    address
                }
                None => {
                    let pool = pool.as_deref().unwrap_or(DEFAULT_POOL);
                    allocator
                        .allocate_from_pool(&service, pool, &ports, sharing_key)
                        .with_context(|| format!("error allocating from pool {pool:?}"))?
                }
            };
            store::store_allocations(&files.allocations, &allocator, &unrestored)?;
            println!("{address}");
            Ok(())
        }
        Commands::Release { files, service } => {
            let (mut allocator, report) =
                store::warm_start(Allocator::new(), &files.config, &files.allocations)?;
            let unrestored = store::unrestored(report, &service);
            if !allocator.release(&service) {
                tracing::info!(%service, "No allocation to release");
            }
            store::store_allocations(&files.allocations, &allocator, &unrestored)
        }
        Commands::Metrics { files } => {
            let registry = MetricsRegistry::new_global();
            let allocator = Allocator::with_metrics(PoolMetrics::new(&registry));
            store::warm_start(allocator, &files.config, &files.allocations)?;
            print!("{}", registry.encode_text());
            Ok(())
        }
    }
}

fn run_check(config: &Path) -> anyhow::Result<()> {
    let config = store::load_config(config)?;
    let mut allocator = Allocator::new();
    allocator
        .reload(&config.pools)
        .context("invalid pool config")?;

    println!("{:<20} {:>40}", "POOL", "CAPACITY");
    for stats in allocator.pool_stats() {
        println!("{:<20} {:>40}", stats.name, stats.capacity);
    }
    Ok(())
}

fn run_replay(files: &StateFiles) -> anyhow::Result<()> {
    let (allocator, report) =
        store::warm_start(Allocator::new(), &files.config, &files.allocations)?;
    let ReplayReport { restored, failed } = report;

    println!("restored {restored} allocations");
    for (record, e) in &failed {
        println!("failed {} ({}): {e}", record.service, record.address);
    }
    println!("{:<20} {:>40} {:>10}", "POOL", "CAPACITY", "IN USE");
    for stats in allocator.pool_stats() {
        println!(
            "{:<20} {:>40} {:>10}",
            stats.name, stats.capacity, stats.in_use
        );
    }
    Ok(())
}
