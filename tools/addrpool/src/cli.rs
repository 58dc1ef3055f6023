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
//! addrpool CLI options.

use std::{net::IpAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use lb_address_pool::Port;

/// Validate address pools and manage file-backed service allocations.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Opts {
    /// Top-level subcommand
    #[command(subcommand)]
    pub command: Commands,

    /// Logging options
    #[command(flatten)]
    pub logging: LoggingOptions,
}

/// Logging options.
#[derive(Debug, Args)]
pub struct LoggingOptions {
    /// Log to stderr.
    #[arg(long, global = true)]
    pub stderr: bool,

    /// Directory for the addrpool log.
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

/// Pool configuration and allocation files.
#[derive(Debug, Args)]
pub struct StateFiles {
    /// JSON file with the pool configuration.
    #[arg(long)]
    pub config: PathBuf,

    /// JSON file with the allocation records. Treated as empty if missing.
    #[arg(long)]
    pub allocations: PathBuf,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Validate the pool configuration and print the pool capacities.
    Check {
        /// JSON file with the pool configuration.
        #[arg(long)]
        config: PathBuf,
    },
    /// Restore the allocations and report per-pool usage.
    Replay {
        #[command(flatten)]
        files: StateFiles,
    },
    /// Allocate an address to a service and store the allocation.
    Allocate {
        #[command(flatten)]
        files: StateFiles,

        /// The service id.
        #[arg(long)]
        service: String,

        /// Allocate the lowest free address of this pool.
        #[arg(long, conflicts_with = "address")]
        pool: Option<String>,

        /// Assign this exact address.
        #[arg(long)]
        address: Option<IpAddr>,

        /// A port the service exposes, e.g. `tcp/80`. May be repeated.
        #[arg(long = "port")]
        ports: Vec<Port>,

        /// Services with the same sharing key may share an address.
        #[arg(long, default_value = "")]
        sharing_key: String,
    },
    /// Release the address of a service and store the change.
    Release {
        #[command(flatten)]
        files: StateFiles,

        /// The service id.
        #[arg(long)]
        service: String,
    },
    /// Print the pool gauges in prometheus text format.
    Metrics {
        #[command(flatten)]
        files: StateFiles,
    },
}
