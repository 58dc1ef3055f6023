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
//! Per-pool capacity and usage gauges.

use lb_observability::metrics::registry::MetricsRegistry;
use prometheus::IntGaugeVec;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Capacity and usage of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PoolStats {
    /// The pool's name.
    pub name: String,
    /// Number of allocation units in the pool.
    pub capacity: u128,
    /// Number of allocation units with at least one bound service.
    pub in_use: usize,
}

/// Prometheus gauges for address pools, labelled by pool name.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Number of allocation units per pool.
    pub capacity: IntGaugeVec,
    /// Number of allocation units in use per pool.
    pub in_use: IntGaugeVec,
}

impl PoolMetrics {
    /// Create new metrics instance with the given registry.
    pub fn new(metrics_registry: &MetricsRegistry) -> Self {
        Self {
            capacity: metrics_registry.int_gauge_vec(
                "address_pool_capacity",
                "Number of addresses (or aggregation blocks) in the pool.",
                &["pool"],
            ),
            in_use: metrics_registry.int_gauge_vec(
                "address_pool_in_use",
                "Number of addresses (or aggregation blocks) of the pool in use.",
                &["pool"],
            ),
        }
    }

    /// Publishes both gauges of a pool.
    pub fn publish(&self, stats: &PoolStats) {
        // saturate, IPv6 pools easily exceed i64
        let capacity = i64::try_from(stats.capacity).unwrap_or(i64::MAX);
        let in_use = i64::try_from(stats.in_use).unwrap_or(i64::MAX);
        self.capacity
            .with_label_values(&[stats.name.as_str()])
            .set(capacity);
        self.in_use
            .with_label_values(&[stats.name.as_str()])
            .set(in_use);
    }

    /// Removes both gauges of a pool.
    pub fn remove(&self, pool: &str) {
        // Err only means the pool was never published.
        self.capacity.remove_label_values(&[pool]).ok();
        self.in_use.remove_label_values(&[pool]).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(name: &str, capacity: u128, in_use: usize) -> PoolStats {
        PoolStats {
            name: name.to_string(),
            capacity,
            in_use,
        }
    }

    #[test]
    fn publishes_and_removes_gauges() {
        let registry = MetricsRegistry::new();
        let metrics = PoolMetrics::new(&registry);

        metrics.publish(&stats("default", 4, 1));
        metrics.publish(&stats("huge", 1 << 64, 0));
        assert_eq!(metrics.capacity.with_label_values(&["default"]).get(), 4);
        assert_eq!(metrics.in_use.with_label_values(&["default"]).get(), 1);
        assert_eq!(
            metrics.capacity.with_label_values(&["huge"]).get(),
            i64::MAX
        );

        metrics.remove("default");
        let text = registry.encode_text();
        assert!(!text.contains("pool=\"default\""), "{text}");
        assert!(text.contains("address_pool_capacity{pool=\"huge\"}"), "{text}");

        // removing twice is harmless
        metrics.remove("default");
    }
}
