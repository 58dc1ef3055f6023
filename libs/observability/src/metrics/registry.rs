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
//! Prometheus metric registry.

use prometheus::{Encoder, IntGaugeVec, Opts, TextEncoder, core::Collector};

/// Register and collect metrics of one or more components.
///
/// ## Designated use case
///
/// When initializing a component, the caller is responsible to build the component's metrics based
/// on the desired `MetricsRegistry`. The component specific metrics uses the provided
/// `MetricsRegistry` to register its metrics.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    registry: prometheus::Registry,
}

impl MetricsRegistry {
    /// Use prometheus' default registry. As a result, this registry will 'point' to the global
    /// registry.
    pub fn new_global() -> Self {
        Self::new_with_registry(prometheus::default_registry().clone())
    }

    /// Create a new metrics registry with the given prometheus registry.
    pub fn new_with_registry(registry: prometheus::Registry) -> Self {
        Self { registry }
    }

    /// Create a new metrics registry with no collectors pre-registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register an `IntGaugeVec`.
    pub fn int_gauge_vec<S: Into<String>>(
        &self,
        name: S,
        help: S,
        label_names: &[&str],
    ) -> IntGaugeVec {
        self.register_collector(IntGaugeVec::new(Opts::new(name, help), label_names).unwrap())
    }

    /// Collect all registered metric families.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Render all registered metrics in the prometheus text exposition format.
    pub fn encode_text(&self) -> String {
        let mf = self.gather();
        let mut buffer = Vec::with_capacity(mf.len() * 20);
        TextEncoder::new()
            .encode(&mf, &mut buffer)
            .expect("never fails");
        String::from_utf8(buffer).expect("text encoder emits utf-8")
    }

    fn register_collector<C: 'static + Collector + Clone>(&self, c: C) -> C {
        self.registry.register(Box::new(C::clone(&c))).unwrap();
        c
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        let registry = prometheus::Registry::new();
        Self { registry }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_encodes_gauges() {
        let registry = MetricsRegistry::new();
        let gauge = registry.int_gauge_vec("pool_size", "Size of a pool.", &["pool"]);
        gauge.with_label_values(&["blue"]).set(4);

        let text = registry.encode_text();
        assert!(text.contains("# HELP pool_size Size of a pool."), "{text}");
        assert!(text.contains("pool_size{pool=\"blue\"} 4"), "{text}");

        gauge.remove_label_values(&["blue"]).unwrap();
        assert!(!registry.encode_text().contains("pool=\"blue\""));
    }

    #[test]
    fn global_registries_share_metrics() {
        let gauge = MetricsRegistry::new_global().int_gauge_vec(
            "global_pool_size",
            "Size of a pool.",
            &["pool"],
        );
        gauge.with_label_values(&["green"]).set(2);

        let text = MetricsRegistry::new_global().encode_text();
        assert!(text.contains("global_pool_size{pool=\"green\"} 2"), "{text}");
    }

    #[test]
    #[should_panic]
    fn duplicate_registration_panics() {
        let registry = MetricsRegistry::new();
        registry.int_gauge_vec("dup", "first", &["pool"]);
        registry.int_gauge_vec("dup", "second", &["pool"]);
    }
}
