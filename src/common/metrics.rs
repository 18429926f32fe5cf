// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Cluster-membership gauges published for scraping.

use std::sync::{Arc, OnceLock};

use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    live_executor_groups: IntGauge,
    healthy_executor_groups: IntGauge,
    total_backends: IntGauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Overwrite the three membership gauges from a freshly built snapshot.
    /// `healthy` can never exceed `live`; callers assert that before updating.
    pub fn set_cluster_membership(&self, live_groups: i64, healthy_groups: i64, backends: i64) {
        self.inner.live_executor_groups.set(live_groups);
        self.inner.healthy_executor_groups.set(healthy_groups);
        self.inner.total_backends.set(backends);
    }

    pub fn live_executor_groups(&self) -> i64 {
        self.inner.live_executor_groups.get()
    }

    pub fn healthy_executor_groups(&self) -> i64 {
        self.inner.healthy_executor_groups.get()
    }

    pub fn total_backends(&self) -> i64 {
        self.inner.total_backends.get()
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let live_executor_groups = int_gauge(
            &registry,
            "cluster_membership_executor_groups_total",
            "Executor groups with at least one live host",
        );
        let healthy_executor_groups = int_gauge(
            &registry,
            "cluster_membership_executor_groups_total_healthy",
            "Executor groups at or above their configured minimum size",
        );
        let total_backends = int_gauge(
            &registry,
            "cluster_membership_backends_total",
            "Backends known to the membership snapshot",
        );

        Self {
            registry,
            live_executor_groups,
            healthy_executor_groups,
            total_backends,
        }
    }
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::with_opts(Opts::new(name, help)).expect("int gauge");
    registry.register(Box::new(g.clone())).expect("register gauge");
    g
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_membership_gauges() {
        let m = MetricsRegistry::new();
        m.set_cluster_membership(3, 2, 7);
        let text = m.render_prometheus();
        assert!(text.contains("cluster_membership_executor_groups_total 3"));
        assert!(text.contains("cluster_membership_executor_groups_total_healthy 2"));
        assert!(text.contains("cluster_membership_backends_total 7"));
    }
}
