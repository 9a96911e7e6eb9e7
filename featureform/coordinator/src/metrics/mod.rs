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

#[cfg(feature = "prometheus-metrics")]
pub mod prometheus;

use std::sync::Arc;

/// Collector of coordinator scheduling metrics.
pub trait CoordinatorMetricsCollector: Send + Sync {
    fn record_run_started(&self, resource: &str);

    fn record_run_completed(&self, resource: &str, started_at_ms: u64, completed_at_ms: u64);

    fn record_run_failed(&self, resource: &str);

    fn set_pending_jobs_queue_size(&self, value: u64);
}

#[derive(Default)]
pub struct NoopMetricsCollector {}

impl CoordinatorMetricsCollector for NoopMetricsCollector {
    fn record_run_started(&self, _resource: &str) {}

    fn record_run_completed(
        &self,
        _resource: &str,
        _started_at_ms: u64,
        _completed_at_ms: u64,
    ) {
    }

    fn record_run_failed(&self, _resource: &str) {}

    fn set_pending_jobs_queue_size(&self, _value: u64) {}
}

pub fn default_metrics_collector() -> Arc<dyn CoordinatorMetricsCollector> {
    #[cfg(feature = "prometheus-metrics")]
    {
        if let Ok(collector) = prometheus::PrometheusMetricsCollector::current() {
            return collector;
        }
    }
    Arc::new(NoopMetricsCollector::default())
}
