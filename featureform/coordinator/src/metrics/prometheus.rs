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

use crate::metrics::CoordinatorMetricsCollector;
use featureform_core::error::{FeatureformError, Result};
use once_cell::sync::OnceCell;
use prometheus::{
    register_counter_with_registry, register_gauge_with_registry,
    register_histogram_with_registry, Counter, Gauge, Histogram, Registry,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;

static COLLECTOR: OnceCell<Arc<dyn CoordinatorMetricsCollector>> = OnceCell::new();

pub struct PrometheusMetricsCollector {
    run_time: Histogram,
    started: Counter,
    completed: Counter,
    failed: Counter,
    pending_queue_size: Gauge,
}

impl PrometheusMetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let run_time = register_histogram_with_registry!(
            "run_time_seconds",
            "Histogram of task run execution time in seconds",
            vec![0.5_f64, 1_f64, 5_f64, 30_f64, 60_f64, 300_f64],
            registry
        )
        .map_err(|e| {
            FeatureformError::Internal(format!("Error registering metric: {e:?}"))
        })?;

        let started = register_counter_with_registry!(
            "runs_started_total",
            "Counter of started task runs",
            registry
        )
        .map_err(|e| {
            FeatureformError::Internal(format!("Error registering metric: {e:?}"))
        })?;

        let completed = register_counter_with_registry!(
            "runs_completed_total",
            "Counter of completed task runs",
            registry
        )
        .map_err(|e| {
            FeatureformError::Internal(format!("Error registering metric: {e:?}"))
        })?;

        let failed = register_counter_with_registry!(
            "runs_failed_total",
            "Counter of failed task runs",
            registry
        )
        .map_err(|e| {
            FeatureformError::Internal(format!("Error registering metric: {e:?}"))
        })?;

        let pending_queue_size = register_gauge_with_registry!(
            "pending_jobs",
            "Number of jobs waiting for a worker",
            registry
        )
        .map_err(|e| {
            FeatureformError::Internal(format!("Error registering metric: {e:?}"))
        })?;

        Ok(Self {
            run_time,
            started,
            completed,
            failed,
            pending_queue_size,
        })
    }

    pub fn current() -> Result<Arc<dyn CoordinatorMetricsCollector>> {
        COLLECTOR
            .get_or_try_init(|| {
                let collector = Self::new(::prometheus::default_registry())?;

                Ok(Arc::new(collector) as Arc<dyn CoordinatorMetricsCollector>)
            })
            .map(|arc| arc.clone())
    }
}

impl CoordinatorMetricsCollector for PrometheusMetricsCollector {
    fn record_run_started(&self, _resource: &str) {
        self.started.inc();
    }

    fn record_run_completed(&self, _resource: &str, started_at_ms: u64, completed_at_ms: u64) {
        self.completed.inc();
        self.run_time
            .observe(completed_at_ms.saturating_sub(started_at_ms) as f64 / 1000_f64);
    }

    fn record_run_failed(&self, _resource: &str) {
        self.failed.inc();
    }

    fn set_pending_jobs_queue_size(&self, value: u64) {
        self.pending_queue_size.set(value as f64);
    }
}

/// Encode the default registry in the prometheus text format; the embedder
/// serves the bytes over its own HTTP surface.
pub fn gather_metrics() -> Result<(Vec<u8>, String)> {
    let encoder = TextEncoder::new();

    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        FeatureformError::Internal(format!("Error encoding prometheus metrics: {e:?}"))
    })?;

    Ok((buffer, encoder.format_type().to_string()))
}
