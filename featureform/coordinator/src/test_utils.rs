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

use crate::config::CoordinatorConfig;
use crate::coordinator::Coordinator;
use crate::executor::Executor;
use crate::metrics::CoordinatorMetricsCollector;
use crate::state::backend::memory::MemoryStore;
use crate::state::CoordinatorState;

use async_trait::async_trait;
use featureform_core::error::{FeatureformError, Result};
use featureform_core::proto;
use featureform_core::proto::NameVariant;
use featureform_core::resource::{Resource, ResourceId, ResourceStatus};
use featureform_provider::memory::{
    timestamped, MemoryOfflineStore, MemoryOnlineStore, MemoryProviderResolver,
};
use featureform_provider::{
    Materialization, MaterializationId, OfflineResourceId, OfflineResourceKind,
    OfflineStore, OfflineTable, OnlineStore, PrimaryTable, ProviderResolver,
    ResourceSchema, TableSchema, TrainingSetDef, TrainingSetRow, TransformationConfig,
    Value,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Utility for running some async check multiple times to verify a condition. It will run the check
/// at the specified interval up to a maximum of the specified iterations.
pub async fn await_condition<Fut: Future<Output = Result<bool>>, F: Fn() -> Fut>(
    interval: Duration,
    iterations: usize,
    cond: F,
) -> Result<bool> {
    let mut iteration = 0;

    while iteration < iterations {
        let check = cond().await?;

        if check {
            return Ok(true);
        } else {
            iteration += 1;
            tokio::time::sleep(interval).await;
        }
    }

    Ok(false)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricEvent {
    Started(String),
    Completed(String),
    Failed(String),
}

impl MetricEvent {
    pub fn resource(&self) -> &str {
        match self {
            MetricEvent::Started(resource) => resource.as_str(),
            MetricEvent::Completed(resource) => resource.as_str(),
            MetricEvent::Failed(resource) => resource.as_str(),
        }
    }
}

#[derive(Default)]
pub struct TestMetricsCollector {
    pub events: Mutex<Vec<MetricEvent>>,
}

impl TestMetricsCollector {
    pub fn resource_events(&self, resource: &str) -> Vec<MetricEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.resource() == resource)
            .cloned()
            .collect()
    }
}

impl CoordinatorMetricsCollector for TestMetricsCollector {
    fn record_run_started(&self, resource: &str) {
        self.events
            .lock()
            .push(MetricEvent::Started(resource.to_string()));
    }

    fn record_run_completed(
        &self,
        resource: &str,
        _started_at_ms: u64,
        _completed_at_ms: u64,
    ) {
        self.events
            .lock()
            .push(MetricEvent::Completed(resource.to_string()));
    }

    fn record_run_failed(&self, resource: &str) {
        self.events
            .lock()
            .push(MetricEvent::Failed(resource.to_string()));
    }

    fn set_pending_jobs_queue_size(&self, _value: u64) {}
}

pub fn assert_completed_event(resource: &str, collector: &TestMetricsCollector) {
    let found = collector
        .resource_events(resource)
        .iter()
        .any(|ev| matches!(ev, MetricEvent::Completed(_)));

    assert!(found, "Expected completed event for {}", resource);
}

pub fn assert_failed_event(resource: &str, collector: &TestMetricsCollector) {
    let found = collector
        .resource_events(resource)
        .iter()
        .any(|ev| matches!(ev, MetricEvent::Failed(_)));

    assert!(found, "Expected failed event for {}", resource);
}

/// Offline store that fails `create_materialization` a configured number of
/// times before delegating, for retry-path tests.
pub struct FlakyOfflineStore {
    inner: Arc<dyn OfflineStore>,
    remaining_failures: AtomicUsize,
}

impl FlakyOfflineStore {
    pub fn wrap(inner: Arc<dyn OfflineStore>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            remaining_failures: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl OfflineStore for FlakyOfflineStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn register_resource_from_source_table(
        &self,
        id: &OfflineResourceId,
        schema: ResourceSchema,
    ) -> Result<Arc<dyn OfflineTable>> {
        self.inner
            .register_resource_from_source_table(id, schema)
            .await
    }

    async fn register_primary_from_source_table(
        &self,
        id: &OfflineResourceId,
        table_name: &str,
    ) -> Result<Arc<dyn PrimaryTable>> {
        self.inner
            .register_primary_from_source_table(id, table_name)
            .await
    }

    async fn create_transformation(&self, config: TransformationConfig) -> Result<()> {
        self.inner.create_transformation(config).await
    }

    async fn update_transformation(&self, config: TransformationConfig) -> Result<()> {
        self.inner.update_transformation(config).await
    }

    async fn get_transformation_table(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Arc<dyn PrimaryTable>> {
        self.inner.get_transformation_table(id).await
    }

    async fn create_primary_table(
        &self,
        id: &OfflineResourceId,
        schema: TableSchema,
    ) -> Result<Arc<dyn PrimaryTable>> {
        self.inner.create_primary_table(id, schema).await
    }

    async fn get_primary_table(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Arc<dyn PrimaryTable>> {
        self.inner.get_primary_table(id).await
    }

    async fn create_resource_table(
        &self,
        id: &OfflineResourceId,
        schema: TableSchema,
    ) -> Result<Arc<dyn OfflineTable>> {
        self.inner.create_resource_table(id, schema).await
    }

    async fn get_resource_table(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Arc<dyn OfflineTable>> {
        self.inner.get_resource_table(id).await
    }

    async fn create_materialization(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Arc<dyn Materialization>> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(FeatureformError::Transient(
                "injected materialization failure".to_string(),
            ));
        }
        self.inner.create_materialization(id).await
    }

    async fn get_materialization(
        &self,
        id: &MaterializationId,
    ) -> Result<Arc<dyn Materialization>> {
        self.inner.get_materialization(id).await
    }

    async fn update_materialization(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Arc<dyn Materialization>> {
        self.inner.update_materialization(id).await
    }

    async fn delete_materialization(&self, id: &MaterializationId) -> Result<()> {
        self.inner.delete_materialization(id).await
    }

    async fn create_training_set(&self, def: TrainingSetDef) -> Result<()> {
        self.inner.create_training_set(def).await
    }

    async fn update_training_set(&self, def: TrainingSetDef) -> Result<()> {
        self.inner.update_training_set(def).await
    }

    async fn get_training_set(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Vec<TrainingSetRow>> {
        self.inner.get_training_set(id).await
    }

    async fn check_health(&self) -> Result<()> {
        self.inner.check_health().await
    }
}

struct WrappingResolver {
    offline: Arc<dyn OfflineStore>,
    online: Arc<dyn OnlineStore>,
}

#[async_trait]
impl ProviderResolver for WrappingResolver {
    async fn offline_store(&self, _provider: &str) -> Result<Arc<dyn OfflineStore>> {
        Ok(self.offline.clone())
    }

    async fn online_store(&self, _provider: &str) -> Result<Arc<dyn OnlineStore>> {
        Ok(self.online.clone())
    }

    async fn check_health(&self, _provider: &str) -> Result<()> {
        self.offline.check_health().await?;
        self.online.check_health().await
    }
}

/// Harness wiring a coordinator to an in-memory store, in-memory providers,
/// and the in-process executor.
pub struct CoordinatorTest {
    pub coordinator: Arc<Coordinator>,
    pub store: MemoryStore,
    pub offline: Arc<MemoryOfflineStore>,
    pub online: Arc<MemoryOnlineStore>,
    pub metrics: Arc<TestMetricsCollector>,
}

impl CoordinatorTest {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::with_flaky_materialization(config, 0)
    }

    pub fn with_flaky_materialization(
        config: CoordinatorConfig,
        failures: usize,
    ) -> Self {
        let store = MemoryStore::with_lease_ttl(Duration::from_millis(500));
        let memory = MemoryProviderResolver::new();
        let offline = memory.offline();
        let online = memory.online();

        let resolver: Arc<dyn ProviderResolver> = Arc::new(WrappingResolver {
            offline: if failures > 0 {
                FlakyOfflineStore::wrap(offline.clone(), failures) as Arc<dyn OfflineStore>
            } else {
                offline.clone() as Arc<dyn OfflineStore>
            },
            online: online.clone() as Arc<dyn OnlineStore>,
        });

        let metrics = Arc::new(TestMetricsCollector::default());
        let coordinator = Coordinator::new(
            Arc::new(store.clone()),
            resolver,
            Arc::new(Executor::in_process()),
            config,
            metrics.clone(),
        );

        Self {
            coordinator,
            store,
            offline,
            online,
            metrics,
        }
    }

    pub fn state(&self) -> &CoordinatorState {
        self.coordinator.state()
    }

    pub async fn start(&self) -> Result<()> {
        self.coordinator.clone().start().await
    }

    pub fn feature_resource(name: &str, variant: &str) -> Resource {
        Resource::FeatureVariant(proto::FeatureVariant {
            name: name.to_string(),
            variant: variant.to_string(),
            source: Some(NameVariant::new("transactions", "v1")),
            entity: "user".to_string(),
            provider: "unit-test".to_string(),
            value_type: "float64".to_string(),
            columns: Some(proto::ResourceColumns {
                entity: "user".to_string(),
                value: name.to_string(),
                ts: "ts".to_string(),
            }),
            ..Default::default()
        })
    }

    /// Register a resource and its job key, exactly as the metadata tier
    /// does on apply.
    pub async fn apply(&self, resource: &Resource) -> Result<ResourceId> {
        let id = resource.id();
        self.state().lookup.set(&id, resource).await?;
        self.state().lookup.set_job(&id, "").await?;
        Ok(id)
    }

    /// Seed the offline feature table so a materialization has rows to
    /// snapshot.
    pub async fn seed_feature_rows(
        &self,
        name: &str,
        variant: &str,
        rows: Vec<(&str, f64)>,
    ) -> Result<()> {
        let dataset =
            OfflineResourceId::new(name, variant, OfflineResourceKind::Feature);
        let table = self
            .offline
            .register_resource_from_source_table(
                &dataset,
                ResourceSchema {
                    entity: "user".to_string(),
                    value: name.to_string(),
                    ts: "ts".to_string(),
                    source_table: "transactions__v1".to_string(),
                },
            )
            .await?;
        for (entity, value) in rows {
            table
                .write(timestamped(entity, Value::Float(value), chrono::Utc::now()))
                .await?;
        }
        Ok(())
    }

    pub async fn await_resource_status(
        &self,
        id: &ResourceId,
        status: ResourceStatus,
    ) -> Result<bool> {
        let lookup = self.state().lookup.clone();
        let id = id.clone();
        await_condition(Duration::from_millis(20), 250, move || {
            let lookup = lookup.clone();
            let id = id.clone();
            async move {
                let resource = match lookup.lookup(&id).await {
                    Ok(resource) => resource,
                    Err(e) if e.is_not_found() => return Ok(false),
                    Err(e) => return Err(e),
                };
                Ok(resource.status() == status && !lookup.has_job(&id).await?)
            }
        })
        .await
    }
}
