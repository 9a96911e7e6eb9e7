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

//! In-memory reference implementation of the provider contracts. Backs the
//! coordinator test harness and single-process deployments; it is not a
//! production driver.

use crate::{
    dataset_already_exists, dataset_not_found, entity_not_found, FeatureRow,
    Materialization, MaterializationId, OfflineResourceId, OfflineResourceKind,
    OfflineStore, OfflineTable, OnlineStore, OnlineStoreTable, PrimaryTable,
    ProviderResolver, ResourceSchema, TableSchema, TrainingSetDef, TrainingSetRow,
    TransformationConfig, Value,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use featureform_core::error::{FeatureformError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

fn dataset_key(id: &OfflineResourceId) -> String {
    format!("{}__{}__{}", id.kind, id.name, id.variant)
}

fn matches_type(declared: &str, value: &Value) -> bool {
    match declared {
        "int" | "int32" | "int64" => matches!(value, Value::Int(_)),
        "float32" | "float64" => matches!(value, Value::Float(_)),
        "string" => matches!(value, Value::Str(_)),
        "bool" => matches!(value, Value::Bool(_)),
        _ => true,
    }
}

#[derive(Default, Debug)]
pub struct MemoryResourceTable {
    rows: RwLock<Vec<FeatureRow>>,
}

impl MemoryResourceTable {
    /// Latest row per entity, later timestamps (and later writes on ties)
    /// winning.
    fn snapshot(&self) -> Vec<FeatureRow> {
        let rows = self.rows.read();
        let mut latest: HashMap<String, FeatureRow> = HashMap::new();
        for row in rows.iter() {
            match latest.get(&row.entity) {
                Some(current) if current.ts > row.ts => {}
                _ => {
                    latest.insert(row.entity.clone(), row.clone());
                }
            }
        }
        let mut snapshot: Vec<FeatureRow> = latest.into_values().collect();
        snapshot.sort_by(|a, b| a.entity.cmp(&b.entity));
        snapshot
    }
}

#[async_trait]
impl OfflineTable for MemoryResourceTable {
    async fn write(&self, row: FeatureRow) -> Result<()> {
        self.rows.write().push(row);
        Ok(())
    }

    async fn num_rows(&self) -> Result<u64> {
        Ok(self.rows.read().len() as u64)
    }
}

pub struct MemoryPrimaryTable {
    name: String,
    rows: RwLock<Vec<FeatureRow>>,
}

impl MemoryPrimaryTable {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PrimaryTable for MemoryPrimaryTable {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn num_rows(&self) -> Result<u64> {
        Ok(self.rows.read().len() as u64)
    }
}

#[derive(Debug)]
pub struct MemoryMaterialization {
    id: MaterializationId,
    rows: Vec<FeatureRow>,
}

#[async_trait]
impl Materialization for MemoryMaterialization {
    fn id(&self) -> MaterializationId {
        self.id.clone()
    }

    async fn num_rows(&self) -> Result<u64> {
        Ok(self.rows.len() as u64)
    }

    async fn num_chunks(&self, chunk_size: usize) -> Result<usize> {
        if chunk_size == 0 {
            return Err(FeatureformError::InvalidArgument(
                "chunk size must be positive".to_string(),
            ));
        }
        Ok((self.rows.len() + chunk_size - 1) / chunk_size)
    }

    async fn iterate_chunk(
        &self,
        chunk: usize,
        chunk_size: usize,
    ) -> Result<Vec<FeatureRow>> {
        let chunks = self.num_chunks(chunk_size).await?;
        if chunk >= chunks {
            return Err(FeatureformError::InvalidArgument(format!(
                "chunk {chunk} out of range, materialization {} has {chunks} chunks",
                self.id
            )));
        }
        let start = chunk * chunk_size;
        let end = (start + chunk_size).min(self.rows.len());
        Ok(self.rows[start..end].to_vec())
    }
}

pub struct MemoryOfflineStore {
    name: String,
    primaries: DashMap<String, Arc<MemoryPrimaryTable>>,
    resources: DashMap<String, Arc<MemoryResourceTable>>,
    transformations: DashMap<String, TransformationConfig>,
    materializations: DashMap<MaterializationId, Arc<MemoryMaterialization>>,
    training_sets: DashMap<String, Vec<TrainingSetRow>>,
}

impl MemoryOfflineStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primaries: DashMap::new(),
            resources: DashMap::new(),
            transformations: DashMap::new(),
            materializations: DashMap::new(),
            training_sets: DashMap::new(),
        }
    }

    pub fn materialization_id(id: &OfflineResourceId) -> MaterializationId {
        format!("{}__{}", id.name, id.variant)
    }

    fn feature_snapshot(&self, id: &OfflineResourceId) -> Result<Vec<FeatureRow>> {
        let table = self
            .resources
            .get(&dataset_key(id))
            .ok_or_else(|| dataset_not_found(id))?;
        Ok(table.snapshot())
    }

    fn build_training_set(&self, def: &TrainingSetDef) -> Result<Vec<TrainingSetRow>> {
        let label_id = OfflineResourceId::new(
            def.label.name.clone(),
            def.label.variant.clone(),
            OfflineResourceKind::Label,
        );
        let labels = self.feature_snapshot(&label_id)?;

        let mut feature_snapshots = Vec::with_capacity(def.features.len());
        for feature in &def.features {
            let feature_id = OfflineResourceId::new(
                feature.name.clone(),
                feature.variant.clone(),
                OfflineResourceKind::Feature,
            );
            let snapshot: HashMap<String, Value> = self
                .feature_snapshot(&feature_id)?
                .into_iter()
                .map(|row| (row.entity, row.value))
                .collect();
            feature_snapshots.push(snapshot);
        }

        let rows = labels
            .into_iter()
            .map(|label_row| TrainingSetRow {
                features: feature_snapshots
                    .iter()
                    .map(|snapshot| {
                        snapshot.get(&label_row.entity).cloned().unwrap_or(Value::Nil)
                    })
                    .collect(),
                label: label_row.value,
            })
            .collect();
        Ok(rows)
    }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn register_resource_from_source_table(
        &self,
        id: &OfflineResourceId,
        _schema: ResourceSchema,
    ) -> Result<Arc<dyn OfflineTable>> {
        let key = dataset_key(id);
        if self.resources.contains_key(&key) {
            return Err(dataset_already_exists(id));
        }
        let table = Arc::new(MemoryResourceTable::default());
        self.resources.insert(key, table.clone());
        Ok(table)
    }

    async fn register_primary_from_source_table(
        &self,
        id: &OfflineResourceId,
        table_name: &str,
    ) -> Result<Arc<dyn PrimaryTable>> {
        let key = dataset_key(id);
        if self.primaries.contains_key(&key) {
            return Err(dataset_already_exists(id));
        }
        let table = Arc::new(MemoryPrimaryTable::new(table_name));
        self.primaries.insert(key, table.clone());
        Ok(table)
    }

    async fn create_transformation(&self, config: TransformationConfig) -> Result<()> {
        let id = OfflineResourceId::new(
            config.name.clone(),
            config.variant.clone(),
            OfflineResourceKind::Transformation,
        );
        let key = dataset_key(&id);
        if self.transformations.contains_key(&key) {
            return Err(dataset_already_exists(&id));
        }
        let table = Arc::new(MemoryPrimaryTable::new(format!(
            "transformation_{}_{}",
            config.name, config.variant
        )));
        self.primaries.insert(key.clone(), table);
        self.transformations.insert(key, config);
        Ok(())
    }

    async fn update_transformation(&self, config: TransformationConfig) -> Result<()> {
        let id = OfflineResourceId::new(
            config.name.clone(),
            config.variant.clone(),
            OfflineResourceKind::Transformation,
        );
        let key = dataset_key(&id);
        if !self.transformations.contains_key(&key) {
            return Err(dataset_not_found(&id));
        }
        self.transformations.insert(key, config);
        Ok(())
    }

    async fn get_transformation_table(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Arc<dyn PrimaryTable>> {
        let key = dataset_key(id);
        if !self.transformations.contains_key(&key) {
            return Err(dataset_not_found(id));
        }
        self.primaries
            .get(&key)
            .map(|t| t.clone() as Arc<dyn PrimaryTable>)
            .ok_or_else(|| dataset_not_found(id))
    }

    async fn create_primary_table(
        &self,
        id: &OfflineResourceId,
        _schema: TableSchema,
    ) -> Result<Arc<dyn PrimaryTable>> {
        let key = dataset_key(id);
        if self.primaries.contains_key(&key) {
            return Err(dataset_already_exists(id));
        }
        let table = Arc::new(MemoryPrimaryTable::new(id.name.clone()));
        self.primaries.insert(key, table.clone());
        Ok(table)
    }

    async fn get_primary_table(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Arc<dyn PrimaryTable>> {
        self.primaries
            .get(&dataset_key(id))
            .map(|t| t.clone() as Arc<dyn PrimaryTable>)
            .ok_or_else(|| dataset_not_found(id))
    }

    async fn create_resource_table(
        &self,
        id: &OfflineResourceId,
        _schema: TableSchema,
    ) -> Result<Arc<dyn OfflineTable>> {
        let key = dataset_key(id);
        if self.resources.contains_key(&key) {
            return Err(dataset_already_exists(id));
        }
        let table = Arc::new(MemoryResourceTable::default());
        self.resources.insert(key, table.clone());
        Ok(table)
    }

    async fn get_resource_table(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Arc<dyn OfflineTable>> {
        self.resources
            .get(&dataset_key(id))
            .map(|t| t.clone() as Arc<dyn OfflineTable>)
            .ok_or_else(|| dataset_not_found(id))
    }

    async fn create_materialization(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Arc<dyn Materialization>> {
        let materialization_id = Self::materialization_id(id);
        if self.materializations.contains_key(&materialization_id) {
            return Err(FeatureformError::AlreadyExists(format!(
                "materialization {materialization_id}"
            )));
        }
        let materialization = Arc::new(MemoryMaterialization {
            id: materialization_id.clone(),
            rows: self.feature_snapshot(id)?,
        });
        self.materializations
            .insert(materialization_id, materialization.clone());
        Ok(materialization)
    }

    async fn get_materialization(
        &self,
        id: &MaterializationId,
    ) -> Result<Arc<dyn Materialization>> {
        self.materializations
            .get(id)
            .map(|m| m.clone() as Arc<dyn Materialization>)
            .ok_or_else(|| {
                FeatureformError::NotFound(format!("materialization {id}"))
            })
    }

    async fn update_materialization(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Arc<dyn Materialization>> {
        let materialization_id = Self::materialization_id(id);
        if !self.materializations.contains_key(&materialization_id) {
            return Err(FeatureformError::NotFound(format!(
                "materialization {materialization_id}"
            )));
        }
        let materialization = Arc::new(MemoryMaterialization {
            id: materialization_id.clone(),
            rows: self.feature_snapshot(id)?,
        });
        self.materializations
            .insert(materialization_id, materialization.clone());
        Ok(materialization)
    }

    async fn delete_materialization(&self, id: &MaterializationId) -> Result<()> {
        self.materializations.remove(id).map(|_| ()).ok_or_else(|| {
            FeatureformError::NotFound(format!("materialization {id}"))
        })
    }

    async fn create_training_set(&self, def: TrainingSetDef) -> Result<()> {
        let id = OfflineResourceId::new(
            def.name.clone(),
            def.variant.clone(),
            OfflineResourceKind::TrainingSet,
        );
        let key = dataset_key(&id);
        if self.training_sets.contains_key(&key) {
            return Err(dataset_already_exists(&id));
        }
        let rows = self.build_training_set(&def)?;
        self.training_sets.insert(key, rows);
        Ok(())
    }

    async fn update_training_set(&self, def: TrainingSetDef) -> Result<()> {
        let id = OfflineResourceId::new(
            def.name.clone(),
            def.variant.clone(),
            OfflineResourceKind::TrainingSet,
        );
        let key = dataset_key(&id);
        if !self.training_sets.contains_key(&key) {
            return Err(dataset_not_found(&id));
        }
        let rows = self.build_training_set(&def)?;
        self.training_sets.insert(key, rows);
        Ok(())
    }

    async fn get_training_set(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Vec<TrainingSetRow>> {
        self.training_sets
            .get(&dataset_key(id))
            .map(|rows| rows.clone())
            .ok_or_else(|| dataset_not_found(id))
    }

    async fn check_health(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryOnlineTable {
    value_type: String,
    values: DashMap<String, Value>,
}

#[async_trait]
impl OnlineStoreTable for MemoryOnlineTable {
    async fn set(&self, entity: &str, value: Value) -> Result<()> {
        if !matches!(value, Value::Nil) && !matches_type(&self.value_type, &value) {
            return Err(FeatureformError::DataTypeMismatch(format!(
                "table expects {}, got {}",
                self.value_type,
                value.type_name()
            )));
        }
        self.values.insert(entity.to_string(), value);
        Ok(())
    }

    async fn get(&self, entity: &str) -> Result<Value> {
        self.values
            .get(entity)
            .map(|v| v.clone())
            .ok_or_else(|| entity_not_found(entity))
    }
}

pub struct MemoryOnlineStore {
    name: String,
    tables: DashMap<(String, String), Arc<MemoryOnlineTable>>,
}

impl MemoryOnlineStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: DashMap::new(),
        }
    }
}

#[async_trait]
impl OnlineStore for MemoryOnlineStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_table(
        &self,
        feature: &str,
        variant: &str,
    ) -> Result<Arc<dyn OnlineStoreTable>> {
        self.tables
            .get(&(feature.to_string(), variant.to_string()))
            .map(|t| t.clone() as Arc<dyn OnlineStoreTable>)
            .ok_or_else(|| {
                FeatureformError::NotFound(format!("online table {feature} ({variant})"))
            })
    }

    async fn create_table(
        &self,
        feature: &str,
        variant: &str,
        value_type: &str,
    ) -> Result<Arc<dyn OnlineStoreTable>> {
        let key = (feature.to_string(), variant.to_string());
        if self.tables.contains_key(&key) {
            return Err(FeatureformError::AlreadyExists(format!(
                "online table {feature} ({variant})"
            )));
        }
        let table = Arc::new(MemoryOnlineTable {
            value_type: value_type.to_string(),
            values: DashMap::new(),
        });
        self.tables.insert(key, table.clone());
        Ok(table)
    }

    async fn delete_table(&self, feature: &str, variant: &str) -> Result<()> {
        self.tables
            .remove(&(feature.to_string(), variant.to_string()))
            .map(|_| ())
            .ok_or_else(|| {
                FeatureformError::NotFound(format!("online table {feature} ({variant})"))
            })
    }

    async fn check_health(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Resolves every provider name to one shared pair of in-memory stores.
pub struct MemoryProviderResolver {
    offline: Arc<MemoryOfflineStore>,
    online: Arc<MemoryOnlineStore>,
}

impl MemoryProviderResolver {
    pub fn new() -> Self {
        Self {
            offline: Arc::new(MemoryOfflineStore::new("memory-offline")),
            online: Arc::new(MemoryOnlineStore::new("memory-online")),
        }
    }

    pub fn offline(&self) -> Arc<MemoryOfflineStore> {
        self.offline.clone()
    }

    pub fn online(&self) -> Arc<MemoryOnlineStore> {
        self.online.clone()
    }
}

impl Default for MemoryProviderResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderResolver for MemoryProviderResolver {
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

pub fn timestamped(entity: &str, value: Value, ts: DateTime<Utc>) -> FeatureRow {
    FeatureRow {
        entity: entity.to_string(),
        value,
        ts: Some(ts),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use featureform_core::proto::NameVariant;

    fn feature_id() -> OfflineResourceId {
        OfflineResourceId::new("price", "v1", OfflineResourceKind::Feature)
    }

    async fn seeded_store() -> MemoryOfflineStore {
        let store = MemoryOfflineStore::new("memory-offline");
        let table = store
            .register_resource_from_source_table(
                &feature_id(),
                ResourceSchema {
                    entity: "user".to_string(),
                    value: "price".to_string(),
                    ts: "ts".to_string(),
                    source_table: "transactions".to_string(),
                },
            )
            .await
            .unwrap();

        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        table
            .write(timestamped("a", Value::Float(1.0), t0))
            .await
            .unwrap();
        table
            .write(timestamped("a", Value::Float(2.0), t1))
            .await
            .unwrap();
        table
            .write(timestamped("b", Value::Float(3.0), t0))
            .await
            .unwrap();
        table
            .write(timestamped("c", Value::Float(4.0), t0))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let store = seeded_store().await;
        let err = store
            .register_resource_from_source_table(
                &feature_id(),
                ResourceSchema {
                    entity: "user".to_string(),
                    value: "price".to_string(),
                    ts: "ts".to_string(),
                    source_table: "transactions".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_materialization_takes_latest_per_entity() {
        let store = seeded_store().await;
        let materialization = store.create_materialization(&feature_id()).await.unwrap();

        assert_eq!(materialization.num_rows().await.unwrap(), 3);

        let rows = materialization.iterate_chunk(0, 100).await.unwrap();
        let a = rows.iter().find(|r| r.entity == "a").unwrap();
        assert_eq!(a.value, Value::Float(2.0));
    }

    #[tokio::test]
    async fn test_materialization_chunking() {
        let store = seeded_store().await;
        let materialization = store.create_materialization(&feature_id()).await.unwrap();

        assert_eq!(materialization.num_chunks(2).await.unwrap(), 2);
        assert_eq!(materialization.iterate_chunk(0, 2).await.unwrap().len(), 2);
        assert_eq!(materialization.iterate_chunk(1, 2).await.unwrap().len(), 1);
        assert!(materialization.iterate_chunk(2, 2).await.is_err());
        assert!(materialization.num_chunks(0).await.is_err());
    }

    #[tokio::test]
    async fn test_create_materialization_twice_fails() {
        let store = seeded_store().await;
        store.create_materialization(&feature_id()).await.unwrap();
        let err = store.create_materialization(&feature_id()).await.unwrap_err();
        assert!(err.is_already_exists());

        // But updating refreshes the snapshot.
        let table = store.get_resource_table(&feature_id()).await.unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        table
            .write(timestamped("d", Value::Float(5.0), t2))
            .await
            .unwrap();
        let updated = store.update_materialization(&feature_id()).await.unwrap();
        assert_eq!(updated.num_rows().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_get_and_delete_materialization() {
        let store = seeded_store().await;
        let created = store.create_materialization(&feature_id()).await.unwrap();
        let id = created.id();

        let fetched = store.get_materialization(&id).await.unwrap();
        assert_eq!(fetched.num_rows().await.unwrap(), 3);

        store.delete_materialization(&id).await.unwrap();
        assert!(store.get_materialization(&id).await.is_err());
        assert!(store.delete_materialization(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_online_table_round_trip() {
        let store = MemoryOnlineStore::new("memory-online");
        let table = store.create_table("price", "v1", "float64").await.unwrap();

        table.set("a", Value::Float(2.0)).await.unwrap();
        assert_eq!(table.get("a").await.unwrap(), Value::Float(2.0));

        let err = table.get("missing").await.unwrap_err();
        assert!(err.is_not_found());

        let err = table.set("a", Value::Str("nope".to_string())).await.unwrap_err();
        assert!(matches!(err, FeatureformError::DataTypeMismatch(_)));

        assert!(store.create_table("price", "v1", "float64").await.is_err());
        store.delete_table("price", "v1").await.unwrap();
        assert!(store.get_table("price", "v1").await.is_err());
    }

    #[tokio::test]
    async fn test_training_set_join() {
        let store = seeded_store().await;

        let label_id = OfflineResourceId::new("bought", "v1", OfflineResourceKind::Label);
        let labels = store
            .register_resource_from_source_table(
                &label_id,
                ResourceSchema {
                    entity: "user".to_string(),
                    value: "bought".to_string(),
                    ts: "ts".to_string(),
                    source_table: "orders".to_string(),
                },
            )
            .await
            .unwrap();

        let t0 = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        labels
            .write(timestamped("a", Value::Bool(true), t0))
            .await
            .unwrap();
        labels
            .write(timestamped("z", Value::Bool(false), t0))
            .await
            .unwrap();

        let def = TrainingSetDef {
            name: "purchases".to_string(),
            variant: "v1".to_string(),
            label: NameVariant::new("bought", "v1"),
            features: vec![NameVariant::new("price", "v1")],
        };
        store.create_training_set(def.clone()).await.unwrap();
        assert!(store.create_training_set(def).await.is_err());

        let ts_id =
            OfflineResourceId::new("purchases", "v1", OfflineResourceKind::TrainingSet);
        let rows = store.get_training_set(&ts_id).await.unwrap();
        assert_eq!(rows.len(), 2);

        // Entity `a` has a feature value; entity `z` does not.
        let a = rows
            .iter()
            .find(|r| r.label == Value::Bool(true))
            .unwrap();
        assert_eq!(a.features, vec![Value::Float(2.0)]);
        let z = rows
            .iter()
            .find(|r| r.label == Value::Bool(false))
            .unwrap();
        assert_eq!(z.features, vec![Value::Nil]);
    }

    #[tokio::test]
    async fn test_transformation_lifecycle() {
        let store = MemoryOfflineStore::new("memory-offline");
        let config = TransformationConfig {
            name: "avg_price".to_string(),
            variant: "v1".to_string(),
            query: "SELECT AVG(price) FROM {{transactions.v1}}".to_string(),
            source_mapping: vec![],
        };

        store.create_transformation(config.clone()).await.unwrap();
        assert!(store.create_transformation(config.clone()).await.is_err());

        let id = OfflineResourceId::new(
            "avg_price",
            "v1",
            OfflineResourceKind::Transformation,
        );
        let table = store.get_transformation_table(&id).await.unwrap();
        assert_eq!(table.name(), "transformation_avg_price_v1");

        store.update_transformation(config).await.unwrap();
    }
}
