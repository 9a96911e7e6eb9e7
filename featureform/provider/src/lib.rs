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

//! The narrow capability surface the coordinator consumes from storage and
//! compute providers. Concrete drivers (warehouse dialects, blob filestores,
//! online KV clients) implement these traits outside this repository; the
//! in-memory implementation in [`memory`] backs tests and single-process
//! deployments.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use featureform_core::error::{FeatureformError, Result};
use featureform_core::proto::NameVariant;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Rows uploaded to an online store per materialization chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

/// The kind of a dataset held in an offline store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OfflineResourceKind {
    Primary,
    Transformation,
    Feature,
    Label,
    TrainingSet,
}

impl fmt::Display for OfflineResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            OfflineResourceKind::Primary => "PRIMARY",
            OfflineResourceKind::Transformation => "TRANSFORMATION",
            OfflineResourceKind::Feature => "FEATURE",
            OfflineResourceKind::Label => "LABEL",
            OfflineResourceKind::TrainingSet => "TRAINING_SET",
        };
        write!(f, "{s}")
    }
}

/// Identity of a dataset within an offline store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OfflineResourceId {
    pub name: String,
    pub variant: String,
    pub kind: OfflineResourceKind,
}

impl OfflineResourceId {
    pub fn new(
        name: impl Into<String>,
        variant: impl Into<String>,
        kind: OfflineResourceKind,
    ) -> Self {
        Self {
            name: name.into(),
            variant: variant.into(),
            kind,
        }
    }
}

impl fmt::Display for OfflineResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.name, self.variant)
    }
}

pub type MaterializationId = String;

/// A single typed cell value moved between stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Nil,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float64",
            Value::Str(_) => "string",
            Value::Nil => "nil",
        }
    }
}

/// One entity's feature observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub entity: String,
    pub value: Value,
    pub ts: Option<DateTime<Utc>>,
}

/// Column bindings mapping a source table onto `(entity, value, ts)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub entity: String,
    pub value: String,
    pub ts: String,
    pub source_table: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub value_type: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
}

/// A transformation query plus the logical-name to physical-table mapping
/// substituted into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationConfig {
    pub name: String,
    pub variant: String,
    pub query: String,
    pub source_mapping: Vec<SourceMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMapping {
    pub template: String,
    pub source: String,
}

/// Definition of a training set: a label joined with features at the
/// label's timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSetDef {
    pub name: String,
    pub variant: String,
    pub label: NameVariant,
    pub features: Vec<NameVariant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSetRow {
    pub features: Vec<Value>,
    pub label: Value,
}

pub fn dataset_already_exists(id: &OfflineResourceId) -> FeatureformError {
    FeatureformError::AlreadyExists(format!("dataset {id}"))
}

pub fn dataset_not_found(id: &OfflineResourceId) -> FeatureformError {
    FeatureformError::NotFound(format!("dataset {id}"))
}

pub fn entity_not_found(entity: &str) -> FeatureformError {
    FeatureformError::NotFound(format!("entity {entity}"))
}

/// A registered feature, label or training-set table on the analytics side.
#[async_trait]
pub trait OfflineTable: Send + Sync + std::fmt::Debug {
    async fn write(&self, row: FeatureRow) -> Result<()>;
    async fn num_rows(&self) -> Result<u64>;
}

/// A primary or transformation table on the analytics side.
#[async_trait]
pub trait PrimaryTable: Send + Sync {
    fn name(&self) -> String;
    async fn num_rows(&self) -> Result<u64>;
}

/// A physical snapshot of a feature optimized for chunked upload into an
/// online store. Chunk iterators must be safe to hand to separate workers;
/// ordering within a chunk is irrelevant.
#[async_trait]
pub trait Materialization: Send + Sync + std::fmt::Debug {
    fn id(&self) -> MaterializationId;
    async fn num_rows(&self) -> Result<u64>;
    async fn num_chunks(&self, chunk_size: usize) -> Result<usize>;
    async fn iterate_chunk(&self, chunk: usize, chunk_size: usize) -> Result<Vec<FeatureRow>>;
}

/// Analytics-side capabilities consumed by the coordinator.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// The provider name, used for error context.
    fn name(&self) -> &str;

    async fn register_resource_from_source_table(
        &self,
        id: &OfflineResourceId,
        schema: ResourceSchema,
    ) -> Result<Arc<dyn OfflineTable>>;

    async fn register_primary_from_source_table(
        &self,
        id: &OfflineResourceId,
        table_name: &str,
    ) -> Result<Arc<dyn PrimaryTable>>;

    async fn create_transformation(&self, config: TransformationConfig) -> Result<()>;

    async fn update_transformation(&self, config: TransformationConfig) -> Result<()>;

    async fn get_transformation_table(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Arc<dyn PrimaryTable>>;

    async fn create_primary_table(
        &self,
        id: &OfflineResourceId,
        schema: TableSchema,
    ) -> Result<Arc<dyn PrimaryTable>>;

    async fn get_primary_table(&self, id: &OfflineResourceId)
        -> Result<Arc<dyn PrimaryTable>>;

    async fn create_resource_table(
        &self,
        id: &OfflineResourceId,
        schema: TableSchema,
    ) -> Result<Arc<dyn OfflineTable>>;

    async fn get_resource_table(&self, id: &OfflineResourceId)
        -> Result<Arc<dyn OfflineTable>>;

    async fn create_materialization(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Arc<dyn Materialization>>;

    async fn get_materialization(
        &self,
        id: &MaterializationId,
    ) -> Result<Arc<dyn Materialization>>;

    async fn update_materialization(
        &self,
        id: &OfflineResourceId,
    ) -> Result<Arc<dyn Materialization>>;

    async fn delete_materialization(&self, id: &MaterializationId) -> Result<()>;

    async fn create_training_set(&self, def: TrainingSetDef) -> Result<()>;

    async fn update_training_set(&self, def: TrainingSetDef) -> Result<()>;

    async fn get_training_set(&self, id: &OfflineResourceId)
        -> Result<Vec<TrainingSetRow>>;

    async fn check_health(&self) -> Result<()>;
}

/// A single feature table on the serving side.
#[async_trait]
pub trait OnlineStoreTable: Send + Sync {
    async fn set(&self, entity: &str, value: Value) -> Result<()>;
    async fn get(&self, entity: &str) -> Result<Value>;
}

/// Serving-side capabilities consumed by the coordinator.
#[async_trait]
pub trait OnlineStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get_table(
        &self,
        feature: &str,
        variant: &str,
    ) -> Result<Arc<dyn OnlineStoreTable>>;

    async fn create_table(
        &self,
        feature: &str,
        variant: &str,
        value_type: &str,
    ) -> Result<Arc<dyn OnlineStoreTable>>;

    async fn delete_table(&self, feature: &str, variant: &str) -> Result<()>;

    async fn check_health(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Blob-backed filestore capabilities.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, contents: &[u8]) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Resolves a provider name from the catalog to concrete store clients.
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    async fn offline_store(&self, provider: &str) -> Result<Arc<dyn OfflineStore>>;
    async fn online_store(&self, provider: &str) -> Result<Arc<dyn OnlineStore>>;
    async fn check_health(&self, provider: &str) -> Result<()>;
}
