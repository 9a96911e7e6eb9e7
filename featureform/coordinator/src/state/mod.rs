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

use std::any::type_name;
use std::future::Future;
use std::sync::Arc;

use crate::state::backend::{CoordinationStore, LockHandle};
use crate::state::metadata_storage::MetadataStorage;
use crate::state::resource_lookup::ResourceLookup;
use crate::state::task_manager::TaskMetadataManager;

use featureform_core::error::{FeatureformError, Result};
use log::error;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod backend;
pub mod metadata_storage;
pub mod resource_lookup;
pub mod task_manager;

pub fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| {
        FeatureformError::Serialization(format!(
            "Could not serialize {}: {}",
            type_name::<T>(),
            e
        ))
    })
}

pub fn decode_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        FeatureformError::Serialization(format!(
            "Could not deserialize {}: {}",
            type_name::<T>(),
            e
        ))
    })
}

/// Run `op` while holding `lock`, releasing it on the way out regardless of
/// the outcome.
pub async fn with_lock<Out, F: Future<Output = Out>>(
    lock: Box<dyn LockHandle>,
    op: F,
) -> Out {
    let mut lock = lock;
    let result = op.await;
    if let Err(e) = lock.unlock().await {
        error!("Failed to release lock on {}: {}", lock.key(), e);
    }
    result
}

/// The coordinator's typed views over one coordination store.
#[derive(Clone)]
pub struct CoordinatorState {
    pub storage: MetadataStorage,
    pub lookup: ResourceLookup,
    pub tasks: TaskMetadataManager,
}

impl CoordinatorState {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        let storage = MetadataStorage::new(store.clone());
        Self {
            lookup: ResourceLookup::new(storage.clone()),
            tasks: TaskMetadataManager::new(storage.clone(), store),
            storage,
        }
    }
}
