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

//! CRUD and status updates for typed resource records. Each resource is
//! stored as its protobuf bytes inside a JSON envelope whose field names
//! are contractual; the envelope lets a generic walker dispatch to the
//! right decoder without pre-knowing the type.

use crate::job::{
    job_key, schedule_job_key, CoordinatorJob, CoordinatorScheduleJob,
};
use crate::state::metadata_storage::MetadataStorage;
use crate::state::{decode_json, encode_json};
use featureform_core::error::{FeatureformError, Result};
use featureform_core::resource::{
    Resource, ResourceId, ResourceStatus, ResourceType, RESOURCE_TYPES,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

const STORAGE_TYPE_RESOURCE: &str = "Resource";

#[derive(Serialize, Deserialize)]
struct ResourceEnvelope {
    #[serde(rename = "ResourceType")]
    resource_type: String,
    #[serde(rename = "StorageType")]
    storage_type: String,
    #[serde(rename = "Message")]
    message: String,
}

fn encode_resource(resource: &Resource) -> Result<String> {
    let envelope = ResourceEnvelope {
        resource_type: resource.resource_type().to_string(),
        storage_type: STORAGE_TYPE_RESOURCE.to_string(),
        message: base64::encode(resource.encode()),
    };
    encode_json(&envelope)
}

fn decode_resource(raw: &str) -> Result<Resource> {
    let envelope: ResourceEnvelope = decode_json(raw)?;
    if envelope.storage_type != STORAGE_TYPE_RESOURCE {
        return Err(FeatureformError::Serialization(format!(
            "unexpected storage type `{}`",
            envelope.storage_type
        )));
    }
    let resource_type = ResourceType::from_str(&envelope.resource_type)?;
    let bytes = base64::decode(&envelope.message).map_err(|e| {
        FeatureformError::Serialization(format!("invalid resource message: {e}"))
    })?;
    Resource::decode(resource_type, &bytes)
}

#[derive(Clone)]
pub struct ResourceLookup {
    storage: MetadataStorage,
}

impl ResourceLookup {
    pub fn new(storage: MetadataStorage) -> Self {
        Self { storage }
    }

    pub async fn lookup(&self, id: &ResourceId) -> Result<Resource> {
        let raw = self.storage.get(&id.to_key()).await.map_err(|e| {
            if e.is_not_found() {
                FeatureformError::NotFound(format!("resource {id}"))
            } else {
                e
            }
        })?;
        decode_resource(&raw)
    }

    pub async fn has(&self, id: &ResourceId) -> Result<bool> {
        match self.storage.get(&id.to_key()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write a resource record, replacing any existing definition. This is
    /// the user re-apply path and the only way a READY resource leaves
    /// READY.
    pub async fn set(&self, id: &ResourceId, resource: &Resource) -> Result<()> {
        if *id != resource.id() {
            return Err(FeatureformError::InvalidArgument(format!(
                "resource identity {} does not match key {id}",
                resource.id()
            )));
        }
        let encoded = encode_resource(resource)?;
        let key = id.to_key();
        if self.has(id).await? {
            self.storage.update(&key, |_| Ok(encoded.clone())).await?;
        } else {
            self.storage.create(&key, &encoded).await?;
        }
        Ok(())
    }

    pub async fn submap(&self, ids: &[ResourceId]) -> Result<HashMap<ResourceId, Resource>> {
        let mut resources = HashMap::with_capacity(ids.len());
        for id in ids {
            resources.insert(id.clone(), self.lookup(id).await?);
        }
        Ok(resources)
    }

    pub async fn list_for_type(&self, resource_type: ResourceType) -> Result<Vec<Resource>> {
        let prefix = format!("{resource_type}__");
        let mut resources = Vec::new();
        for (_, raw) in self.storage.list(&prefix).await? {
            resources.push(decode_resource(&raw)?);
        }
        Ok(resources)
    }

    /// All resources of all types. Resource keys share no common prefix, so
    /// the walker lists each type's range rather than sweeping the root
    /// keyspace.
    pub async fn list(&self) -> Result<Vec<Resource>> {
        let mut resources = Vec::new();
        for resource_type in RESOURCE_TYPES {
            resources.extend(self.list_for_type(resource_type).await?);
        }
        Ok(resources)
    }

    /// Update only the status of a resource. Runs through `update` so
    /// concurrent scheduler workers serialize, and refuses to move a
    /// resource out of READY; only a user re-apply through [`Self::set`]
    /// does that.
    pub async fn set_status(
        &self,
        id: &ResourceId,
        status: ResourceStatus,
        error_message: &str,
    ) -> Result<()> {
        let id = id.clone();
        self.storage
            .update(&id.to_key(), move |current| {
                let mut resource = decode_resource(current)?;
                let from = resource.status();
                if from == ResourceStatus::Ready && status != ResourceStatus::Ready {
                    return Err(FeatureformError::InvalidArgument(format!(
                        "cannot transition {id} away from READY"
                    )));
                }
                resource.set_status(status, error_message);
                encode_resource(&resource)
            })
            .await?;
        Ok(())
    }

    pub async fn has_job(&self, id: &ResourceId) -> Result<bool> {
        match self.storage.get(&job_key(id)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Enqueue scheduler work for a resource. Rejects if a job key already
    /// exists for it.
    pub async fn set_job(&self, id: &ResourceId, schedule: &str) -> Result<()> {
        let mut record = CoordinatorJob::new(id.clone());
        record.schedule = schedule.to_string();
        self.storage
            .create(&job_key(id), &encode_json(&record)?)
            .await
    }

    pub async fn get_job(&self, id: &ResourceId) -> Result<CoordinatorJob> {
        decode_json(&self.storage.get(&job_key(id)).await?)
    }

    pub async fn delete_job(&self, id: &ResourceId) -> Result<()> {
        self.storage.delete(&job_key(id)).await
    }

    /// Create or replace the recurring-schedule record for a resource.
    pub async fn set_schedule(&self, id: &ResourceId, schedule: &str) -> Result<()> {
        let record = CoordinatorScheduleJob::new(id.clone(), schedule);
        let encoded = encode_json(&record)?;
        let key = schedule_job_key(id);
        match self.storage.get(&key).await {
            Ok(_) => {
                self.storage.update(&key, |_| Ok(encoded.clone())).await?;
                Ok(())
            }
            Err(e) if e.is_not_found() => self.storage.create(&key, &encoded).await,
            Err(e) => Err(e),
        }
    }

    pub async fn get_schedule(&self, id: &ResourceId) -> Result<CoordinatorScheduleJob> {
        decode_json(&self.storage.get(&schedule_job_key(id)).await?)
    }
}
