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

//! Scheduler queue records. `JOB__` keys carry one-shot on-apply work;
//! `SCHEDULEJOB__` keys carry recurring schedules and form an independent
//! queue.

use featureform_core::error::{FeatureformError, Result};
use featureform_core::resource::ResourceId;
use serde::{Deserialize, Serialize};

pub const JOB_KEY_PREFIX: &str = "JOB__";
pub const SCHEDULE_JOB_KEY_PREFIX: &str = "SCHEDULEJOB__";

/// The scheduler's queue record for a resource. Created by the metadata
/// tier on apply and deleted by the scheduler after a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorJob {
    pub attempts: u32,
    pub resource: ResourceId,
    /// Empty for one-shot work.
    pub schedule: String,
}

impl CoordinatorJob {
    pub fn new(resource: ResourceId) -> Self {
        Self {
            attempts: 0,
            resource,
            schedule: String::new(),
        }
    }
}

/// Same shape as [`CoordinatorJob`] but keyed under `SCHEDULEJOB__` so the
/// scheduler can tell recurring schedules from on-apply work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorScheduleJob {
    pub attempts: u32,
    pub resource: ResourceId,
    pub schedule: String,
}

impl CoordinatorScheduleJob {
    pub fn new(resource: ResourceId, schedule: impl Into<String>) -> Self {
        Self {
            attempts: 0,
            resource,
            schedule: schedule.into(),
        }
    }
}

pub fn job_key(id: &ResourceId) -> String {
    format!("{JOB_KEY_PREFIX}{}", id.to_key())
}

pub fn schedule_job_key(id: &ResourceId) -> String {
    format!("{SCHEDULE_JOB_KEY_PREFIX}{}", id.to_key())
}

pub fn resource_id_from_job_key(key: &str) -> Result<ResourceId> {
    let rest = key.strip_prefix(JOB_KEY_PREFIX).ok_or_else(|| {
        FeatureformError::InvalidArgument(format!("not a job key: `{key}`"))
    })?;
    ResourceId::from_key(rest)
}

pub fn resource_id_from_schedule_job_key(key: &str) -> Result<ResourceId> {
    let rest = key.strip_prefix(SCHEDULE_JOB_KEY_PREFIX).ok_or_else(|| {
        FeatureformError::InvalidArgument(format!("not a schedule-job key: `{key}`"))
    })?;
    ResourceId::from_key(rest)
}
