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

//! Tasks and task runs: the durable model of scheduler work. The JSON field
//! names used here are part of the stored-document contract.

use crate::error::{FeatureformError, Result};
use crate::resource::ResourceType;
use crate::utils::{is_zero_time, zero_time};
use chrono::{DateTime, Utc};
use serde::de::Error as DeError;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ordered id allocated from the "task" namespace.
pub type TaskId = u64;
/// Ordered id allocated from the "task_run" namespace, unique within a task.
pub type RunId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    ResourceCreation,
    HealthCheck,
    Monitoring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetType {
    NameVariant,
    Provider,
}

/// What a task acts on: a `(name, variant, type)` resource or a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskTarget {
    NameVariant {
        name: String,
        variant: String,
        resource_type: ResourceType,
    },
    Provider {
        name: String,
    },
}

impl TaskTarget {
    pub fn target_type(&self) -> TargetType {
        match self {
            TaskTarget::NameVariant { .. } => TargetType::NameVariant,
            TaskTarget::Provider { .. } => TargetType::Provider,
        }
    }

    fn from_value(target_type: TargetType, value: serde_json::Value) -> Result<Self> {
        let target = match target_type {
            TargetType::NameVariant => {
                let doc: NameVariantTargetDoc = serde_json::from_value(value)?;
                TaskTarget::NameVariant {
                    name: doc.name,
                    variant: doc.variant,
                    resource_type: doc.resource_type,
                }
            }
            TargetType::Provider => {
                let doc: ProviderTargetDoc = serde_json::from_value(value)?;
                TaskTarget::Provider { name: doc.name }
            }
        };
        Ok(target)
    }
}

#[derive(Serialize, Deserialize)]
struct NameVariantTargetDoc {
    name: String,
    variant: String,
    #[serde(rename = "type")]
    resource_type: ResourceType,
}

#[derive(Serialize, Deserialize)]
struct ProviderTargetDoc {
    name: String,
}

impl Serialize for TaskTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            TaskTarget::NameVariant {
                name,
                variant,
                resource_type,
            } => NameVariantTargetDoc {
                name: name.clone(),
                variant: variant.clone(),
                resource_type: *resource_type,
            }
            .serialize(serializer),
            TaskTarget::Provider { name } => {
                ProviderTargetDoc { name: name.clone() }.serialize(serializer)
            }
        }
    }
}

/// A unit of work targeting a resource. Owned exclusively by the task
/// metadata manager.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMetadata {
    pub id: TaskId,
    pub name: String,
    pub task_type: TaskType,
    pub target: TaskTarget,
    pub date_created: DateTime<Utc>,
}

impl TaskMetadata {
    pub fn new(
        id: TaskId,
        name: impl Into<String>,
        task_type: TaskType,
        target: TaskTarget,
        date_created: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            task_type,
            target,
            date_created,
        }
    }
}

impl Serialize for TaskMetadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut doc = serializer.serialize_struct("TaskMetadata", 6)?;
        doc.serialize_field("taskId", &self.id)?;
        doc.serialize_field("name", &self.name)?;
        doc.serialize_field("taskType", &self.task_type)?;
        doc.serialize_field("target", &self.target)?;
        doc.serialize_field("targetType", &self.target.target_type())?;
        doc.serialize_field("dateCreated", &self.date_created)?;
        doc.end()
    }
}

#[derive(Deserialize)]
struct TaskMetadataDoc {
    #[serde(rename = "taskId")]
    task_id: TaskId,
    name: String,
    #[serde(rename = "taskType")]
    task_type: TaskType,
    target: serde_json::Value,
    #[serde(rename = "targetType")]
    target_type: TargetType,
    #[serde(rename = "dateCreated")]
    date_created: DateTime<Utc>,
}

impl<'de> Deserialize<'de> for TaskMetadata {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let doc = TaskMetadataDoc::deserialize(deserializer)?;
        let target = TaskTarget::from_value(doc.target_type, doc.target)
            .map_err(|e| D::Error::custom(e.to_string()))?;
        Ok(TaskMetadata {
            id: doc.task_id,
            name: doc.name,
            task_type: doc.task_type,
            target,
            date_created: doc.date_created,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerType {
    OnApplyTrigger,
    DummyTrigger,
}

/// What caused a run. The serialized form is an embedded object
/// disambiguated by the sibling `triggerType` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    OnApply { trigger_name: String },
    Dummy { dummy_name: String },
}

impl Trigger {
    pub fn on_apply() -> Self {
        Trigger::OnApply {
            trigger_name: "apply".to_string(),
        }
    }

    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Trigger::OnApply { .. } => TriggerType::OnApplyTrigger,
            Trigger::Dummy { .. } => TriggerType::DummyTrigger,
        }
    }

    fn from_value(trigger_type: TriggerType, value: serde_json::Value) -> Result<Self> {
        let trigger = match trigger_type {
            TriggerType::OnApplyTrigger => {
                let doc: OnApplyTriggerDoc = serde_json::from_value(value)?;
                Trigger::OnApply {
                    trigger_name: doc.trigger_name,
                }
            }
            TriggerType::DummyTrigger => {
                let doc: DummyTriggerDoc = serde_json::from_value(value)?;
                Trigger::Dummy {
                    dummy_name: doc.dummy_name,
                }
            }
        };
        Ok(trigger)
    }
}

#[derive(Serialize, Deserialize)]
struct OnApplyTriggerDoc {
    #[serde(rename = "triggerName")]
    trigger_name: String,
}

#[derive(Serialize, Deserialize)]
struct DummyTriggerDoc {
    #[serde(rename = "dummyName")]
    dummy_name: String,
}

impl Serialize for Trigger {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Trigger::OnApply { trigger_name } => OnApplyTriggerDoc {
                trigger_name: trigger_name.clone(),
            }
            .serialize(serializer),
            Trigger::Dummy { dummy_name } => DummyTriggerDoc {
                dummy_name: dummy_name.clone(),
            }
            .serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    /// The status transition table. SUCCESS is closed; FAILED may re-enter
    /// PENDING on retry.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        matches!(
            (self, to),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Success)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Success)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Failed, RunStatus::Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }

    /// PENDING or RUNNING. At most one active run may exist per resource.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// One execution of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRunMetadata {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub name: String,
    pub trigger: Trigger,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub logs: Vec<String>,
    pub error: String,
}

impl TaskRunMetadata {
    pub fn new(
        run_id: RunId,
        task_id: TaskId,
        name: impl Into<String>,
        trigger: Trigger,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            task_id,
            name: name.into(),
            trigger,
            status: RunStatus::Pending,
            start_time,
            end_time: zero_time(),
            logs: Vec::new(),
            error: String::new(),
        }
    }

    /// Apply a status transition, enforcing the transition table and the
    /// error-message invariant: FAILED carries an error, every other status
    /// carries none.
    pub fn update_status(&mut self, status: RunStatus, error: Option<String>) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(FeatureformError::InvalidArgument(format!(
                "invalid status transition {:?} -> {:?} for run {} of task {}",
                self.status, status, self.run_id, self.task_id
            )));
        }

        match status {
            RunStatus::Failed => {
                let message = error.unwrap_or_default();
                if message.is_empty() {
                    return Err(FeatureformError::InvalidArgument(format!(
                        "marking run {} of task {} FAILED requires an error",
                        self.run_id, self.task_id
                    )));
                }
                self.error = message;
            }
            _ => {
                if error.map(|e| !e.is_empty()).unwrap_or(false) {
                    return Err(FeatureformError::InvalidArgument(format!(
                        "status {status:?} cannot carry an error"
                    )));
                }
                self.error = String::new();
            }
        }

        self.status = status;
        Ok(())
    }

    /// Record the end of the run. The end time must be set and must not
    /// precede the start time.
    pub fn set_end_time(&mut self, end_time: DateTime<Utc>) -> Result<()> {
        if is_zero_time(end_time) {
            return Err(FeatureformError::InvalidArgument(
                "end time cannot be the zero timestamp".to_string(),
            ));
        }
        if end_time < self.start_time {
            return Err(FeatureformError::InvalidArgument(format!(
                "end time {end_time} precedes start time {}",
                self.start_time
            )));
        }
        self.end_time = end_time;
        Ok(())
    }

    pub fn append_log(&mut self, log: impl Into<String>) -> Result<()> {
        let log = log.into();
        if log.is_empty() {
            return Err(FeatureformError::InvalidArgument(
                "cannot append an empty log entry".to_string(),
            ));
        }
        self.logs.push(log);
        Ok(())
    }

    pub fn has_ended(&self) -> bool {
        !is_zero_time(self.end_time)
    }
}

impl Serialize for TaskRunMetadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut doc = serializer.serialize_struct("TaskRunMetadata", 10)?;
        doc.serialize_field("runId", &self.run_id)?;
        doc.serialize_field("taskId", &self.task_id)?;
        doc.serialize_field("name", &self.name)?;
        doc.serialize_field("trigger", &self.trigger)?;
        doc.serialize_field("triggerType", &self.trigger.trigger_type())?;
        doc.serialize_field("status", &self.status)?;
        doc.serialize_field("startTime", &self.start_time)?;
        doc.serialize_field("endTime", &self.end_time)?;
        doc.serialize_field("logs", &self.logs)?;
        doc.serialize_field("error", &self.error)?;
        doc.end()
    }
}

#[derive(Deserialize)]
struct TaskRunMetadataDoc {
    #[serde(rename = "runId")]
    run_id: RunId,
    #[serde(rename = "taskId")]
    task_id: TaskId,
    name: String,
    trigger: serde_json::Value,
    #[serde(rename = "triggerType")]
    trigger_type: TriggerType,
    status: RunStatus,
    #[serde(rename = "startTime")]
    start_time: DateTime<Utc>,
    #[serde(rename = "endTime")]
    end_time: DateTime<Utc>,
    logs: Vec<String>,
    error: String,
}

impl<'de> Deserialize<'de> for TaskRunMetadata {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let doc = TaskRunMetadataDoc::deserialize(deserializer)?;
        let trigger = Trigger::from_value(doc.trigger_type, doc.trigger)
            .map_err(|e| D::Error::custom(e.to_string()))?;
        Ok(TaskRunMetadata {
            run_id: doc.run_id,
            task_id: doc.task_id,
            name: doc.name,
            trigger,
            status: doc.status,
            start_time: doc.start_time,
            end_time: doc.end_time,
            logs: doc.logs,
            error: doc.error,
        })
    }
}

/// Per-task index of runs in insertion order. Lets a task's runs be
/// enumerated without scanning the date-partitioned keyspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRuns {
    #[serde(rename = "taskId")]
    pub task_id: TaskId,
    pub runs: Vec<TaskRunRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunRef {
    #[serde(rename = "runId")]
    pub run_id: RunId,
    #[serde(rename = "dateCreated")]
    pub date_created: DateTime<Utc>,
}

impl TaskRuns {
    pub fn empty(task_id: TaskId) -> Self {
        Self {
            task_id,
            runs: Vec::new(),
        }
    }

    pub fn append(&mut self, run_id: RunId, date_created: DateTime<Utc>) {
        self.runs.push(TaskRunRef {
            run_id,
            date_created,
        });
    }

    pub fn find(&self, run_id: RunId) -> Option<&TaskRunRef> {
        self.runs.iter().find(|r| r.run_id == run_id)
    }

    pub fn latest(&self) -> Option<&TaskRunRef> {
        self.runs.iter().max_by_key(|r| (r.date_created, r.run_id))
    }
}
