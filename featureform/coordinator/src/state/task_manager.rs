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

//! Durable model of tasks and their runs. Every run is stored twice: once
//! under a date-partitioned metadata key and once referenced from the
//! per-task runs index. The two writes buy two fast access paths —
//! "all runs of a task" and "all runs on a day" — and no other access
//! pattern is supported.

use crate::state::metadata_storage::MetadataStorage;
use crate::state::backend::CoordinationStore;
use crate::state::{decode_json, encode_json};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use featureform_core::error::{FeatureformError, Result};
use featureform_core::task::{
    RunId, RunStatus, TaskId, TaskMetadata, TaskRunMetadata, TaskRunRef, TaskRuns,
    TaskTarget, TaskType, Trigger,
};
use log::error;
use std::sync::Arc;

pub const TASK_METADATA_PREFIX: &str = "/tasks/metadata/";
pub const TASK_RUN_METADATA_PREFIX: &str = "/tasks/runs/metadata/";

pub const TASK_ID_NAMESPACE: &str = "task";
pub const TASK_RUN_ID_NAMESPACE: &str = "task_run";

fn task_metadata_key(task_id: TaskId) -> String {
    format!("{TASK_METADATA_PREFIX}task_id={task_id}")
}

fn task_runs_key(task_id: TaskId) -> String {
    format!("/tasks/runs/task_id={task_id}")
}

fn run_day_prefix(day: NaiveDate) -> String {
    format!(
        "{TASK_RUN_METADATA_PREFIX}{:04}/{:02}/{:02}/",
        day.year(),
        day.month(),
        day.day()
    )
}

fn run_metadata_key(task_id: TaskId, run_id: RunId, start: DateTime<Utc>) -> String {
    format!(
        "{TASK_RUN_METADATA_PREFIX}{:04}/{:02}/{:02}/{:02}/{:02}/task_id={}/run_id={}",
        start.year(),
        start.month(),
        start.day(),
        start.hour(),
        start.minute(),
        task_id,
        run_id
    )
}

/// The sole owner of task and run records.
#[derive(Clone)]
pub struct TaskMetadataManager {
    storage: MetadataStorage,
    store: Arc<dyn CoordinationStore>,
}

impl TaskMetadataManager {
    pub fn new(storage: MetadataStorage, store: Arc<dyn CoordinationStore>) -> Self {
        Self { storage, store }
    }

    /// Allocate a task id and durably record the task together with its
    /// empty runs index.
    pub async fn create_task(
        &self,
        name: impl Into<String>,
        task_type: TaskType,
        target: TaskTarget,
    ) -> Result<TaskMetadata> {
        let task_id = self.store.next_ordered_id(TASK_ID_NAMESPACE).await?;
        let task = TaskMetadata::new(task_id, name, task_type, target, Utc::now());
        let index = TaskRuns::empty(task_id);

        self.storage
            .multi_create(vec![
                (task_metadata_key(task_id), encode_json(&task)?),
                (task_runs_key(task_id), encode_json(&index)?),
            ])
            .await?;
        Ok(task)
    }

    pub async fn get_task_by_id(&self, task_id: TaskId) -> Result<TaskMetadata> {
        let raw = self
            .storage
            .get(&task_metadata_key(task_id))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    FeatureformError::NotFound(format!("task {task_id}"))
                } else {
                    e
                }
            })?;
        decode_json(&raw)
    }

    pub async fn get_all_tasks(&self) -> Result<Vec<TaskMetadata>> {
        let mut tasks = Vec::new();
        for (_, raw) in self.storage.list(TASK_METADATA_PREFIX).await? {
            tasks.push(decode_json(&raw)?);
        }
        Ok(tasks)
    }

    /// The most recent task targeting `target`, if any. This is the
    /// discovery path the scheduler's idempotent-apply rule relies on.
    pub async fn get_task_by_target(
        &self,
        target: &TaskTarget,
    ) -> Result<Option<TaskMetadata>> {
        Ok(self
            .get_all_tasks()
            .await?
            .into_iter()
            .filter(|t| &t.target == target)
            .max_by_key(|t| t.id))
    }

    pub async fn get_task_runs(&self, task_id: TaskId) -> Result<TaskRuns> {
        let raw = self.storage.get(&task_runs_key(task_id)).await.map_err(|e| {
            if e.is_not_found() {
                FeatureformError::NotFound(format!("runs index for task {task_id}"))
            } else {
                e
            }
        })?;
        decode_json(&raw)
    }

    /// Record a new run in PENDING. Refuses while the task already has an
    /// active run.
    pub async fn create_task_run(
        &self,
        name: impl Into<String>,
        task_id: TaskId,
        trigger: Trigger,
    ) -> Result<TaskRunMetadata> {
        self.create_task_run_with_start(name, task_id, trigger, Utc::now())
            .await
    }

    async fn create_task_run_with_start(
        &self,
        name: impl Into<String>,
        task_id: TaskId,
        trigger: Trigger,
        start_time: DateTime<Utc>,
    ) -> Result<TaskRunMetadata> {
        self.get_task_by_id(task_id).await?;

        let index = self.get_task_runs(task_id).await?;
        for run_ref in &index.runs {
            let run = self.get_run(task_id, run_ref).await?;
            if run.status.is_active() {
                return Err(FeatureformError::AlreadyExists(format!(
                    "task {task_id} already has an active run {}",
                    run.run_id
                )));
            }
        }

        let run_id = self.store.next_ordered_id(TASK_RUN_ID_NAMESPACE).await?;
        let run = TaskRunMetadata::new(run_id, task_id, name, trigger, start_time);
        let run_key = run_metadata_key(task_id, run_id, start_time);

        // The metadata key goes first so the index never references a
        // missing run.
        self.storage.create(&run_key, &encode_json(&run)?).await?;

        let appended = self
            .storage
            .update(&task_runs_key(task_id), |current| {
                let mut index: TaskRuns = decode_json(current)?;
                index.append(run_id, start_time);
                encode_json(&index)
            })
            .await;

        if let Err(e) = appended {
            if let Err(cleanup) = self.storage.delete(&run_key).await {
                error!("Failed to reverse run-metadata create at {run_key}: {cleanup}");
            }
            return Err(e);
        }
        Ok(run)
    }

    async fn get_run(&self, task_id: TaskId, run_ref: &TaskRunRef) -> Result<TaskRunMetadata> {
        let key = run_metadata_key(task_id, run_ref.run_id, run_ref.date_created);
        decode_json(&self.storage.get(&key).await?)
    }

    async fn run_key(&self, task_id: TaskId, run_id: RunId) -> Result<String> {
        let index = self.get_task_runs(task_id).await?;
        let run_ref = index.find(run_id).ok_or_else(|| {
            FeatureformError::NotFound(format!("run {run_id} of task {task_id}"))
        })?;
        Ok(run_metadata_key(task_id, run_id, run_ref.date_created))
    }

    pub async fn get_run_by_id(
        &self,
        task_id: TaskId,
        run_id: RunId,
    ) -> Result<TaskRunMetadata> {
        let key = self.run_key(task_id, run_id).await?;
        decode_json(&self.storage.get(&key).await?)
    }

    /// All runs whose start time falls in the inclusive `[start, end]`
    /// range. The date-partitioned keys bound the scan to one day at a
    /// time; the start-time filter is authoritative.
    pub async fn get_runs_by_date(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskRunMetadata>> {
        if end < start {
            return Err(FeatureformError::InvalidArgument(format!(
                "invalid date range: {end} precedes {start}"
            )));
        }

        let mut runs: Vec<TaskRunMetadata> = Vec::new();
        let mut day = start.date_naive();
        let last = end.date_naive();
        while day <= last {
            for (_, raw) in self.storage.list(&run_day_prefix(day)).await? {
                let run: TaskRunMetadata = decode_json(&raw)?;
                if run.start_time >= start && run.start_time <= end {
                    runs.push(run);
                }
            }
            day = day.succ_opt().ok_or_else(|| {
                FeatureformError::Internal("date range overflow".to_string())
            })?;
        }

        runs.sort_by_key(|r| (r.start_time, r.run_id));
        Ok(runs)
    }

    /// The run with the greatest start time, per the runs index.
    pub async fn get_latest_run(&self, task_id: TaskId) -> Result<TaskRunMetadata> {
        let index = self.get_task_runs(task_id).await?;
        let latest = index
            .latest()
            .cloned()
            .ok_or(FeatureformError::NoRunsForTask(task_id))?;
        self.get_run(task_id, &latest).await
    }

    /// Apply a status transition to a run. FAILED requires an error; every
    /// other status clears it. The stored start time never changes.
    pub async fn set_run_status(
        &self,
        task_id: TaskId,
        run_id: RunId,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<TaskRunMetadata> {
        let key = self.run_key(task_id, run_id).await?;
        let updated = self
            .storage
            .update(&key, move |current| {
                let mut run: TaskRunMetadata = decode_json(current)?;
                run.update_status(status, error)?;
                encode_json(&run)
            })
            .await?;
        decode_json(&updated)
    }

    pub async fn set_run_end_time(
        &self,
        task_id: TaskId,
        run_id: RunId,
        end_time: DateTime<Utc>,
    ) -> Result<TaskRunMetadata> {
        let key = self.run_key(task_id, run_id).await?;
        let updated = self
            .storage
            .update(&key, move |current| {
                let mut run: TaskRunMetadata = decode_json(current)?;
                run.set_end_time(end_time)?;
                encode_json(&run)
            })
            .await?;
        decode_json(&updated)
    }

    pub async fn append_run_log(
        &self,
        task_id: TaskId,
        run_id: RunId,
        log: impl Into<String>,
    ) -> Result<()> {
        let log = log.into();
        let key = self.run_key(task_id, run_id).await?;
        self.storage
            .update(&key, move |current| {
                let mut run: TaskRunMetadata = decode_json(current)?;
                run.append_log(log)?;
                encode_json(&run)
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::state::backend::memory::MemoryStore;
    use chrono::TimeZone;
    use featureform_core::resource::ResourceType;

    fn manager() -> TaskMetadataManager {
        let store = Arc::new(MemoryStore::new());
        TaskMetadataManager::new(MetadataStorage::new(store.clone()), store)
    }

    fn price_target() -> TaskTarget {
        TaskTarget::NameVariant {
            name: "price".to_string(),
            variant: "v1".to_string(),
            resource_type: ResourceType::FeatureVariant,
        }
    }

    async fn create_price_task(manager: &TaskMetadataManager) -> TaskMetadata {
        manager
            .create_task(
                "Create Resource FEATURE_VARIANT price (v1)",
                TaskType::ResourceCreation,
                price_target(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_task_writes_both_keys() -> Result<()> {
        let manager = manager();
        let task = create_price_task(&manager).await;
        assert_eq!(task.id, 1);

        // The key layout is the on-disk contract.
        manager.storage.get("/tasks/metadata/task_id=1").await?;
        let raw = manager.storage.get("/tasks/runs/task_id=1").await?;
        let index: TaskRuns = decode_json(&raw)?;
        assert_eq!(index.task_id, 1);
        assert!(index.runs.is_empty());

        let again = create_price_task(&manager).await;
        assert_eq!(again.id, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_task_by_id_and_target() -> Result<()> {
        let manager = manager();
        let task = create_price_task(&manager).await;

        let fetched = manager.get_task_by_id(task.id).await?;
        assert_eq!(fetched, task);
        assert!(manager.get_task_by_id(99).await.unwrap_err().is_not_found());

        let by_target = manager.get_task_by_target(&price_target()).await?;
        assert_eq!(by_target.unwrap().id, task.id);

        let other = TaskTarget::Provider {
            name: "warehouse".to_string(),
        };
        assert!(manager.get_task_by_target(&other).await?.is_none());

        assert_eq!(manager.get_all_tasks().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_run_maintains_index_coherence() -> Result<()> {
        let manager = manager();
        let task = create_price_task(&manager).await;

        let run = manager
            .create_task_run("apply price (v1)", task.id, Trigger::on_apply())
            .await?;
        assert_eq!(run.run_id, 1);
        assert_eq!(run.status, RunStatus::Pending);

        // Every index entry must resolve to a date-partitioned key.
        let index = manager.get_task_runs(task.id).await?;
        assert_eq!(index.runs.len(), 1);
        for run_ref in &index.runs {
            let key = run_metadata_key(task.id, run_ref.run_id, run_ref.date_created);
            manager.storage.get(&key).await?;
        }

        let fetched = manager.get_run_by_id(task.id, run.run_id).await?;
        assert_eq!(fetched, run);
        Ok(())
    }

    #[tokio::test]
    async fn test_at_most_one_active_run() -> Result<()> {
        let manager = manager();
        let task = create_price_task(&manager).await;

        let run = manager
            .create_task_run("apply price (v1)", task.id, Trigger::on_apply())
            .await?;

        let err = manager
            .create_task_run("apply price (v1)", task.id, Trigger::on_apply())
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        // A terminal run unblocks the next one.
        manager
            .set_run_status(
                task.id,
                run.run_id,
                RunStatus::Failed,
                Some("provider unreachable".to_string()),
            )
            .await?;
        let second = manager
            .create_task_run("apply price (v1)", task.id, Trigger::on_apply())
            .await?;
        assert_eq!(second.run_id, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_status_transitions() -> Result<()> {
        let manager = manager();
        let task = create_price_task(&manager).await;
        let run = manager
            .create_task_run("apply price (v1)", task.id, Trigger::on_apply())
            .await?;

        manager
            .set_run_status(task.id, run.run_id, RunStatus::Running, None)
            .await?;
        manager
            .set_run_status(task.id, run.run_id, RunStatus::Success, None)
            .await?;

        // SUCCESS is closed under further transitions.
        for status in [RunStatus::Pending, RunStatus::Running, RunStatus::Failed] {
            let err = manager
                .set_run_status(task.id, run.run_id, status, Some("late".to_string()))
                .await
                .unwrap_err();
            assert!(matches!(err, FeatureformError::InvalidArgument(_)));
        }

        let stored = manager.get_run_by_id(task.id, run.run_id).await?;
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.error, "");
        assert_eq!(stored.start_time, run.start_time);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_requires_error() -> Result<()> {
        let manager = manager();
        let task = create_price_task(&manager).await;
        let run = manager
            .create_task_run("apply price (v1)", task.id, Trigger::on_apply())
            .await?;

        let err = manager
            .set_run_status(task.id, run.run_id, RunStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FeatureformError::InvalidArgument(_)));

        let updated = manager
            .set_run_status(
                task.id,
                run.run_id,
                RunStatus::Failed,
                Some("provider unreachable".to_string()),
            )
            .await?;
        assert_eq!(updated.error, "provider unreachable");
        Ok(())
    }

    #[tokio::test]
    async fn test_end_time_validation() -> Result<()> {
        let manager = manager();
        let task = create_price_task(&manager).await;
        let run = manager
            .create_task_run("apply price (v1)", task.id, Trigger::on_apply())
            .await?;

        let before_start = run.start_time - chrono::Duration::seconds(10);
        assert!(manager
            .set_run_end_time(task.id, run.run_id, before_start)
            .await
            .is_err());

        let end = run.start_time + chrono::Duration::seconds(10);
        let updated = manager.set_run_end_time(task.id, run.run_id, end).await?;
        assert_eq!(updated.end_time, end);
        assert!(updated.end_time >= updated.start_time);
        Ok(())
    }

    #[tokio::test]
    async fn test_append_run_log() -> Result<()> {
        let manager = manager();
        let task = create_price_task(&manager).await;
        let run = manager
            .create_task_run("apply price (v1)", task.id, Trigger::on_apply())
            .await?;

        manager
            .append_run_log(task.id, run.run_id, "status set to RUNNING (attempt 1)")
            .await?;
        manager
            .append_run_log(task.id, run.run_id, "materialization complete")
            .await?;
        assert!(manager.append_run_log(task.id, run.run_id, "").await.is_err());

        let stored = manager.get_run_by_id(task.id, run.run_id).await?;
        assert_eq!(stored.logs.len(), 2);
        assert_eq!(stored.logs[0], "status set to RUNNING (attempt 1)");
        Ok(())
    }

    #[tokio::test]
    async fn test_latest_run_and_no_runs_error() -> Result<()> {
        let manager = manager();
        let task = create_price_task(&manager).await;

        let err = manager.get_latest_run(task.id).await.unwrap_err();
        assert!(matches!(err, FeatureformError::NoRunsForTask(id) if id == task.id));

        let first = manager
            .create_task_run("apply price (v1)", task.id, Trigger::on_apply())
            .await?;
        manager
            .set_run_status(
                task.id,
                first.run_id,
                RunStatus::Failed,
                Some("flaky".to_string()),
            )
            .await?;
        let second = manager
            .create_task_run("apply price (v1)", task.id, Trigger::on_apply())
            .await?;

        let latest = manager.get_latest_run(task.id).await?;
        assert_eq!(latest.run_id, second.run_id);
        Ok(())
    }

    #[tokio::test]
    async fn test_runs_by_date_filters_inclusively() -> Result<()> {
        let manager = manager();

        // Three tasks so all three runs can coexist.
        let mut run_ids = Vec::new();
        let starts = [
            Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap(),
        ];
        for start in starts {
            let task = create_price_task(&manager).await;
            let run = manager
                .create_task_run_with_start(
                    "apply price (v1)",
                    task.id,
                    Trigger::on_apply(),
                    start,
                )
                .await?;
            run_ids.push(run.run_id);
        }

        let matched = manager
            .get_runs_by_date(
                Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 2, 23, 59, 59).unwrap(),
            )
            .await?;
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].run_id, run_ids[1]);
        assert_eq!(matched[0].start_time, starts[1]);

        // The full span returns all three in start-time order.
        let all = manager
            .get_runs_by_date(
                starts[0],
                Utc.with_ymd_and_hms(2024, 1, 3, 23, 59, 59).unwrap(),
            )
            .await?;
        assert_eq!(
            all.iter().map(|r| r.run_id).collect::<Vec<_>>(),
            run_ids
        );

        assert!(manager
            .get_runs_by_date(starts[1], starts[0])
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_key_is_date_partitioned() {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            run_metadata_key(7, 9, start),
            "/tasks/runs/metadata/2024/01/02/03/04/task_id=7/run_id=9"
        );
    }
}
