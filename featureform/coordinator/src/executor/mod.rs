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

//! Executors run job plans. The set is a closed variant: in-process for a
//! worker task in this process, remote for a container-orchestrated job
//! that is polled to completion. Adding an executor is an additive change
//! to the variant.

use crate::state::task_manager::TaskMetadataManager;
use async_trait::async_trait;
use featureform_core::error::{FeatureformError, Result};
use featureform_core::resource::ResourceId;
use featureform_core::task::{RunId, TaskId, TaskType};
use featureform_core::utils::CancelToken;
use futures::future::BoxFuture;
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Remote log relays coalesce to at most one write per run in this window.
const DEFAULT_LOG_COALESCE: Duration = Duration::from_millis(250);

/// Appends execution logs to a run's metadata.
#[derive(Clone)]
pub struct RunLogger {
    tasks: TaskMetadataManager,
    task_id: TaskId,
    run_id: RunId,
}

impl RunLogger {
    pub fn new(tasks: TaskMetadataManager, task_id: TaskId, run_id: RunId) -> Self {
        Self {
            tasks,
            task_id,
            run_id,
        }
    }

    pub async fn append(&self, log: impl Into<String>) -> Result<()> {
        self.tasks
            .append_run_log(self.task_id, self.run_id, log)
            .await
    }
}

pub type PlanAction =
    Box<dyn FnOnce(CancelToken, RunLogger) -> BoxFuture<'static, Result<()>> + Send>;

/// An executable unit of provider work for one run. The action closure
/// drives the in-process executor; the serializable spec drives the remote
/// one.
pub struct JobPlan {
    pub resource: ResourceId,
    pub task_id: TaskId,
    pub run_id: RunId,
    pub task_type: TaskType,
    action: Option<PlanAction>,
}

impl JobPlan {
    pub fn new(
        resource: ResourceId,
        task_id: TaskId,
        run_id: RunId,
        task_type: TaskType,
        action: PlanAction,
    ) -> Self {
        Self {
            resource,
            task_id,
            run_id,
            task_type,
            action: Some(action),
        }
    }

    pub fn spec(&self) -> OrchestratorJobSpec {
        OrchestratorJobSpec {
            resource: self.resource.clone(),
            task_id: self.task_id,
            run_id: self.run_id,
            task_type: self.task_type,
        }
    }
}

/// The job description handed to a container orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorJobSpec {
    pub resource: ResourceId,
    #[serde(rename = "taskId")]
    pub task_id: TaskId,
    #[serde(rename = "runId")]
    pub run_id: RunId,
    #[serde(rename = "taskType")]
    pub task_type: TaskType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorJobStatus {
    Running,
    Succeeded,
    Failed(String),
}

/// The orchestration layer the remote executor submits to. Concrete
/// integrations (Kubernetes jobs) live outside this repository.
#[async_trait]
pub trait JobOrchestrator: Send + Sync {
    /// Submit a job and return an opaque handle for polling.
    async fn submit(&self, spec: OrchestratorJobSpec) -> Result<String>;

    async fn status(&self, handle: &str) -> Result<OrchestratorJobStatus>;

    /// All log lines produced so far, in order.
    async fn logs(&self, handle: &str) -> Result<Vec<String>>;
}

pub enum Executor {
    InProcess(InProcessExecutor),
    Remote(RemoteExecutor),
}

impl Executor {
    pub fn in_process() -> Self {
        Executor::InProcess(InProcessExecutor::default())
    }

    pub fn remote(orchestrator: Arc<dyn JobOrchestrator>) -> Self {
        Executor::Remote(RemoteExecutor::new(orchestrator))
    }

    pub async fn run(
        &self,
        plan: JobPlan,
        cancel: CancelToken,
        logger: RunLogger,
    ) -> Result<()> {
        match self {
            Executor::InProcess(executor) => executor.run(plan, cancel, logger).await,
            Executor::Remote(executor) => executor.run(plan, cancel, logger).await,
        }
    }
}

#[derive(Default)]
pub struct InProcessExecutor {}

impl InProcessExecutor {
    pub async fn run(
        &self,
        mut plan: JobPlan,
        cancel: CancelToken,
        logger: RunLogger,
    ) -> Result<()> {
        let action = plan.action.take().ok_or_else(|| {
            FeatureformError::Internal(format!(
                "plan for {} has no executable action",
                plan.resource
            ))
        })?;

        tokio::select! {
            result = action(cancel.clone(), logger) => result,
            _ = cancel.cancelled() => Err(FeatureformError::LeaseLost(
                "lease lost".to_string(),
            )),
        }
    }
}

pub struct RemoteExecutor {
    orchestrator: Arc<dyn JobOrchestrator>,
    poll_interval: Duration,
    log_coalesce: Duration,
}

impl RemoteExecutor {
    pub fn new(orchestrator: Arc<dyn JobOrchestrator>) -> Self {
        Self {
            orchestrator,
            poll_interval: DEFAULT_POLL_INTERVAL,
            log_coalesce: DEFAULT_LOG_COALESCE,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_log_coalesce(mut self, log_coalesce: Duration) -> Self {
        self.log_coalesce = log_coalesce;
        self
    }

    pub async fn run(
        &self,
        plan: JobPlan,
        cancel: CancelToken,
        logger: RunLogger,
    ) -> Result<()> {
        let spec = plan.spec();
        let resource = plan.resource.clone();
        let handle = self.orchestrator.submit(spec).await?;

        let mut forwarded = 0usize;
        let mut last_flush = Instant::now() - self.log_coalesce;

        loop {
            cancel.check()?;

            let status = self.orchestrator.status(&handle).await?;
            let terminal = !matches!(status, OrchestratorJobStatus::Running);

            // Coalesce relayed logs to one write per window, flushing
            // unconditionally at the end.
            if terminal || last_flush.elapsed() >= self.log_coalesce {
                let lines = self.orchestrator.logs(&handle).await?;
                if lines.len() > forwarded {
                    let batch = lines[forwarded..].join("\n");
                    forwarded = lines.len();
                    last_flush = Instant::now();
                    if let Err(e) = logger.append(batch).await {
                        warn!("Failed to relay logs for {resource}: {e}");
                    }
                }
            }

            match status {
                OrchestratorJobStatus::Running => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                OrchestratorJobStatus::Succeeded => return Ok(()),
                OrchestratorJobStatus::Failed(message) => {
                    return Err(FeatureformError::execution(
                        "kubernetes",
                        resource.to_string(),
                        message,
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::state::backend::memory::MemoryStore;
    use crate::state::metadata_storage::MetadataStorage;
    use featureform_core::resource::ResourceType;
    use featureform_core::task::{TaskTarget, Trigger};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    async fn test_logger() -> (TaskMetadataManager, RunLogger, TaskId, RunId) {
        let store = Arc::new(MemoryStore::new());
        let tasks = TaskMetadataManager::new(MetadataStorage::new(store.clone()), store);
        let task = tasks
            .create_task(
                "Create Resource FEATURE_VARIANT price (v1)",
                TaskType::ResourceCreation,
                TaskTarget::NameVariant {
                    name: "price".to_string(),
                    variant: "v1".to_string(),
                    resource_type: ResourceType::FeatureVariant,
                },
            )
            .await
            .unwrap();
        let run = tasks
            .create_task_run("apply price (v1)", task.id, Trigger::on_apply())
            .await
            .unwrap();
        let logger = RunLogger::new(tasks.clone(), task.id, run.run_id);
        (tasks, logger, task.id, run.run_id)
    }

    fn test_plan(action: PlanAction) -> JobPlan {
        JobPlan::new(
            ResourceId::new(ResourceType::FeatureVariant, "price", "v1"),
            1,
            1,
            TaskType::ResourceCreation,
            action,
        )
    }

    #[tokio::test]
    async fn test_in_process_runs_action() {
        let (tasks, logger, task_id, run_id) = test_logger().await;
        let executor = Executor::in_process();

        let plan = test_plan(Box::new(|_cancel, logger| {
            Box::pin(async move {
                logger.append("working").await?;
                Ok(())
            })
        }));

        executor
            .run(plan, CancelToken::new(), logger)
            .await
            .unwrap();

        let run = tasks.get_run_by_id(task_id, run_id).await.unwrap();
        assert_eq!(run.logs, vec!["working".to_string()]);
    }

    #[tokio::test]
    async fn test_in_process_propagates_errors() {
        let (_tasks, logger, _task_id, _run_id) = test_logger().await;
        let executor = Executor::in_process();

        let plan = test_plan(Box::new(|_cancel, _logger| {
            Box::pin(async move {
                Err(FeatureformError::Transient("provider timeout".to_string()))
            })
        }));

        let err = executor
            .run(plan, CancelToken::new(), logger)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_in_process_unwinds_on_cancellation() {
        let (_tasks, logger, _task_id, _run_id) = test_logger().await;
        let executor = Executor::in_process();

        let plan = test_plan(Box::new(|_cancel, _logger| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
        }));

        let cancel = CancelToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trip.cancel();
        });

        let started = Instant::now();
        let err = executor.run(plan, cancel, logger).await.unwrap_err();
        assert!(matches!(err, FeatureformError::LeaseLost(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    struct ScriptedOrchestrator {
        statuses: Mutex<VecDeque<OrchestratorJobStatus>>,
        logs: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobOrchestrator for ScriptedOrchestrator {
        async fn submit(&self, spec: OrchestratorJobSpec) -> Result<String> {
            Ok(format!("job-{}-{}", spec.task_id, spec.run_id))
        }

        async fn status(&self, _handle: &str) -> Result<OrchestratorJobStatus> {
            let mut statuses = self.statuses.lock();
            self.logs
                .lock()
                .push(format!("poll {}", statuses.len()));
            Ok(statuses
                .pop_front()
                .unwrap_or(OrchestratorJobStatus::Succeeded))
        }

        async fn logs(&self, _handle: &str) -> Result<Vec<String>> {
            Ok(self.logs.lock().clone())
        }
    }

    #[tokio::test]
    async fn test_remote_polls_to_success_and_relays_logs() {
        let (tasks, logger, task_id, run_id) = test_logger().await;

        let orchestrator = Arc::new(ScriptedOrchestrator {
            statuses: Mutex::new(VecDeque::from(vec![
                OrchestratorJobStatus::Running,
                OrchestratorJobStatus::Running,
                OrchestratorJobStatus::Succeeded,
            ])),
            logs: Mutex::new(Vec::new()),
        });

        let executor = RemoteExecutor::new(orchestrator)
            .with_poll_interval(Duration::from_millis(5))
            .with_log_coalesce(Duration::from_millis(0));

        let plan = test_plan(Box::new(|_cancel, _logger| Box::pin(async { Ok(()) })));
        executor
            .run(plan, CancelToken::new(), logger)
            .await
            .unwrap();

        let run = tasks.get_run_by_id(task_id, run_id).await.unwrap();
        assert!(!run.logs.is_empty());
        assert!(run.logs.join("\n").contains("poll"));
    }

    #[tokio::test]
    async fn test_remote_surfaces_failure() {
        let (_tasks, logger, _task_id, _run_id) = test_logger().await;

        let orchestrator = Arc::new(ScriptedOrchestrator {
            statuses: Mutex::new(VecDeque::from(vec![OrchestratorJobStatus::Failed(
                "container OOMKilled".to_string(),
            )])),
            logs: Mutex::new(Vec::new()),
        });

        let executor = RemoteExecutor::new(orchestrator)
            .with_poll_interval(Duration::from_millis(5));

        let plan = test_plan(Box::new(|_cancel, _logger| Box::pin(async { Ok(()) })));
        let err = executor
            .run(plan, CancelToken::new(), logger)
            .await
            .unwrap_err();
        assert!(matches!(err, FeatureformError::ExecutionError { .. }));
        assert!(err.to_string().contains("OOMKilled"));
    }
}
