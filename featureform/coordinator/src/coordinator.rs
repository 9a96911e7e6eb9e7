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

//! The scheduling loop. Job keys written by the metadata tier are
//! discovered by an initial sweep plus a watch, leased with a per-resource
//! lock, planned by resource type, executed with bounded retries, and
//! finalized with status, end time, and job-key deletion under the lock.

use crate::config::CoordinatorConfig;
use crate::executor::{Executor, JobPlan, PlanAction, RunLogger};
use crate::job::{
    job_key, resource_id_from_job_key, resource_id_from_schedule_job_key,
    CoordinatorJob, JOB_KEY_PREFIX, SCHEDULE_JOB_KEY_PREFIX,
};
use crate::metrics::CoordinatorMetricsCollector;
use crate::state::backend::{CoordinationStore, WatchEvent, WatchStream};
use crate::state::{encode_json, with_lock, CoordinatorState};
use chrono::Utc;
use dashmap::DashMap;
use featureform_core::error::{FeatureformError, Result};
use featureform_core::proto;
use featureform_core::proto::source_variant::Definition;
use featureform_core::resource::{Resource, ResourceId, ResourceStatus, ResourceType};
use featureform_core::task::{
    RunStatus, TaskMetadata, TaskRunMetadata, TaskTarget, TaskType, Trigger,
};
use featureform_core::utils::{timestamp_millis, CancelToken};
use featureform_provider::{
    OfflineResourceId, OfflineResourceKind, ProviderResolver, ResourceSchema,
    SourceMapping, TrainingSetDef, TransformationConfig,
};
use futures::StreamExt;
use log::{debug, error, info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct Coordinator {
    state: CoordinatorState,
    store: Arc<dyn CoordinationStore>,
    providers: Arc<dyn ProviderResolver>,
    executor: Arc<Executor>,
    metrics: Arc<dyn CoordinatorMetricsCollector>,
    config: CoordinatorConfig,
    queue_tx: mpsc::UnboundedSender<ResourceId>,
    queue_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ResourceId>>>,
    fatal_tx: mpsc::UnboundedSender<FeatureformError>,
    fatal_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<FeatureformError>>>,
    // Job keys currently being processed by this instance. Watch replays
    // and the startup sweep can surface the same key more than once.
    in_flight: DashMap<String, ()>,
    pending: AtomicU64,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        providers: Arc<dyn ProviderResolver>,
        executor: Arc<Executor>,
        config: CoordinatorConfig,
        metrics: Arc<dyn CoordinatorMetricsCollector>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: CoordinatorState::new(store.clone()),
            store,
            providers,
            executor,
            metrics,
            config,
            queue_tx,
            queue_rx: parking_lot::Mutex::new(Some(queue_rx)),
            fatal_tx,
            fatal_rx: parking_lot::Mutex::new(Some(fatal_rx)),
            in_flight: DashMap::new(),
            pending: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    /// Spawn the workers, the watch loops, and run the initial sweep. Also
    /// recovers runs abandoned by a dead coordinator before accepting work.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.recover_abandoned_runs().await?;

        let receiver = self.queue_rx.lock().take().ok_or_else(|| {
            FeatureformError::Internal("coordinator already started".to_string())
        })?;
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        for _ in 0..self.config.worker_pool_size {
            let this = self.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move { this.worker_loop(receiver).await });
        }

        // Watches start before the sweep so a key created in between is
        // seen by one of the two.
        let job_watch = self.store.watch(JOB_KEY_PREFIX).await?;
        let schedule_watch = self.store.watch(SCHEDULE_JOB_KEY_PREFIX).await?;
        {
            let this = self.clone();
            tokio::spawn(async move { this.watch_jobs(job_watch).await });
        }
        {
            let this = self.clone();
            tokio::spawn(async move { this.watch_schedules(schedule_watch).await });
        }

        for (key, _) in self.store.get_with_prefix(JOB_KEY_PREFIX).await? {
            match resource_id_from_job_key(&key) {
                Ok(id) => self.enqueue(id),
                Err(e) => warn!("Ignoring malformed job key {key}: {e}"),
            }
        }
        for (key, _) in self.store.get_with_prefix(SCHEDULE_JOB_KEY_PREFIX).await? {
            match resource_id_from_schedule_job_key(&key) {
                Ok(id) => self.process_schedule_job(&id).await,
                Err(e) => warn!("Ignoring malformed schedule-job key {key}: {e}"),
            }
        }

        info!(
            "Coordinator started with {} workers",
            self.config.worker_pool_size
        );
        Ok(())
    }

    /// Start and block until a fatal error (lost watch stream, lost lease)
    /// surfaces.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.clone().start().await?;
        let mut fatal = self.fatal_rx.lock().take().ok_or_else(|| {
            FeatureformError::Internal("coordinator already running".to_string())
        })?;
        match fatal.recv().await {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn enqueue(&self, id: ResourceId) {
        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.set_pending_jobs_queue_size(pending);
        if self.queue_tx.send(id).is_err() {
            warn!("Job queue is closed, dropping work");
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ResourceId>>>,
    ) {
        loop {
            let next = {
                let mut receiver = receiver.lock().await;
                receiver.recv().await
            };
            let Some(id) = next else { return };

            let pending = self.pending.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            self.metrics.set_pending_jobs_queue_size(pending);

            if let Err(e) = self.clone().process_job(id.clone()).await {
                error!("Failed to process job for {id}: {e}");
            }
        }
    }

    async fn watch_jobs(self: Arc<Self>, mut stream: WatchStream) {
        while let Some(event) = stream.next().await {
            if let WatchEvent::Put { key, .. } = event {
                match resource_id_from_job_key(&key) {
                    Ok(id) => self.enqueue(id),
                    Err(e) => warn!("Ignoring malformed job key {key}: {e}"),
                }
            }
        }
        warn!("Job watch stream ended");
        let _ = self.fatal_tx.send(FeatureformError::Transient(
            "job watch stream ended".to_string(),
        ));
    }

    async fn watch_schedules(self: Arc<Self>, mut stream: WatchStream) {
        while let Some(event) = stream.next().await {
            if let WatchEvent::Put { key, .. } = event {
                match resource_id_from_schedule_job_key(&key) {
                    Ok(id) => self.process_schedule_job(&id).await,
                    Err(e) => warn!("Ignoring malformed schedule-job key {key}: {e}"),
                }
            }
        }
        warn!("Schedule watch stream ended");
    }

    /// Recurring schedules form a queue of their own; observing one records
    /// it without promoting it to on-apply work.
    async fn process_schedule_job(&self, id: &ResourceId) {
        match self.state.lookup.get_schedule(id).await {
            Ok(record) if record.schedule.is_empty() => {
                warn!("Schedule job for {id} carries an empty schedule")
            }
            Ok(record) => {
                info!("Observed schedule `{}` for {id}", record.schedule)
            }
            Err(e) => warn!("Failed to read schedule job for {id}: {e}"),
        }
    }

    /// On startup, fail runs whose owner died while they were RUNNING and
    /// requeue their resources. A live owner still holds the job lock and
    /// is skipped.
    async fn recover_abandoned_runs(&self) -> Result<()> {
        for task in self.state.tasks.get_all_tasks().await? {
            let latest = match self.state.tasks.get_latest_run(task.id).await {
                Ok(run) => run,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if latest.status != RunStatus::Running {
                continue;
            }

            let id = resource_id_of_target(&task.target);
            let lock = match self.store.lock(&job_key(&id)).await {
                Ok(lock) => lock,
                Err(e) if e.is_lock_contended() => continue,
                Err(e) => return Err(e),
            };

            with_lock(lock, async {
                let current = self
                    .state
                    .tasks
                    .get_run_by_id(task.id, latest.run_id)
                    .await?;
                if current.status != RunStatus::Running {
                    return Ok(());
                }

                warn!(
                    "Run {} of task {} lost its owner, marking it failed",
                    latest.run_id, task.id
                );
                self.state
                    .tasks
                    .set_run_status(
                        task.id,
                        latest.run_id,
                        RunStatus::Failed,
                        Some("owner lost".to_string()),
                    )
                    .await?;
                if let Err(e) = self
                    .state
                    .tasks
                    .set_run_end_time(task.id, latest.run_id, Utc::now())
                    .await
                {
                    warn!("Failed to close out abandoned run {}: {e}", latest.run_id);
                }

                match self.state.lookup.set_job(&id, "").await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_already_exists() => Ok(()),
                    Err(e) => Err(e),
                }
            })
            .await?;
        }
        Ok(())
    }

    async fn process_job(self: Arc<Self>, id: ResourceId) -> Result<()> {
        let key = job_key(&id);
        if self.in_flight.insert(key.clone(), ()).is_some() {
            return Ok(());
        }
        let result = self.process_job_locked(&id).await;
        self.in_flight.remove(&key);

        match result {
            Err(e) if e.is_lock_contended() => {
                debug!("Job for {id} is held by another coordinator, requeueing");
                let this = self.clone();
                let backoff = self.config.lock_retry_backoff;
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    this.enqueue(id);
                });
                Ok(())
            }
            other => other,
        }
    }

    async fn process_job_locked(&self, id: &ResourceId) -> Result<()> {
        let lock = self.store.lock(&job_key(id)).await?;
        let cancel = lock.cancel_token();
        with_lock(lock, self.run_job(id, cancel)).await
    }

    async fn run_job(&self, id: &ResourceId, cancel: CancelToken) -> Result<()> {
        // Re-read under the lock; watch replays and crash windows mean the
        // key may be gone or the resource already satisfied.
        let job = match self.state.lookup.get_job(id).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let resource = match self.state.lookup.lookup(id).await {
            Ok(resource) => resource,
            Err(e) if e.is_not_found() => {
                warn!("Dropping job for unknown resource {id}");
                return self.state.lookup.delete_job(id).await;
            }
            Err(e) => return Err(e),
        };
        if resource.status() == ResourceStatus::Ready {
            debug!("Resource {id} is already READY, dropping its job");
            return self.state.lookup.delete_job(id).await;
        }

        let task = self.ensure_task(id, &resource).await?;
        let run = self.ensure_run(&task).await?;

        self.state
            .tasks
            .set_run_status(task.id, run.run_id, RunStatus::Running, None)
            .await?;
        if resource.status() != ResourceStatus::Pending {
            self.state
                .lookup
                .set_status(id, ResourceStatus::Pending, "")
                .await?;
        }
        self.metrics.record_run_started(&id.to_string());

        let logger = RunLogger::new(self.state.tasks.clone(), task.id, run.run_id);
        let outcome = self
            .execute_with_retries(id, job, &resource, &task, &run, cancel, &logger)
            .await;

        let started_ms = run.start_time.timestamp_millis() as u64;
        match outcome {
            Ok(()) => {
                self.state
                    .tasks
                    .set_run_end_time(task.id, run.run_id, Utc::now())
                    .await?;
                self.state
                    .tasks
                    .set_run_status(task.id, run.run_id, RunStatus::Success, None)
                    .await?;
                self.state
                    .lookup
                    .set_status(id, ResourceStatus::Ready, "")
                    .await?;
                self.state.lookup.delete_job(id).await?;
                self.metrics.record_run_completed(
                    &id.to_string(),
                    started_ms,
                    timestamp_millis(),
                );
                info!("Realized {id}");
                Ok(())
            }
            Err(e) if matches!(e, FeatureformError::LeaseLost(_)) => {
                // The lock is gone; another coordinator owns recovery. Mark
                // the run best-effort and let the process decide whether to
                // keep going.
                let _ = self
                    .state
                    .tasks
                    .set_run_status(
                        task.id,
                        run.run_id,
                        RunStatus::Failed,
                        Some("lease lost".to_string()),
                    )
                    .await;
                let _ = self
                    .fatal_tx
                    .send(FeatureformError::LeaseLost(e.to_string()));
                Err(e)
            }
            Err(e) => {
                let message = e.to_string();
                self.state
                    .tasks
                    .set_run_end_time(task.id, run.run_id, Utc::now())
                    .await?;
                self.state
                    .tasks
                    .set_run_status(
                        task.id,
                        run.run_id,
                        RunStatus::Failed,
                        Some(message.clone()),
                    )
                    .await?;
                self.state
                    .lookup
                    .set_status(id, ResourceStatus::Failed, &message)
                    .await?;
                self.state.lookup.delete_job(id).await?;
                self.metrics.record_run_failed(&id.to_string());
                error!("Failed to realize {id}: {message}");
                Ok(())
            }
        }
    }

    /// One task per resource. A replayed job reuses the task created for
    /// the first observation.
    async fn ensure_task(
        &self,
        id: &ResourceId,
        resource: &Resource,
    ) -> Result<TaskMetadata> {
        let target = task_target(id);
        if let Some(task) = self.state.tasks.get_task_by_target(&target).await? {
            return Ok(task);
        }
        let (name, task_type) = match resource {
            Resource::Provider(_) => (format!("Health Check {id}"), TaskType::HealthCheck),
            _ => (format!("Create Resource {id}"), TaskType::ResourceCreation),
        };
        self.state.tasks.create_task(name, task_type, target).await
    }

    /// Reuse a PENDING run, fail over an abandoned RUNNING run, or create a
    /// fresh one. We hold the job lock here, so a RUNNING run's owner is
    /// gone.
    async fn ensure_run(&self, task: &TaskMetadata) -> Result<TaskRunMetadata> {
        match self.state.tasks.get_latest_run(task.id).await {
            Ok(latest) => match latest.status {
                RunStatus::Pending => Ok(latest),
                RunStatus::Running => {
                    warn!(
                        "Run {} of task {} lost its owner, marking it failed",
                        latest.run_id, task.id
                    );
                    self.state
                        .tasks
                        .set_run_status(
                            task.id,
                            latest.run_id,
                            RunStatus::Failed,
                            Some("owner lost".to_string()),
                        )
                        .await?;
                    if let Err(e) = self
                        .state
                        .tasks
                        .set_run_end_time(task.id, latest.run_id, Utc::now())
                        .await
                    {
                        warn!("Failed to close out abandoned run {}: {e}", latest.run_id);
                    }
                    self.new_run(task).await
                }
                _ => self.new_run(task).await,
            },
            Err(FeatureformError::NoRunsForTask(_)) => self.new_run(task).await,
            Err(e) => Err(e),
        }
    }

    async fn new_run(&self, task: &TaskMetadata) -> Result<TaskRunMetadata> {
        self.state
            .tasks
            .create_task_run(task.name.clone(), task.id, Trigger::on_apply())
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_with_retries(
        &self,
        id: &ResourceId,
        mut job: CoordinatorJob,
        resource: &Resource,
        task: &TaskMetadata,
        run: &TaskRunMetadata,
        cancel: CancelToken,
        logger: &RunLogger,
    ) -> Result<()> {
        loop {
            cancel.check()?;
            logger
                .append(format!("status set to RUNNING (attempt {})", job.attempts + 1))
                .await?;

            let plan = self.plan(resource, task, run)?;
            match self.executor.run(plan, cancel.clone(), logger.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if matches!(e, FeatureformError::LeaseLost(_)) => return Err(e),
                Err(e)
                    if is_retryable(&e) && job.attempts + 1 < self.config.max_job_attempts =>
                {
                    job.attempts += 1;
                    self.persist_attempts(id, &job).await?;
                    logger
                        .append(format!("attempt {} failed: {e}", job.attempts))
                        .await?;

                    let backoff = backoff_with_jitter(
                        job.attempts,
                        self.config.job_backoff_base,
                        self.config.job_backoff_cap,
                    );
                    debug!("Retrying {id} in {backoff:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => {
                            return Err(FeatureformError::LeaseLost(
                                "lease lost".to_string(),
                            ))
                        }
                    }
                }
                Err(e) => {
                    let _ = logger.append(format!("terminal failure: {e}")).await;
                    return Err(e);
                }
            }
        }
    }

    /// The enclosing job lock serializes writers on this key, so a direct
    /// write is safe here.
    async fn persist_attempts(&self, id: &ResourceId, job: &CoordinatorJob) -> Result<()> {
        self.store.put(&job_key(id), &encode_json(job)?).await
    }

    fn plan(
        &self,
        resource: &Resource,
        task: &TaskMetadata,
        run: &TaskRunMetadata,
    ) -> Result<JobPlan> {
        let id = resource.id();
        let action: PlanAction = match resource {
            Resource::SourceVariant(v) => {
                plan_register_source(self.providers.clone(), v.clone())
            }
            Resource::LabelVariant(v) => {
                plan_register_label(self.providers.clone(), v.clone())
            }
            Resource::FeatureVariant(v) => plan_feature_materialization(
                self.providers.clone(),
                v.clone(),
                self.config.chunk_size,
            ),
            Resource::TrainingSetVariant(v) => {
                plan_training_set(self.providers.clone(), v.clone())
            }
            Resource::Provider(p) => {
                plan_provider_health_check(self.providers.clone(), p.clone())
            }
            _ => {
                return Err(FeatureformError::InvalidArgument(format!(
                    "no job planner for {id}"
                )))
            }
        };
        Ok(JobPlan::new(id, task.id, run.run_id, task.task_type, action))
    }
}

fn task_target(id: &ResourceId) -> TaskTarget {
    match id.resource_type {
        ResourceType::Provider => TaskTarget::Provider {
            name: id.name.clone(),
        },
        _ => TaskTarget::NameVariant {
            name: id.name.clone(),
            variant: id.variant.clone(),
            resource_type: id.resource_type,
        },
    }
}

fn resource_id_of_target(target: &TaskTarget) -> ResourceId {
    match target {
        TaskTarget::NameVariant {
            name,
            variant,
            resource_type,
        } => ResourceId::new(*resource_type, name.clone(), variant.clone()),
        TaskTarget::Provider { name } => {
            ResourceId::new(ResourceType::Provider, name.clone(), "")
        }
    }
}

fn is_retryable(e: &FeatureformError) -> bool {
    matches!(
        e,
        FeatureformError::Transient(_) | FeatureformError::ExecutionError { .. }
    )
}

fn backoff_with_jitter(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let exponential = base
        .checked_mul(2u32.saturating_pow(attempts))
        .unwrap_or(cap)
        .min(cap);
    let jitter = rand::thread_rng().gen_range(0.5_f64..1.5_f64);
    exponential.mul_f64(jitter).min(cap)
}

/// Treat AlreadyExists as success; replayed jobs re-run provider calls that
/// already took effect.
fn allow_existing<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_already_exists() => Ok(None),
        Err(e) => Err(e),
    }
}

fn source_table_name(source: &proto::NameVariant) -> String {
    format!("{}__{}", source.name, source.variant)
}

fn resource_schema(
    columns: Option<&proto::ResourceColumns>,
    source: Option<&proto::NameVariant>,
) -> ResourceSchema {
    ResourceSchema {
        entity: columns.map(|c| c.entity.clone()).unwrap_or_default(),
        value: columns.map(|c| c.value.clone()).unwrap_or_default(),
        ts: columns.map(|c| c.ts.clone()).unwrap_or_default(),
        source_table: source.map(source_table_name).unwrap_or_default(),
    }
}

fn plan_register_source(
    providers: Arc<dyn ProviderResolver>,
    variant: proto::SourceVariant,
) -> PlanAction {
    Box::new(move |cancel, logger| {
        Box::pin(async move {
            let offline = providers.offline_store(&variant.provider).await?;
            cancel.check()?;

            match variant.definition {
                Some(Definition::PrimaryData(primary)) => {
                    logger
                        .append(format!(
                            "registering primary table {}",
                            primary.table_name
                        ))
                        .await?;
                    let dataset = OfflineResourceId::new(
                        variant.name,
                        variant.variant,
                        OfflineResourceKind::Primary,
                    );
                    allow_existing(
                        offline
                            .register_primary_from_source_table(
                                &dataset,
                                &primary.table_name,
                            )
                            .await
                            .map(|_| ()),
                    )?;
                }
                Some(Definition::Transformation(transformation)) => {
                    logger.append("running transformation").await?;
                    let config = TransformationConfig {
                        name: variant.name.clone(),
                        variant: variant.variant.clone(),
                        query: transformation.query,
                        source_mapping: transformation
                            .sources
                            .iter()
                            .map(|s| SourceMapping {
                                template: format!("{{{{{}.{}}}}}", s.name, s.variant),
                                source: source_table_name(s),
                            })
                            .collect(),
                    };
                    allow_existing(offline.create_transformation(config).await)?;
                    cancel.check()?;

                    let dataset = OfflineResourceId::new(
                        variant.name,
                        variant.variant,
                        OfflineResourceKind::Transformation,
                    );
                    offline.get_transformation_table(&dataset).await?;
                }
                None => {
                    return Err(FeatureformError::InvalidArgument(format!(
                        "source {} ({}) has no definition",
                        variant.name, variant.variant
                    )))
                }
            }
            Ok(())
        })
    })
}

fn plan_register_label(
    providers: Arc<dyn ProviderResolver>,
    variant: proto::LabelVariant,
) -> PlanAction {
    Box::new(move |cancel, logger| {
        Box::pin(async move {
            let offline = providers.offline_store(&variant.provider).await?;
            cancel.check()?;

            logger
                .append(format!(
                    "registering label table {} ({})",
                    variant.name, variant.variant
                ))
                .await?;
            let schema =
                resource_schema(variant.columns.as_ref(), variant.source.as_ref());
            let dataset = OfflineResourceId::new(
                variant.name,
                variant.variant,
                OfflineResourceKind::Label,
            );
            allow_existing(
                offline
                    .register_resource_from_source_table(&dataset, schema)
                    .await
                    .map(|_| ()),
            )?;
            Ok(())
        })
    })
}

fn plan_feature_materialization(
    providers: Arc<dyn ProviderResolver>,
    variant: proto::FeatureVariant,
    chunk_size: usize,
) -> PlanAction {
    Box::new(move |cancel, logger| {
        Box::pin(async move {
            let offline = providers.offline_store(&variant.provider).await?;
            let online = providers.online_store(&variant.provider).await?;
            cancel.check()?;

            let dataset = OfflineResourceId::new(
                variant.name.clone(),
                variant.variant.clone(),
                OfflineResourceKind::Feature,
            );
            let schema =
                resource_schema(variant.columns.as_ref(), variant.source.as_ref());
            allow_existing(
                offline
                    .register_resource_from_source_table(&dataset, schema)
                    .await
                    .map(|_| ()),
            )?;
            cancel.check()?;

            let materialization = match offline.create_materialization(&dataset).await {
                Ok(materialization) => materialization,
                Err(e) if e.is_already_exists() => {
                    offline.update_materialization(&dataset).await?
                }
                Err(e) => return Err(e),
            };
            cancel.check()?;

            let table = match online
                .create_table(&variant.name, &variant.variant, &variant.value_type)
                .await
            {
                Ok(table) => table,
                Err(e) if e.is_already_exists() => {
                    online.get_table(&variant.name, &variant.variant).await?
                }
                Err(e) => return Err(e),
            };

            // Chunks upload on separate workers; ordering within a chunk is
            // irrelevant.
            let chunks = materialization.num_chunks(chunk_size).await?;
            let mut uploads = Vec::with_capacity(chunks);
            for chunk in 0..chunks {
                cancel.check()?;
                let materialization = materialization.clone();
                let table = table.clone();
                let cancel = cancel.clone();
                uploads.push(tokio::spawn(async move {
                    let rows = materialization.iterate_chunk(chunk, chunk_size).await?;
                    for row in rows {
                        cancel.check()?;
                        table.set(&row.entity, row.value).await?;
                    }
                    Ok::<(), FeatureformError>(())
                }));
            }
            for upload in uploads {
                upload.await.map_err(|e| {
                    FeatureformError::Internal(format!("chunk upload panicked: {e}"))
                })??;
            }

            let rows = materialization.num_rows().await?;
            logger
                .append(format!("materialized {rows} rows in {chunks} chunks"))
                .await?;
            Ok(())
        })
    })
}

fn plan_training_set(
    providers: Arc<dyn ProviderResolver>,
    variant: proto::TrainingSetVariant,
) -> PlanAction {
    Box::new(move |cancel, logger| {
        Box::pin(async move {
            let offline = providers.offline_store(&variant.provider).await?;
            cancel.check()?;

            let label = variant.label.clone().ok_or_else(|| {
                FeatureformError::InvalidArgument(format!(
                    "training set {} ({}) has no label",
                    variant.name, variant.variant
                ))
            })?;
            let def = TrainingSetDef {
                name: variant.name.clone(),
                variant: variant.variant.clone(),
                label,
                features: variant.features.clone(),
            };

            logger
                .append(format!(
                    "building training set {} ({})",
                    def.name, def.variant
                ))
                .await?;
            match offline.create_training_set(def.clone()).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_already_exists() => offline.update_training_set(def).await,
                Err(e) => Err(e),
            }
        })
    })
}

fn plan_provider_health_check(
    providers: Arc<dyn ProviderResolver>,
    provider: proto::Provider,
) -> PlanAction {
    Box::new(move |cancel, logger| {
        Box::pin(async move {
            cancel.check()?;
            logger
                .append(format!("checking provider {}", provider.name))
                .await?;
            providers.check_health(&provider.name).await
        })
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::state::backend::LockHandle;
    use crate::test_utils::{
        assert_completed_event, assert_failed_event, CoordinatorTest,
    };
    use featureform_provider::memory::timestamped;
    use featureform_provider::{
        OfflineStore, OfflineTable, OnlineStore, PrimaryTable, Value,
    };

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_worker_pool_size(2)
            .with_job_backoff(Duration::from_millis(1), Duration::from_millis(5))
            .with_lock_retry_backoff(Duration::from_millis(10))
            .with_chunk_size(2)
    }

    #[tokio::test]
    async fn test_create_then_materialize() -> Result<()> {
        let test = CoordinatorTest::new(fast_config());
        test.seed_feature_rows("price", "v1", vec![("a", 1.0), ("b", 2.0), ("c", 3.0)])
            .await?;

        let id = test
            .apply(&CoordinatorTest::feature_resource("price", "v1"))
            .await?;
        test.start().await?;

        assert!(test.await_resource_status(&id, ResourceStatus::Ready).await?);

        // Exactly one ResourceCreation task and one successful run.
        let tasks = test.state().tasks.get_all_tasks().await?;
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.id, 1);
        assert_eq!(task.task_type, TaskType::ResourceCreation);

        let run = test.state().tasks.get_latest_run(task.id).await?;
        assert_eq!(run.run_id, 1);
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.has_ended());
        assert!(run.end_time >= run.start_time);
        assert!(!run.logs.is_empty());
        assert_eq!(run.error, "");

        assert!(!test.state().lookup.has_job(&id).await?);

        // Rows made it into the online store through the chunked copy.
        let table = test.online.get_table("price", "v1").await?;
        assert_eq!(table.get("b").await?, Value::Float(2.0));

        assert_completed_event(&id.to_string(), &test.metrics);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_on_transient_failure() -> Result<()> {
        let test = CoordinatorTest::with_flaky_materialization(fast_config(), 2);
        test.seed_feature_rows("price", "v1", vec![("a", 1.0)]).await?;

        let id = test
            .apply(&CoordinatorTest::feature_resource("price", "v1"))
            .await?;
        test.start().await?;

        assert!(test.await_resource_status(&id, ResourceStatus::Ready).await?);

        let run = test.state().tasks.get_latest_run(1).await?;
        assert_eq!(run.status, RunStatus::Success);

        // One RUNNING entry per attempt, and one failure entry per retry.
        let running_entries = run
            .logs
            .iter()
            .filter(|log| log.contains("status set to RUNNING"))
            .count();
        assert_eq!(running_entries, 3);
        let failure_entries = run
            .logs
            .iter()
            .filter(|log| log.contains("failed"))
            .count();
        assert_eq!(failure_entries, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_run() -> Result<()> {
        let test = CoordinatorTest::with_flaky_materialization(fast_config(), 3);
        test.seed_feature_rows("price", "v1", vec![("a", 1.0)]).await?;

        let id = test
            .apply(&CoordinatorTest::feature_resource("price", "v1"))
            .await?;
        test.start().await?;

        assert!(test
            .await_resource_status(&id, ResourceStatus::Failed)
            .await?);

        let run = test.state().tasks.get_latest_run(1).await?;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(!run.error.is_empty());
        assert!(run.has_ended());

        let resource = test.state().lookup.lookup(&id).await?;
        assert_eq!(resource.status(), ResourceStatus::Failed);
        assert!(!resource.status_error().is_empty());

        assert!(!test.state().lookup.has_job(&id).await?);
        assert_failed_event(&id.to_string(), &test.metrics);
        Ok(())
    }

    #[tokio::test]
    async fn test_ready_resource_short_circuits() -> Result<()> {
        let test = CoordinatorTest::new(fast_config());

        let id = test
            .apply(&CoordinatorTest::feature_resource("price", "v1"))
            .await?;
        test.state()
            .lookup
            .set_status(&id, ResourceStatus::Ready, "")
            .await?;

        test.start().await?;
        assert!(test.await_resource_status(&id, ResourceStatus::Ready).await?);

        // No task was recorded; the job key was simply consumed.
        assert!(test.state().tasks.get_all_tasks().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_idempotent_apply() -> Result<()> {
        let test = CoordinatorTest::new(fast_config());
        test.seed_feature_rows("price", "v1", vec![("a", 1.0)]).await?;

        let resource = CoordinatorTest::feature_resource("price", "v1");
        let id = test.apply(&resource).await?;

        // A second apply of the same resource observes AlreadyExists on the
        // job key and short-circuits.
        let err = test.state().lookup.set_job(&id, "").await.unwrap_err();
        assert!(err.is_already_exists());

        test.start().await?;
        assert!(test.await_resource_status(&id, ResourceStatus::Ready).await?);

        assert_eq!(test.state().tasks.get_all_tasks().await?.len(), 1);
        assert_eq!(test.state().tasks.get_task_runs(1).await?.runs.len(), 1);

        // Replaying the job key after completion is a no-op.
        test.state().lookup.set_job(&id, "").await?;
        let lookup = test.state().lookup.clone();
        let replayed = id.clone();
        assert!(
            crate::test_utils::await_condition(
                Duration::from_millis(20),
                250,
                move || {
                    let lookup = lookup.clone();
                    let id = replayed.clone();
                    async move { Ok(!lookup.has_job(&id).await?) }
                }
            )
            .await?
        );
        assert_eq!(test.state().tasks.get_all_tasks().await?.len(), 1);
        assert_eq!(test.state().tasks.get_task_runs(1).await?.runs.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_recovers_abandoned_running_run() -> Result<()> {
        let test = CoordinatorTest::new(fast_config());
        test.seed_feature_rows("price", "v1", vec![("a", 1.0)]).await?;

        let resource = CoordinatorTest::feature_resource("price", "v1");
        let id = test.apply(&resource).await?;

        // A previous coordinator created the task, moved its run to
        // RUNNING, and died without unlocking.
        let task = test
            .state()
            .tasks
            .create_task(
                format!("Create Resource {id}"),
                TaskType::ResourceCreation,
                task_target(&id),
            )
            .await?;
        let run = test
            .state()
            .tasks
            .create_task_run(task.name.clone(), task.id, Trigger::on_apply())
            .await?;
        test.state()
            .tasks
            .set_run_status(task.id, run.run_id, RunStatus::Running, None)
            .await?;

        test.start().await?;
        assert!(test.await_resource_status(&id, ResourceStatus::Ready).await?);

        let first = test.state().tasks.get_run_by_id(task.id, run.run_id).await?;
        assert_eq!(first.status, RunStatus::Failed);
        assert_eq!(first.error, "owner lost");
        assert!(first.has_ended());

        let latest = test.state().tasks.get_latest_run(task.id).await?;
        assert_eq!(latest.run_id, 2);
        assert_eq!(latest.status, RunStatus::Success);
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_contention_requeues() -> Result<()> {
        let test = CoordinatorTest::new(fast_config());
        test.seed_feature_rows("price", "v1", vec![("a", 1.0)]).await?;

        let id = test
            .apply(&CoordinatorTest::feature_resource("price", "v1"))
            .await?;

        // Another coordinator holds the job lock.
        let other = test.store.session();
        let mut held = other.acquire(&job_key(&id)).await?;

        test.start().await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_ne!(
            test.state().lookup.lookup(&id).await?.status(),
            ResourceStatus::Ready
        );

        held.unlock().await?;
        assert!(test.await_resource_status(&id, ResourceStatus::Ready).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_apply_after_start_is_seen_by_watch() -> Result<()> {
        let test = CoordinatorTest::new(fast_config());
        test.seed_feature_rows("price", "v1", vec![("a", 1.0)]).await?;

        test.start().await?;

        let id = test
            .apply(&CoordinatorTest::feature_resource("price", "v1"))
            .await?;
        assert!(test.await_resource_status(&id, ResourceStatus::Ready).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_register_primary_source() -> Result<()> {
        let test = CoordinatorTest::new(fast_config());

        let resource = Resource::SourceVariant(proto::SourceVariant {
            name: "transactions".to_string(),
            variant: "v1".to_string(),
            provider: "unit-test".to_string(),
            definition: Some(Definition::PrimaryData(proto::PrimaryData {
                table_name: "raw_transactions".to_string(),
            })),
            ..Default::default()
        });
        let id = test.apply(&resource).await?;
        test.start().await?;

        assert!(test.await_resource_status(&id, ResourceStatus::Ready).await?);

        let dataset = OfflineResourceId::new(
            "transactions",
            "v1",
            OfflineResourceKind::Primary,
        );
        let table = test.offline.get_primary_table(&dataset).await?;
        assert_eq!(table.name(), "raw_transactions");
        Ok(())
    }

    #[tokio::test]
    async fn test_register_transformation_source() -> Result<()> {
        let test = CoordinatorTest::new(fast_config());

        let resource = Resource::SourceVariant(proto::SourceVariant {
            name: "avg_price".to_string(),
            variant: "v1".to_string(),
            provider: "unit-test".to_string(),
            definition: Some(Definition::Transformation(proto::SqlTransformation {
                query: "SELECT user, AVG(price) FROM {{transactions.v1}} GROUP BY user"
                    .to_string(),
                sources: vec![proto::NameVariant::new("transactions", "v1")],
            })),
            ..Default::default()
        });
        let id = test.apply(&resource).await?;
        test.start().await?;

        assert!(test.await_resource_status(&id, ResourceStatus::Ready).await?);

        let dataset = OfflineResourceId::new(
            "avg_price",
            "v1",
            OfflineResourceKind::Transformation,
        );
        test.offline.get_transformation_table(&dataset).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_label_and_training_set() -> Result<()> {
        let test = CoordinatorTest::new(fast_config());
        test.seed_feature_rows("price", "v1", vec![("a", 1.0), ("b", 2.0)])
            .await?;

        let label = Resource::LabelVariant(proto::LabelVariant {
            name: "bought".to_string(),
            variant: "v1".to_string(),
            source: Some(proto::NameVariant::new("orders", "v1")),
            entity: "user".to_string(),
            provider: "unit-test".to_string(),
            value_type: "bool".to_string(),
            columns: Some(proto::ResourceColumns {
                entity: "user".to_string(),
                value: "bought".to_string(),
                ts: "ts".to_string(),
            }),
            ..Default::default()
        });
        let label_id = test.apply(&label).await?;
        test.start().await?;
        assert!(test
            .await_resource_status(&label_id, ResourceStatus::Ready)
            .await?);

        // Seed label observations, then build the training set.
        let label_dataset =
            OfflineResourceId::new("bought", "v1", OfflineResourceKind::Label);
        let label_table = test.offline.get_resource_table(&label_dataset).await?;
        label_table
            .write(timestamped("a", Value::Bool(true), Utc::now()))
            .await?;
        label_table
            .write(timestamped("b", Value::Bool(false), Utc::now()))
            .await?;

        let training_set = Resource::TrainingSetVariant(proto::TrainingSetVariant {
            name: "purchases".to_string(),
            variant: "v1".to_string(),
            label: Some(proto::NameVariant::new("bought", "v1")),
            features: vec![proto::NameVariant::new("price", "v1")],
            provider: "unit-test".to_string(),
            ..Default::default()
        });
        let ts_id = test.apply(&training_set).await?;
        assert!(test
            .await_resource_status(&ts_id, ResourceStatus::Ready)
            .await?);

        let dataset = OfflineResourceId::new(
            "purchases",
            "v1",
            OfflineResourceKind::TrainingSet,
        );
        let rows = test.offline.get_training_set(&dataset).await?;
        assert_eq!(rows.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_provider_health_check() -> Result<()> {
        let test = CoordinatorTest::new(fast_config());

        let resource = Resource::Provider(proto::Provider {
            name: "warehouse".to_string(),
            provider_type: "POSTGRES_OFFLINE".to_string(),
            ..Default::default()
        });
        let id = test.apply(&resource).await?;
        test.start().await?;

        assert!(test.await_resource_status(&id, ResourceStatus::Ready).await?);

        let tasks = test.state().tasks.get_all_tasks().await?;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, TaskType::HealthCheck);
        assert!(matches!(tasks[0].target, TaskTarget::Provider { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_backoff_with_jitter_is_capped() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(400);
        for attempts in 1..10 {
            let backoff = backoff_with_jitter(attempts, base, cap);
            assert!(backoff <= cap);
            assert!(backoff >= Duration::from_millis(50));
        }
    }
}
