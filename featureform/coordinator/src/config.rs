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
//

//! Featureform coordinator specific configuration

use clap::ArgEnum;
use featureform_provider::DEFAULT_CHUNK_SIZE;
use std::time::Duration;

/// Configuration for the coordinator's scheduling loop
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Number of concurrent job workers. Defaults to the hardware thread
    /// count; additional work queues in memory.
    pub worker_pool_size: usize,
    /// Executions of one job before its run is marked FAILED
    pub max_job_attempts: u32,
    /// Base of the exponential backoff between job attempts
    pub job_backoff_base: Duration,
    /// Upper bound of the backoff between job attempts
    pub job_backoff_cap: Duration,
    /// Delay before requeueing a job whose lock is held by another coordinator
    pub lock_retry_backoff: Duration,
    /// Rows per chunk when copying a materialization into an online store
    pub chunk_size: usize,
    /// Which executor runs job plans
    pub executor_backend: ExecutorBackend,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: num_cpus::get(),
            max_job_attempts: 3,
            job_backoff_base: Duration::from_secs(1),
            job_backoff_cap: Duration::from_secs(30),
            lock_retry_backoff: Duration::from_secs(1),
            chunk_size: DEFAULT_CHUNK_SIZE,
            executor_backend: ExecutorBackend::InProcess,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_worker_pool_size(mut self, workers: usize) -> Self {
        self.worker_pool_size = workers.max(1);
        self
    }

    pub fn with_max_job_attempts(mut self, attempts: u32) -> Self {
        self.max_job_attempts = attempts.max(1);
        self
    }

    pub fn with_job_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.job_backoff_base = base;
        self.job_backoff_cap = cap;
        self
    }

    pub fn with_lock_retry_backoff(mut self, backoff: Duration) -> Self {
        self.lock_retry_backoff = backoff;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_executor_backend(mut self, backend: ExecutorBackend) -> Self {
        self.executor_backend = backend;
        self
    }
}

// an enum used to configure the executor backend
// needs to be visible to the CLI argument parser
#[derive(Clone, ArgEnum, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
pub enum ExecutorBackend {
    InProcess,
    Kubernetes,
}

impl ExecutorBackend {
    pub fn is_remote(&self) -> bool {
        matches!(self, ExecutorBackend::Kubernetes)
    }
}

impl std::str::FromStr for ExecutorBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ArgEnum::from_str(s, true)
    }
}
