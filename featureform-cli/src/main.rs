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

//! The coordinator daemon. Connection settings come from the contractual
//! environment variables (ETCD_HOST, ETCD_PORT, ETCD_USERNAME,
//! ETCD_PASSWORD, METADATA_HOST, METADATA_PORT, K8S_RUNNER_ENABLE).

use clap::Parser;
use featureform_coordinator::config::{CoordinatorConfig, ExecutorBackend};
use featureform_coordinator::coordinator::Coordinator;
use featureform_coordinator::executor::Executor;
use featureform_coordinator::metrics::default_metrics_collector;
#[cfg(feature = "etcd")]
use featureform_coordinator::state::backend::etcd::EtcdStore;
use featureform_coordinator::state::backend::memory::MemoryStore;
use featureform_coordinator::state::backend::CoordinationStore;
#[cfg(feature = "etcd")]
use featureform_core::config::EtcdConfig;
use featureform_core::config::{k8s_runner_enabled, MetadataConfig};
use featureform_core::error::{FeatureformError, Result};
use featureform_provider::memory::MemoryProviderResolver;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_STARTUP_FAILURE: u8 = 1;
const EXIT_EXECUTOR_FAILURE: u8 = 2;
const EXIT_LOCK_LOST: u8 = 3;

#[derive(Debug, Parser)]
#[clap(
    name = "featureform-coordinator",
    about = "Featureform coordinator daemon",
    version
)]
struct Opt {
    /// Run against an in-process coordination store instead of etcd.
    /// Single-process only; state does not survive a restart.
    #[clap(long)]
    standalone: bool,

    /// Number of concurrent job workers; defaults to the hardware thread
    /// count.
    #[clap(long)]
    workers: Option<usize>,

    /// Log filter when RUST_LOG is unset.
    #[clap(long, default_value = "info")]
    log_level: String,

    /// Write daily-rotated log files to this directory instead of stdout.
    #[clap(long)]
    log_dir: Option<String>,

    /// File name prefix for rotated log files.
    #[clap(long, default_value = "featureform-coordinator")]
    log_file_name_prefix: String,
}

fn exit_code_for(e: &FeatureformError) -> u8 {
    match e {
        FeatureformError::LeaseLost(_) => EXIT_LOCK_LOST,
        FeatureformError::ExecutionError { .. } => EXIT_EXECUTOR_FAILURE,
        _ => EXIT_STARTUP_FAILURE,
    }
}

async fn connect_store(opt: &Opt) -> Result<Arc<dyn CoordinationStore>> {
    if opt.standalone {
        info!("Running with the in-process coordination store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    #[cfg(feature = "etcd")]
    {
        let config = EtcdConfig::from_env()?;
        info!("Connecting to etcd at {}", config.endpoint());
        let store = EtcdStore::connect(&config).await?;
        Ok(Arc::new(store))
    }
    #[cfg(not(feature = "etcd"))]
    {
        Err(FeatureformError::InvalidArgument(
            "this build has no etcd support; run with --standalone".to_string(),
        ))
    }
}

async fn serve(opt: Opt) -> Result<()> {
    let metadata = MetadataConfig::from_env()?;
    info!(
        "Metadata tier expected at {}:{}",
        metadata.host, metadata.port
    );

    let backend = if k8s_runner_enabled()? {
        ExecutorBackend::Kubernetes
    } else {
        ExecutorBackend::InProcess
    };
    let executor = match backend {
        ExecutorBackend::InProcess => Executor::in_process(),
        ExecutorBackend::Kubernetes => {
            // The remote executor needs a container-orchestrator
            // integration, which this build does not link. Embedders
            // construct Executor::Remote with their own JobOrchestrator.
            return Err(FeatureformError::InvalidArgument(
                "K8S_RUNNER_ENABLE is set but no orchestrator integration is available"
                    .to_string(),
            ));
        }
    };

    let store = connect_store(&opt).await?;

    let mut config = CoordinatorConfig::default().with_executor_backend(backend);
    if let Some(workers) = opt.workers {
        config = config.with_worker_pool_size(workers);
    }

    let coordinator = Coordinator::new(
        store,
        Arc::new(MemoryProviderResolver::new()),
        Arc::new(executor),
        config,
        default_metrics_collector(),
    );

    coordinator.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let opt = Opt::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&opt.log_level));

    // The non-blocking writer flushes on drop; the guard lives for the
    // whole process.
    let _guard = match &opt.log_dir {
        Some(dir) => {
            let appender =
                tracing_appender::rolling::daily(dir, &opt.log_file_name_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        }
    };

    match serve(opt).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Coordinator exited: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}
