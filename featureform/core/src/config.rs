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

//! Process configuration read from the environment. The variable names are
//! contractual and shared with the deployment manifests.

use crate::error::{FeatureformError, Result};
use std::env;

pub const ETCD_HOST: &str = "ETCD_HOST";
pub const ETCD_PORT: &str = "ETCD_PORT";
pub const ETCD_USERNAME: &str = "ETCD_USERNAME";
pub const ETCD_PASSWORD: &str = "ETCD_PASSWORD";
pub const METADATA_HOST: &str = "METADATA_HOST";
pub const METADATA_PORT: &str = "METADATA_PORT";
pub const K8S_RUNNER_ENABLE: &str = "K8S_RUNNER_ENABLE";

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Connection settings for the coordination store.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl EtcdConfig {
    pub fn from_env() -> Result<Self> {
        let port = env_or(ETCD_PORT, "2379");
        let port = port.parse::<u16>().map_err(|e| {
            FeatureformError::InvalidArgument(format!("{ETCD_PORT} `{port}`: {e}"))
        })?;

        Ok(Self {
            host: env_or(ETCD_HOST, "localhost"),
            port,
            username: env_opt(ETCD_USERNAME),
            password: env_opt(ETCD_PASSWORD),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Address of the metadata RPC tier. The coordinator only records it; the
/// RPC surface itself lives outside this repository.
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    pub host: String,
    pub port: u16,
}

impl MetadataConfig {
    pub fn from_env() -> Result<Self> {
        let port = env_or(METADATA_PORT, "8080");
        let port = port.parse::<u16>().map_err(|e| {
            FeatureformError::InvalidArgument(format!("{METADATA_PORT} `{port}`: {e}"))
        })?;

        Ok(Self {
            host: env_or(METADATA_HOST, "localhost"),
            port,
        })
    }
}

/// Whether the remote (container-orchestrated) executor is selected.
pub fn k8s_runner_enabled() -> Result<bool> {
    match env::var(K8S_RUNNER_ENABLE) {
        Err(_) => Ok(false),
        Ok(raw) => match raw.to_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" | "" => Ok(false),
            other => Err(FeatureformError::InvalidArgument(format!(
                "{K8S_RUNNER_ENABLE} must be a boolean, got `{other}`"
            ))),
        },
    }
}
