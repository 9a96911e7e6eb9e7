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

//! Featureform error types

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::result;

pub type Result<T> = result::Result<T, FeatureformError>;

/// Featureform error
#[derive(Debug)]
pub enum FeatureformError {
    /// The requested key or resource does not exist. Idempotent callers
    /// treat this as an empty result.
    NotFound(String),
    /// The key, resource or task already exists. Idempotent scheduler paths
    /// upgrade this to success.
    AlreadyExists(String),
    /// Caller error; never retried.
    InvalidArgument(String),
    /// The lock is held by another holder. The scheduler retries with
    /// backoff; everyone else surfaces it.
    LockContended(String),
    /// The lease backing a held lock could not be renewed. Fatal for the
    /// current execution.
    LeaseLost(String),
    /// Connection or timeout class failure; retried with exponential
    /// backoff at the scheduler boundary.
    Transient(String),
    /// A provider operation failed. Terminal unless the job has attempts
    /// remaining.
    ExecutionError {
        provider: String,
        resource: String,
        message: String,
    },
    /// The value's type does not match the declared schema. Never retried.
    DataTypeMismatch(String),
    /// The task exists but has no recorded runs.
    NoRunsForTask(u64),
    /// A non-transient failure reported by the coordination store.
    EtcdError(String),
    /// Encoding or decoding a stored document failed.
    Serialization(String),
    IoError(io::Error),
    Internal(String),
}

impl FeatureformError {
    pub fn execution<P: Into<String>, R: Into<String>, M: Into<String>>(
        provider: P,
        resource: R,
        message: M,
    ) -> Self {
        FeatureformError::ExecutionError {
            provider: provider.into(),
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Whether a retry at the scheduler boundary may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FeatureformError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FeatureformError::NotFound(_) | FeatureformError::NoRunsForTask(_)
        )
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, FeatureformError::AlreadyExists(_))
    }

    pub fn is_lock_contended(&self) -> bool {
        matches!(self, FeatureformError::LockContended(_))
    }
}

impl From<io::Error> for FeatureformError {
    fn from(e: io::Error) -> Self {
        FeatureformError::IoError(e)
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for FeatureformError {
    fn from(e: etcd_client::Error) -> Self {
        FeatureformError::EtcdError(format!("{e}"))
    }
}

impl From<serde_json::Error> for FeatureformError {
    fn from(e: serde_json::Error) -> Self {
        FeatureformError::Serialization(format!("json: {e}"))
    }
}

impl From<prost::DecodeError> for FeatureformError {
    fn from(e: prost::DecodeError) -> Self {
        FeatureformError::Serialization(format!("protobuf decode: {e}"))
    }
}

impl From<prost::EncodeError> for FeatureformError {
    fn from(e: prost::EncodeError) -> Self {
        FeatureformError::Serialization(format!("protobuf encode: {e}"))
    }
}

impl Display for FeatureformError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            FeatureformError::NotFound(desc) => {
                write!(f, "Not found: {desc}")
            }
            FeatureformError::AlreadyExists(desc) => {
                write!(f, "Already exists: {desc}")
            }
            FeatureformError::InvalidArgument(desc) => {
                write!(f, "Invalid argument: {desc}")
            }
            FeatureformError::LockContended(desc) => {
                write!(f, "Lock contended: {desc}")
            }
            FeatureformError::LeaseLost(desc) => {
                write!(f, "Lease lost: {desc}")
            }
            FeatureformError::Transient(desc) => {
                write!(f, "Transient error: {desc}")
            }
            FeatureformError::ExecutionError {
                provider,
                resource,
                message,
            } => {
                write!(
                    f,
                    "Execution error on provider {provider} for {resource}: {message}"
                )
            }
            FeatureformError::DataTypeMismatch(desc) => {
                write!(f, "Data type mismatch: {desc}")
            }
            FeatureformError::NoRunsForTask(task_id) => {
                write!(f, "No runs recorded for task {task_id}")
            }
            FeatureformError::EtcdError(desc) => {
                write!(f, "Etcd error: {desc}")
            }
            FeatureformError::Serialization(desc) => {
                write!(f, "Serialization error: {desc}")
            }
            FeatureformError::IoError(e) => write!(f, "IO error: {e}"),
            FeatureformError::Internal(desc) => {
                write!(f, "Internal error: {desc}")
            }
        }
    }
}

impl Error for FeatureformError {}
