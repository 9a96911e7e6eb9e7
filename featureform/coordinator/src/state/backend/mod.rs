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

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;

use async_trait::async_trait;
use featureform_core::error::Result;
use featureform_core::utils::CancelToken;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// How long a lock lease survives after its last refresh. Holders refresh at
/// a third of this period; a dead holder's lock becomes acquirable within
/// two periods.
pub const VALID_TIME_PERIOD: Duration = Duration::from_secs(5);

/// Deadline for individual coordination-store operations.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(1);

pub const RETRY_MAX_ATTEMPTS: usize = 10;
pub const RETRY_BASE: Duration = Duration::from_secs(1);
pub const RETRY_CAP: Duration = Duration::from_secs(32);

/// A change observed on a watched prefix. Events for a single key arrive in
/// revision order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchEvent {
    /// Contains the inserted or updated key and the new value
    Put {
        key: String,
        value: String,
        revision: i64,
    },

    /// Contains the deleted key
    Delete { key: String, revision: i64 },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } => key,
            WatchEvent::Delete { key, .. } => key,
        }
    }

    pub fn revision(&self) -> i64 {
        match self {
            WatchEvent::Put { revision, .. } => *revision,
            WatchEvent::Delete { revision, .. } => *revision,
        }
    }
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// An advisory lease-backed lock on a single key. The lease is refreshed in
/// the background while the handle is held; if refreshing fails, the
/// handle's cancel token fires and the holder is expected to unwind.
#[async_trait]
pub trait LockHandle: Send + Sync {
    fn key(&self) -> &str;

    /// Fires when the lease backing this lock is lost.
    fn cancel_token(&self) -> CancelToken;

    /// Release the lock. Fails if the handle no longer owns it.
    async fn unlock(&mut self) -> Result<()>;
}

/// A KeyValue interface with locking primitives for persisting coordinator
/// state. All keys are hierarchical strings; the layout is the on-disk
/// contract.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Blind write, durable on return.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Retrieve the value at `key`; NotFound if the key does not exist.
    async fn get(&self, key: &str) -> Result<String>;

    /// Retrieve all key/value pairs matching a prefix, in lexicographic key
    /// order.
    async fn get_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Count the keys matching a prefix without fetching their values.
    async fn count_with_prefix(&self, prefix: &str) -> Result<usize>;

    /// Permanently delete a key. Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Acquire the advisory lock on `key`. Re-entrance by the same holder
    /// succeeds; acquisition by a different holder fails with LockContended
    /// until release or lease expiry.
    async fn lock(&self, key: &str) -> Result<Box<dyn LockHandle>>;

    /// Watch all events that happen under a prefix.
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;

    /// Return a strictly increasing integer for the namespace. Ids are never
    /// reused, and survive restarts of the caller.
    async fn next_ordered_id(&self, namespace: &str) -> Result<u64>;
}

/// Key holding a namespace's ordered-id counter.
pub fn ordered_id_key(namespace: &str) -> String {
    format!("/ids/{namespace}")
}

/// Retry a transient-failing operation with exponential backoff. Errors
/// other than `Transient` are returned immediately.
pub async fn retry_with_backoff<T, Fut, F>(
    max_attempts: usize,
    base: Duration,
    cap: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && (attempt as usize) + 1 < max_attempts => {
                let backoff = base
                    .checked_mul(2u32.saturating_pow(attempt))
                    .unwrap_or(cap)
                    .min(cap);
                log::debug!(
                    "Transient error (attempt {}): {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
