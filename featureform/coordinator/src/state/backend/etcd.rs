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

//! Etcd-backed coordination store. Locks are etcd mutexes bound to a lease
//! that a background task keeps alive; if renewal fails the handle's cancel
//! token fires.

use crate::state::backend::{
    ordered_id_key, CoordinationStore, LockHandle, WatchEvent, WatchStream,
    DEFAULT_OP_TIMEOUT, VALID_TIME_PERIOD,
};
use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseClient, LockOptions, WatchOptions,
};
use featureform_core::config::EtcdConfig;
use featureform_core::error::{FeatureformError, Result};
use featureform_core::utils::CancelToken;
use log::warn;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Connection-class failures are retryable; anything else (malformed
/// requests, server-side rejections) surfaces as EtcdError and is never
/// retried.
fn etcd_error(e: etcd_client::Error) -> FeatureformError {
    match &e {
        etcd_client::Error::IoError(_)
        | etcd_client::Error::TransportError(_)
        | etcd_client::Error::WatchError(_)
        | etcd_client::Error::LeaseKeepAliveError(_) => {
            FeatureformError::Transient(format!("etcd: {e}"))
        }
        _ => e.into(),
    }
}

struct HeldLock {
    lease_id: i64,
    lock_key: Vec<u8>,
    count: usize,
    token: CancelToken,
    released: Arc<AtomicBool>,
}

/// Coordination store backed by an etcd cluster. Clones share the lock
/// table, so locks are re-entrant within one process.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    held: Arc<Mutex<HashMap<String, HeldLock>>>,
}

impl EtcdStore {
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        let options = match (&config.username, &config.password) {
            (Some(user), Some(password)) => {
                Some(ConnectOptions::new().with_user(user, password))
            }
            _ => None,
        };

        let client = Client::connect([config.endpoint()], options)
            .await
            .map_err(etcd_error)?;

        Ok(Self {
            client,
            held: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

async fn refresh_lease(
    mut lease: LeaseClient,
    lease_id: i64,
    token: CancelToken,
    released: Arc<AtomicBool>,
) {
    let (mut keeper, mut responses) = match lease.keep_alive(lease_id).await {
        Ok(streams) => streams,
        Err(e) => {
            warn!("Failed to start lease keep-alive for {lease_id}: {e}");
            token.cancel();
            return;
        }
    };

    let interval = VALID_TIME_PERIOD / 3;
    loop {
        tokio::time::sleep(interval).await;
        if released.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = keeper.keep_alive().await {
            if !released.load(Ordering::SeqCst) {
                warn!("Lease {lease_id} renewal failed: {e}");
                token.cancel();
            }
            return;
        }
        match responses.message().await {
            Ok(Some(resp)) if resp.ttl() > 0 => {}
            _ => {
                if !released.load(Ordering::SeqCst) {
                    warn!("Lease {lease_id} expired on the server");
                    token.cancel();
                }
                return;
            }
        }
    }
}

pub struct EtcdLockHandle {
    client: Client,
    held: Arc<Mutex<HashMap<String, HeldLock>>>,
    key: String,
    lease_id: i64,
    token: CancelToken,
    released: Arc<AtomicBool>,
    refresher: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl LockHandle for EtcdLockHandle {
    fn key(&self) -> &str {
        &self.key
    }

    fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    async fn unlock(&mut self) -> Result<()> {
        let to_release: Option<Vec<u8>> = {
            let mut held = self.held.lock();
            match held.get_mut(&self.key) {
                Some(entry) if entry.lease_id == self.lease_id => {
                    entry.count -= 1;
                    if entry.count == 0 {
                        let lock_key = entry.lock_key.clone();
                        held.remove(&self.key);
                        Some(lock_key)
                    } else {
                        None
                    }
                }
                _ => {
                    return Err(FeatureformError::LeaseLost(format!(
                        "lock on {} is no longer held",
                        self.key
                    )))
                }
            }
        };

        if let Some(lock_key) = to_release {
            self.released.store(true, Ordering::SeqCst);
            if let Some(refresher) = self.refresher.take() {
                refresher.abort();
            }
            self.client
                .lock_client()
                .unlock(lock_key)
                .await
                .map_err(etcd_error)?;
            // Revoking the lease is best-effort; it expires on its own.
            let _ = self.client.lease_client().revoke(self.lease_id).await;
        }
        Ok(())
    }
}

impl Drop for EtcdLockHandle {
    fn drop(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.client
            .kv_client()
            .put(key, value, None)
            .await
            .map(|_| ())
            .map_err(etcd_error)
    }

    async fn get(&self, key: &str) -> Result<String> {
        let resp = self
            .client
            .kv_client()
            .get(key, None)
            .await
            .map_err(etcd_error)?;

        match resp.kvs().first() {
            Some(kv) => Ok(kv.value_str().map_err(etcd_error)?.to_string()),
            None => Err(FeatureformError::NotFound(key.to_string())),
        }
    }

    async fn get_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let resp = self
            .client
            .kv_client()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(etcd_error)?;

        resp.kvs()
            .iter()
            .map(|kv| {
                Ok((
                    kv.key_str().map_err(etcd_error)?.to_string(),
                    kv.value_str().map_err(etcd_error)?.to_string(),
                ))
            })
            .collect()
    }

    async fn count_with_prefix(&self, prefix: &str) -> Result<usize> {
        let resp = self
            .client
            .kv_client()
            .get(prefix, Some(GetOptions::new().with_prefix().with_count_only()))
            .await
            .map_err(etcd_error)?;
        Ok(resp.count() as usize)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .kv_client()
            .delete(key, None)
            .await
            .map(|_| ())
            .map_err(etcd_error)
    }

    async fn lock(&self, key: &str) -> Result<Box<dyn LockHandle>> {
        // Re-entrance within this process.
        {
            let mut held = self.held.lock();
            if let Some(entry) = held.get_mut(key) {
                if entry.released.load(Ordering::SeqCst) {
                    held.remove(key);
                } else {
                    entry.count += 1;
                    return Ok(Box::new(EtcdLockHandle {
                        client: self.client.clone(),
                        held: self.held.clone(),
                        key: key.to_string(),
                        lease_id: entry.lease_id,
                        token: entry.token.clone(),
                        released: entry.released.clone(),
                        refresher: None,
                    }));
                }
            }
        }

        let mut lease = self.client.lease_client();
        let grant = lease
            .grant(VALID_TIME_PERIOD.as_secs() as i64, None)
            .await
            .map_err(etcd_error)?;
        let lease_id = grant.id();

        // The etcd lock call blocks behind the current holder; bound it so
        // contention surfaces as an error the caller can back off on.
        let mut lock_client = self.client.lock_client();
        let acquired = tokio::time::timeout(
            DEFAULT_OP_TIMEOUT,
            lock_client.lock(key, Some(LockOptions::new().with_lease(lease_id))),
        )
        .await;

        let lock_key = match acquired {
            Ok(Ok(resp)) => resp.key().to_vec(),
            Ok(Err(e)) => {
                let _ = lease.revoke(lease_id).await;
                return Err(etcd_error(e));
            }
            Err(_) => {
                let _ = lease.revoke(lease_id).await;
                return Err(FeatureformError::LockContended(key.to_string()));
            }
        };

        let token = CancelToken::new();
        let released = Arc::new(AtomicBool::new(false));
        self.held.lock().insert(
            key.to_string(),
            HeldLock {
                lease_id,
                lock_key,
                count: 1,
                token: token.clone(),
                released: released.clone(),
            },
        );

        let refresher = tokio::spawn(refresh_lease(
            self.client.lease_client(),
            lease_id,
            token.clone(),
            released.clone(),
        ));

        Ok(Box::new(EtcdLockHandle {
            client: self.client.clone(),
            held: self.held.clone(),
            key: key.to_string(),
            lease_id,
            token,
            released,
            refresher: Some(refresher),
        }))
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let mut watch_client = self.client.watch_client();
        let (watcher, stream) = watch_client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(etcd_error)?;

        let stream = futures::stream::unfold(
            (watcher, stream, VecDeque::<WatchEvent>::new()),
            |(watcher, mut stream, mut pending)| async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((event, (watcher, stream, pending)));
                    }
                    match stream.message().await {
                        Ok(Some(resp)) => {
                            let revision =
                                resp.header().map(|h| h.revision()).unwrap_or_default();
                            for event in resp.events() {
                                let Some(kv) = event.kv() else { continue };
                                let key = String::from_utf8_lossy(kv.key()).to_string();
                                match event.event_type() {
                                    EventType::Put => pending.push_back(WatchEvent::Put {
                                        key,
                                        value: String::from_utf8_lossy(kv.value())
                                            .to_string(),
                                        revision: kv.mod_revision(),
                                    }),
                                    EventType::Delete => {
                                        pending.push_back(WatchEvent::Delete {
                                            key,
                                            revision,
                                        })
                                    }
                                }
                            }
                        }
                        Ok(None) => return None,
                        Err(e) => {
                            warn!("Etcd watch stream failed: {e}");
                            return None;
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    async fn next_ordered_id(&self, namespace: &str) -> Result<u64> {
        let key = ordered_id_key(namespace);

        // Allocation contention between coordinators is short-lived; wait
        // out the current holder rather than surfacing LockContended from
        // inside the allocator.
        let mut lock = {
            let mut attempts = 0;
            loop {
                match self.lock(&key).await {
                    Ok(lock) => break lock,
                    Err(e) if e.is_lock_contended() && attempts < 50 => {
                        attempts += 1;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    Err(e) if e.is_lock_contended() => {
                        return Err(FeatureformError::Transient(format!(
                            "ordered-id lock on {key} stayed contended"
                        )))
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let result = async {
            let current = match self.get(&key).await {
                Ok(raw) => raw.parse::<u64>().map_err(|e| {
                    FeatureformError::Internal(format!(
                        "corrupt ordered-id counter at {key}: {e}"
                    ))
                })?,
                Err(e) if e.is_not_found() => 0,
                Err(e) => return Err(e),
            };
            let next = current + 1;
            self.put(&key, &next.to_string()).await?;
            Ok(next)
        }
        .await;

        let unlocked = lock.unlock().await;
        result.and_then(|next| unlocked.map(|_| next))
    }
}
