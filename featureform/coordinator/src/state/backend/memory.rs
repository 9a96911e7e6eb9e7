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

//! In-memory coordination store. Single-process only; backs tests and
//! standalone deployments. Lock leases expire exactly as in the distributed
//! backend, so holder-death recovery paths are exercised here too.

use crate::state::backend::{
    ordered_id_key, CoordinationStore, LockHandle, WatchEvent, WatchStream,
    VALID_TIME_PERIOD,
};
use async_trait::async_trait;
use featureform_core::error::{FeatureformError, Result};
use featureform_core::utils::CancelToken;
use futures::StreamExt;
use log::warn;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct LockEntry {
    holder: String,
    lease_id: u64,
    expires_at: Instant,
    count: usize,
    token: CancelToken,
    released: Arc<AtomicBool>,
}

#[derive(Debug)]
struct StoreInner {
    data: RwLock<BTreeMap<String, String>>,
    locks: Mutex<HashMap<String, LockEntry>>,
    // Serializes ordered-id allocation across sessions.
    ids: Mutex<()>,
    revision: AtomicI64,
    next_lease: AtomicU64,
    events: broadcast::Sender<WatchEvent>,
    lease_ttl: Duration,
}

impl StoreInner {
    fn next_revision(&self) -> i64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, event: WatchEvent) {
        // Send fails when no watcher is subscribed, which is fine.
        let _ = self.events.send(event);
    }
}

/// In-memory [`CoordinationStore`]. Clones share state and lock-holder
/// identity; [`MemoryStore::session`] creates a distinct holder over the
/// same state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
    holder: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lease_ttl(VALID_TIME_PERIOD)
    }

    pub fn with_lease_ttl(lease_ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                data: RwLock::new(BTreeMap::new()),
                locks: Mutex::new(HashMap::new()),
                ids: Mutex::new(()),
                revision: AtomicI64::new(0),
                next_lease: AtomicU64::new(1),
                events,
                lease_ttl,
            }),
            holder: Uuid::new_v4().to_string(),
        }
    }

    /// A new lock-holder identity over the same shared state, as a second
    /// coordinator instance would have.
    pub fn session(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            holder: Uuid::new_v4().to_string(),
        }
    }

    pub async fn acquire(&self, key: &str) -> Result<MemoryLockHandle> {
        let ttl = self.inner.lease_ttl;
        let (lease_id, token, released) = {
            let mut locks = self.inner.locks.lock();
            let now = Instant::now();

            if let Some(entry) = locks.get_mut(key) {
                if entry.expires_at > now {
                    if entry.holder == self.holder {
                        entry.count += 1;
                        return Ok(MemoryLockHandle {
                            inner: self.inner.clone(),
                            key: key.to_string(),
                            lease_id: entry.lease_id,
                            token: entry.token.clone(),
                            released: entry.released.clone(),
                            refresher: None,
                        });
                    }
                    return Err(FeatureformError::LockContended(key.to_string()));
                }
                // The lease expired with the lock still registered: its
                // holder died without unlocking.
                entry.token.cancel();
                locks.remove(key);
            }

            let lease_id = self.inner.next_lease.fetch_add(1, Ordering::SeqCst);
            let token = CancelToken::new();
            let released = Arc::new(AtomicBool::new(false));
            locks.insert(
                key.to_string(),
                LockEntry {
                    holder: self.holder.clone(),
                    lease_id,
                    expires_at: now + ttl,
                    count: 1,
                    token: token.clone(),
                    released: released.clone(),
                },
            );
            (lease_id, token, released)
        };

        let refresher = tokio::spawn(refresh_lease(
            self.inner.clone(),
            key.to_string(),
            lease_id,
            token.clone(),
            released.clone(),
        ));

        Ok(MemoryLockHandle {
            inner: self.inner.clone(),
            key: key.to_string(),
            lease_id,
            token,
            released,
            refresher: Some(refresher),
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn refresh_lease(
    inner: Arc<StoreInner>,
    key: String,
    lease_id: u64,
    token: CancelToken,
    released: Arc<AtomicBool>,
) {
    let ttl = inner.lease_ttl;
    loop {
        tokio::time::sleep(ttl / 3).await;
        if released.load(Ordering::SeqCst) {
            return;
        }
        let mut locks = inner.locks.lock();
        match locks.get_mut(&key) {
            Some(entry) if entry.lease_id == lease_id => {
                entry.expires_at = Instant::now() + ttl;
            }
            _ => {
                // The entry was stolen after an expiry. The holder must
                // stop trusting the lock.
                token.cancel();
                return;
            }
        }
    }
}

#[derive(Debug)]
pub struct MemoryLockHandle {
    inner: Arc<StoreInner>,
    key: String,
    lease_id: u64,
    token: CancelToken,
    released: Arc<AtomicBool>,
    refresher: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl LockHandle for MemoryLockHandle {
    fn key(&self) -> &str {
        &self.key
    }

    fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    async fn unlock(&mut self) -> Result<()> {
        let mut locks = self.inner.locks.lock();
        match locks.get_mut(&self.key) {
            Some(entry) if entry.lease_id == self.lease_id => {
                entry.count -= 1;
                if entry.count == 0 {
                    locks.remove(&self.key);
                    self.released.store(true, Ordering::SeqCst);
                    if let Some(refresher) = self.refresher.take() {
                        refresher.abort();
                    }
                }
                Ok(())
            }
            _ => Err(FeatureformError::LeaseLost(format!(
                "lock on {} is no longer held",
                self.key
            ))),
        }
    }
}

impl Drop for MemoryLockHandle {
    fn drop(&mut self) {
        // Dropping without unlocking models a crashed holder: refreshing
        // stops and the lease is left to expire.
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .data
            .write()
            .insert(key.to_string(), value.to_string());
        let revision = self.inner.next_revision();
        self.inner.publish(WatchEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
            revision,
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.inner
            .data
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| FeatureformError::NotFound(key.to_string()))
    }

    async fn get_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let data = self.inner.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn count_with_prefix(&self, prefix: &str) -> Result<usize> {
        let data = self.inner.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .count())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let removed = self.inner.data.write().remove(key);
        if removed.is_some() {
            let revision = self.inner.next_revision();
            self.inner.publish(WatchEvent::Delete {
                key: key.to_string(),
                revision,
            });
        }
        Ok(())
    }

    async fn lock(&self, key: &str) -> Result<Box<dyn LockHandle>> {
        Ok(Box::new(self.acquire(key).await?))
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let rx = self.inner.events.subscribe();
        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |event| {
            let prefix = prefix.clone();
            async move {
                match event {
                    Ok(ev) if ev.key().starts_with(&prefix) => Some(ev),
                    Ok(_) => None,
                    Err(e) => {
                        warn!("Watch stream lagged: {e}");
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn next_ordered_id(&self, namespace: &str) -> Result<u64> {
        let _guard = self.inner.ids.lock();
        let key = ordered_id_key(namespace);

        let current = match self.inner.data.read().get(&key) {
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                FeatureformError::Internal(format!(
                    "corrupt ordered-id counter at {key}: {e}"
                ))
            })?,
            None => 0,
        };

        let next = current + 1;
        self.inner.data.write().insert(key, next.to_string());
        Ok(next)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_put_get_delete() -> Result<()> {
        let store = MemoryStore::new();

        assert!(store.get("missing").await.unwrap_err().is_not_found());

        store.put("a", "1").await?;
        assert_eq!(store.get("a").await?, "1");

        store.put("a", "2").await?;
        assert_eq!(store.get("a").await?, "2");

        store.delete("a").await?;
        assert!(store.get("a").await.unwrap_err().is_not_found());

        // Deleting an absent key is a no-op.
        store.delete("a").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_prefix_listing_is_ordered() -> Result<()> {
        let store = MemoryStore::new();
        store.put("jobs/b", "2").await?;
        store.put("jobs/a", "1").await?;
        store.put("jobs/c", "3").await?;
        store.put("other/z", "9").await?;

        let entries = store.get_with_prefix("jobs/").await?;
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["jobs/a", "jobs/b", "jobs/c"]);

        assert_eq!(store.count_with_prefix("jobs/").await?, 3);
        assert_eq!(store.count_with_prefix("nope/").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_watch_delivers_events_in_revision_order() -> Result<()> {
        let store = MemoryStore::new();
        let mut watch = store.watch("jobs/").await?;

        store.put("jobs/a", "1").await?;
        store.put("ignored/b", "2").await?;
        store.put("jobs/a", "3").await?;
        store.delete("jobs/a").await?;

        let first = watch.next().await.unwrap();
        let second = watch.next().await.unwrap();
        let third = watch.next().await.unwrap();

        assert!(matches!(
            &first,
            WatchEvent::Put { key, value, .. } if key == "jobs/a" && value == "1"
        ));
        assert!(matches!(
            &second,
            WatchEvent::Put { key, value, .. } if key == "jobs/a" && value == "3"
        ));
        assert!(matches!(
            &third,
            WatchEvent::Delete { key, .. } if key == "jobs/a"
        ));
        assert!(first.revision() < second.revision());
        assert!(second.revision() < third.revision());
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_exclusivity() -> Result<()> {
        let store = MemoryStore::new();
        let other = store.session();

        let mut held = store.acquire("jobs/a").await?;

        let err = other.acquire("jobs/a").await.unwrap_err();
        assert!(err.is_lock_contended());

        held.unlock().await?;

        let mut reacquired = other.acquire("jobs/a").await?;
        reacquired.unlock().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_reentrance() -> Result<()> {
        let store = MemoryStore::new();
        let other = store.session();

        let mut outer = store.acquire("jobs/a").await?;
        let mut inner = store.acquire("jobs/a").await?;

        inner.unlock().await?;

        // Still held after the inner unlock.
        assert!(other.acquire("jobs/a").await.unwrap_err().is_lock_contended());

        outer.unlock().await?;
        let mut handle = other.acquire("jobs/a").await?;
        handle.unlock().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_unlock_twice_fails() -> Result<()> {
        let store = MemoryStore::new();
        let mut held = store.acquire("jobs/a").await?;
        held.unlock().await?;
        assert!(held.unlock().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_lease_survives_while_holder_alive() -> Result<()> {
        let ttl = Duration::from_millis(100);
        let store = MemoryStore::with_lease_ttl(ttl);
        let other = store.session();

        let mut held = store.acquire("jobs/a").await?;

        // Well past the lease period; the refresher keeps it alive.
        tokio::time::sleep(ttl * 3).await;
        assert!(other.acquire("jobs/a").await.unwrap_err().is_lock_contended());
        assert!(!held.cancel_token().is_cancelled());

        held.unlock().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_dead_holder_lock_expires() -> Result<()> {
        let ttl = Duration::from_millis(100);
        let store = MemoryStore::with_lease_ttl(ttl);
        let other = store.session();

        let held = store.acquire("jobs/a").await?;
        let dead_token = held.cancel_token();
        // Dropping without unlocking models a crash: refreshing stops.
        drop(held);

        let deadline = Instant::now() + ttl * 2 + Duration::from_millis(100);
        let mut acquired = None;
        while Instant::now() < deadline {
            match other.acquire("jobs/a").await {
                Ok(handle) => {
                    acquired = Some(handle);
                    break;
                }
                Err(e) if e.is_lock_contended() => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => return Err(e),
            }
        }

        let mut handle = acquired.expect("lock should expire within 2x the lease period");
        assert!(dead_token.is_cancelled());
        handle.unlock().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_ordered_ids_are_unique_and_dense() -> Result<()> {
        let store = MemoryStore::new();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..10 {
                    ids.push(store.next_ordered_id("task").await.unwrap());
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }

        let unique: HashSet<u64> = all.iter().copied().collect();
        assert_eq!(unique.len(), 200);
        assert_eq!(*all.iter().max().unwrap(), 200);
        Ok(())
    }

    #[tokio::test]
    async fn test_ordered_ids_monotonic_and_namespaced() -> Result<()> {
        let store = MemoryStore::new();

        let mut last = 0;
        for _ in 0..10 {
            let id = store.next_ordered_id("task").await?;
            assert!(id > last);
            last = id;
        }

        // Namespaces are independent.
        assert_eq!(store.next_ordered_id("task_run").await?, 1);
        Ok(())
    }
}
