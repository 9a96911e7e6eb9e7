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

//! Typed read/modify/write over the coordination store. `update` is the
//! only read-modify-write primitive in the repository; every mutation of an
//! existing key goes through it so writers serialize per key without
//! exposing CAS revisions.

use crate::state::backend::CoordinationStore;
use crate::state::with_lock;
use featureform_core::error::{FeatureformError, Result};
use log::{error, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct MetadataStorage {
    store: Arc<dyn CoordinationStore>,
}

impl MetadataStorage {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn CoordinationStore> {
        self.store.clone()
    }

    /// Create a key that must not already exist. The existence check runs
    /// under the key's lock so concurrent creators serialize.
    pub async fn create(&self, key: &str, value: &str) -> Result<()> {
        let lock = self.store.lock(key).await?;
        with_lock(lock, async {
            match self.store.get(key).await {
                Ok(_) => Err(FeatureformError::AlreadyExists(key.to_string())),
                Err(e) if e.is_not_found() => self.store.put(key, value).await,
                Err(e) => Err(e),
            }
        })
        .await
    }

    pub async fn get(&self, key: &str) -> Result<String> {
        self.store.get(key).await
    }

    pub async fn list(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .store
            .get_with_prefix(prefix)
            .await?
            .into_iter()
            .collect())
    }

    /// Create every entry, or none. On a partial failure the entries
    /// already written are reversed best-effort before the error returns.
    pub async fn multi_create(&self, entries: Vec<(String, String)>) -> Result<()> {
        let mut created: Vec<String> = Vec::with_capacity(entries.len());

        for (key, value) in &entries {
            match self.create(key, value).await {
                Ok(()) => created.push(key.clone()),
                Err(e) => {
                    warn!("Multi-create failed on {key}, reversing {} entries", created.len());
                    for key in created {
                        if let Err(cleanup) = self.store.delete(&key).await {
                            error!("Failed to reverse create of {key}: {cleanup}");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Lock the key, read its value, apply `f`, and write the result back.
    /// `f` must be side-effect-free; returning an error aborts the update
    /// with the lock released.
    pub async fn update<F>(&self, key: &str, f: F) -> Result<String>
    where
        F: FnOnce(&str) -> Result<String> + Send,
    {
        let lock = self.store.lock(key).await?;
        with_lock(lock, async {
            let current = self.store.get(key).await?;
            let next = f(&current)?;
            self.store.put(key, &next).await?;
            Ok(next)
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(key).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::state::backend::memory::MemoryStore;

    fn storage() -> MetadataStorage {
        MetadataStorage::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_create_rejects_existing_key() -> Result<()> {
        let storage = storage();
        storage.create("a", "1").await?;
        let err = storage.create("a", "2").await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(storage.get("a").await?, "1");
        Ok(())
    }

    #[tokio::test]
    async fn test_update_applies_function_under_lock() -> Result<()> {
        let storage = storage();
        storage.create("counter", "1").await?;

        let next = storage
            .update("counter", |current| {
                let n: u64 = current.parse().unwrap();
                Ok((n + 1).to_string())
            })
            .await?;

        assert_eq!(next, "2");
        assert_eq!(storage.get("counter").await?, "2");
        Ok(())
    }

    #[tokio::test]
    async fn test_update_aborts_without_writing() -> Result<()> {
        let storage = storage();
        storage.create("a", "original").await?;

        let err = storage
            .update("a", |_| {
                Err(FeatureformError::InvalidArgument("rejected".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FeatureformError::InvalidArgument(_)));
        assert_eq!(storage.get("a").await?, "original");

        // The lock was released despite the abort.
        storage
            .update("a", |_| Ok("changed".to_string()))
            .await?;
        assert_eq!(storage.get("a").await?, "changed");
        Ok(())
    }

    #[tokio::test]
    async fn test_update_missing_key_fails() {
        let storage = storage();
        let err = storage
            .update("missing", |v| Ok(v.to_string()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_multi_create_reverses_on_failure() -> Result<()> {
        let storage = storage();
        storage.create("c", "already here").await?;

        let err = storage
            .multi_create(vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
                ("c".to_string(), "3".to_string()),
            ])
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        // The batch was reversed; only the pre-existing key remains.
        assert!(storage.get("a").await.unwrap_err().is_not_found());
        assert!(storage.get("b").await.unwrap_err().is_not_found());
        assert_eq!(storage.get("c").await?, "already here");
        Ok(())
    }

    #[tokio::test]
    async fn test_multi_create_success() -> Result<()> {
        let storage = storage();
        storage
            .multi_create(vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ])
            .await?;
        assert_eq!(storage.get("a").await?, "1");
        assert_eq!(storage.get("b").await?, "2");
        Ok(())
    }

    #[tokio::test]
    async fn test_list() -> Result<()> {
        let storage = storage();
        storage.create("jobs/a", "1").await?;
        storage.create("jobs/b", "2").await?;
        storage.create("tasks/c", "3").await?;

        let jobs = storage.list("jobs/").await?;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs["jobs/a"], "1");
        assert_eq!(jobs["jobs/b"], "2");
        Ok(())
    }
}
