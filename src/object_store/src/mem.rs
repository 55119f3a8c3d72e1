// Copyright 2024 Photon Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-memory object store, used by the embedded single-node cluster and
//! in tests.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use photon_common::ids::ObjectId;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use crate::error::{ObjectError, ObjectResult};
use crate::PlasmaStore;

const ADDITION_CHANNEL_CAPACITY: usize = 4096;

pub struct InMemPlasmaStore {
    objects: Mutex<HashMap<ObjectId, Bytes>>,
    /// Woken on every successful `put` so pending `get`s can re-check.
    new_object: Notify,
    additions: broadcast::Sender<ObjectId>,
    disconnected: Mutex<bool>,
}

impl Default for InMemPlasmaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemPlasmaStore {
    pub fn new() -> Self {
        let (additions, _) = broadcast::channel(ADDITION_CHANNEL_CAPACITY);
        Self {
            objects: Mutex::new(HashMap::new()),
            new_object: Notify::new(),
            additions,
            disconnected: Mutex::new(false),
        }
    }

    fn check_connected(&self) -> ObjectResult<()> {
        if *self.disconnected.lock() {
            return Err(ObjectError::Disconnected);
        }
        Ok(())
    }

    fn try_get_all(&self, ids: &[ObjectId]) -> (Vec<Option<Bytes>>, usize) {
        let objects = self.objects.lock();
        let mut missing = 0;
        let results = ids
            .iter()
            .map(|id| {
                let found = objects.get(id).cloned();
                if found.is_none() {
                    missing += 1;
                }
                found
            })
            .collect();
        (results, missing)
    }
}

#[async_trait::async_trait]
impl PlasmaStore for InMemPlasmaStore {
    async fn put(&self, id: ObjectId, data: Bytes, _memcopy_threads: usize) -> ObjectResult<()> {
        self.check_connected()?;
        {
            let mut objects = self.objects.lock();
            if objects.contains_key(&id) {
                return Err(ObjectError::ObjectExists(id));
            }
            objects.insert(id, data);
        }
        self.new_object.notify_waiters();
        // Nobody may be listening yet; additions are best-effort.
        let _ = self.additions.send(id);
        Ok(())
    }

    async fn get(&self, ids: &[ObjectId], timeout_ms: u64) -> ObjectResult<Vec<Option<Bytes>>> {
        self.check_connected()?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            // Register for the wakeup before checking, otherwise a `put`
            // racing with the check would be lost.
            let notified = self.new_object.notified();
            let (results, missing) = self.try_get_all(ids);
            if missing == 0 || timeout_ms == 0 {
                return Ok(results);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(self.try_get_all(ids).0);
                }
            }
        }
    }

    async fn contains(&self, id: ObjectId) -> ObjectResult<bool> {
        self.check_connected()?;
        Ok(self.objects.lock().contains_key(&id))
    }

    fn subscribe_additions(&self) -> broadcast::Receiver<ObjectId> {
        self.additions.subscribe()
    }

    async fn disconnect(&self) -> ObjectResult<()> {
        *self.disconnected.lock() = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = InMemPlasmaStore::new();
        let id = ObjectId::random();
        store.put(id, Bytes::from_static(b"hello"), 1).await.unwrap();
        let results = store.get(&[id], 0).await.unwrap();
        assert_eq!(results, vec![Some(Bytes::from_static(b"hello"))]);
        assert!(store.contains(id).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_put_reports_object_exists() {
        let store = InMemPlasmaStore::new();
        let id = ObjectId::random();
        store.put(id, Bytes::from_static(b"a"), 1).await.unwrap();
        assert_matches!(
            store.put(id, Bytes::from_static(b"b"), 1).await,
            Err(ObjectError::ObjectExists(reported)) if reported == id
        );
    }

    #[tokio::test]
    async fn get_times_out_on_missing_objects() {
        let store = InMemPlasmaStore::new();
        let results = store.get(&[ObjectId::random()], 10).await.unwrap();
        assert_eq!(results, vec![None]);
    }

    #[tokio::test]
    async fn blocked_get_wakes_up_on_put() {
        let store = std::sync::Arc::new(InMemPlasmaStore::new());
        let id = ObjectId::random();
        let reader = {
            let store = store.clone();
            tokio::spawn(async move { store.get(&[id], 5_000).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.put(id, Bytes::from_static(b"late"), 1).await.unwrap();
        let results = reader.await.unwrap().unwrap();
        assert_eq!(results, vec![Some(Bytes::from_static(b"late"))]);
    }

    #[tokio::test]
    async fn additions_stream_sees_new_objects() {
        let store = InMemPlasmaStore::new();
        let mut additions = store.subscribe_additions();
        let id = ObjectId::random();
        store.put(id, Bytes::new(), 1).await.unwrap();
        assert_eq!(additions.recv().await.unwrap(), id);
    }

    #[tokio::test]
    async fn disconnected_store_rejects_operations() {
        let store = InMemPlasmaStore::new();
        store.disconnect().await.unwrap();
        assert_matches!(
            store.get(&[ObjectId::random()], 0).await,
            Err(ObjectError::Disconnected)
        );
    }
}
