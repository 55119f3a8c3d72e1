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

use std::sync::Arc;

use bytes::Bytes;
use photon_common::ids::ObjectId;
use tokio::sync::broadcast;

use crate::error::ObjectResult;
use crate::metrics::ObjectStoreMetrics;
use crate::PlasmaStore;

/// Wraps a concrete store and records per-operation traffic metrics.
pub struct MonitoredPlasmaStore<S: PlasmaStore> {
    inner: S,
    metrics: Arc<ObjectStoreMetrics>,
}

impl<S: PlasmaStore> MonitoredPlasmaStore<S> {
    pub fn new(store: S, metrics: Arc<ObjectStoreMetrics>) -> Self {
        Self {
            inner: store,
            metrics,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub async fn put(
        &self,
        id: ObjectId,
        data: Bytes,
        memcopy_threads: usize,
    ) -> ObjectResult<()> {
        let timer = self
            .metrics
            .operation_latency
            .with_label_values(&["put"])
            .start_timer();
        let len = data.len() as u64;
        let res = self.inner.put(id, data, memcopy_threads).await;
        timer.observe_duration();
        match &res {
            Ok(()) => self
                .metrics
                .operation_size
                .with_label_values(&["put"])
                .inc_by(len),
            Err(_) => self
                .metrics
                .failure_count
                .with_label_values(&["put"])
                .inc(),
        }
        res
    }

    pub async fn get(&self, ids: &[ObjectId], timeout_ms: u64) -> ObjectResult<Vec<Option<Bytes>>> {
        let timer = self
            .metrics
            .operation_latency
            .with_label_values(&["get"])
            .start_timer();
        let res = self.inner.get(ids, timeout_ms).await;
        timer.observe_duration();
        match &res {
            Ok(results) => {
                let bytes: usize = results.iter().flatten().map(|b| b.len()).sum();
                self.metrics
                    .operation_size
                    .with_label_values(&["get"])
                    .inc_by(bytes as u64);
            }
            Err(_) => self
                .metrics
                .failure_count
                .with_label_values(&["get"])
                .inc(),
        }
        res
    }

    pub async fn contains(&self, id: ObjectId) -> ObjectResult<bool> {
        self.inner.contains(id).await
    }

    pub fn subscribe_additions(&self) -> broadcast::Receiver<ObjectId> {
        self.inner.subscribe_additions()
    }

    pub async fn disconnect(&self) -> ObjectResult<()> {
        self.inner.disconnect().await
    }
}
