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

//! Client side of the plasma object store protocol.
//!
//! The store itself is an external collaborator; this crate defines the
//! request/response surface the worker depends on, an in-memory
//! implementation backing the embedded single-node cluster and the test
//! suite, and a monitored wrapper recording store traffic metrics.

use std::sync::Arc;

use bytes::Bytes;
use photon_common::ids::ObjectId;
use tokio::sync::broadcast;

pub mod error;
pub mod mem;
pub mod metrics;
pub mod monitor;

pub use error::{ObjectError, ObjectResult};
pub use mem::InMemPlasmaStore;
pub use metrics::ObjectStoreMetrics;
pub use monitor::MonitoredPlasmaStore;

pub type PlasmaStoreRef = Arc<PlasmaStoreImpl>;

/// The store client surface. Implementations must be thread-safe.
#[async_trait::async_trait]
pub trait PlasmaStore: Send + Sync + 'static {
    /// Write an object. Fails with [`ObjectError::ObjectExists`] if the id
    /// is already present; the payloads are *not* compared.
    async fn put(&self, id: ObjectId, data: Bytes, memcopy_threads: usize) -> ObjectResult<()>;

    /// Read a batch of objects. Each slot is `None` if the object is still
    /// absent after `timeout_ms` (0 means return immediately).
    async fn get(&self, ids: &[ObjectId], timeout_ms: u64) -> ObjectResult<Vec<Option<Bytes>>>;

    async fn contains(&self, id: ObjectId) -> ObjectResult<bool>;

    /// Stream of ids as they become locally available. The local scheduler
    /// uses this to resolve task dependencies.
    fn subscribe_additions(&self) -> broadcast::Receiver<ObjectId>;

    async fn disconnect(&self) -> ObjectResult<()>;
}

pub enum PlasmaStoreImpl {
    InMem(MonitoredPlasmaStore<InMemPlasmaStore>),
}

/// Routes a store operation to the concrete implementation behind
/// [`PlasmaStoreImpl`].
macro_rules! plasma_store_impl_method_body {
    ($object_store:expr, $method_name:ident $(, $args:expr)*) => {
        match $object_store {
            PlasmaStoreImpl::InMem(in_mem) => in_mem.$method_name($($args, )*).await,
        }
    };
}

impl PlasmaStoreImpl {
    pub fn in_mem(metrics: Arc<ObjectStoreMetrics>) -> Self {
        Self::InMem(MonitoredPlasmaStore::new(InMemPlasmaStore::new(), metrics))
    }

    pub async fn put(
        &self,
        id: ObjectId,
        data: Bytes,
        memcopy_threads: usize,
    ) -> ObjectResult<()> {
        plasma_store_impl_method_body!(self, put, id, data, memcopy_threads)
    }

    pub async fn get(&self, ids: &[ObjectId], timeout_ms: u64) -> ObjectResult<Vec<Option<Bytes>>> {
        plasma_store_impl_method_body!(self, get, ids, timeout_ms)
    }

    pub async fn contains(&self, id: ObjectId) -> ObjectResult<bool> {
        plasma_store_impl_method_body!(self, contains, id)
    }

    pub fn subscribe_additions(&self) -> broadcast::Receiver<ObjectId> {
        match self {
            PlasmaStoreImpl::InMem(in_mem) => in_mem.subscribe_additions(),
        }
    }

    pub async fn disconnect(&self) -> ObjectResult<()> {
        plasma_store_impl_method_body!(self, disconnect)
    }
}
