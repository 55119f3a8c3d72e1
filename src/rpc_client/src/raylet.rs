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

use std::collections::HashMap;
use std::sync::Arc;

use photon_common::ids::{ObjectId, TaskId};
use photon_common::task::TaskSpec;

use crate::error::Result;

/// Resource name to the (slot id, fraction) pairs allotted to the current
/// task, e.g. `{"GPU": [(0, 1.0), (1, 1.0)]}`.
pub type ResourceIdMap = HashMap<String, Vec<(u64, f64)>>;

pub type RayletClientRef = Arc<dyn RayletClient>;

/// Client connection to the per-node local scheduler.
#[async_trait::async_trait]
pub trait RayletClient: Send + Sync + 'static {
    /// Block until the scheduler assigns this worker a task.
    async fn get_task(&self) -> Result<TaskSpec>;

    async fn submit_task(&self, spec: TaskSpec) -> Result<()>;

    /// Ask the scheduler to make the given objects local, reconstructing
    /// lost ones if needed. With `fetch_only` the request only primes
    /// availability; otherwise it marks `current_task_id` as stalled on the
    /// objects, which allows the scheduler to reassign its resources.
    async fn fetch_or_reconstruct(
        &self,
        object_ids: &[ObjectId],
        fetch_only: bool,
        current_task_id: TaskId,
    ) -> Result<()>;

    /// Retract any earlier blocking fetches issued on behalf of `task_id`.
    async fn notify_unblocked(&self, task_id: TaskId) -> Result<()>;

    /// Server-side wait: resolves once `num_returns` of `object_ids` are
    /// locally available or the timeout fires. Both returned lists preserve
    /// the input order.
    async fn wait(
        &self,
        object_ids: &[ObjectId],
        num_returns: usize,
        timeout_ms: u64,
        blocked: bool,
        task_id: TaskId,
    ) -> Result<(Vec<ObjectId>, Vec<ObjectId>)>;

    /// Resources allotted to the task currently assigned to this worker.
    async fn resource_ids(&self) -> Result<ResourceIdMap>;

    async fn disconnect(&self) -> Result<()>;

    /// Deterministic id of the `put_index`-th put of `task_id`. The
    /// derivation is owned by the scheduler protocol so that every
    /// component computes identical ids.
    fn compute_put_id(&self, task_id: TaskId, put_index: i32) -> ObjectId {
        ObjectId::for_put(task_id, put_index)
    }
}
