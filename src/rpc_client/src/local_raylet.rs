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

//! Embedded single-node scheduler.
//!
//! Backs bootstrap mode and the test suite with the same dispatch contract
//! a production raylet provides: a task is handed to a worker only once
//! every execution dependency and by-reference argument is locally
//! available, actor-method tasks are pinned to the worker that executed
//! the actor's creation task, and GPU slots are allotted per task from a
//! fixed pool. There is no cross-node scheduling and no reconstruction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use photon_common::ids::{ActorId, ClientId, ObjectId, TaskId};
use photon_common::task::TaskSpec;
use photon_object_store::PlasmaStoreRef;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Result, RpcError};
use crate::raylet::{RayletClient, ResourceIdMap};

struct SchedulerState {
    pending: VecDeque<TaskSpec>,
    /// Objects known to be local, fed by the store's additions stream.
    available: HashSet<ObjectId>,
    idle_workers: VecDeque<ClientId>,
    workers: HashMap<ClientId, mpsc::UnboundedSender<TaskSpec>>,
    /// Actor id to the worker its creation task ran on.
    actor_owners: HashMap<ActorId, ClientId>,
    /// Workers consumed by an actor; they only ever receive that actor's
    /// method tasks.
    actor_workers: HashSet<ClientId>,
    resource_assignments: HashMap<ClientId, ResourceIdMap>,
    gpu_pool: Vec<u64>,
    blocked_tasks: HashSet<TaskId>,
    shutdown: bool,
}

struct Shared {
    store: PlasmaStoreRef,
    state: Mutex<SchedulerState>,
    wake: Notify,
}

pub struct LocalRaylet {
    shared: Arc<Shared>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl LocalRaylet {
    pub fn new(store: PlasmaStoreRef, num_gpus: u64) -> Arc<Self> {
        let shared = Arc::new(Shared {
            store,
            state: Mutex::new(SchedulerState {
                pending: VecDeque::new(),
                available: HashSet::new(),
                idle_workers: VecDeque::new(),
                workers: HashMap::new(),
                actor_owners: HashMap::new(),
                actor_workers: HashSet::new(),
                resource_assignments: HashMap::new(),
                gpu_pool: (0..num_gpus).collect(),
                blocked_tasks: HashSet::new(),
                shutdown: false,
            }),
            wake: Notify::new(),
        });
        let scheduler = tokio::spawn(Self::run_scheduler(shared.clone()));
        Arc::new(Self {
            shared,
            scheduler: Mutex::new(Some(scheduler)),
        })
    }

    /// Register a client connection. Drivers connect too; only clients that
    /// call `get_task` participate in dispatch.
    pub fn connect(&self, client_id: ClientId) -> LocalRayletClient {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.shared.state.lock();
        state.workers.insert(client_id, sender);
        state.resource_assignments.insert(client_id, ResourceIdMap::new());
        LocalRayletClient {
            client_id,
            shared: self.shared.clone(),
            assigned: tokio::sync::Mutex::new(receiver),
        }
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.workers.clear();
        }
        self.shared.wake.notify_waiters();
        if let Some(handle) = self.scheduler.lock().take() {
            handle.abort();
        }
    }

    async fn run_scheduler(shared: Arc<Shared>) {
        let mut additions = shared.store.subscribe_additions();
        loop {
            Self::dispatch_ready(&shared);
            tokio::select! {
                _ = shared.wake.notified() => {
                    if shared.state.lock().shutdown {
                        break;
                    }
                }
                result = additions.recv() => match result {
                    Ok(id) => {
                        shared.state.lock().available.insert(id);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "additions stream lagged, resyncing");
                        Self::resync_available(&shared).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Re-derive availability of every pending dependency straight from the
    /// store after the additions stream lost messages.
    async fn resync_available(shared: &Arc<Shared>) {
        let deps: Vec<ObjectId> = {
            let state = shared.state.lock();
            state
                .pending
                .iter()
                .flat_map(|task| task.dependencies())
                .collect()
        };
        for dep in deps {
            if let Ok(true) = shared.store.contains(dep).await {
                shared.state.lock().available.insert(dep);
            }
        }
    }

    fn dispatch_ready(shared: &Arc<Shared>) {
        let mut state = shared.state.lock();
        if state.shutdown {
            return;
        }
        while let Some((index, worker)) = Self::find_dispatchable(&state) {
            // The index stays valid: the lock is held continuously.
            let task = state
                .pending
                .remove(index)
                .expect("dispatchable index out of range");
            Self::dispatch(&mut state, task, worker);
        }
    }

    fn find_dispatchable(state: &SchedulerState) -> Option<(usize, ClientId)> {
        for (index, task) in state.pending.iter().enumerate() {
            if !task
                .dependencies()
                .iter()
                .all(|dep| state.available.contains(dep))
            {
                continue;
            }
            if Self::gpus_demanded(task) > state.gpu_pool.len() {
                continue;
            }
            let worker = if task.is_actor_task() {
                // Method tasks are pinned; the owner is known once the
                // creation task has been dispatched.
                match state.actor_owners.get(&task.actor_id) {
                    Some(owner) if state.idle_workers.contains(owner) => *owner,
                    _ => continue,
                }
            } else {
                // Workers consumed by an actor never take unrelated tasks.
                match state
                    .idle_workers
                    .iter()
                    .find(|worker| !state.actor_workers.contains(worker))
                {
                    Some(worker) => *worker,
                    None => continue,
                }
            };
            return Some((index, worker));
        }
        None
    }

    fn gpus_demanded(task: &TaskSpec) -> usize {
        task.required_resources
            .get("GPU")
            .map(|demand| demand.floor() as usize)
            .unwrap_or(0)
    }

    fn dispatch(state: &mut SchedulerState, task: TaskSpec, worker: ClientId) {
        state.idle_workers.retain(|w| *w != worker);

        let mut assignment = ResourceIdMap::new();
        let gpus = Self::gpus_demanded(&task);
        if gpus > 0 {
            let slots: Vec<(u64, f64)> = state
                .gpu_pool
                .drain(..gpus)
                .map(|slot| (slot, 1.0))
                .collect();
            assignment.insert("GPU".to_owned(), slots);
        }
        state.resource_assignments.insert(worker, assignment);

        if task.is_actor_creation_task() {
            state.actor_owners.insert(task.actor_creation_id, worker);
            state.actor_workers.insert(worker);
        }

        let task_id = task.task_id;
        if let Some(sender) = state.workers.get(&worker) {
            if sender.send(task).is_err() {
                tracing::warn!(worker = %worker, task = %task_id, "worker went away before dispatch");
            }
        }
    }
}

/// One client's connection to a [`LocalRaylet`].
pub struct LocalRayletClient {
    client_id: ClientId,
    shared: Arc<Shared>,
    assigned: tokio::sync::Mutex<mpsc::UnboundedReceiver<TaskSpec>>,
}

#[async_trait::async_trait]
impl RayletClient for LocalRayletClient {
    async fn get_task(&self) -> Result<TaskSpec> {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown || !state.workers.contains_key(&self.client_id) {
                return Err(RpcError::ConnectionClosed("raylet"));
            }
            // The previous task is finished; its slots return to the pool.
            if let Some(assignment) = state.resource_assignments.insert(
                self.client_id,
                ResourceIdMap::new(),
            ) {
                if let Some(slots) = assignment.get("GPU") {
                    let released: Vec<u64> = slots.iter().map(|(slot, _)| *slot).collect();
                    state.gpu_pool.extend(released);
                }
            }
            if !state.idle_workers.contains(&self.client_id) {
                state.idle_workers.push_back(self.client_id);
            }
        }
        self.shared.wake.notify_waiters();
        self.assigned
            .lock()
            .await
            .recv()
            .await
            .ok_or(RpcError::ConnectionClosed("raylet"))
    }

    async fn submit_task(&self, spec: TaskSpec) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return Err(RpcError::ConnectionClosed("raylet"));
            }
            state.pending.push_back(spec);
        }
        self.shared.wake.notify_waiters();
        Ok(())
    }

    async fn fetch_or_reconstruct(
        &self,
        _object_ids: &[ObjectId],
        fetch_only: bool,
        current_task_id: TaskId,
    ) -> Result<()> {
        // Single-node: objects are either local already or will be produced
        // by a queued task, so there is nothing to transfer or reconstruct.
        // Blocking requests are still tracked for resource accounting.
        if !fetch_only {
            self.shared
                .state
                .lock()
                .blocked_tasks
                .insert(current_task_id);
        }
        self.shared.wake.notify_waiters();
        Ok(())
    }

    async fn notify_unblocked(&self, task_id: TaskId) -> Result<()> {
        self.shared.state.lock().blocked_tasks.remove(&task_id);
        Ok(())
    }

    async fn wait(
        &self,
        object_ids: &[ObjectId],
        num_returns: usize,
        timeout_ms: u64,
        blocked: bool,
        task_id: TaskId,
    ) -> Result<(Vec<ObjectId>, Vec<ObjectId>)> {
        if blocked {
            self.shared.state.lock().blocked_tasks.insert(task_id);
        }
        // Subscribe before the first check so no addition is missed.
        let mut additions = self.shared.store.subscribe_additions();
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let result = loop {
            let mut ready = Vec::new();
            for id in object_ids {
                if self
                    .shared
                    .store
                    .contains(*id)
                    .await
                    .map_err(|e| RpcError::Internal(e.into()))?
                {
                    ready.push(*id);
                }
            }
            if ready.len() >= num_returns || Instant::now() >= deadline {
                break split_by_readiness(object_ids, &ready, num_returns);
            }
            tokio::select! {
                result = additions.recv() => match result {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {
                        break split_by_readiness(object_ids, &ready, num_returns);
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {}
            }
        };
        if blocked {
            self.shared.state.lock().blocked_tasks.remove(&task_id);
        }
        Ok(result)
    }

    async fn resource_ids(&self) -> Result<ResourceIdMap> {
        Ok(self
            .shared
            .state
            .lock()
            .resource_assignments
            .get(&self.client_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.workers.remove(&self.client_id);
        state.idle_workers.retain(|w| *w != self.client_id);
        state.actor_workers.remove(&self.client_id);
        Ok(())
    }
}

/// Split `object_ids` into (ready, remaining), both preserving input order,
/// with at most `num_returns` ids reported ready.
fn split_by_readiness(
    object_ids: &[ObjectId],
    ready: &[ObjectId],
    num_returns: usize,
) -> (Vec<ObjectId>, Vec<ObjectId>) {
    let ready_set: HashSet<&ObjectId> = ready.iter().collect();
    let mut ready_out = Vec::new();
    let mut remaining = Vec::new();
    for id in object_ids {
        if ready_out.len() < num_returns && ready_set.contains(id) {
            ready_out.push(*id);
        } else {
            remaining.push(*id);
        }
    }
    (ready_out, remaining)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;
    use photon_common::ids::{ActorHandleId, DriverId};
    use photon_common::task::{FunctionDescriptor, TaskArg};
    use photon_object_store::{ObjectStoreMetrics, PlasmaStoreImpl};
    use pretty_assertions::assert_eq;

    use super::*;

    fn test_store() -> PlasmaStoreRef {
        Arc::new(PlasmaStoreImpl::in_mem(ObjectStoreMetrics::unused()))
    }

    fn spec(task_id: TaskId, deps: Vec<ObjectId>) -> TaskSpec {
        TaskSpec {
            driver_id: DriverId::random(),
            task_id,
            parent_task_id: TaskId::random(),
            parent_counter: 0,
            function_descriptor: FunctionDescriptor::for_function(DriverId::nil(), "tests", "f"),
            args: deps.into_iter().map(TaskArg::ObjectRef).collect(),
            num_returns: 1,
            required_resources: HashMap::new(),
            required_placement_resources: HashMap::new(),
            actor_creation_id: ActorId::nil(),
            actor_creation_dummy_object_id: ObjectId::nil(),
            max_actor_reconstructions: 0,
            actor_id: ActorId::nil(),
            actor_handle_id: ActorHandleId::nil(),
            actor_counter: 0,
            execution_dependencies: vec![],
        }
    }

    #[tokio::test]
    async fn dispatches_task_without_dependencies() {
        let store = test_store();
        let raylet = LocalRaylet::new(store, 0);
        let worker = raylet.connect(ClientId::random());
        let driver = raylet.connect(ClientId::random());

        let submitted = spec(TaskId::random(), vec![]);
        driver.submit_task(submitted.clone()).await.unwrap();
        let task = worker.get_task().await.unwrap();
        assert_eq!(task.task_id, submitted.task_id);
        raylet.shutdown();
    }

    #[tokio::test]
    async fn holds_task_until_dependency_is_local() {
        let store = test_store();
        let raylet = LocalRaylet::new(store.clone(), 0);
        let worker = raylet.connect(ClientId::random());
        let driver = raylet.connect(ClientId::random());

        let dep = ObjectId::random();
        driver.submit_task(spec(TaskId::random(), vec![dep])).await.unwrap();

        let pending = tokio::spawn(async move { worker.get_task().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        store.put(dep, Bytes::new(), 1).await.unwrap();
        let task = pending.await.unwrap().unwrap();
        assert_eq!(task.dependencies(), vec![dep]);
        raylet.shutdown();
    }

    #[tokio::test]
    async fn wait_preserves_input_order() {
        let store = test_store();
        let raylet = LocalRaylet::new(store.clone(), 0);
        let driver = raylet.connect(ClientId::random());

        let ids: Vec<ObjectId> = (0..4).map(|_| ObjectId::random()).collect();
        store.put(ids[1], Bytes::new(), 1).await.unwrap();
        store.put(ids[3], Bytes::new(), 1).await.unwrap();

        let (ready, remaining) = driver
            .wait(&ids, 2, 1_000, false, TaskId::random())
            .await
            .unwrap();
        assert_eq!(ready, vec![ids[1], ids[3]]);
        assert_eq!(remaining, vec![ids[0], ids[2]]);
        raylet.shutdown();
    }

    #[tokio::test]
    async fn wait_times_out_with_partial_results() {
        let store = test_store();
        let raylet = LocalRaylet::new(store.clone(), 0);
        let driver = raylet.connect(ClientId::random());

        let ids = vec![ObjectId::random(), ObjectId::random()];
        store.put(ids[0], Bytes::new(), 1).await.unwrap();
        let (ready, remaining) = driver
            .wait(&ids, 2, 20, false, TaskId::random())
            .await
            .unwrap();
        assert_eq!(ready, vec![ids[0]]);
        assert_eq!(remaining, vec![ids[1]]);
        raylet.shutdown();
    }

    #[tokio::test]
    async fn gpu_slots_are_assigned_and_recycled() {
        let store = test_store();
        let raylet = LocalRaylet::new(store, 2);
        let worker = raylet.connect(ClientId::random());
        let driver = raylet.connect(ClientId::random());

        let mut gpu_task = spec(TaskId::random(), vec![]);
        gpu_task.required_resources.insert("GPU".to_owned(), 2.0);
        driver.submit_task(gpu_task).await.unwrap();

        let _task = worker.get_task().await.unwrap();
        let resources = worker.resource_ids().await.unwrap();
        assert_eq!(resources["GPU"].len(), 2);

        // Finishing the task (asking for the next one) releases the slots.
        driver.submit_task(spec(TaskId::random(), vec![])).await.unwrap();
        let _task = worker.get_task().await.unwrap();
        let resources = worker.resource_ids().await.unwrap();
        assert!(resources.get("GPU").is_none());
        raylet.shutdown();
    }
}
