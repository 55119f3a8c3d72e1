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

//! The worker state machine.
//!
//! A [`Worker`] owns one process's mode, identity and per-task state; in
//! executor mode it drives the main loop pulling tasks from the local
//! scheduler, materialising arguments from the object store, executing the
//! body and writing outputs (or failure sentinels) back. In driver modes it
//! backs the `put`/`get`/`wait`/`submit` surface.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use photon_common::config::WorkerConfig;
use photon_common::constants::{
    CODEC_KEY_PREFIX, EXPORTS_CHANNEL, EXPORTS_LIST, EXPORT_LOCK_KEY_PREFIX,
    FUNCTIONS_TO_RUN_KEY_PREFIX, NO_TIMEOUT_MS, TASK_PUSH_ERROR, WAIT_FOR_CLASS_PUSH_ERROR,
};
use photon_common::failure::TaskFailure;
use photon_common::ids::{ActorHandleId, ActorId, DriverId, ObjectId, TaskId, WorkerId};
use photon_common::task::{FunctionDescriptor, TaskArg, TaskSpec};
use photon_object_store::{ObjectError, PlasmaStoreRef};
use photon_rpc_client::{ControlPlaneRef, RayletClientRef, ResourceIdMap, RpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::actor::{ActorHandle, DynActor};
use crate::error::{WorkerError, WorkerResult};
use crate::error_pipeline::push_error_to_driver;
use crate::function_manager::{
    linkage, Executable, ExecutionInfo, FunctionActorManager, SetupFunction, TaskKind, WorkerInfo,
};
use crate::memory::MemoryMonitor;
use crate::metrics::WorkerMetrics;
use crate::profiling::Profiler;
use crate::remote::{validate_resource_quantities, RemoteFunction};
use crate::serialization::{
    is_simple_value, opaque_codec, structural_codec, Codec, CodecStrategy, DynValue, SerError,
    SerializationContext, SerializationRegistry,
};

const TERMINATE_METHOD: &str = "__terminate__";
const INIT_METHOD: &str = "__init__";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerMode {
    /// A driver running a user program.
    Script,
    /// An executor pulling tasks from the local scheduler.
    Worker,
    /// In-process serial execution; no scheduler or store is contacted.
    Local,
}

/// Identity of the caller of `get`/`wait` for blocked-task bookkeeping.
/// The main execution context is implicit; any other thread of control must
/// opt in with a detached context carrying a fresh random task id.
#[derive(Clone, Copy, Debug)]
pub enum CallerContext {
    Main,
    Detached(TaskId),
}

impl CallerContext {
    pub fn detached() -> Self {
        Self::Detached(TaskId::random())
    }
}

/// Per-task state guarded by the state lock. Both ids are NIL exactly when
/// the worker is idle.
struct ExecState {
    task_driver_id: DriverId,
    current_task_id: TaskId,
    task_index: u64,
    put_index: i32,
}

/// A positional argument of `submit_task`: either a reference to a stored
/// object or a value to ship with the task.
pub struct Arg {
    inner: ArgInner,
}

enum ArgInner {
    ObjectRef(ObjectId),
    Value(Box<dyn ErasedArgValue>),
}

impl Arg {
    pub fn id(object_id: ObjectId) -> Self {
        Self {
            inner: ArgInner::ObjectRef(object_id),
        }
    }

    pub fn value<T>(value: T) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Self {
            inner: ArgInner::Value(Box::new(TypedArg(value))),
        }
    }
}

#[async_trait::async_trait]
trait ErasedArgValue: Send + Sync {
    fn is_simple(&self) -> bool;
    fn encode_inline(&self, ctx: &SerializationContext) -> Result<Vec<u8>, SerError>;
    async fn spill(self: Box<Self>, worker: &Worker) -> WorkerResult<ObjectId>;
}

struct TypedArg<T>(T);

#[async_trait::async_trait]
impl<T> ErasedArgValue for TypedArg<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn is_simple(&self) -> bool {
        is_simple_value(&self.0 as &(dyn Any + Send + Sync))
    }

    fn encode_inline(&self, ctx: &SerializationContext) -> Result<Vec<u8>, SerError> {
        ctx.serialize(&self.0 as &(dyn Any + Send + Sync))
    }

    async fn spill(self: Box<Self>, worker: &Worker) -> WorkerResult<ObjectId> {
        let TypedArg(value) = *self;
        worker.put_value(value).await
    }
}

/// Actor coordinates of a method submission.
pub struct ActorCallCoords {
    pub actor_id: ActorId,
    pub actor_handle_id: ActorHandleId,
    pub actor_counter: u64,
    pub creation_dummy_object_id: ObjectId,
    pub execution_dependencies: Vec<ObjectId>,
}

/// Coordinates of an actor-creation submission.
pub struct ActorCreationCoords {
    pub actor_creation_id: ActorId,
    pub max_reconstructions: u64,
}

#[derive(Default)]
pub struct SubmitOptions {
    pub num_returns: usize,
    pub resources: HashMap<String, f64>,
    /// Defaults to `resources` when empty.
    pub placement_resources: HashMap<String, f64>,
    pub actor: Option<ActorCallCoords>,
    pub actor_creation: Option<ActorCreationCoords>,
    /// Defaults to the current task's driver.
    pub driver_id: Option<DriverId>,
}

pub struct WorkerParams {
    pub mode: WorkerMode,
    pub worker_id: WorkerId,
    pub driver_id: DriverId,
    pub store: Option<PlasmaStoreRef>,
    pub raylet: Option<RayletClientRef>,
    pub control_plane: Option<ControlPlaneRef>,
    pub config: WorkerConfig,
    pub metrics: Arc<WorkerMetrics>,
    pub profiler: Profiler,
    pub object_id_seed: Option<u64>,
}

pub struct Worker {
    mode: WorkerMode,
    worker_id: WorkerId,
    /// The driver this process belongs to; NIL on executor workers.
    own_driver_id: DriverId,
    config: WorkerConfig,
    store: Option<PlasmaStoreRef>,
    raylet: Option<RayletClientRef>,
    control_plane: Option<ControlPlaneRef>,
    pub(crate) serialization: Arc<SerializationRegistry>,
    pub(crate) manager: Arc<FunctionActorManager>,
    metrics: Arc<WorkerMetrics>,
    profiler: Profiler,
    memory_monitor: MemoryMonitor,
    state: Mutex<ExecState>,
    /// Held across argument materialisation, execution and output storing.
    execution_lock: tokio::sync::Mutex<()>,
    /// Serialises reconstruction requests; the scheduler may recycle the
    /// worker's resources around a blocking fetch.
    reconstruction_lock: tokio::sync::Mutex<()>,
    actors: Mutex<HashMap<ActorId, DynActor>>,
    actor_init_errors: Mutex<HashMap<ActorId, TaskFailure>>,
    own_actor_id: Mutex<ActorId>,
    /// Object map of LOCAL mode.
    local_objects: Mutex<HashMap<ObjectId, Vec<u8>>>,
    /// GPU ids visible to this process at startup; assigned slots are
    /// remapped through this list so tasks only ever see the original set.
    original_gpu_ids: Option<Vec<u64>>,
    pub(crate) last_task_error_raise_ms: Arc<AtomicU64>,
    detached_warning_emitted: AtomicBool,
    proctitle: Mutex<String>,
    exported_functions: Mutex<HashSet<String>>,
    exit_requested: AtomicBool,
}

impl Worker {
    pub fn new(params: WorkerParams) -> Arc<Self> {
        let own_driver_id = match params.mode {
            WorkerMode::Worker => DriverId::nil(),
            WorkerMode::Script | WorkerMode::Local => params.driver_id,
        };
        let current_task_id = match params.mode {
            WorkerMode::Worker => TaskId::nil(),
            WorkerMode::Script | WorkerMode::Local => params
                .object_id_seed
                .map(TaskId::from_seed)
                .unwrap_or_else(TaskId::random),
        };
        let memory_threshold = params.config.memory_usage_threshold;
        let fixed_point_rounds = params.config.class_id_fixed_point_rounds;
        Arc::new(Self {
            mode: params.mode,
            worker_id: params.worker_id,
            own_driver_id,
            store: params.store,
            raylet: params.raylet,
            control_plane: params.control_plane,
            serialization: Arc::new(SerializationRegistry::new(fixed_point_rounds)),
            manager: Arc::new(FunctionActorManager::new()),
            metrics: params.metrics,
            profiler: params.profiler,
            memory_monitor: MemoryMonitor::new(memory_threshold),
            state: Mutex::new(ExecState {
                task_driver_id: own_driver_id,
                current_task_id,
                task_index: 0,
                put_index: 1,
            }),
            execution_lock: tokio::sync::Mutex::new(()),
            reconstruction_lock: tokio::sync::Mutex::new(()),
            actors: Mutex::new(HashMap::new()),
            actor_init_errors: Mutex::new(HashMap::new()),
            own_actor_id: Mutex::new(ActorId::nil()),
            local_objects: Mutex::new(HashMap::new()),
            original_gpu_ids: read_original_gpu_ids(),
            last_task_error_raise_ms: Arc::new(AtomicU64::new(0)),
            detached_warning_emitted: AtomicBool::new(false),
            proctitle: Mutex::new("photon_worker".to_owned()),
            exported_functions: Mutex::new(HashSet::new()),
            exit_requested: AtomicBool::new(false),
            config: params.config,
        })
    }

    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn worker_info(&self) -> WorkerInfo {
        WorkerInfo {
            worker_id: self.worker_id,
            mode: self.mode,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn own_driver_id(&self) -> DriverId {
        self.own_driver_id
    }

    pub fn profiler_handle(&self) -> Profiler {
        self.profiler.clone()
    }

    /// Disconnect from the store, the scheduler and the control plane.
    pub async fn disconnect(&self) {
        if let Some(raylet) = &self.raylet {
            let _ = raylet.disconnect().await;
        }
        if let Some(store) = &self.store {
            let _ = store.disconnect().await;
        }
        if let Some(control_plane) = &self.control_plane {
            let _ = control_plane.disconnect().await;
        }
    }

    fn store(&self) -> WorkerResult<&PlasmaStoreRef> {
        self.store.as_ref().ok_or(WorkerError::NotConnected)
    }

    fn raylet(&self) -> WorkerResult<&RayletClientRef> {
        self.raylet.as_ref().ok_or(WorkerError::NotConnected)
    }

    pub(crate) fn control_plane(&self) -> WorkerResult<&ControlPlaneRef> {
        self.control_plane.as_ref().ok_or(WorkerError::NotConnected)
    }

    /// The driver whose task is currently executing, falling back to this
    /// process's own driver.
    pub fn current_driver_id(&self) -> DriverId {
        let state = self.state.lock();
        if state.task_driver_id.is_nil() {
            self.own_driver_id
        } else {
            state.task_driver_id
        }
    }

    /// The serialization context of a driver, with the actor-handle codec
    /// installed.
    pub fn serialization_context(&self, driver_id: DriverId) -> Arc<SerializationContext> {
        let ctx = self.serialization.context(driver_id);
        if !ctx.has_codec_for::<ActorHandle>() {
            crate::actor::install_handle_codec(&ctx);
        }
        ctx
    }

    fn current_task_id_for(&self, caller: CallerContext) -> TaskId {
        match caller {
            CallerContext::Main => self.state.lock().current_task_id,
            CallerContext::Detached(task_id) => {
                if !self.detached_warning_emitted.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        "blocking call from outside the main execution context; if the \
                         main context is waiting on this thread, the process may deadlock"
                    );
                }
                task_id
            }
        }
    }

    // ------------------------------------------------------------------
    // put
    // ------------------------------------------------------------------

    /// Store a value and return its id.
    pub async fn put_value<T>(&self, value: T) -> WorkerResult<ObjectId>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        if std::any::TypeId::of::<T>() == std::any::TypeId::of::<ObjectId>() {
            return Err(WorkerError::InvalidArgument(
                "calling put on an ObjectId is not allowed; wrap it in another value \
                 if you really need to store it"
                    .to_owned(),
            ));
        }
        let _span = self.profiler.profile("put");
        let driver_id = self.current_driver_id();
        let ctx = self.serialization_context(driver_id);
        let (bytes, new_codecs) = self.serialize_with_cascade(&ctx, &value)?;
        self.export_codecs(driver_id, &new_codecs).await;

        let object_id = {
            let mut state = self.state.lock();
            let object_id = ObjectId::for_put(state.current_task_id, state.put_index);
            state.put_index += 1;
            object_id
        };
        match self.mode {
            WorkerMode::Local => {
                self.local_objects.lock().insert(object_id, bytes);
            }
            WorkerMode::Script | WorkerMode::Worker => {
                self.store_and_register(object_id, bytes).await?;
            }
        }
        self.metrics.object_put_count.inc();
        Ok(object_id)
    }

    /// Serialize a value; on a missing codec, walk the registration
    /// cascade: structural, then opaque, each retried, with newly created
    /// codecs returned for export.
    fn serialize_with_cascade<T>(
        &self,
        ctx: &SerializationContext,
        value: &T,
    ) -> WorkerResult<(Vec<u8>, Vec<Arc<Codec>>)>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let any = value as &(dyn Any + Send + Sync);
        let mut new_codecs = Vec::new();
        match ctx.serialize(any) {
            Ok(bytes) => return Ok((bytes, new_codecs)),
            Err(SerError::CodecMissing(_)) | Err(SerError::Encode { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        register_codec_builders::<T>();
        let codec = ctx.register_structural::<T>();
        new_codecs.push(codec);
        match ctx.serialize(any) {
            Ok(bytes) => {
                tracing::debug!(
                    type_name = std::any::type_name::<T>(),
                    "registered a structural codec on first use"
                );
                return Ok((bytes, new_codecs));
            }
            Err(SerError::Encode { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        tracing::warn!(
            type_name = std::any::type_name::<T>(),
            "structural encoding failed; falling back to an opaque blob"
        );
        let codec = ctx.register_opaque::<T>(false);
        new_codecs.push(codec);
        let bytes = ctx.serialize(any)?;
        Ok((bytes, new_codecs))
    }

    /// Export newly registered codecs so other workers can decode the
    /// values. A failed export degrades the codec to local-only.
    pub(crate) async fn export_codecs(&self, driver_id: DriverId, codecs: &[Arc<Codec>]) {
        let Some(control_plane) = &self.control_plane else {
            return;
        };
        for codec in codecs {
            if codec.local_only {
                continue;
            }
            let key = format!("{}{}", CODEC_KEY_PREFIX, codec.class_id.hex());
            let result: photon_rpc_client::Result<()> = async {
                let lock_key = format!("{}{}", EXPORT_LOCK_KEY_PREFIX, key);
                if !control_plane
                    .set_if_absent(&lock_key, bytes::Bytes::from_static(b"1"))
                    .await?
                {
                    return Ok(());
                }
                control_plane
                    .hash_set(
                        &key,
                        vec![
                            (
                                "driver_id".to_owned(),
                                driver_id.hex().into_bytes().into(),
                            ),
                            (
                                "type_name".to_owned(),
                                codec.type_name.as_bytes().to_vec().into(),
                            ),
                            (
                                "strategy".to_owned(),
                                strategy_tag(codec.strategy).as_bytes().to_vec().into(),
                            ),
                        ],
                    )
                    .await?;
                control_plane
                    .list_push(EXPORTS_LIST, key.clone().into_bytes().into())
                    .await?;
                control_plane
                    .publish(EXPORTS_CHANNEL, key.clone().into_bytes().into())
                    .await?;
                Ok(())
            }
            .await;
            if let Err(e) = result {
                tracing::warn!(
                    type_name = codec.type_name,
                    error = %e,
                    "failed to export codec; values of this type can only be decoded locally"
                );
            }
        }
    }

    /// Write serialized bytes under an id. A duplicate write is success:
    /// ids are derived deterministically, so the payload is presumed equal.
    async fn store_and_register(&self, object_id: ObjectId, bytes: Vec<u8>) -> WorkerResult<()> {
        let store = self.store()?;
        match store
            .put(object_id, bytes.into(), self.config.memcopy_threads)
            .await
        {
            Ok(()) => Ok(()),
            Err(ObjectError::ObjectExists(_)) => {
                tracing::info!(object = %object_id, "object already exists in the object store");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Store a task output. Outputs are dynamically typed, so a missing
    /// codec here is an error rather than a registration trigger.
    async fn put_dynamic(&self, object_id: ObjectId, value: &DynValue) -> WorkerResult<()> {
        if value.downcast_ref::<ActorHandle>().is_some() {
            return Err(WorkerError::InvalidArgument(
                "returning an actor handle from a remote function is not allowed".to_owned(),
            ));
        }
        let ctx = self.serialization_context(self.current_driver_id());
        let bytes = ctx.serialize(value.as_ref())?;
        self.store_and_register(object_id, bytes).await
    }

    async fn store_dummy(&self, object_id: ObjectId) -> WorkerResult<()> {
        let ctx = self.serialization_context(self.current_driver_id());
        let bytes = ctx.serialize(&() as &(dyn Any + Send + Sync))?;
        self.store_and_register(object_id, bytes).await
    }

    // ------------------------------------------------------------------
    // get
    // ------------------------------------------------------------------

    /// Fetch and decode a batch of objects, blocking until every one is
    /// available. Values that are failure sentinels are returned as-is.
    pub async fn get_object(
        &self,
        object_ids: &[ObjectId],
        caller: CallerContext,
    ) -> WorkerResult<Vec<DynValue>> {
        let _span = self.profiler.profile("get");
        if self.mode == WorkerMode::Local {
            return self.local_get(object_ids);
        }
        let raylet = self.raylet()?;
        let fetch_size = self.config.worker_fetch_request_size;

        // Prime local availability without flagging the task as blocked.
        for chunk in object_ids.chunks(fetch_size) {
            raylet
                .fetch_or_reconstruct(chunk, true, TaskId::nil())
                .await?;
        }

        let mut finals = self.retrieve_and_deserialize(object_ids, 0).await?;
        let mut unready: Vec<(usize, ObjectId)> = finals
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| (index, object_ids[index]))
            .collect();

        if !unready.is_empty() {
            // One blocking fetch sequence at a time: the scheduler may
            // recycle this worker's resources around the reconstruction.
            let _guard = self.reconstruction_lock.lock().await;
            let current_task_id = self.current_task_id_for(caller);
            while !unready.is_empty() {
                let fetch_ids: Vec<ObjectId> = unready.iter().map(|(_, id)| *id).collect();
                for chunk in fetch_ids.chunks(fetch_size) {
                    raylet
                        .fetch_or_reconstruct(chunk, false, current_task_id)
                        .await?;
                }
                let timeout_ms = self
                    .config
                    .get_timeout_milliseconds
                    .max((0.01 * unready.len() as f64).ceil() as u64);
                let round = self.retrieve_and_deserialize(&fetch_ids, timeout_ms).await?;
                let mut still_unready = Vec::new();
                for ((index, object_id), slot) in unready.into_iter().zip(round) {
                    match slot {
                        Some(value) => finals[index] = Some(value),
                        None => still_unready.push((index, object_id)),
                    }
                }
                unready = still_unready;
            }
            raylet.notify_unblocked(current_task_id).await?;
        }

        self.metrics.object_get_count.inc_by(object_ids.len() as u64);
        Ok(finals.into_iter().map(|slot| slot.expect("unready object survived the fetch loop")).collect())
    }

    /// One `get` round against the store, decoding whatever arrived.
    ///
    /// A pending codec import is waited out with a short back-off (a
    /// one-shot warning is pushed to the driver if it takes too long, but
    /// the wait never gives up); undecodable bytes are a hard error
    /// answered with failure sentinels for the entire batch.
    async fn retrieve_and_deserialize(
        &self,
        object_ids: &[ObjectId],
        timeout_ms: u64,
    ) -> WorkerResult<Vec<Option<DynValue>>> {
        let store = self.store()?;
        let ctx = self.serialization_context(self.current_driver_id());
        let started = Instant::now();
        let mut warning_sent = false;
        'retry: loop {
            let mut results = Vec::with_capacity(object_ids.len());
            for chunk in object_ids.chunks(self.config.worker_get_request_size) {
                let batch = store.get(chunk, timeout_ms).await?;
                for slot in batch {
                    let Some(bytes) = slot else {
                        results.push(None);
                        continue;
                    };
                    match ctx.deserialize(&bytes) {
                        Ok(value) => results.push(Some(value)),
                        Err(SerError::ClassMissing(class_id)) => {
                            // Let the import subscription advance.
                            tokio::time::sleep(Duration::from_millis(
                                self.config.codec_import_backoff_ms,
                            ))
                            .await;
                            if !warning_sent
                                && started.elapsed().as_secs()
                                    >= self.config.codec_wait_warn_timeout_secs
                            {
                                warning_sent = true;
                                self.push_error(
                                    self.current_driver_id(),
                                    WAIT_FOR_CLASS_PUSH_ERROR,
                                    format!(
                                        "this worker or driver is waiting to receive the codec \
                                         for class {class_id} so that it can deserialize an \
                                         object from the object store; this may be fine, or it \
                                         may be a bug"
                                    ),
                                )
                                .await;
                            }
                            continue 'retry;
                        }
                        Err(SerError::Decode { .. }) | Err(SerError::TruncatedHeader) => {
                            let failures = object_ids
                                .iter()
                                .map(|_| {
                                    Some(Box::new(TaskFailure::worker_died()) as DynValue)
                                })
                                .collect();
                            return Ok(failures);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            return Ok(results);
        }
    }

    fn local_get(&self, object_ids: &[ObjectId]) -> WorkerResult<Vec<DynValue>> {
        let ctx = self.serialization_context(self.own_driver_id);
        let objects = self.local_objects.lock();
        object_ids
            .iter()
            .map(|id| {
                let bytes = objects.get(id).ok_or_else(|| {
                    WorkerError::InvalidArgument(format!("unknown object {id} in local mode"))
                })?;
                Ok(ctx.deserialize(bytes)?)
            })
            .collect()
    }

    /// Record that a failure sentinel is being raised synchronously, so
    /// the background printer suppresses its duplicate.
    pub fn record_task_error_raise(&self) {
        self.last_task_error_raise_ms
            .store(crate::error_pipeline::now_ms(), Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // wait
    // ------------------------------------------------------------------

    pub async fn wait(
        &self,
        object_ids: &[ObjectId],
        num_returns: usize,
        timeout_ms: Option<u64>,
        caller: CallerContext,
    ) -> WorkerResult<(Vec<ObjectId>, Vec<ObjectId>)> {
        let _span = self.profiler.profile("wait");
        if object_ids.is_empty() {
            return Ok((vec![], vec![]));
        }
        let unique: HashSet<&ObjectId> = object_ids.iter().collect();
        if unique.len() != object_ids.len() {
            return Err(WorkerError::InvalidArgument(
                "wait requires a list of unique object ids".to_owned(),
            ));
        }
        if num_returns == 0 {
            return Err(WorkerError::InvalidArgument(
                "invalid number of objects to wait for: 0".to_owned(),
            ));
        }
        if num_returns > object_ids.len() {
            return Err(WorkerError::InvalidArgument(format!(
                "num_returns ({num_returns}) cannot exceed the number of objects ({})",
                object_ids.len()
            )));
        }
        if self.mode == WorkerMode::Local {
            // Everything submitted in local mode already ran.
            return Ok((
                object_ids[..num_returns].to_vec(),
                object_ids[num_returns..].to_vec(),
            ));
        }
        let current_task_id = self.current_task_id_for(caller);
        let (ready, remaining) = self
            .raylet()?
            .wait(
                object_ids,
                num_returns,
                timeout_ms.unwrap_or(NO_TIMEOUT_MS),
                false,
                current_task_id,
            )
            .await?;
        Ok((ready, remaining))
    }

    // ------------------------------------------------------------------
    // submit
    // ------------------------------------------------------------------

    pub async fn submit_task(
        &self,
        descriptor: FunctionDescriptor,
        args: Vec<Arg>,
        options: SubmitOptions,
    ) -> WorkerResult<Vec<ObjectId>> {
        let _span = self.profiler.profile("submit_task");
        validate_resource_quantities(&options.resources)?;
        validate_resource_quantities(&options.placement_resources)?;

        let driver_id = options.driver_id.unwrap_or_else(|| self.current_driver_id());
        let ctx = self.serialization_context(driver_id);

        // Spill large by-value arguments to the store; simple ones ship
        // inline with the task.
        let mut task_args = Vec::with_capacity(args.len());
        for arg in args {
            match arg.inner {
                ArgInner::ObjectRef(id) => task_args.push(TaskArg::ObjectRef(id)),
                ArgInner::Value(value) => {
                    if value.is_simple() {
                        match value.encode_inline(&ctx) {
                            Ok(bytes) => {
                                task_args.push(TaskArg::Value(bytes));
                                continue;
                            }
                            Err(SerError::CodecMissing(_)) => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                    let object_id = value.spill(self).await?;
                    task_args.push(TaskArg::ObjectRef(object_id));
                }
            }
        }

        let placement_resources = if options.placement_resources.is_empty() {
            options.resources.clone()
        } else {
            options.placement_resources.clone()
        };

        let (task_id, parent_task_id, parent_counter) = {
            let mut state = self.state.lock();
            if state.current_task_id.is_nil() {
                return Err(WorkerError::InvalidArgument(
                    "tasks may only be submitted from a driver or from within a task".to_owned(),
                ));
            }
            let parent_counter = state.task_index;
            state.task_index += 1;
            (
                TaskId::for_child(state.current_task_id, parent_counter),
                state.current_task_id,
                parent_counter,
            )
        };

        let (actor_id, actor_handle_id, actor_counter, creation_dummy, execution_dependencies) =
            match &options.actor {
                Some(coords) => (
                    coords.actor_id,
                    coords.actor_handle_id,
                    coords.actor_counter,
                    coords.creation_dummy_object_id,
                    coords.execution_dependencies.clone(),
                ),
                None => (ActorId::nil(), ActorHandleId::nil(), 0, ObjectId::nil(), vec![]),
            };
        let (actor_creation_id, max_actor_reconstructions) = match &options.actor_creation {
            Some(coords) => (coords.actor_creation_id, coords.max_reconstructions),
            None => (ActorId::nil(), 0),
        };

        let spec = TaskSpec {
            driver_id,
            task_id,
            parent_task_id,
            parent_counter,
            function_descriptor: descriptor,
            args: task_args,
            num_returns: options.num_returns,
            required_resources: options.resources,
            required_placement_resources: placement_resources,
            actor_creation_id,
            actor_creation_dummy_object_id: creation_dummy,
            max_actor_reconstructions,
            actor_id,
            actor_handle_id,
            actor_counter,
            execution_dependencies,
        };
        let returns = spec.returns();

        match self.mode {
            WorkerMode::Local => self.execute_local_task(spec).await?,
            WorkerMode::Script | WorkerMode::Worker => {
                self.raylet()?.submit_task(spec).await?;
            }
        }
        Ok(returns)
    }

    // ------------------------------------------------------------------
    // run_function_on_all_workers
    // ------------------------------------------------------------------

    /// Run a setup function locally, then export it so that every current
    /// and future worker runs it exactly once.
    pub async fn run_function_on_all_workers(
        &self,
        setup: Arc<SetupFunction>,
    ) -> WorkerResult<()> {
        linkage().register_setup(setup.clone());

        // The key is content-addressed by the function alone, so the same
        // function exported by two drivers collides on one key.
        #[derive(serde::Serialize)]
        struct SetupBlob<'a> {
            name: &'a str,
            payload: &'a [u8],
            run_on_other_drivers: bool,
        }
        let blob = bincode::serialize(&SetupBlob {
            name: &setup.name,
            payload: &setup.payload,
            run_on_other_drivers: setup.run_on_other_drivers,
        })
        .map_err(|e| WorkerError::Internal(e.into()))?;
        let digest = Sha1::digest(&blob);
        let key = format!("{}{}", FUNCTIONS_TO_RUN_KEY_PREFIX, hex::encode(digest));

        // The driver always runs the function locally first.
        (setup.callable)(&self.worker_info());

        if self.mode == WorkerMode::Local {
            return Ok(());
        }
        let control_plane = self.control_plane()?;
        let lock_key = format!("{}{}", EXPORT_LOCK_KEY_PREFIX, key);
        if !control_plane
            .set_if_absent(&lock_key, bytes::Bytes::from_static(b"1"))
            .await?
        {
            // Another driver already exported this function.
            return Ok(());
        }
        // These three writes are not atomic together; a crash in between
        // can leave workers waiting for the blob behind the lock key.
        control_plane
            .hash_set(
                &key,
                vec![
                    (
                        "driver_id".to_owned(),
                        self.own_driver_id.hex().into_bytes().into(),
                    ),
                    ("name".to_owned(), setup.name.clone().into_bytes().into()),
                    ("payload".to_owned(), setup.payload.clone().into()),
                    (
                        "run_on_other_drivers".to_owned(),
                        if setup.run_on_other_drivers { "true" } else { "false" }
                            .as_bytes()
                            .to_vec()
                            .into(),
                    ),
                ],
            )
            .await?;
        control_plane
            .list_push(EXPORTS_LIST, key.clone().into_bytes().into())
            .await?;
        control_plane
            .publish(EXPORTS_CHANNEL, key.into_bytes().into())
            .await?;
        Ok(())
    }

    /// Publish a remote function's descriptor, once.
    pub async fn export_remote_function(&self, function: &RemoteFunction) -> WorkerResult<()> {
        if self.mode == WorkerMode::Local {
            return Ok(());
        }
        let descriptor = function.descriptor(self.own_driver_id);
        let key = format!(
            "{}{}:{}",
            photon_common::constants::REMOTE_FUNCTION_KEY_PREFIX,
            self.own_driver_id.hex(),
            descriptor.function_id().hex()
        );
        if !self.exported_functions.lock().insert(key.clone()) {
            return Ok(());
        }
        let control_plane = self.control_plane()?;
        control_plane
            .hash_set(
                &key,
                vec![
                    (
                        "driver_id".to_owned(),
                        self.own_driver_id.hex().into_bytes().into(),
                    ),
                    (
                        "module_name".to_owned(),
                        descriptor.module_name.clone().into_bytes().into(),
                    ),
                    (
                        "function_name".to_owned(),
                        descriptor.function_name.clone().into_bytes().into(),
                    ),
                    (
                        "max_calls".to_owned(),
                        function.max_calls().to_string().into_bytes().into(),
                    ),
                ],
            )
            .await?;
        control_plane
            .list_push(EXPORTS_LIST, key.clone().into_bytes().into())
            .await?;
        control_plane
            .publish(EXPORTS_CHANNEL, key.into_bytes().into())
            .await?;
        Ok(())
    }

    /// Publish an actor class's descriptor, once.
    pub async fn export_actor_class(
        &self,
        class: &crate::actor::LinkedActorClass,
    ) -> WorkerResult<()> {
        if self.mode == WorkerMode::Local {
            return Ok(());
        }
        let key = format!(
            "{}{}:{}",
            photon_common::constants::ACTOR_CLASS_KEY_PREFIX,
            self.own_driver_id.hex(),
            FunctionDescriptor::for_method(
                self.own_driver_id,
                &class.module_name,
                &class.class_name,
                INIT_METHOD
            )
            .function_id()
            .hex()
        );
        if !self.exported_functions.lock().insert(key.clone()) {
            return Ok(());
        }
        let control_plane = self.control_plane()?;
        control_plane
            .hash_set(
                &key,
                vec![
                    (
                        "driver_id".to_owned(),
                        self.own_driver_id.hex().into_bytes().into(),
                    ),
                    (
                        "module_name".to_owned(),
                        class.module_name.clone().into_bytes().into(),
                    ),
                    (
                        "class_name".to_owned(),
                        class.class_name.clone().into_bytes().into(),
                    ),
                    (
                        "max_reconstructions".to_owned(),
                        class.max_reconstructions.to_string().into_bytes().into(),
                    ),
                    (
                        "checkpoint_interval".to_owned(),
                        class.checkpoint_interval.to_string().into_bytes().into(),
                    ),
                ],
            )
            .await?;
        control_plane
            .list_push(EXPORTS_LIST, key.clone().into_bytes().into())
            .await?;
        control_plane
            .publish(EXPORTS_CHANNEL, key.into_bytes().into())
            .await?;
        Ok(())
    }

    pub(crate) async fn push_error(&self, driver_id: DriverId, error_type: &str, message: String) {
        if let Some(control_plane) = &self.control_plane {
            self.metrics.pushed_error_count.inc();
            push_error_to_driver(control_plane, driver_id, error_type, message, HashMap::new())
                .await;
        }
    }

    // ------------------------------------------------------------------
    // task execution (WORKER mode)
    // ------------------------------------------------------------------

    /// Pull and execute tasks until the scheduler disconnects or the
    /// worker retires after `max_calls` executions of a function.
    pub async fn main_loop(&self) -> WorkerResult<()> {
        loop {
            if self.exit_requested.load(Ordering::Relaxed) {
                return Ok(());
            }
            let task = {
                let _span = self.profiler.profile("worker_idle");
                match self.raylet()?.get_task().await {
                    Ok(task) => task,
                    Err(RpcError::ConnectionClosed(_)) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            };
            self.apply_gpu_visibility().await;
            self.wait_for_and_process_task(task).await?;
        }
    }

    /// Rewrite `CUDA_VISIBLE_DEVICES` to the slots allotted for the next
    /// task, remapped through the set this process saw at startup.
    async fn apply_gpu_visibility(&self) {
        let assigned = match self.get_gpu_ids().await {
            Ok(ids) => ids,
            Err(_) => return,
        };
        let value = assigned
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        std::env::set_var("CUDA_VISIBLE_DEVICES", value);
    }

    /// GPU ids allotted to the current task, in terms of the user's
    /// original visible set.
    pub async fn get_gpu_ids(&self) -> WorkerResult<Vec<u64>> {
        if self.mode == WorkerMode::Local {
            return Ok(vec![]);
        }
        let resources = self.raylet()?.resource_ids().await?;
        let slots = resources
            .get("GPU")
            .map(|slots| slots.iter().map(|(slot, _)| *slot).collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(match &self.original_gpu_ids {
            Some(original) => slots
                .iter()
                .filter_map(|slot| original.get(*slot as usize).copied())
                .collect(),
            None => slots,
        })
    }

    pub async fn get_resource_ids(&self) -> WorkerResult<ResourceIdMap> {
        if self.mode == WorkerMode::Local {
            return Ok(ResourceIdMap::new());
        }
        Ok(self.raylet()?.resource_ids().await?)
    }

    async fn wait_for_and_process_task(&self, task: TaskSpec) -> WorkerResult<()> {
        let descriptor = task.function_descriptor.clone();
        let driver_id = task.driver_id;

        if task.is_actor_task() && descriptor.function_name == TERMINATE_METHOD {
            return self.terminate_actor_worker(&task).await;
        }

        let kind = if task.is_actor_creation_task() {
            let mut own_actor_id = self.own_actor_id.lock();
            debug_assert!(own_actor_id.is_nil());
            *own_actor_id = task.actor_creation_id;
            TaskKind::ActorCreation
        } else if task.is_actor_task() {
            TaskKind::ActorMethod
        } else {
            TaskKind::Plain
        };
        let info = self
            .manager
            .get_execution_info(driver_id, &descriptor, kind)
            .await;

        {
            let _execution = self.execution_lock.lock().await;
            *self.proctitle.lock() = proctitle_for(&info);
            {
                let _span = self.profiler.profile_with(
                    "task",
                    format!("{}:{}", info.function_name, task.task_id.hex()),
                );
                self.process_task(&task, &info).await;
            }
            let mut state = self.state.lock();
            state.task_driver_id = DriverId::nil();
            state.current_task_id = TaskId::nil();
            state.task_index = 0;
            state.put_index = 1;
            drop(state);
            *self.proctitle.lock() = "photon_worker".to_owned();
        }

        let executions = self
            .manager
            .increase_task_counter(driver_id, descriptor.function_id());
        if info.max_calls != 0 && executions >= info.max_calls {
            tracing::info!(
                function = %info.function_name,
                executions,
                "reached max_calls; retiring this worker"
            );
            self.raylet()?.disconnect().await?;
            self.exit_requested.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn terminate_actor_worker(&self, task: &TaskSpec) -> WorkerResult<()> {
        self.actors.lock().remove(&task.actor_id);
        if let Some(dummy) = task.dummy_object_id() {
            {
                let mut state = self.state.lock();
                state.task_driver_id = task.driver_id;
                state.current_task_id = task.task_id;
            }
            let _ = self.store_dummy(dummy).await;
            let mut state = self.state.lock();
            state.task_driver_id = DriverId::nil();
            state.current_task_id = TaskId::nil();
        }
        self.raylet()?.disconnect().await?;
        self.exit_requested.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Execute one task and write its outputs, or failure sentinels for
    /// every expected return id.
    async fn process_task(&self, task: &TaskSpec, info: &ExecutionInfo) {
        {
            let mut state = self.state.lock();
            debug_assert!(state.task_driver_id.is_nil());
            debug_assert!(state.current_task_id.is_nil());
            debug_assert_eq!(state.task_index, 0);
            debug_assert_eq!(state.put_index, 1);
            state.task_driver_id = task.driver_id;
            state.current_task_id = task.task_id;
        }

        let mut return_ids = task.returns();
        let dummy_id = (task.is_actor_task() || task.is_actor_creation_task())
            .then(|| return_ids.pop())
            .flatten();

        let args = match self.prepare_task_inputs(task, &info.function_name).await {
            Ok(args) => args,
            Err(failure) => {
                self.handle_task_failure(task, &return_ids, dummy_id, failure)
                    .await;
                return;
            }
        };

        let timer = self.metrics.task_execution_duration.start_timer();
        let outcome = self.execute_body(task, info, args);
        timer.observe_duration();

        match outcome {
            Ok(outputs) => {
                if outputs.len() != return_ids.len() {
                    let failure = TaskFailure::new(
                        info.function_name.clone(),
                        format!(
                            "task returned {} values but {} were expected",
                            outputs.len(),
                            return_ids.len()
                        ),
                    )
                    .with_proctitle(self.proctitle.lock().clone());
                    self.handle_task_failure(task, &return_ids, dummy_id, failure)
                        .await;
                    return;
                }
                for (object_id, value) in return_ids.iter().zip(&outputs) {
                    if let Err(e) = self.put_dynamic(*object_id, value).await {
                        let failure = TaskFailure::new(
                            info.function_name.clone(),
                            format!("failed to store task output: {e}"),
                        )
                        .with_proctitle(self.proctitle.lock().clone());
                        self.handle_task_failure(task, &return_ids, dummy_id, failure)
                            .await;
                        return;
                    }
                }
                if let Some(dummy) = dummy_id {
                    if let Err(e) = self.store_dummy(dummy).await {
                        tracing::error!(error = %e, "failed to store the actor dummy object");
                    }
                }
                self.metrics.task_count.with_label_values(&["ok"]).inc();
            }
            Err(error) => {
                let failure = TaskFailure::new(info.function_name.clone(), format!("{error:?}"))
                    .with_proctitle(self.proctitle.lock().clone());
                self.handle_task_failure(task, &return_ids, dummy_id, failure)
                    .await;
            }
        }
    }

    /// Materialise every argument. An argument that is itself a failure
    /// sentinel fails the task with that error as the cause, without
    /// executing it.
    async fn prepare_task_inputs(
        &self,
        task: &TaskSpec,
        function_name: &str,
    ) -> Result<Vec<DynValue>, TaskFailure> {
        if task.is_actor_task() {
            if let Some(init_error) = self.actor_init_errors.lock().get(&task.actor_id) {
                return Err(init_error.clone());
            }
        }
        self.memory_monitor.raise_if_low_memory().map_err(|e| {
            TaskFailure::new(function_name, e.to_string())
                .with_proctitle(self.proctitle.lock().clone())
        })?;

        let _span = self.profiler.profile("task:deserialize_arguments");
        let ctx = self.serialization_context(task.driver_id);
        let mut args = Vec::with_capacity(task.args.len());
        for arg in &task.args {
            match arg {
                TaskArg::Value(bytes) => {
                    let value = self.deserialize_inline(&ctx, bytes).await.map_err(|e| {
                        TaskFailure::new(function_name, format!("invalid inline argument: {e}"))
                            .with_proctitle(self.proctitle.lock().clone())
                    })?;
                    args.push(value);
                }
                TaskArg::ObjectRef(object_id) => {
                    let mut values = self
                        .get_object(&[*object_id], CallerContext::Main)
                        .await
                        .map_err(|e| {
                            TaskFailure::new(function_name, e.to_string())
                                .with_proctitle(self.proctitle.lock().clone())
                        })?;
                    let value = values.pop().expect("one id yields one value");
                    if let Some(failure) = value.downcast_ref::<TaskFailure>() {
                        return Err(failure.clone());
                    }
                    args.push(value);
                }
            }
        }
        Ok(args)
    }

    /// Decode an inline argument, waiting out a pending codec import.
    async fn deserialize_inline(
        &self,
        ctx: &SerializationContext,
        bytes: &[u8],
    ) -> Result<DynValue, SerError> {
        loop {
            match ctx.deserialize(bytes) {
                Err(SerError::ClassMissing(_)) => {
                    tokio::time::sleep(Duration::from_millis(self.config.codec_import_backoff_ms))
                        .await;
                }
                other => return other,
            }
        }
    }

    fn execute_body(
        &self,
        task: &TaskSpec,
        info: &ExecutionInfo,
        args: Vec<DynValue>,
    ) -> anyhow::Result<Vec<DynValue>> {
        match &info.executable {
            Executable::Function(callable) => callable(args),
            Executable::ActorCreation(class) => {
                let instance = (class.factory)(args)?;
                self.actors.lock().insert(task.actor_creation_id, instance);
                Ok(vec![])
            }
            Executable::ActorMethod { class, method } => {
                let spec = class
                    .methods
                    .get(method)
                    .ok_or_else(|| anyhow::anyhow!("actor has no method named `{method}`"))?;
                let mut actors = self.actors.lock();
                let instance = actors.get_mut(&task.actor_id).ok_or_else(|| {
                    anyhow::anyhow!("actor {} is not hosted on this worker", task.actor_id)
                })?;
                (spec.callable)(instance, args)
            }
        }
    }

    /// Fill every expected output with the failure sentinel and publish an
    /// error event to the owning driver.
    async fn handle_task_failure(
        &self,
        task: &TaskSpec,
        return_ids: &[ObjectId],
        dummy_id: Option<ObjectId>,
        failure: TaskFailure,
    ) {
        for object_id in return_ids {
            let sentinel: DynValue = Box::new(failure.clone());
            if let Err(e) = self.put_dynamic(*object_id, &sentinel).await {
                tracing::error!(object = %object_id, error = %e, "failed to store a failure sentinel");
            }
        }
        // The dummy must be written even on failure so that the actor's
        // next method can still be dispatched.
        if let Some(dummy) = dummy_id {
            if let Err(e) = self.store_dummy(dummy).await {
                tracing::error!(error = %e, "failed to store the actor dummy object");
            }
        }
        if task.is_actor_creation_task()
            || (task.is_actor_task() && task.function_descriptor.function_name == INIT_METHOD)
        {
            let actor_id = if task.is_actor_creation_task() {
                task.actor_creation_id
            } else {
                task.actor_id
            };
            self.actor_init_errors.lock().insert(actor_id, failure.clone());
        }
        self.metrics.task_count.with_label_values(&["failed"]).inc();
        self.push_error(task.driver_id, TASK_PUSH_ERROR, failure.to_string())
            .await;
    }

    // ------------------------------------------------------------------
    // LOCAL mode
    // ------------------------------------------------------------------

    /// Run a task synchronously against the in-process object map.
    async fn execute_local_task(&self, task: TaskSpec) -> WorkerResult<()> {
        let kind = if task.is_actor_creation_task() {
            TaskKind::ActorCreation
        } else if task.is_actor_task() {
            TaskKind::ActorMethod
        } else {
            TaskKind::Plain
        };
        let info = self
            .manager
            .try_get_execution_info(task.driver_id, &task.function_descriptor, kind)
            .ok_or_else(|| {
                WorkerError::InvalidArgument(format!(
                    "function {} is not registered",
                    task.function_descriptor.qualified_name()
                ))
            })?;

        let mut return_ids = task.returns();
        let dummy_id = (task.is_actor_task() || task.is_actor_creation_task())
            .then(|| return_ids.pop())
            .flatten();

        let ctx = self.serialization_context(task.driver_id);
        let mut args = Vec::with_capacity(task.args.len());
        let mut arg_failure = None;
        for arg in &task.args {
            let value = match arg {
                TaskArg::Value(bytes) => ctx.deserialize(bytes)?,
                TaskArg::ObjectRef(object_id) => {
                    self.local_get(&[*object_id])?.pop().expect("one value")
                }
            };
            if let Some(failure) = value.downcast_ref::<TaskFailure>() {
                arg_failure = Some(failure.clone());
                break;
            }
            args.push(value);
        }

        let init_failure = task
            .is_actor_task()
            .then(|| self.actor_init_errors.lock().get(&task.actor_id).cloned())
            .flatten();
        let outcome = match (init_failure, arg_failure) {
            (Some(failure), _) | (None, Some(failure)) => Err(anyhow::Error::new(failure)),
            (None, None) => self.execute_body(&task, &info, args),
        };
        let outputs = match outcome {
            Ok(outputs) if outputs.len() == return_ids.len() => outputs,
            Ok(outputs) => {
                let failure = TaskFailure::new(
                    info.function_name.clone(),
                    format!(
                        "task returned {} values but {} were expected",
                        outputs.len(),
                        return_ids.len()
                    ),
                );
                return_ids
                    .iter()
                    .map(|_| Box::new(failure.clone()) as DynValue)
                    .collect()
            }
            Err(error) => {
                let failure = match error.downcast_ref::<TaskFailure>() {
                    Some(failure) => failure.clone(),
                    None => TaskFailure::new(info.function_name.clone(), format!("{error:?}")),
                };
                if task.is_actor_creation_task() {
                    self.actor_init_errors
                        .lock()
                        .insert(task.actor_creation_id, failure.clone());
                }
                return_ids
                    .iter()
                    .map(|_| Box::new(failure.clone()) as DynValue)
                    .collect()
            }
        };

        let mut objects = self.local_objects.lock();
        for (object_id, value) in return_ids.iter().zip(&outputs) {
            objects.insert(*object_id, ctx.serialize(value.as_ref())?);
        }
        if let Some(dummy) = dummy_id {
            objects.insert(dummy, ctx.serialize(&() as &(dyn Any + Send + Sync))?);
        }
        Ok(())
    }
}

fn proctitle_for(info: &ExecutionInfo) -> String {
    match &info.executable {
        Executable::Function(_) => format!("photon_worker:{}()", info.function_name),
        Executable::ActorCreation(class) => {
            format!("photon_{}:{}()", class.class_name, INIT_METHOD)
        }
        Executable::ActorMethod { class, method } => {
            format!("photon_{}:{}()", class.class_name, method)
        }
    }
}

/// Register linkage builders for a type so remote workers can construct
/// its codec from an export descriptor.
fn register_codec_builders<T>()
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let type_name = std::any::type_name::<T>();
    linkage().register_codec_builder(
        type_name,
        strategy_tag(CodecStrategy::Structural),
        Arc::new(|rounds, local_only| structural_codec::<T>(rounds, local_only)),
    );
    linkage().register_codec_builder(
        type_name,
        strategy_tag(CodecStrategy::Opaque),
        Arc::new(|rounds, local_only| opaque_codec::<T>(rounds, local_only)),
    );
}

fn strategy_tag(strategy: CodecStrategy) -> &'static str {
    match strategy {
        CodecStrategy::Structural => "structural",
        CodecStrategy::Opaque => "opaque",
        CodecStrategy::Custom => "custom",
    }
}

/// The GPU set this process was started with, captured once.
fn read_original_gpu_ids() -> Option<Vec<u64>> {
    let raw = std::env::var("CUDA_VISIBLE_DEVICES").ok()?;
    if raw.is_empty() {
        return Some(vec![]);
    }
    raw.split(',')
        .map(|part| part.trim().parse::<u64>().ok())
        .collect()
}
