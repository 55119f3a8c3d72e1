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

//! The process-wide runtime: explicit init/teardown around one driver (or
//! worker) and its background activities.
//!
//! There is no ambient global worker; `init` returns a [`Runtime`] handle
//! owning every component, and a weak process-wide guard only enforces the
//! reinitialization rules. Tests can run init/shutdown sequences
//! repeatedly.

use std::any::TypeId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use photon_common::config::WorkerConfig;
use photon_common::constants::{
    DRIVERS_KEY_PREFIX, VERSION_INFO_KEY, VERSION_MISMATCH_PUSH_ERROR, WEBUI_KEY,
    WORKERS_KEY_PREFIX,
};
use photon_common::failure::TaskFailure;
use photon_common::ids::{ActorHandleId, ActorId, ClientId, DriverId, ObjectId, WorkerId};
use photon_common::task::FunctionDescriptor;
use photon_object_store::{ObjectStoreMetrics, PlasmaStoreImpl, PlasmaStoreRef};
use photon_rpc_client::{ControlPlaneRef, InMemControlPlane, LocalRaylet, ResourceIdMap};
use prometheus::Registry;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::actor::{ActorClass, ActorHandle};
use crate::error::{WorkerError, WorkerResult};
use crate::error_pipeline::ErrorPipeline;
use crate::function_manager::{linkage, spawn_import_loop, ImportEnv, SetupFunction};
use crate::metrics::WorkerMetrics;
use crate::profiling::{spawn_flush_loop, Profiler};
use crate::remote::RemoteFunction;
use crate::serialization::{custom_codec, DynValue, SerResult};
use crate::worker::{
    ActorCallCoords, ActorCreationCoords, Arg, CallerContext, SubmitOptions, Worker, WorkerMode,
    WorkerParams,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Connection points of a running cluster. In-process handles stand in for
/// the socket transports of a multi-node deployment.
#[derive(Clone)]
pub struct ClusterHandles {
    pub store: PlasmaStoreRef,
    pub raylet: Arc<LocalRaylet>,
    pub control_plane: ControlPlaneRef,
}

/// Options of [`Runtime::init`]. With `cluster` set the runtime attaches
/// to an existing cluster and every bootstrap-only option must be absent.
#[derive(Default)]
pub struct InitOptions {
    pub cluster: Option<ClusterHandles>,
    pub num_cpus: Option<u64>,
    pub num_gpus: Option<u64>,
    pub resources: HashMap<String, f64>,
    pub object_store_memory: Option<u64>,
    /// Mutually exclusive with profiling-data collection: setting it
    /// disables the profiler with a warning.
    pub control_plane_max_memory: Option<u64>,
    pub object_id_seed: Option<u64>,
    pub local_mode: bool,
    pub ignore_reinit_error: bool,
    pub num_control_plane_shards: Option<u64>,
    pub control_plane_password: Option<String>,
    pub store_directory: Option<PathBuf>,
    pub huge_pages: bool,
    pub include_webui: bool,
    pub driver_id: Option<DriverId>,
    pub temp_dir: Option<PathBuf>,
    /// JSON overriding individual `WorkerConfig` fields.
    pub internal_config: Option<String>,
}

impl InitOptions {
    fn bootstrap_only_options_set(&self) -> Vec<&'static str> {
        let mut set = Vec::new();
        if self.num_cpus.is_some() {
            set.push("num_cpus");
        }
        if self.num_gpus.is_some() {
            set.push("num_gpus");
        }
        if !self.resources.is_empty() {
            set.push("resources");
        }
        if self.object_store_memory.is_some() {
            set.push("object_store_memory");
        }
        if self.control_plane_max_memory.is_some() {
            set.push("control_plane_max_memory");
        }
        if self.num_control_plane_shards.is_some() {
            set.push("num_control_plane_shards");
        }
        if self.store_directory.is_some() {
            set.push("store_directory");
        }
        if self.huge_pages {
            set.push("huge_pages");
        }
        if self.include_webui {
            set.push("include_webui");
        }
        if self.temp_dir.is_some() {
            set.push("temp_dir");
        }
        set
    }

    fn validate(&self) -> WorkerResult<()> {
        if self.cluster.is_some() {
            let set = self.bootstrap_only_options_set();
            if !set.is_empty() {
                return Err(WorkerError::InvalidArgument(format!(
                    "when connecting to an existing cluster, the following options must \
                     not be provided: {}",
                    set.join(", ")
                )));
            }
        }
        if self.huge_pages && self.store_directory.is_none() {
            return Err(WorkerError::InvalidArgument(
                "huge_pages requires store_directory to be provided".to_owned(),
            ));
        }
        if self.local_mode && self.cluster.is_some() {
            return Err(WorkerError::InvalidArgument(
                "local_mode cannot attach to a cluster".to_owned(),
            ));
        }
        Ok(())
    }
}

struct OwnedCluster {
    handles: ClusterHandles,
    workers: Vec<Arc<Worker>>,
    worker_loops: Vec<tokio::task::JoinHandle<()>>,
}

struct RuntimeInner {
    worker: Arc<Worker>,
    cluster: Option<OwnedCluster>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    error_pipeline: Mutex<Option<ErrorPipeline>>,
    shut_down: AtomicBool,
}

/// Handle to an initialized photon process.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

fn global_guard() -> &'static Mutex<Weak<RuntimeInner>> {
    static GUARD: std::sync::OnceLock<Mutex<Weak<RuntimeInner>>> = std::sync::OnceLock::new();
    GUARD.get_or_init(|| Mutex::new(Weak::new()))
}

/// Whether `init` has been called (and not yet shut down) in this process.
pub fn is_initialized() -> bool {
    global_guard().lock().upgrade().is_some()
}

impl Runtime {
    /// Connect to a cluster or bootstrap an embedded one, register the
    /// driver, and start the background machinery.
    pub async fn init(options: InitOptions) -> WorkerResult<Self> {
        if let Some(existing) = global_guard().lock().upgrade() {
            if options.ignore_reinit_error {
                tracing::error!("calling init again after it has already been called; ignored");
                return Ok(Self { inner: existing });
            }
            return Err(WorkerError::AlreadyInitialized);
        }
        let runtime = Self::connect(options).await?;
        *global_guard().lock() = Arc::downgrade(&runtime.inner);
        Ok(runtime)
    }

    /// Connect an additional driver to an existing cluster, bypassing the
    /// process-wide reinitialization guard. Used by processes hosting more
    /// than one driver session.
    pub async fn attach(options: InitOptions) -> WorkerResult<Self> {
        if options.cluster.is_none() {
            return Err(WorkerError::InvalidArgument(
                "attach requires cluster handles".to_owned(),
            ));
        }
        Self::connect(options).await
    }

    async fn connect(options: InitOptions) -> WorkerResult<Self> {
        options.validate()?;

        let config = match &options.internal_config {
            Some(json) => WorkerConfig::from_internal_json(json)
                .map_err(|e| WorkerError::InvalidArgument(format!("bad _internal_config: {e}")))?,
            None => WorkerConfig::default(),
        };
        let driver_id = options.driver_id.unwrap_or_else(DriverId::random);
        let worker_id = WorkerId::from(driver_id);

        let profiling_enabled = if options.control_plane_max_memory.is_some() {
            tracing::warn!(
                "control_plane_max_memory is set; profiling data collection is disabled"
            );
            false
        } else {
            !options.local_mode
        };

        if options.local_mode {
            let worker = Worker::new(WorkerParams {
                mode: WorkerMode::Local,
                worker_id,
                driver_id,
                store: None,
                raylet: None,
                control_plane: None,
                config,
                metrics: WorkerMetrics::unused(),
                profiler: Profiler::noop(),
                object_id_seed: options.object_id_seed,
            });
            // Setup functions registered before init still run locally.
            for setup in linkage().take_pending_setups() {
                worker.run_function_on_all_workers(setup).await?;
            }
            let inner = Arc::new(RuntimeInner {
                worker,
                cluster: None,
                background: Mutex::new(Vec::new()),
                error_pipeline: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            });
            return Ok(Self { inner });
        }

        let registry = Registry::new();
        let metrics = Arc::new(WorkerMetrics::new(&registry));

        let (handles, cluster) = match options.cluster.clone() {
            Some(handles) => (handles, None),
            None => {
                let cluster = bootstrap_cluster(&options, &config, metrics.clone()).await?;
                (cluster.handles.clone(), Some(cluster))
            }
        };

        check_version(&handles.control_plane, WorkerMode::Script, driver_id).await?;

        let worker = Worker::new(WorkerParams {
            mode: WorkerMode::Script,
            worker_id,
            driver_id,
            store: Some(handles.store.clone()),
            raylet: Some(Arc::new(
                handles.raylet.connect(client_id_of(worker_id)),
            )),
            control_plane: Some(handles.control_plane.clone()),
            config: config.clone(),
            metrics,
            profiler: if profiling_enabled {
                Profiler::new("driver")
            } else {
                Profiler::noop()
            },
            object_id_seed: options.object_id_seed,
        });

        register_driver(&handles.control_plane, &worker).await?;
        if options.include_webui {
            let _ = handles
                .control_plane
                .hash_set(
                    WEBUI_KEY,
                    vec![("url".to_owned(), b"http://127.0.0.1:8265".to_vec().into())],
                )
                .await;
        }

        let mut background = Vec::new();
        background.push(spawn_import_loop(ImportEnv {
            control_plane: handles.control_plane.clone(),
            manager: worker.manager.clone(),
            serialization: worker.serialization.clone(),
            worker_info: worker.worker_info(),
            own_driver_id: worker.own_driver_id(),
            fixed_point_rounds: worker.config().class_id_fixed_point_rounds,
        }));
        if let Some(flush) = spawn_flush_loop(
            worker_profiler(&worker),
            handles.control_plane.clone(),
            worker.worker_id(),
            worker.config().profiler_flush_interval_ms,
        ) {
            background.push(flush);
        }
        let error_pipeline = ErrorPipeline::spawn(
            handles.control_plane.clone(),
            driver_id,
            worker.last_task_error_raise_ms.clone(),
            worker.config().uncaught_error_grace_period_ms,
            worker.config().task_error_queue_size,
        );

        // Setup functions buffered before init are exported now, in order.
        for setup in linkage().take_pending_setups() {
            worker.run_function_on_all_workers(setup).await?;
        }

        let inner = Arc::new(RuntimeInner {
            worker,
            cluster,
            background: Mutex::new(background),
            error_pipeline: Mutex::new(Some(error_pipeline)),
            shut_down: AtomicBool::new(false),
        });
        Ok(Self { inner })
    }

    /// Handles for attaching further drivers to this runtime's cluster.
    pub fn cluster_handles(&self) -> Option<ClusterHandles> {
        self.inner
            .cluster
            .as_ref()
            .map(|cluster| cluster.handles.clone())
    }

    /// Disconnect everything. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pipeline) = self.inner.error_pipeline.lock().take() {
            pipeline.shutdown();
        }
        for handle in self.inner.background.lock().drain(..) {
            handle.abort();
        }
        if let Some(cluster) = &self.inner.cluster {
            tracing::debug!(
                workers = cluster.workers.len(),
                "stopping the embedded cluster"
            );
            cluster.handles.raylet.shutdown();
            for handle in &cluster.worker_loops {
                handle.abort();
            }
            let _ = cluster.handles.control_plane.disconnect().await;
            let _ = cluster.handles.store.disconnect().await;
        }
        let mut guard = global_guard().lock();
        if guard.upgrade().map_or(false, |live| Arc::ptr_eq(&live, &self.inner)) {
            *guard = Weak::new();
        }
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.inner.worker
    }

    fn driver_id(&self) -> DriverId {
        self.inner.worker.own_driver_id()
    }

    // ------------------------------------------------------------------
    // driver surface
    // ------------------------------------------------------------------

    pub async fn put<T>(&self, value: T) -> WorkerResult<ObjectId>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.inner.worker.put_value(value).await
    }

    pub async fn get<T>(&self, object_id: ObjectId) -> WorkerResult<T>
    where
        T: Send + Sync + 'static,
    {
        let mut values = self
            .inner
            .worker
            .get_object(&[object_id], CallerContext::Main)
            .await?;
        self.extract(values.pop().expect("one id yields one value"))
    }

    pub async fn get_many<T>(&self, object_ids: &[ObjectId]) -> WorkerResult<Vec<T>>
    where
        T: Send + Sync + 'static,
    {
        let values = self
            .inner
            .worker
            .get_object(object_ids, CallerContext::Main)
            .await?;
        values.into_iter().map(|value| self.extract(value)).collect()
    }

    fn extract<T>(&self, value: DynValue) -> WorkerResult<T>
    where
        T: Send + Sync + 'static,
    {
        let value = if TypeId::of::<T>() != TypeId::of::<TaskFailure>() {
            match value.downcast::<TaskFailure>() {
                Ok(failure) => {
                    // The producing task failed; raise its sentinel here
                    // and suppress the background duplicate.
                    self.inner.worker.record_task_error_raise();
                    return Err(WorkerError::TaskFailed(*failure));
                }
                Err(value) => value,
            }
        } else {
            value
        };
        value.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
            WorkerError::InvalidArgument(format!(
                "stored value is not a `{}`",
                std::any::type_name::<T>()
            ))
        })
    }

    pub async fn wait(
        &self,
        object_ids: &[ObjectId],
        num_returns: usize,
        timeout_ms: Option<u64>,
    ) -> WorkerResult<(Vec<ObjectId>, Vec<ObjectId>)> {
        self.inner
            .worker
            .wait(object_ids, num_returns, timeout_ms, CallerContext::Main)
            .await
    }

    /// Submit an invocation of a declared remote function; returns its
    /// return object ids immediately.
    pub async fn submit(
        &self,
        function: &RemoteFunction,
        args: Vec<Arg>,
    ) -> WorkerResult<Vec<ObjectId>> {
        self.inner.worker.export_remote_function(function).await?;
        self.inner
            .worker
            .submit_task(
                function.descriptor(self.driver_id()),
                args,
                SubmitOptions {
                    num_returns: function.num_return_vals(),
                    resources: function.resources().clone(),
                    ..Default::default()
                },
            )
            .await
    }

    /// Submit the creation task of an actor and return a handle to it.
    pub async fn create_actor(
        &self,
        class: &ActorClass,
        args: Vec<Arg>,
    ) -> WorkerResult<ActorHandle> {
        self.inner.worker.export_actor_class(&class.linked).await?;
        let actor_id = ActorId::random();
        let descriptor = FunctionDescriptor::for_method(
            self.driver_id(),
            &class.linked.module_name,
            &class.linked.class_name,
            "__init__",
        );
        let returns = self
            .inner
            .worker
            .submit_task(
                descriptor,
                args,
                SubmitOptions {
                    num_returns: 1,
                    resources: class.linked.creation_resources.clone(),
                    actor_creation: Some(ActorCreationCoords {
                        actor_creation_id: actor_id,
                        max_reconstructions: class.linked.max_reconstructions,
                    }),
                    ..Default::default()
                },
            )
            .await?;
        let creation_dummy = returns[0];
        Ok(ActorHandle::new(
            actor_id,
            ActorHandleId::random(),
            self.driver_id(),
            class.linked.module_name.clone(),
            class.linked.class_name.clone(),
            creation_dummy,
        ))
    }

    /// Submit a method call on an actor; returns the user-visible return
    /// object ids (the trailing dummy object is consumed by the handle).
    pub async fn call_actor(
        &self,
        handle: &ActorHandle,
        method: &str,
        args: Vec<Arg>,
    ) -> WorkerResult<Vec<ObjectId>> {
        let class_key = format!("{}.{}", handle.module_name, handle.class_name);
        let class = linkage().actor_class(&class_key).ok_or_else(|| {
            WorkerError::InvalidArgument(format!("unknown actor class {class_key}"))
        })?;
        let num_returns = class
            .methods
            .get(method)
            .map(|spec| spec.num_returns)
            .ok_or_else(|| {
                WorkerError::InvalidArgument(format!(
                    "actor class {class_key} has no method named `{method}`"
                ))
            })?;
        let descriptor = FunctionDescriptor::for_method(
            handle.driver_id,
            &handle.module_name,
            &handle.class_name,
            method,
        );
        self.submit_on_handle(handle, descriptor, args, num_returns, &class.method_resources)
            .await
    }

    /// Ask the actor's worker to drop the instance and retire.
    pub async fn terminate_actor(&self, handle: &ActorHandle) -> WorkerResult<()> {
        let descriptor = FunctionDescriptor::for_method(
            handle.driver_id,
            &handle.module_name,
            &handle.class_name,
            "__terminate__",
        );
        self.submit_on_handle(handle, descriptor, vec![], 0, &HashMap::new())
            .await?;
        Ok(())
    }

    async fn submit_on_handle(
        &self,
        handle: &ActorHandle,
        descriptor: FunctionDescriptor,
        args: Vec<Arg>,
        num_returns: usize,
        resources: &HashMap<String, f64>,
    ) -> WorkerResult<Vec<ObjectId>> {
        let (counter, previous_dummy) = handle.begin_call();
        let result = self
            .inner
            .worker
            .submit_task(
                descriptor,
                args,
                SubmitOptions {
                    num_returns: num_returns + 1,
                    resources: resources.clone(),
                    actor: Some(ActorCallCoords {
                        actor_id: handle.actor_id,
                        actor_handle_id: handle.handle_id,
                        actor_counter: counter,
                        creation_dummy_object_id: handle.creation_dummy_object_id,
                        execution_dependencies: vec![previous_dummy],
                    }),
                    driver_id: Some(handle.driver_id),
                    ..Default::default()
                },
            )
            .await;
        match result {
            Ok(mut returns) => {
                let dummy = returns.pop().expect("actor tasks have a dummy return");
                handle.complete_call(dummy);
                Ok(returns)
            }
            Err(e) => {
                // The slot was claimed but never submitted; keep the old
                // cursor so the next call chains on the last real task.
                handle.complete_call(previous_dummy);
                Err(e)
            }
        }
    }

    pub async fn run_function_on_all_workers(
        &self,
        setup: Arc<SetupFunction>,
    ) -> WorkerResult<()> {
        self.inner.worker.run_function_on_all_workers(setup).await
    }

    /// Register a custom serializer for `T` in this driver's context and,
    /// unless `local_only`, export it to the cluster.
    pub async fn register_custom_serializer<T, S, D>(
        &self,
        serialize: S,
        deserialize: D,
        local_only: bool,
    ) -> WorkerResult<()>
    where
        T: Send + Sync + 'static,
        S: Fn(&T) -> SerResult<Vec<u8>> + Send + Sync + 'static,
        D: Fn(&[u8]) -> SerResult<T> + Send + Sync + 'static,
    {
        let driver_id = self.inner.worker.current_driver_id();
        let ctx = self.inner.worker.serialization_context(driver_id);
        let serialize = Arc::new(serialize);
        let deserialize = Arc::new(deserialize);
        let codec = ctx.register_custom::<T, _, _>(
            {
                let serialize = serialize.clone();
                move |value: &T| serialize(value)
            },
            {
                let deserialize = deserialize.clone();
                move |bytes: &[u8]| deserialize(bytes)
            },
            local_only,
        );
        linkage().register_codec_builder(
            std::any::type_name::<T>(),
            "custom",
            Arc::new(move |rounds, local| {
                let serialize = serialize.clone();
                let deserialize = deserialize.clone();
                custom_codec::<T, _, _>(
                    move |value| serialize(value),
                    move |bytes| deserialize(bytes),
                    rounds,
                    local,
                )
            }),
        );
        if !local_only {
            self.inner.worker.export_codecs(driver_id, &[codec]).await;
        }
        Ok(())
    }

    pub async fn get_gpu_ids(&self) -> WorkerResult<Vec<u64>> {
        self.inner.worker.get_gpu_ids().await
    }

    pub async fn get_resource_ids(&self) -> WorkerResult<ResourceIdMap> {
        self.inner.worker.get_resource_ids().await
    }

    pub async fn get_webui_url(&self) -> WorkerResult<String> {
        let control_plane = self.inner.worker.control_plane()?;
        let url = control_plane
            .hash_get(WEBUI_KEY, "url")
            .await?
            .ok_or_else(|| WorkerError::InvalidArgument("no web UI is running".to_owned()))?;
        Ok(String::from_utf8_lossy(&url).into_owned())
    }

    /// Record an uncaught driver exception so dashboards and other drivers
    /// can see why this driver died.
    pub async fn record_driver_exception(&self, traceback: &str) {
        if let Ok(control_plane) = self.inner.worker.control_plane() {
            let key = format!("{}{}", DRIVERS_KEY_PREFIX, self.inner.worker.worker_id().hex());
            let _ = control_plane
                .hash_set(
                    &key,
                    vec![("exception".to_owned(), traceback.as_bytes().to_vec().into())],
                )
                .await;
        }
    }
}

fn worker_profiler(worker: &Arc<Worker>) -> Profiler {
    worker.profiler_handle()
}

fn client_id_of(worker_id: WorkerId) -> ClientId {
    ClientId::from_bytes(*worker_id.as_bytes())
}

async fn check_version(
    control_plane: &ControlPlaneRef,
    mode: WorkerMode,
    driver_id: DriverId,
) -> WorkerResult<()> {
    match control_plane.kv_get(VERSION_INFO_KEY).await? {
        None => {
            control_plane
                .kv_set(VERSION_INFO_KEY, VERSION.as_bytes().to_vec().into())
                .await?;
            Ok(())
        }
        Some(cluster_version) => {
            let cluster_version = String::from_utf8_lossy(&cluster_version).into_owned();
            if cluster_version == VERSION {
                return Ok(());
            }
            match mode {
                WorkerMode::Script | WorkerMode::Local => Err(WorkerError::VersionMismatch {
                    cluster: cluster_version,
                    local: VERSION.to_owned(),
                }),
                WorkerMode::Worker => {
                    // Keep running; the scheduler decides what to do with a
                    // mismatched worker.
                    crate::error_pipeline::push_error_to_driver(
                        control_plane,
                        driver_id,
                        VERSION_MISMATCH_PUSH_ERROR,
                        format!(
                            "version mismatch: cluster runs {cluster_version}, worker runs {VERSION}"
                        ),
                        HashMap::new(),
                    )
                    .await;
                    Ok(())
                }
            }
        }
    }
}

async fn register_driver(
    control_plane: &ControlPlaneRef,
    worker: &Arc<Worker>,
) -> WorkerResult<()> {
    let key = format!("{}{}", DRIVERS_KEY_PREFIX, worker.worker_id().hex());
    let start_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    control_plane
        .hash_set(
            &key,
            vec![
                (
                    "node_ip_address".to_owned(),
                    b"127.0.0.1".to_vec().into(),
                ),
                (
                    "driver_id".to_owned(),
                    worker.own_driver_id().hex().into_bytes().into(),
                ),
                (
                    "start_time".to_owned(),
                    start_time.to_string().into_bytes().into(),
                ),
                (
                    "plasma_store_socket".to_owned(),
                    b"embedded".to_vec().into(),
                ),
                ("raylet_socket".to_owned(), b"embedded".to_vec().into()),
                ("name".to_owned(), b"driver".to_vec().into()),
            ],
        )
        .await?;
    Ok(())
}

async fn register_worker(
    control_plane: &ControlPlaneRef,
    worker_id: WorkerId,
) -> WorkerResult<()> {
    let key = format!("{}{}", WORKERS_KEY_PREFIX, worker_id.hex());
    control_plane
        .hash_set(
            &key,
            vec![
                (
                    "node_ip_address".to_owned(),
                    b"127.0.0.1".to_vec().into(),
                ),
                (
                    "plasma_store_socket".to_owned(),
                    b"embedded".to_vec().into(),
                ),
            ],
        )
        .await?;
    Ok(())
}

/// Default executor count of an embedded cluster when `num_cpus` is not
/// given.
const DEFAULT_NUM_WORKERS: u64 = 4;

async fn bootstrap_cluster(
    options: &InitOptions,
    config: &WorkerConfig,
    metrics: Arc<WorkerMetrics>,
) -> WorkerResult<OwnedCluster> {
    let registry = Registry::new();
    let store: PlasmaStoreRef = Arc::new(PlasmaStoreImpl::in_mem(Arc::new(
        ObjectStoreMetrics::new(&registry),
    )));
    let control_plane: ControlPlaneRef = Arc::new(InMemControlPlane::new());
    let raylet = LocalRaylet::new(store.clone(), options.num_gpus.unwrap_or(0));

    control_plane
        .kv_set(VERSION_INFO_KEY, VERSION.as_bytes().to_vec().into())
        .await?;

    let handles = ClusterHandles {
        store,
        raylet,
        control_plane,
    };

    let num_workers = options.num_cpus.unwrap_or(DEFAULT_NUM_WORKERS).max(1);
    let mut workers = Vec::new();
    let mut worker_loops = Vec::new();
    for _ in 0..num_workers {
        let worker_id = WorkerId::random();
        let worker = Worker::new(WorkerParams {
            mode: WorkerMode::Worker,
            worker_id,
            driver_id: DriverId::nil(),
            store: Some(handles.store.clone()),
            raylet: Some(Arc::new(handles.raylet.connect(client_id_of(worker_id)))),
            control_plane: Some(handles.control_plane.clone()),
            config: config.clone(),
            metrics: metrics.clone(),
            profiler: Profiler::new("worker"),
            object_id_seed: None,
        });
        register_worker(&handles.control_plane, worker_id).await?;
        worker_loops.push(spawn_import_loop(ImportEnv {
            control_plane: handles.control_plane.clone(),
            manager: worker.manager.clone(),
            serialization: worker.serialization.clone(),
            worker_info: worker.worker_info(),
            own_driver_id: DriverId::nil(),
            fixed_point_rounds: config.class_id_fixed_point_rounds,
        }));
        if let Some(flush) = spawn_flush_loop(
            worker.profiler_handle(),
            handles.control_plane.clone(),
            worker_id,
            config.profiler_flush_interval_ms,
        ) {
            worker_loops.push(flush);
        }
        let main = {
            let worker = worker.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.main_loop().await {
                    tracing::error!(error = %e, "worker main loop failed");
                }
            })
        };
        worker_loops.push(main);
        workers.push(worker);
    }

    Ok(OwnedCluster {
        handles,
        workers,
        worker_loops,
    })
}

/// Entry point of a standalone executor-worker process: connect in WORKER
/// mode, install the SIGTERM hook and run the main loop until the
/// scheduler lets go.
pub async fn start_worker(handles: ClusterHandles, config: WorkerConfig) -> WorkerResult<()> {
    let worker_id = WorkerId::random();
    check_version(&handles.control_plane, WorkerMode::Worker, DriverId::nil()).await?;
    let worker = Worker::new(WorkerParams {
        mode: WorkerMode::Worker,
        worker_id,
        driver_id: DriverId::nil(),
        store: Some(handles.store.clone()),
        raylet: Some(Arc::new(handles.raylet.connect(client_id_of(worker_id)))),
        control_plane: Some(handles.control_plane.clone()),
        config: config.clone(),
        metrics: WorkerMetrics::new(&Registry::new()).into(),
        profiler: Profiler::new("worker"),
        object_id_seed: None,
    });
    register_worker(&handles.control_plane, worker_id).await?;
    let _import = spawn_import_loop(ImportEnv {
        control_plane: handles.control_plane.clone(),
        manager: worker.manager.clone(),
        serialization: worker.serialization.clone(),
        worker_info: worker.worker_info(),
        own_driver_id: DriverId::nil(),
        fixed_point_rounds: config.class_id_fixed_point_rounds,
    });
    let _flush = spawn_flush_loop(
        worker.profiler_handle(),
        handles.control_plane.clone(),
        worker_id,
        config.profiler_flush_interval_ms,
    );

    #[cfg(unix)]
    {
        let worker = worker.clone();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            sigterm.recv().await;
            let _ = worker.disconnect().await;
            std::process::exit(0);
        });
    }

    worker.main_loop().await
}
