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

//! Per-driver catalog of executable task bodies, and the export/import
//! machinery that distributes them.
//!
//! Rust code does not travel over the wire: an export is a *descriptor*
//! (ids, names, metadata) published through the control plane, and every
//! worker binds descriptors to the identical registrations made by the
//! application binary in the process-wide [`LinkageRegistry`]. The
//! `Exports` list and its pubsub channel drive a background import task on
//! every worker; lookups for not-yet-imported entries wait cooperatively.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use photon_common::constants::{
    ACTOR_CLASS_KEY_PREFIX, CODEC_KEY_PREFIX, EXPORTS_CHANNEL, EXPORTS_LIST,
    FUNCTIONS_TO_RUN_KEY_PREFIX, REMOTE_FUNCTION_KEY_PREFIX,
};
use photon_common::ids::{DriverId, FunctionId, WorkerId};
use photon_common::task::FunctionDescriptor;
use photon_rpc_client::ControlPlaneRef;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::actor::LinkedActorClass;
use crate::serialization::{Codec, DynValue, SerializationRegistry};
use crate::worker::WorkerMode;

/// Body of a plain remote function.
pub type RemoteCallable =
    Arc<dyn Fn(Vec<DynValue>) -> anyhow::Result<Vec<DynValue>> + Send + Sync>;

/// A function replayed on every worker, carrying an opaque payload.
pub type SetupCallable = Arc<dyn Fn(&WorkerInfo) + Send + Sync>;

type CodecBuilder = Arc<dyn Fn(usize, bool) -> Codec + Send + Sync>;

/// What the import subscriber knows about the process it runs in.
#[derive(Clone, Debug)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub mode: WorkerMode,
}

/// A named function to run once on every worker of the cluster.
pub struct SetupFunction {
    pub name: String,
    pub payload: Vec<u8>,
    pub run_on_other_drivers: bool,
    pub callable: SetupCallable,
}

impl SetupFunction {
    pub fn new(
        name: impl Into<String>,
        callable: impl Fn(&WorkerInfo) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            payload: Vec::new(),
            run_on_other_drivers: false,
            callable: Arc::new(callable),
        })
    }

    pub fn with_payload(self: Arc<Self>, payload: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            name: self.name.clone(),
            payload,
            run_on_other_drivers: self.run_on_other_drivers,
            callable: self.callable.clone(),
        })
    }

    pub fn run_on_other_drivers(self: Arc<Self>, run: bool) -> Arc<Self> {
        Arc::new(Self {
            name: self.name.clone(),
            payload: self.payload.clone(),
            run_on_other_drivers: run,
            callable: self.callable.clone(),
        })
    }
}

struct LinkedFunction {
    callable: RemoteCallable,
    max_calls: u64,
}

#[derive(Default)]
struct LinkageInner {
    functions: HashMap<String, LinkedFunction>,
    actor_classes: HashMap<String, Arc<LinkedActorClass>>,
    setups: HashMap<String, Arc<SetupFunction>>,
    /// Setup functions registered before any runtime was initialized,
    /// replayed by `connect` in registration order.
    pending_setups: Vec<Arc<SetupFunction>>,
    codec_builders: HashMap<(String, String), CodecBuilder>,
}

/// Process-wide table binding exported descriptors to executable code.
///
/// Every node runs the same application binary, so a registration made at
/// startup exists identically on every worker; the control plane only has
/// to ship descriptors.
#[derive(Default)]
pub struct LinkageRegistry {
    inner: Mutex<LinkageInner>,
}

pub fn linkage() -> &'static LinkageRegistry {
    static LINKAGE: OnceLock<LinkageRegistry> = OnceLock::new();
    LINKAGE.get_or_init(LinkageRegistry::default)
}

impl LinkageRegistry {
    pub fn register_function(
        &self,
        qualified_name: &str,
        callable: RemoteCallable,
        max_calls: u64,
    ) {
        self.inner.lock().functions.insert(
            qualified_name.to_owned(),
            LinkedFunction { callable, max_calls },
        );
    }

    pub fn register_actor_class(&self, qualified_name: &str, class: Arc<LinkedActorClass>) {
        self.inner
            .lock()
            .actor_classes
            .insert(qualified_name.to_owned(), class);
    }

    /// Bind a setup function's name so imports can resolve it.
    pub fn register_setup(&self, setup: Arc<SetupFunction>) {
        self.inner
            .lock()
            .setups
            .insert(setup.name.clone(), setup);
    }

    /// Register a setup function before any runtime exists; `connect`
    /// replays and exports the pending list in registration order.
    pub fn cache_setup(&self, setup: Arc<SetupFunction>) {
        let mut inner = self.inner.lock();
        inner.setups.insert(setup.name.clone(), setup.clone());
        inner.pending_setups.push(setup);
    }

    pub fn register_codec_builder(
        &self,
        type_name: &str,
        strategy_tag: &str,
        builder: CodecBuilder,
    ) {
        self.inner
            .lock()
            .codec_builders
            .insert((type_name.to_owned(), strategy_tag.to_owned()), builder);
    }

    pub fn take_pending_setups(&self) -> Vec<Arc<SetupFunction>> {
        std::mem::take(&mut self.inner.lock().pending_setups)
    }

    fn function(&self, qualified_name: &str) -> Option<(RemoteCallable, u64)> {
        self.inner
            .lock()
            .functions
            .get(qualified_name)
            .map(|f| (f.callable.clone(), f.max_calls))
    }

    pub fn actor_class(&self, qualified_name: &str) -> Option<Arc<LinkedActorClass>> {
        self.inner.lock().actor_classes.get(qualified_name).cloned()
    }

    fn setup(&self, name: &str) -> Option<Arc<SetupFunction>> {
        self.inner.lock().setups.get(name).cloned()
    }

    fn codec_builder(&self, type_name: &str, strategy_tag: &str) -> Option<CodecBuilder> {
        self.inner
            .lock()
            .codec_builders
            .get(&(type_name.to_owned(), strategy_tag.to_owned()))
            .cloned()
    }
}

/// How a task body is executed.
#[derive(Clone)]
pub enum Executable {
    Function(RemoteCallable),
    ActorCreation(Arc<LinkedActorClass>),
    ActorMethod {
        class: Arc<LinkedActorClass>,
        method: String,
    },
}

#[derive(Clone)]
pub struct ExecutionInfo {
    pub executable: Executable,
    pub function_name: String,
    /// After this many executions of the function the worker retires.
    /// Zero means unlimited.
    pub max_calls: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Plain,
    ActorCreation,
    ActorMethod,
}

#[derive(Default)]
struct ManagerInner {
    functions: HashMap<(DriverId, FunctionId), Arc<ExecutionInfo>>,
    task_counters: HashMap<(DriverId, FunctionId), u64>,
    ran_setups: HashSet<String>,
}

/// Per-worker catalog of imported executables.
pub struct FunctionActorManager {
    inner: Mutex<ManagerInner>,
    /// Notified on every import; cooperative waiters re-check on wake.
    imported: Notify,
}

impl Default for FunctionActorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionActorManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ManagerInner::default()),
            imported: Notify::new(),
        }
    }

    /// Resolve a function descriptor to an executable, waiting for the
    /// import subscription (or a late application registration) if needed.
    pub async fn get_execution_info(
        &self,
        driver_id: DriverId,
        descriptor: &FunctionDescriptor,
        kind: TaskKind,
    ) -> Arc<ExecutionInfo> {
        let function_id = descriptor.function_id();
        let mut waited = Duration::ZERO;
        let mut warned = false;
        loop {
            if let Some(info) = self.inner.lock().functions.get(&(driver_id, function_id)) {
                return info.clone();
            }
            if let Some(info) = self.resolve_from_linkage(descriptor, kind) {
                let info = Arc::new(info);
                self.inner
                    .lock()
                    .functions
                    .insert((driver_id, function_id), info.clone());
                return info;
            }
            let wait = Duration::from_millis(100);
            let _ = tokio::time::timeout(wait, self.imported.notified()).await;
            waited += wait;
            if !warned && waited >= Duration::from_secs(10) {
                warned = true;
                tracing::warn!(
                    function = %descriptor.qualified_name(),
                    "still waiting for this function to be registered; this may be fine, or it may be a bug"
                );
            }
        }
    }

    /// Non-waiting variant of [`Self::get_execution_info`], used by LOCAL
    /// mode where nothing can arrive later.
    pub fn try_get_execution_info(
        &self,
        driver_id: DriverId,
        descriptor: &FunctionDescriptor,
        kind: TaskKind,
    ) -> Option<Arc<ExecutionInfo>> {
        let function_id = descriptor.function_id();
        if let Some(info) = self.inner.lock().functions.get(&(driver_id, function_id)) {
            return Some(info.clone());
        }
        let info = Arc::new(self.resolve_from_linkage(descriptor, kind)?);
        self.inner
            .lock()
            .functions
            .insert((driver_id, function_id), info.clone());
        Some(info)
    }

    fn resolve_from_linkage(
        &self,
        descriptor: &FunctionDescriptor,
        kind: TaskKind,
    ) -> Option<ExecutionInfo> {
        match kind {
            TaskKind::Plain => {
                let (callable, max_calls) = linkage().function(&descriptor.qualified_name())?;
                Some(ExecutionInfo {
                    executable: Executable::Function(callable),
                    function_name: descriptor.qualified_name(),
                    max_calls,
                })
            }
            TaskKind::ActorCreation | TaskKind::ActorMethod => {
                let class_key = format!("{}.{}", descriptor.module_name, descriptor.class_name);
                let class = linkage().actor_class(&class_key)?;
                let executable = if kind == TaskKind::ActorCreation {
                    Executable::ActorCreation(class)
                } else {
                    Executable::ActorMethod {
                        class,
                        method: descriptor.function_name.clone(),
                    }
                };
                Some(ExecutionInfo {
                    executable,
                    function_name: descriptor.qualified_name(),
                    max_calls: 0,
                })
            }
        }
    }

    /// Install an imported executable and wake cooperative waiters.
    pub fn install(&self, driver_id: DriverId, function_id: FunctionId, info: ExecutionInfo) {
        self.inner
            .lock()
            .functions
            .insert((driver_id, function_id), Arc::new(info));
        self.imported.notify_waiters();
    }

    pub fn increase_task_counter(&self, driver_id: DriverId, function_id: FunctionId) -> u64 {
        let mut inner = self.inner.lock();
        let counter = inner.task_counters.entry((driver_id, function_id)).or_insert(0);
        *counter += 1;
        *counter
    }

    fn mark_setup_ran(&self, key: &str) -> bool {
        self.inner.lock().ran_setups.insert(key.to_owned())
    }

    /// Wake waiters; used whenever any import-visible table changed.
    pub fn notify_imported(&self) {
        self.imported.notify_waiters();
    }
}

/// Everything the background import task needs.
pub struct ImportEnv {
    pub control_plane: ControlPlaneRef,
    pub manager: Arc<FunctionActorManager>,
    pub serialization: Arc<SerializationRegistry>,
    pub worker_info: WorkerInfo,
    /// NIL on executor workers.
    pub own_driver_id: DriverId,
    pub fixed_point_rounds: usize,
}

/// Spawn the import subscriber: replays the existing `Exports` list, then
/// follows the pubsub channel. Exits silently when the control plane
/// disconnects.
pub fn spawn_import_loop(env: ImportEnv) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscription = match env.control_plane.subscribe(EXPORTS_CHANNEL).await {
            Ok(subscription) => subscription,
            Err(_) => return,
        };
        let mut processed: HashSet<String> = HashSet::new();

        // Exports published before this worker connected.
        if let Ok(existing) = env.control_plane.list_range(EXPORTS_LIST, 0, -1).await {
            for key in existing {
                let key = String::from_utf8_lossy(&key).into_owned();
                if processed.insert(key.clone()) {
                    handle_export(&env, &key).await;
                }
            }
        }

        loop {
            match subscription.recv().await {
                Ok(payload) => {
                    let key = String::from_utf8_lossy(&payload).into_owned();
                    if processed.insert(key.clone()) {
                        handle_export(&env, &key).await;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // Fall back to the list to recover anything missed.
                    if let Ok(existing) = env.control_plane.list_range(EXPORTS_LIST, 0, -1).await {
                        for key in existing {
                            let key = String::from_utf8_lossy(&key).into_owned();
                            if processed.insert(key.clone()) {
                                handle_export(&env, &key).await;
                            }
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

async fn handle_export(env: &ImportEnv, key: &str) {
    let result = if key.starts_with(REMOTE_FUNCTION_KEY_PREFIX) {
        import_remote_function(env, key).await
    } else if key.starts_with(ACTOR_CLASS_KEY_PREFIX) {
        import_actor_class(env, key).await
    } else if key.starts_with(FUNCTIONS_TO_RUN_KEY_PREFIX) {
        import_function_to_run(env, key).await
    } else if key.starts_with(CODEC_KEY_PREFIX) {
        import_codec(env, key).await
    } else {
        tracing::debug!(key, "ignoring unknown export");
        Ok(())
    };
    if let Err(e) = result {
        tracing::warn!(key, error = %e, "failed to import export");
    }
}

fn field(fields: &HashMap<String, Bytes>, name: &str) -> anyhow::Result<String> {
    fields
        .get(name)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .ok_or_else(|| anyhow::anyhow!("export is missing field `{name}`"))
}

fn driver_field(fields: &HashMap<String, Bytes>) -> anyhow::Result<DriverId> {
    Ok(DriverId::from_hex(&field(fields, "driver_id")?)?)
}

async fn import_remote_function(env: &ImportEnv, key: &str) -> anyhow::Result<()> {
    let fields = env.control_plane.hash_get_all(key).await?;
    let driver_id = driver_field(&fields)?;
    let descriptor = FunctionDescriptor {
        driver_id,
        module_name: field(&fields, "module_name")?,
        class_name: String::new(),
        function_name: field(&fields, "function_name")?,
    };
    let max_calls: u64 = field(&fields, "max_calls")?.parse()?;
    let Some((callable, _)) = linkage().function(&descriptor.qualified_name()) else {
        // The application has not registered this function here (yet);
        // lookups fall back to the linkage table once it appears.
        tracing::debug!(function = %descriptor.qualified_name(), "no local registration for export");
        return Ok(());
    };
    env.manager.install(
        driver_id,
        descriptor.function_id(),
        ExecutionInfo {
            executable: Executable::Function(callable),
            function_name: descriptor.qualified_name(),
            max_calls,
        },
    );
    Ok(())
}

async fn import_actor_class(env: &ImportEnv, key: &str) -> anyhow::Result<()> {
    let fields = env.control_plane.hash_get_all(key).await?;
    driver_field(&fields)?;
    let module_name = field(&fields, "module_name")?;
    let class_name = field(&fields, "class_name")?;
    let class_key = format!("{module_name}.{class_name}");
    if linkage().actor_class(&class_key).is_none() {
        tracing::debug!(class = %class_key, "no local registration for actor class export");
        return Ok(());
    }
    // Resolution happens lazily through the linkage table; the import only
    // needs to wake waiters.
    env.manager.notify_imported();
    Ok(())
}

async fn import_function_to_run(env: &ImportEnv, key: &str) -> anyhow::Result<()> {
    if !env.manager.mark_setup_ran(key) {
        return Ok(());
    }
    let fields = env.control_plane.hash_get_all(key).await?;
    let driver_id = driver_field(&fields)?;
    let name = field(&fields, "name")?;
    let run_on_other_drivers = field(&fields, "run_on_other_drivers")? == "true";

    let should_run = match env.worker_info.mode {
        WorkerMode::Worker => true,
        // The publishing driver already ran it locally before exporting.
        WorkerMode::Script | WorkerMode::Local => {
            run_on_other_drivers && driver_id != env.own_driver_id
        }
    };
    if !should_run {
        return Ok(());
    }
    let Some(setup) = linkage().setup(&name) else {
        anyhow::bail!("no local registration for setup function `{name}`");
    };
    (setup.callable)(&env.worker_info);
    env.manager.notify_imported();
    Ok(())
}

async fn import_codec(env: &ImportEnv, key: &str) -> anyhow::Result<()> {
    let fields = env.control_plane.hash_get_all(key).await?;
    let driver_id = driver_field(&fields)?;
    let type_name = field(&fields, "type_name")?;
    let strategy = field(&fields, "strategy")?;
    let Some(builder) = linkage().codec_builder(&type_name, &strategy) else {
        anyhow::bail!("no local codec registration for type `{type_name}`");
    };
    let codec = Arc::new(builder(env.fixed_point_rounds, false));
    env.serialization.context(driver_id).install(codec);
    env.manager.notify_imported();
    Ok(())
}
