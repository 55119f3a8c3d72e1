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

//! Actors: stateful objects pinned to the worker that created them, whose
//! methods run in caller-specified order.
//!
//! Ordering is enforced through the object store: every actor task's last
//! return slot is a zero-payload *dummy object*, and each method lists the
//! previous call's dummy object as an execution dependency. The scheduler
//! therefore cannot dispatch a method before its predecessor finished.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use photon_common::ids::{ActorHandleId, ActorId, DriverId, ObjectId};
use serde::{Deserialize, Serialize};

use crate::remote::RemoteOptions;
use crate::serialization::{SerError, SerializationContext};

/// A live actor instance owned by a worker.
pub type DynActor = Box<dyn Any + Send>;

pub type ActorFactory =
    Arc<dyn Fn(Vec<crate::serialization::DynValue>) -> anyhow::Result<DynActor> + Send + Sync>;

pub type ActorMethodFn = Arc<
    dyn Fn(&mut DynActor, Vec<crate::serialization::DynValue>) -> anyhow::Result<Vec<crate::serialization::DynValue>>
        + Send
        + Sync,
>;

pub struct ActorMethodSpec {
    pub callable: ActorMethodFn,
    /// User-visible return count, excluding the dummy slot.
    pub num_returns: usize,
}

/// The executable side of an actor class, registered in the process-wide
/// linkage table.
pub struct LinkedActorClass {
    pub module_name: String,
    pub class_name: String,
    pub factory: ActorFactory,
    pub methods: HashMap<String, ActorMethodSpec>,
    pub max_reconstructions: u64,
    pub checkpoint_interval: u64,
    pub creation_resources: HashMap<String, f64>,
    pub method_resources: HashMap<String, f64>,
}

impl LinkedActorClass {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module_name, self.class_name)
    }
}

/// Driver-facing handle to a registered actor class; create instances with
/// `Runtime::create_actor`.
#[derive(Clone)]
pub struct ActorClass {
    pub(crate) linked: Arc<LinkedActorClass>,
}

impl ActorClass {
    pub fn builder(module_name: &str, class_name: &str) -> ActorClassBuilder {
        ActorClassBuilder {
            module_name: module_name.to_owned(),
            class_name: class_name.to_owned(),
            factory: None,
            methods: HashMap::new(),
            options: RemoteOptions::default(),
        }
    }

    pub fn qualified_name(&self) -> String {
        self.linked.qualified_name()
    }
}

pub struct ActorClassBuilder {
    module_name: String,
    class_name: String,
    factory: Option<ActorFactory>,
    methods: HashMap<String, ActorMethodSpec>,
    options: RemoteOptions,
}

impl ActorClassBuilder {
    /// The constructor run by the actor-creation task.
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(Vec<crate::serialization::DynValue>) -> anyhow::Result<DynActor>
            + Send
            + Sync
            + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn method<F>(mut self, name: &str, callable: F) -> Self
    where
        F: Fn(&mut DynActor, Vec<crate::serialization::DynValue>) -> anyhow::Result<Vec<crate::serialization::DynValue>>
            + Send
            + Sync
            + 'static,
    {
        self.methods.insert(
            name.to_owned(),
            ActorMethodSpec {
                callable: Arc::new(callable),
                num_returns: 1,
            },
        );
        self
    }

    pub fn method_num_returns(mut self, name: &str, num_returns: usize) -> Self {
        if let Some(spec) = self.methods.get_mut(name) {
            spec.num_returns = num_returns;
        }
        self
    }

    pub fn options(mut self, options: RemoteOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the options, register the class in the linkage table and
    /// return the driver-facing handle.
    pub fn build(self) -> crate::error::WorkerResult<ActorClass> {
        let (creation_resources, method_resources) = self.options.actor_resources()?;
        let factory = self.factory.ok_or_else(|| {
            crate::error::WorkerError::InvalidArgument(format!(
                "actor class {}.{} has no factory",
                self.module_name, self.class_name
            ))
        })?;
        let linked = Arc::new(LinkedActorClass {
            module_name: self.module_name,
            class_name: self.class_name,
            factory,
            methods: self.methods,
            max_reconstructions: self.options.max_reconstructions.unwrap_or(0),
            checkpoint_interval: self.options.checkpoint_interval.unwrap_or(0),
            creation_resources,
            method_resources,
        });
        crate::function_manager::linkage()
            .register_actor_class(&linked.qualified_name(), linked.clone());
        Ok(ActorClass { linked })
    }
}

struct HandleState {
    /// Dummy object of the most recently submitted task on this handle.
    cursor: ObjectId,
    counter: u64,
    forks: u64,
}

/// A serialisable reference used to invoke methods on an actor.
pub struct ActorHandle {
    pub actor_id: ActorId,
    pub handle_id: ActorHandleId,
    pub driver_id: DriverId,
    pub module_name: String,
    pub class_name: String,
    /// Dummy object of the creation task.
    pub creation_dummy_object_id: ObjectId,
    state: Mutex<HandleState>,
}

impl ActorHandle {
    pub(crate) fn new(
        actor_id: ActorId,
        handle_id: ActorHandleId,
        driver_id: DriverId,
        module_name: String,
        class_name: String,
        creation_dummy_object_id: ObjectId,
    ) -> Self {
        Self {
            actor_id,
            handle_id,
            driver_id,
            module_name,
            class_name,
            creation_dummy_object_id,
            state: Mutex::new(HandleState {
                cursor: creation_dummy_object_id,
                counter: 0,
                forks: 0,
            }),
        }
    }

    /// Claim the next method slot: returns `(counter, previous dummy)`.
    /// The claimed slot's dummy object is recorded with
    /// [`Self::complete_call`] once the task id is known.
    pub(crate) fn begin_call(&self) -> (u64, ObjectId) {
        let mut state = self.state.lock();
        let claimed = (state.counter, state.cursor);
        state.counter += 1;
        claimed
    }

    pub(crate) fn complete_call(&self, dummy: ObjectId) {
        self.state.lock().cursor = dummy;
    }

    pub(crate) fn peek(&self) -> (u64, ObjectId) {
        let state = self.state.lock();
        (state.counter, state.cursor)
    }
}

#[derive(Serialize, Deserialize)]
struct HandleData {
    actor_id: ActorId,
    parent_handle_id: ActorHandleId,
    driver_id: DriverId,
    module_name: String,
    class_name: String,
    creation_dummy_object_id: ObjectId,
    cursor: ObjectId,
    counter: u64,
    fork_index: u64,
}

/// Register the actor-handle codec on a context. Serializing a handle
/// forks it: the receiver derives its own handle id so two holders never
/// collide on per-handle counters.
pub fn install_handle_codec(ctx: &SerializationContext) {
    ctx.register_custom::<ActorHandle, _, _>(
        |handle| {
            let mut state = handle.state.lock();
            let fork_index = state.forks;
            state.forks += 1;
            let data = HandleData {
                actor_id: handle.actor_id,
                parent_handle_id: handle.handle_id,
                driver_id: handle.driver_id,
                module_name: handle.module_name.clone(),
                class_name: handle.class_name.clone(),
                creation_dummy_object_id: handle.creation_dummy_object_id,
                cursor: state.cursor,
                counter: state.counter,
                fork_index,
            };
            bincode::serialize(&data).map_err(|e| SerError::Encode {
                type_name: "ActorHandle",
                source: e.into(),
            })
        },
        |bytes| {
            let data: HandleData =
                bincode::deserialize(bytes).map_err(|e| SerError::Decode {
                    class_id: photon_common::ids::ClassId::nil(),
                    source: e.into(),
                })?;
            let handle = ActorHandle::new(
                data.actor_id,
                ActorHandleId::for_fork(data.parent_handle_id, data.fork_index),
                data.driver_id,
                data.module_name,
                data.class_name,
                data.creation_dummy_object_id,
            );
            {
                let mut state = handle.state.lock();
                state.cursor = data.cursor;
                state.counter = data.counter;
            }
            Ok(handle)
        },
        false,
    );
}

#[cfg(test)]
mod tests {
    use photon_common::ids::TaskId;
    use pretty_assertions::assert_eq;

    use super::*;

    fn handle() -> ActorHandle {
        ActorHandle::new(
            ActorId::random(),
            ActorHandleId::random(),
            DriverId::random(),
            "tests".to_owned(),
            "Counter".to_owned(),
            ObjectId::for_return(TaskId::random(), 1),
        )
    }

    #[test]
    fn calls_chain_dummy_objects() {
        let handle = handle();
        let creation_dummy = handle.creation_dummy_object_id;
        let first_dummy = ObjectId::random();
        let second_dummy = ObjectId::random();

        assert_eq!(handle.begin_call(), (0, creation_dummy));
        handle.complete_call(first_dummy);
        assert_eq!(handle.begin_call(), (1, first_dummy));
        handle.complete_call(second_dummy);
        assert_eq!(handle.peek(), (2, second_dummy));
    }

    #[test]
    fn serialized_handle_forks_deterministically() {
        let ctx = SerializationContext::new(DriverId::random(), 5);
        install_handle_codec(&ctx);

        let original = handle();
        let bytes = ctx
            .serialize(&original as &(dyn std::any::Any + Send + Sync))
            .unwrap();
        let fork = ctx.deserialize(&bytes).unwrap();
        let fork = fork.downcast_ref::<ActorHandle>().unwrap();

        assert_eq!(fork.actor_id, original.actor_id);
        assert_eq!(
            fork.handle_id,
            ActorHandleId::for_fork(original.handle_id, 0)
        );
        assert_ne!(fork.handle_id, original.handle_id);

        // A second serialization forks at the next index.
        let bytes = ctx
            .serialize(&original as &(dyn std::any::Any + Send + Sync))
            .unwrap();
        let second = ctx.deserialize(&bytes).unwrap();
        let second = second.downcast_ref::<ActorHandle>().unwrap();
        assert_eq!(
            second.handle_id,
            ActorHandleId::for_fork(original.handle_id, 1)
        );
    }
}
