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

//! The task data model handed from a submitter to the local scheduler and
//! consumed once by a worker. A [`TaskSpec`] is immutable after submission.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{ActorHandleId, ActorId, DriverId, FunctionId, ObjectId, TaskId};

/// Content-addressed identity of a remote function or actor method.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub driver_id: DriverId,
    pub module_name: String,
    /// Empty for plain remote functions.
    pub class_name: String,
    pub function_name: String,
}

impl FunctionDescriptor {
    pub fn for_function(driver_id: DriverId, module_name: &str, function_name: &str) -> Self {
        Self {
            driver_id,
            module_name: module_name.to_owned(),
            class_name: String::new(),
            function_name: function_name.to_owned(),
        }
    }

    pub fn for_method(
        driver_id: DriverId,
        module_name: &str,
        class_name: &str,
        function_name: &str,
    ) -> Self {
        Self {
            driver_id,
            module_name: module_name.to_owned(),
            class_name: class_name.to_owned(),
            function_name: function_name.to_owned(),
        }
    }

    pub fn function_id(&self) -> FunctionId {
        FunctionId::from_parts(
            self.driver_id,
            &self.module_name,
            &self.class_name,
            &self.function_name,
        )
    }

    /// `module.Class.method` or `module.function`.
    pub fn qualified_name(&self) -> String {
        if self.class_name.is_empty() {
            format!("{}.{}", self.module_name, self.function_name)
        } else {
            format!(
                "{}.{}.{}",
                self.module_name, self.class_name, self.function_name
            )
        }
    }
}

/// One positional argument of a task.
///
/// Large or complex values are spilled to the object store by the submitter
/// and passed by reference; small simple values ship inline with the task,
/// already encoded by the submitting driver's serialization context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TaskArg {
    ObjectRef(ObjectId),
    Value(#[serde(with = "serde_bytes")] Vec<u8>),
}

/// A task as handed to the local scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSpec {
    pub driver_id: DriverId,
    pub task_id: TaskId,
    pub parent_task_id: TaskId,
    /// Value of the parent's `task_index` when this task was submitted.
    pub parent_counter: u64,
    pub function_descriptor: FunctionDescriptor,
    pub args: Vec<TaskArg>,
    /// Number of return objects, *including* the trailing dummy object for
    /// actor-creation and actor-method tasks.
    pub num_returns: usize,
    pub required_resources: HashMap<String, f64>,
    pub required_placement_resources: HashMap<String, f64>,
    pub actor_creation_id: ActorId,
    pub actor_creation_dummy_object_id: ObjectId,
    pub max_actor_reconstructions: u64,
    pub actor_id: ActorId,
    pub actor_handle_id: ActorHandleId,
    /// Per-handle sequence number of an actor-method task.
    pub actor_counter: u64,
    /// Objects that must be local before the task may be dispatched, on top
    /// of the by-reference arguments. Actor methods chain on the previous
    /// method's dummy object through this list.
    pub execution_dependencies: Vec<ObjectId>,
}

impl TaskSpec {
    pub fn is_actor_creation_task(&self) -> bool {
        !self.actor_creation_id.is_nil()
    }

    pub fn is_actor_task(&self) -> bool {
        !self.actor_id.is_nil()
    }

    /// The deterministically derived return object ids, in return order.
    pub fn returns(&self) -> Vec<ObjectId> {
        (1..=self.num_returns)
            .map(|i| ObjectId::for_return(self.task_id, i as i32))
            .collect()
    }

    /// The dummy object id serialising execution on the target actor, i.e.
    /// the last return slot. `None` for plain tasks.
    pub fn dummy_object_id(&self) -> Option<ObjectId> {
        (self.is_actor_task() || self.is_actor_creation_task())
            .then(|| ObjectId::for_return(self.task_id, self.num_returns as i32))
    }

    /// Every object that must be local before dispatch: by-reference
    /// arguments plus explicit execution dependencies.
    pub fn dependencies(&self) -> Vec<ObjectId> {
        let mut deps: Vec<ObjectId> = self
            .args
            .iter()
            .filter_map(|arg| match arg {
                TaskArg::ObjectRef(id) => Some(*id),
                TaskArg::Value(_) => None,
            })
            .collect();
        deps.extend(self.execution_dependencies.iter().copied());
        deps
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn plain_spec(num_returns: usize) -> TaskSpec {
        TaskSpec {
            driver_id: DriverId::random(),
            task_id: TaskId::random(),
            parent_task_id: TaskId::random(),
            parent_counter: 0,
            function_descriptor: FunctionDescriptor::for_function(
                DriverId::nil(),
                "tests",
                "noop",
            ),
            args: vec![],
            num_returns,
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

    #[test]
    fn returns_are_ordered_and_unique() {
        let spec = plain_spec(3);
        let returns = spec.returns();
        assert_eq!(returns.len(), 3);
        assert_eq!(returns[0], ObjectId::for_return(spec.task_id, 1));
        assert_ne!(returns[0], returns[2]);
        assert_eq!(spec.dummy_object_id(), None);
    }

    #[test]
    fn actor_task_exposes_dummy_object() {
        let mut spec = plain_spec(2);
        spec.actor_id = ActorId::random();
        assert_eq!(
            spec.dummy_object_id(),
            Some(ObjectId::for_return(spec.task_id, 2))
        );
    }

    #[test]
    fn dependencies_cover_refs_and_execution_edges() {
        let mut spec = plain_spec(1);
        let arg = ObjectId::random();
        let dep = ObjectId::random();
        spec.args = vec![TaskArg::ObjectRef(arg), TaskArg::Value(vec![1, 2, 3])];
        spec.execution_dependencies = vec![dep];
        assert_eq!(spec.dependencies(), vec![arg, dep]);
    }

    #[test]
    fn function_ids_are_content_addressed() {
        let driver = DriverId::random();
        let a = FunctionDescriptor::for_function(driver, "m", "f");
        let b = FunctionDescriptor::for_function(driver, "m", "f");
        let c = FunctionDescriptor::for_method(driver, "m", "C", "f");
        assert_eq!(a.function_id(), b.function_id());
        assert_ne!(a.function_id(), c.function_id());
        assert_eq!(c.qualified_name(), "m.C.f");
    }
}
