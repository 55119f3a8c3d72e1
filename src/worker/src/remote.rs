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

//! The builder surface producing [`RemoteFunction`] and actor-class values
//! from an options table.

use std::collections::HashMap;

use photon_common::ids::DriverId;
use photon_common::task::FunctionDescriptor;

use crate::error::{WorkerError, WorkerResult};
use crate::function_manager::{linkage, RemoteCallable};

/// Options accepted when declaring a remote function or actor class.
#[derive(Clone, Debug, Default)]
pub struct RemoteOptions {
    pub num_return_vals: Option<usize>,
    pub num_cpus: Option<f64>,
    pub num_gpus: Option<f64>,
    /// Custom resource demands; must not name `CPU` or `GPU`.
    pub resources: HashMap<String, f64>,
    /// Functions only: retire the worker after this many executions.
    pub max_calls: Option<u64>,
    /// Actors only.
    pub max_reconstructions: Option<u64>,
    /// Actors only.
    pub checkpoint_interval: Option<u64>,
}

/// Resource quantities must be non-negative, and any quantity of one or
/// more must be whole.
pub fn validate_resource_quantities(resources: &HashMap<String, f64>) -> WorkerResult<()> {
    for (name, &quantity) in resources {
        if !quantity.is_finite() || quantity < 0.0 {
            return Err(WorkerError::InvalidArgument(format!(
                "resource quantities must be nonnegative, got {name}={quantity}"
            )));
        }
        if quantity >= 1.0 && quantity.fract() != 0.0 {
            return Err(WorkerError::InvalidArgument(format!(
                "resource quantities of at least one must be whole numbers, got {name}={quantity}"
            )));
        }
    }
    Ok(())
}

impl RemoteOptions {
    fn validate_custom_resources(&self) -> WorkerResult<()> {
        if self.resources.contains_key("CPU") || self.resources.contains_key("GPU") {
            return Err(WorkerError::InvalidArgument(
                "use num_cpus / num_gpus instead of naming CPU or GPU in resources".to_owned(),
            ));
        }
        validate_resource_quantities(&self.resources)
    }

    /// The resource demand of a plain remote function.
    pub fn function_resources(&self) -> WorkerResult<HashMap<String, f64>> {
        if self.max_reconstructions.is_some() {
            return Err(WorkerError::InvalidArgument(
                "max_reconstructions only applies to actors".to_owned(),
            ));
        }
        if self.checkpoint_interval.is_some() {
            return Err(WorkerError::InvalidArgument(
                "checkpoint_interval only applies to actors".to_owned(),
            ));
        }
        self.validate_custom_resources()?;
        let mut resources = self.resources.clone();
        resources.insert("CPU".to_owned(), self.num_cpus.unwrap_or(1.0));
        let gpus = self.num_gpus.unwrap_or(0.0);
        if gpus > 0.0 {
            resources.insert("GPU".to_owned(), gpus);
        }
        validate_resource_quantities(&resources)?;
        Ok(resources)
    }

    /// Resource demands of an actor: `(creation task, each method)`.
    ///
    /// With no demand declared the creation task is free and every method
    /// costs one CPU; with any demand declared the creation task absorbs it
    /// and methods are free.
    pub fn actor_resources(
        &self,
    ) -> WorkerResult<(HashMap<String, f64>, HashMap<String, f64>)> {
        if self.max_calls.is_some() {
            return Err(WorkerError::InvalidArgument(
                "max_calls only applies to remote functions".to_owned(),
            ));
        }
        self.validate_custom_resources()?;
        let declared = self.num_cpus.is_some() || self.num_gpus.is_some() || !self.resources.is_empty();
        if !declared {
            return Ok((
                HashMap::from([("CPU".to_owned(), 0.0)]),
                HashMap::from([("CPU".to_owned(), 1.0)]),
            ));
        }
        let mut creation = self.resources.clone();
        creation.insert("CPU".to_owned(), self.num_cpus.unwrap_or(1.0));
        let gpus = self.num_gpus.unwrap_or(0.0);
        if gpus > 0.0 {
            creation.insert("GPU".to_owned(), gpus);
        }
        validate_resource_quantities(&creation)?;
        Ok((creation, HashMap::from([("CPU".to_owned(), 0.0)])))
    }
}

/// A declared remote function: submit invocations with `Runtime::submit`.
#[derive(Clone)]
pub struct RemoteFunction {
    module_name: String,
    function_name: String,
    pub(crate) num_return_vals: usize,
    pub(crate) resources: HashMap<String, f64>,
    pub(crate) max_calls: u64,
}

impl RemoteFunction {
    /// Declare a remote function: validates the options and registers the
    /// body in the process-wide linkage table.
    pub fn new(
        module_name: &str,
        function_name: &str,
        callable: RemoteCallable,
        options: RemoteOptions,
    ) -> WorkerResult<Self> {
        let resources = options.function_resources()?;
        let max_calls = options.max_calls.unwrap_or(0);
        let function = Self {
            module_name: module_name.to_owned(),
            function_name: function_name.to_owned(),
            num_return_vals: options.num_return_vals.unwrap_or(1),
            resources,
            max_calls,
        };
        linkage().register_function(&function.qualified_name(), callable, max_calls);
        Ok(function)
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module_name, self.function_name)
    }

    pub fn descriptor(&self, driver_id: DriverId) -> FunctionDescriptor {
        FunctionDescriptor::for_function(driver_id, &self.module_name, &self.function_name)
    }

    pub fn num_return_vals(&self) -> usize {
        self.num_return_vals
    }

    pub fn resources(&self) -> &HashMap<String, f64> {
        &self.resources
    }

    pub fn max_calls(&self) -> u64 {
        self.max_calls
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn function_resources_default_to_one_cpu() {
        let resources = RemoteOptions::default().function_resources().unwrap();
        assert_eq!(resources["CPU"], 1.0);
        assert!(!resources.contains_key("GPU"));
    }

    #[test]
    fn custom_resources_must_not_name_cpu_or_gpu() {
        let options = RemoteOptions {
            resources: HashMap::from([("GPU".to_owned(), 1.0)]),
            ..Default::default()
        };
        assert_matches!(
            options.function_resources(),
            Err(WorkerError::InvalidArgument(_))
        );
    }

    #[test]
    fn fractional_quantities_above_one_are_rejected() {
        let options = RemoteOptions {
            num_cpus: Some(1.5),
            ..Default::default()
        };
        assert_matches!(
            options.function_resources(),
            Err(WorkerError::InvalidArgument(_))
        );
        // Fractions below one are fine.
        let options = RemoteOptions {
            num_cpus: Some(0.5),
            ..Default::default()
        };
        assert_eq!(options.function_resources().unwrap()["CPU"], 0.5);
    }

    #[test]
    fn negative_quantities_are_rejected() {
        let resources = HashMap::from([("accelerator".to_owned(), -1.0)]);
        assert_matches!(
            validate_resource_quantities(&resources),
            Err(WorkerError::InvalidArgument(_))
        );
    }

    #[test]
    fn actor_options_reject_max_calls() {
        let options = RemoteOptions {
            max_calls: Some(10),
            ..Default::default()
        };
        assert_matches!(
            options.actor_resources(),
            Err(WorkerError::InvalidArgument(_))
        );
    }

    #[test]
    fn function_options_reject_actor_only_knobs() {
        let options = RemoteOptions {
            checkpoint_interval: Some(10),
            ..Default::default()
        };
        assert_matches!(
            options.function_resources(),
            Err(WorkerError::InvalidArgument(_))
        );
    }

    #[test]
    fn default_actor_split_is_free_creation_paid_methods() {
        let (creation, method) = RemoteOptions::default().actor_resources().unwrap();
        assert_eq!(creation["CPU"], 0.0);
        assert_eq!(method["CPU"], 1.0);
    }

    #[test]
    fn declared_actor_resources_go_to_creation() {
        let options = RemoteOptions {
            num_cpus: Some(2.0),
            num_gpus: Some(1.0),
            ..Default::default()
        };
        let (creation, method) = options.actor_resources().unwrap();
        assert_eq!(creation["CPU"], 2.0);
        assert_eq!(creation["GPU"], 1.0);
        assert_eq!(method["CPU"], 0.0);
    }
}
