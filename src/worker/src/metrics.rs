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

use prometheus::core::{AtomicU64, GenericCounter, GenericCounterVec};
use prometheus::{
    exponential_buckets, histogram_opts, register_histogram_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry, Histogram,
    Registry,
};

/// Metrics of one worker process.
pub struct WorkerMetrics {
    /// Executed tasks by outcome (`ok` / `failed`).
    pub task_count: GenericCounterVec<AtomicU64>,
    pub task_execution_duration: Histogram,
    pub object_put_count: GenericCounter<AtomicU64>,
    pub object_get_count: GenericCounter<AtomicU64>,
    pub pushed_error_count: GenericCounter<AtomicU64>,
}

impl WorkerMetrics {
    pub fn new(registry: &Registry) -> Self {
        let task_count = register_int_counter_vec_with_registry!(
            "photon_worker_task_count",
            "Tasks executed by this worker",
            &["outcome"],
            registry
        )
        .unwrap();

        let task_execution_duration = register_histogram_with_registry!(
            histogram_opts!(
                "photon_worker_task_execution_duration",
                "Wall time of user task bodies",
                exponential_buckets(0.001, 2.0, 21).unwrap()
            ),
            registry
        )
        .unwrap();

        let object_put_count = register_int_counter_with_registry!(
            "photon_worker_object_put_count",
            "Objects written by this worker",
            registry
        )
        .unwrap();

        let object_get_count = register_int_counter_with_registry!(
            "photon_worker_object_get_count",
            "Objects fetched by this worker",
            registry
        )
        .unwrap();

        let pushed_error_count = register_int_counter_with_registry!(
            "photon_worker_pushed_error_count",
            "Errors pushed to drivers through the control plane",
            registry
        )
        .unwrap();

        Self {
            task_count,
            task_execution_duration,
            object_put_count,
            object_get_count,
            pushed_error_count,
        }
    }

    /// Metrics on a throwaway registry, for tests.
    pub fn unused() -> Arc<Self> {
        Arc::new(Self::new(&Registry::new()))
    }
}
