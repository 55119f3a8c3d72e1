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

use prometheus::core::{AtomicU64, GenericCounterVec};
use prometheus::{
    exponential_buckets, histogram_opts, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, HistogramVec, Registry,
};

/// Traffic metrics of the store client, labelled by operation.
pub struct ObjectStoreMetrics {
    pub operation_latency: HistogramVec,
    pub operation_size: GenericCounterVec<AtomicU64>,
    pub failure_count: GenericCounterVec<AtomicU64>,
}

impl ObjectStoreMetrics {
    pub fn new(registry: &Registry) -> Self {
        let operation_latency = register_histogram_vec_with_registry!(
            histogram_opts!(
                "photon_object_store_operation_latency",
                "Latency of object store operations",
                exponential_buckets(0.0001, 2.0, 21).unwrap()
            ),
            &["type"],
            registry
        )
        .unwrap();

        let operation_size = register_int_counter_vec_with_registry!(
            "photon_object_store_operation_bytes",
            "Bytes moved by object store operations",
            &["type"],
            registry
        )
        .unwrap();

        let failure_count = register_int_counter_vec_with_registry!(
            "photon_object_store_failure_count",
            "Failed object store operations",
            &["type"],
            registry
        )
        .unwrap();

        Self {
            operation_latency,
            operation_size,
            failure_count,
        }
    }

    /// Metrics on a throwaway registry, for tests.
    pub fn unused() -> Arc<Self> {
        Arc::new(Self::new(&Registry::new()))
    }
}
