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

//! Tunables of the worker runtime.
//!
//! Every field has a serde default so that a config deserialized from the
//! `_internal_config` JSON string only needs to name the overridden knobs.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Maximum number of object ids in a single store `get` request.
    #[serde(default = "default::worker_get_request_size")]
    pub worker_get_request_size: usize,

    /// Maximum number of object ids in a single fetch-or-reconstruct
    /// request to the raylet.
    #[serde(default = "default::worker_fetch_request_size")]
    pub worker_fetch_request_size: usize,

    /// Timeout of one blocking store `get` round while materialising
    /// arguments.
    #[serde(default = "default::get_timeout_milliseconds")]
    pub get_timeout_milliseconds: u64,

    /// Parallel memcopy threads the store is asked to use per `put`.
    #[serde(default = "default::memcopy_threads")]
    pub memcopy_threads: usize,

    /// Back-off between deserialization retries while a codec import is
    /// pending.
    #[serde(default = "default::codec_import_backoff_ms")]
    pub codec_import_backoff_ms: u64,

    /// After this long waiting for a codec, a one-shot warning is pushed
    /// to the driver. The wait itself never gives up.
    #[serde(default = "default::codec_wait_warn_timeout_secs")]
    pub codec_wait_warn_timeout_secs: u64,

    /// How long the background printer delays a task error so that a
    /// near-simultaneous synchronous raise can suppress it.
    #[serde(default = "default::uncaught_error_grace_period_ms")]
    pub uncaught_error_grace_period_ms: u64,

    /// Capacity of the listener-to-printer task error queue.
    #[serde(default = "default::task_error_queue_size")]
    pub task_error_queue_size: usize,

    #[serde(default = "default::profiler_flush_interval_ms")]
    pub profiler_flush_interval_ms: u64,

    /// Fraction of total memory above which task execution is refused.
    #[serde(default = "default::memory_usage_threshold")]
    pub memory_usage_threshold: f64,

    /// Bound on the serialize/deserialize/serialize fixed-point rounds used
    /// to compute a deterministic class id.
    #[serde(default = "default::class_id_fixed_point_rounds")]
    pub class_id_fixed_point_rounds: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl WorkerConfig {
    /// Parse the `_internal_config` JSON string; unspecified fields keep
    /// their defaults, unknown fields are rejected.
    pub fn from_internal_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

pub mod default {
    pub fn worker_get_request_size() -> usize {
        10_000
    }

    pub fn worker_fetch_request_size() -> usize {
        10_000
    }

    pub fn get_timeout_milliseconds() -> u64 {
        1000
    }

    pub fn memcopy_threads() -> usize {
        6
    }

    pub fn codec_import_backoff_ms() -> u64 {
        10
    }

    pub fn codec_wait_warn_timeout_secs() -> u64 {
        10
    }

    pub fn uncaught_error_grace_period_ms() -> u64 {
        5000
    }

    pub fn task_error_queue_size() -> usize {
        128
    }

    pub fn profiler_flush_interval_ms() -> u64 {
        1000
    }

    pub fn memory_usage_threshold() -> f64 {
        0.95
    }

    pub fn class_id_fixed_point_rounds() -> usize {
        5
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_the_default_module() {
        let config = WorkerConfig::default();
        assert_eq!(config.worker_get_request_size, 10_000);
        assert_eq!(config.get_timeout_milliseconds, 1000);
        assert_eq!(config.uncaught_error_grace_period_ms, 5000);
    }

    #[test]
    fn internal_json_overrides_a_subset() {
        let config =
            WorkerConfig::from_internal_json(r#"{"get_timeout_milliseconds": 50}"#).unwrap();
        assert_eq!(config.get_timeout_milliseconds, 50);
        assert_eq!(config.worker_fetch_request_size, 10_000);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(WorkerConfig::from_internal_json(r#"{"no_such_knob": 1}"#).is_err());
    }
}
