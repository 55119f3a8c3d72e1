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

//! Control-plane key prefixes, channel names and error type labels shared
//! between drivers and workers.

/// Keys of error entries: `Error:` + 20-byte driver id + `:` + 20-byte
/// error id. A NIL driver id addresses all drivers.
pub const ERROR_KEY_PREFIX: &str = "Error:";
/// Pubsub channel carrying error events.
pub const ERROR_CHANNEL: &str = "ErrorInfo";
/// List of all error keys, in publication order.
pub const ERROR_KEYS_LIST: &str = "ErrorKeys";

pub const DRIVERS_KEY_PREFIX: &str = "Drivers:";
pub const WORKERS_KEY_PREFIX: &str = "Workers:";

/// List of export keys replayed to every (current and future) worker.
pub const EXPORTS_LIST: &str = "Exports";
/// Pubsub channel notified on every export list append.
pub const EXPORTS_CHANNEL: &str = "Exports";
pub const FUNCTIONS_TO_RUN_KEY_PREFIX: &str = "FunctionsToRun:";
pub const REMOTE_FUNCTION_KEY_PREFIX: &str = "RemoteFunction:";
pub const ACTOR_CLASS_KEY_PREFIX: &str = "ActorClass:";
pub const CODEC_KEY_PREFIX: &str = "Codec:";
pub const EXPORT_LOCK_KEY_PREFIX: &str = "Lock:";

pub const PROFILE_TABLE_KEY_PREFIX: &str = "ProfileTable:";

pub const VERSION_INFO_KEY: &str = "VersionInfo";
pub const WEBUI_KEY: &str = "webui";

/// Error type labels carried by pushed error events.
pub const TASK_PUSH_ERROR: &str = "task";
pub const WAIT_FOR_CLASS_PUSH_ERROR: &str = "wait_for_class";
pub const VERSION_MISMATCH_PUSH_ERROR: &str = "version_mismatch";
pub const WORKER_CRASH_PUSH_ERROR: &str = "worker_crash";
pub const PICKLING_LARGE_OBJECT_PUSH_ERROR: &str = "pickling_large_object";
pub const INFEASIBLE_TASK_PUSH_ERROR: &str = "infeasible_task";

/// `wait` with no explicit timeout waits effectively forever.
pub const NO_TIMEOUT_MS: u64 = 1 << 30;
