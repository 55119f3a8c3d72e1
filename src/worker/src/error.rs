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

use photon_common::failure::TaskFailure;
use photon_object_store::ObjectError;
use photon_rpc_client::RpcError;
use thiserror::Error;

use crate::serialization::SerError;

/// A specialized Result type for worker runtime operations.
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

/// The error type for worker runtime operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("the runtime is not connected; call init first")]
    NotConnected,

    #[error("the runtime is already initialized: perhaps you called init twice by accident?")]
    AlreadyInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An upstream task failed; its sentinel was observed by `get` or while
    /// materialising arguments.
    #[error(transparent)]
    TaskFailed(#[from] TaskFailure),

    #[error("version mismatch: cluster runs {cluster}, this process runs {local}")]
    VersionMismatch { cluster: String, local: String },

    #[error(transparent)]
    Serialization(#[from] SerError),

    #[error(transparent)]
    ObjectStore(#[from] ObjectError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
