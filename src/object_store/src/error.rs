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

use photon_common::ids::ObjectId;
use thiserror::Error;

/// A specialized Result type for object store operations.
pub type ObjectResult<T> = std::result::Result<T, ObjectError>;

/// The error type for object store operations.
#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("object {0} already exists in the object store")]
    ObjectExists(ObjectId),

    #[error("object store client is disconnected")]
    Disconnected,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
