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

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RpcError>;

#[derive(Error, Debug)]
pub enum RpcError {
    /// The peer closed the connection, either through `disconnect` or
    /// because the process went away.
    #[error("connection to the {0} is closed")]
    ConnectionClosed(&'static str),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
