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

//! Clients for the worker's two control collaborators: the per-node local
//! scheduler (raylet) and the cluster metadata/pubsub service (control
//! plane).
//!
//! Both are defined as traits; the embedded implementations in
//! [`local_raylet`] and [`control_plane`] back the single-node bootstrap
//! mode and the test suite.

pub mod control_plane;
pub mod error;
pub mod local_raylet;
pub mod raylet;

pub use control_plane::{ControlPlaneClient, ControlPlaneRef, InMemControlPlane};
pub use error::{Result, RpcError};
pub use local_raylet::LocalRaylet;
pub use raylet::{RayletClient, RayletClientRef, ResourceIdMap};
