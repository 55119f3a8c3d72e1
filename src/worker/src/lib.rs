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

//! The photon worker runtime.
//!
//! This crate contains the per-process state machine of a task-parallel
//! cluster: executor workers pulling tasks from the local scheduler and
//! materialising their arguments from the object store, and the driver
//! surface (`put` / `get` / `wait` / `submit`, remote functions, actors)
//! exposed through [`Runtime`].
//!
//! ```no_run
//! # async fn example() -> photon_worker::WorkerResult<()> {
//! use photon_worker::{InitOptions, Runtime};
//!
//! let runtime = Runtime::init(InitOptions::default()).await?;
//! let id = runtime.put(42i64).await?;
//! assert_eq!(runtime.get::<i64>(id).await?, 42);
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod error;
pub mod error_pipeline;
pub mod function_manager;
pub mod memory;
pub mod metrics;
pub mod profiling;
pub mod remote;
pub mod runtime;
pub mod serialization;
pub mod worker;

pub use actor::{ActorClass, ActorClassBuilder, ActorHandle};
pub use error::{WorkerError, WorkerResult};
pub use function_manager::{SetupFunction, WorkerInfo};
pub use remote::{RemoteFunction, RemoteOptions};
pub use runtime::{
    is_initialized, start_worker, ClusterHandles, InitOptions, Runtime,
};
pub use serialization::DynValue;
pub use worker::{Arg, CallerContext, Worker, WorkerMode};

/// Register a setup function before `init`; it is replayed and exported
/// when a runtime connects.
pub fn register_setup_function(setup: std::sync::Arc<SetupFunction>) {
    function_manager::linkage().cache_setup(setup);
}
