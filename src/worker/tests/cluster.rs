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

//! End-to-end scenarios against an embedded single-node cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use photon_common::constants::EXPORTS_LIST;
use photon_common::ids::ObjectId;
use photon_worker::worker::SubmitOptions;
use photon_worker::{
    ActorClass, Arg, DynValue, InitOptions, RemoteFunction, RemoteOptions, Runtime, SetupFunction,
    WorkerError, WorkerMode,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// One cluster at a time: the reinitialization guard is process-wide.
fn test_lock() -> &'static tokio::sync::Mutex<()> {
    static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
}

fn options(num_workers: u64) -> InitOptions {
    InitOptions {
        num_cpus: Some(num_workers),
        ..Default::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Point {
    x: i64,
    y: i64,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn put_get_roundtrip() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(options(1)).await.unwrap();

    let id = runtime.put(42i64).await.unwrap();
    assert_eq!(runtime.get::<i64>(id).await.unwrap(), 42);

    let id = runtime.put("hello".to_owned()).await.unwrap();
    assert_eq!(runtime.get::<String>(id).await.unwrap(), "hello");

    // A user type gets its codec registered on first use.
    let point = Point { x: 3, y: 4 };
    let id = runtime.put(point.clone()).await.unwrap();
    assert_eq!(runtime.get::<Point>(id).await.unwrap(), point);

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submitted_task_runs_on_a_worker() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(options(2)).await.unwrap();

    let double = RemoteFunction::new(
        "cluster_tests",
        "double",
        Arc::new(|mut args: Vec<DynValue>| {
            let value = *args
                .remove(0)
                .downcast::<i64>()
                .map_err(|_| anyhow::anyhow!("expected an i64 argument"))?;
            Ok(vec![Box::new(value * 2) as DynValue])
        }),
        RemoteOptions::default(),
    )
    .unwrap();

    let returns = runtime.submit(&double, vec![Arg::value(21i64)]).await.unwrap();
    assert_eq!(returns.len(), 1);
    assert_eq!(runtime.get::<i64>(returns[0]).await.unwrap(), 42);

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spilled_arguments_ship_their_codec() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(options(1)).await.unwrap();

    let add = RemoteFunction::new(
        "cluster_tests",
        "add_point",
        Arc::new(|mut args: Vec<DynValue>| {
            let point = *args
                .remove(0)
                .downcast::<Point>()
                .map_err(|_| anyhow::anyhow!("expected a Point argument"))?;
            Ok(vec![Box::new(point.x + point.y) as DynValue])
        }),
        RemoteOptions::default(),
    )
    .unwrap();

    // Point is not a simple value: it is spilled to the store and the
    // worker must import its codec before it can deserialize the argument.
    let returns = runtime
        .submit(&add, vec![Arg::value(Point { x: 40, y: 2 })])
        .await
        .unwrap();
    assert_eq!(runtime.get::<i64>(returns[0]).await.unwrap(), 42);

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_task_surfaces_a_task_failure() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(options(1)).await.unwrap();

    let boom = RemoteFunction::new(
        "cluster_tests",
        "boom",
        Arc::new(|_args: Vec<DynValue>| Err(anyhow::anyhow!("boom"))),
        RemoteOptions::default(),
    )
    .unwrap();

    let returns = runtime.submit(&boom, vec![]).await.unwrap();
    let error = runtime.get::<i64>(returns[0]).await.unwrap_err();
    match error {
        WorkerError::TaskFailed(failure) => {
            assert!(failure.traceback.contains("boom"));
            assert_eq!(failure.function_name, "cluster_tests.boom");
        }
        other => panic!("expected a task failure, got {other:?}"),
    }

    // The sentinel persists: a second get fails identically.
    assert!(runtime.get::<i64>(returns[0]).await.is_err());

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upstream_failure_propagates_without_execution() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(options(2)).await.unwrap();

    let boom = RemoteFunction::new(
        "cluster_tests",
        "boom_upstream",
        Arc::new(|_args: Vec<DynValue>| Err(anyhow::anyhow!("root cause"))),
        RemoteOptions::default(),
    )
    .unwrap();
    let executed = Arc::new(AtomicUsize::new(0));
    let consume = {
        let executed = executed.clone();
        RemoteFunction::new(
            "cluster_tests",
            "consume",
            Arc::new(move |_args: Vec<DynValue>| {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok(vec![Box::new(0i64) as DynValue])
            }),
            RemoteOptions::default(),
        )
        .unwrap()
    };

    let upstream = runtime.submit(&boom, vec![]).await.unwrap();
    let downstream = runtime
        .submit(&consume, vec![Arg::id(upstream[0])])
        .await
        .unwrap();

    let error = runtime.get::<i64>(downstream[0]).await.unwrap_err();
    match error {
        WorkerError::TaskFailed(failure) => {
            // The downstream task fails with the upstream error as cause
            // and never runs.
            assert_eq!(failure.function_name, "cluster_tests.boom_upstream");
            assert!(failure.traceback.contains("root cause"));
        }
        other => panic!("expected a task failure, got {other:?}"),
    }
    assert_eq!(executed.load(Ordering::SeqCst), 0);

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wait_returns_ready_ids_in_input_order() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(options(1)).await.unwrap();

    let mut ids = Vec::new();
    for i in 0..100i64 {
        ids.push(runtime.put(i).await.unwrap());
    }
    let (ready, remaining) = runtime.wait(&ids, 50, Some(10_000)).await.unwrap();
    assert_eq!(ready.len(), 50);
    assert_eq!(ready, ids[..50].to_vec());
    assert_eq!(remaining, ids[50..].to_vec());

    // With an id that never becomes ready, wait times out with partials.
    let some = runtime.put(7i64).await.unwrap();
    let missing = ObjectId::random();
    let (ready, remaining) = runtime.wait(&[some, missing], 2, Some(100)).await.unwrap();
    assert_eq!(ready, vec![some]);
    assert_eq!(remaining, vec![missing]);

    runtime.shutdown().await;
}

struct CounterState {
    count: i64,
}

fn counter_class(module: &str) -> ActorClass {
    ActorClass::builder(module, "Counter")
        .factory(|_args| Ok(Box::new(CounterState { count: 0 }) as Box<dyn std::any::Any + Send>))
        .method("inc", |actor, _args| {
            let state = actor
                .downcast_mut::<CounterState>()
                .ok_or_else(|| anyhow::anyhow!("wrong actor state type"))?;
            state.count += 1;
            Ok(vec![Box::new(state.count) as DynValue])
        })
        .method("fail", |_actor, _args| Err(anyhow::anyhow!("method failed")))
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn actor_methods_run_in_submission_order() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(options(2)).await.unwrap();

    let class = counter_class("cluster_tests_order");
    let handle = runtime.create_actor(&class, vec![]).await.unwrap();

    let first = runtime.call_actor(&handle, "inc", vec![]).await.unwrap();
    let second = runtime.call_actor(&handle, "inc", vec![]).await.unwrap();
    let third = runtime.call_actor(&handle, "inc", vec![]).await.unwrap();

    assert_eq!(runtime.get::<i64>(third[0]).await.unwrap(), 3);
    assert_eq!(runtime.get::<i64>(first[0]).await.unwrap(), 1);
    assert_eq!(runtime.get::<i64>(second[0]).await.unwrap(), 2);

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn actor_method_failure_does_not_block_later_methods() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(options(2)).await.unwrap();

    let class = counter_class("cluster_tests_failure");
    let handle = runtime.create_actor(&class, vec![]).await.unwrap();

    let failed = runtime.call_actor(&handle, "fail", vec![]).await.unwrap();
    let after = runtime.call_actor(&handle, "inc", vec![]).await.unwrap();

    assert!(matches!(
        runtime.get::<i64>(failed[0]).await,
        Err(WorkerError::TaskFailed(_))
    ));
    // The failure did not break the chain.
    assert_eq!(runtime.get::<i64>(after[0]).await.unwrap(), 1);

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_actor_init_poisons_every_method() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(options(2)).await.unwrap();

    let class = ActorClass::builder("cluster_tests_init", "Broken")
        .factory(|_args| Err(anyhow::anyhow!("init exploded")))
        .method("work", |_actor, _args| Ok(vec![Box::new(0i64) as DynValue]))
        .build()
        .unwrap();
    let handle = runtime.create_actor(&class, vec![]).await.unwrap();

    let returns = runtime.call_actor(&handle, "work", vec![]).await.unwrap();
    match runtime.get::<i64>(returns[0]).await.unwrap_err() {
        WorkerError::TaskFailed(failure) => {
            assert!(failure.traceback.contains("init exploded"));
        }
        other => panic!("expected the init failure, got {other:?}"),
    }

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_drivers_export_a_setup_function_once() {
    let _guard = test_lock().lock().await;
    static RUNS_ON_WORKERS: AtomicUsize = AtomicUsize::new(0);
    RUNS_ON_WORKERS.store(0, Ordering::SeqCst);

    let driver_a = Runtime::init(options(2)).await.unwrap();
    let handles = driver_a.cluster_handles().unwrap();
    let driver_b = Runtime::attach(InitOptions {
        cluster: Some(handles.clone()),
        ..Default::default()
    })
    .await
    .unwrap();

    let make_setup = || {
        SetupFunction::new("cluster_tests.shared_setup", |info| {
            if info.mode == WorkerMode::Worker {
                RUNS_ON_WORKERS.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    driver_a
        .run_function_on_all_workers(make_setup())
        .await
        .unwrap();
    driver_b
        .run_function_on_all_workers(make_setup())
        .await
        .unwrap();

    // Every worker runs the function exactly once.
    assert!(
        wait_until(
            || RUNS_ON_WORKERS.load(Ordering::SeqCst) == 2,
            Duration::from_secs(5)
        )
        .await,
        "workers ran the setup {} times, expected 2",
        RUNS_ON_WORKERS.load(Ordering::SeqCst)
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(RUNS_ON_WORKERS.load(Ordering::SeqCst), 2);

    // Exactly one of the two drivers actually published the export.
    let exports = handles
        .control_plane
        .list_range(EXPORTS_LIST, 0, -1)
        .await
        .unwrap();
    let published = exports
        .iter()
        .filter(|key| String::from_utf8_lossy(key).starts_with("FunctionsToRun:"))
        .count();
    assert_eq!(published, 1);

    driver_b.shutdown().await;
    driver_a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undecodable_object_reads_as_worker_death() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(options(1)).await.unwrap();
    let handles = runtime.cluster_handles().unwrap();

    // A producer that died mid-write leaves bytes the store client cannot
    // decode.
    let id = ObjectId::random();
    handles
        .store
        .put(id, bytes::Bytes::from_static(b"xx"), 1)
        .await
        .unwrap();

    match runtime.get::<i64>(id).await.unwrap_err() {
        WorkerError::TaskFailed(failure) => {
            assert!(failure.traceback.contains("worker died or was killed"));
        }
        other => panic!("expected a worker-death failure, got {other:?}"),
    }

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn max_calls_retires_the_worker_between_tasks() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(options(2)).await.unwrap();

    let once = RemoteFunction::new(
        "cluster_tests",
        "single_use",
        Arc::new(|_args: Vec<DynValue>| Ok(vec![Box::new(1i64) as DynValue])),
        RemoteOptions {
            max_calls: Some(1),
            ..Default::default()
        },
    )
    .unwrap();

    let first = runtime.submit(&once, vec![]).await.unwrap();
    assert_eq!(runtime.get::<i64>(first[0]).await.unwrap(), 1);
    // The first worker retired after its single call; the second worker
    // picks the next task up.
    let second = runtime.submit(&once, vec![]).await.unwrap();
    assert_eq!(runtime.get::<i64>(second[0]).await.unwrap(), 1);

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn init_lifecycle_rules() {
    let _guard = test_lock().lock().await;

    let runtime = Runtime::init(options(1)).await.unwrap();
    assert!(photon_worker::is_initialized());

    // A second init is refused...
    assert!(matches!(
        Runtime::init(options(1)).await,
        Err(WorkerError::AlreadyInitialized)
    ));
    // ...unless explicitly downgraded, which hands back the live runtime.
    let again = Runtime::init(InitOptions {
        ignore_reinit_error: true,
        ..Default::default()
    })
    .await
    .unwrap();
    let id = again.put(5i64).await.unwrap();
    assert_eq!(runtime.get::<i64>(id).await.unwrap(), 5);

    // Shutdown is idempotent and re-arms init.
    runtime.shutdown().await;
    runtime.shutdown().await;
    assert!(!photon_worker::is_initialized());

    let fresh = Runtime::init(options(1)).await.unwrap();
    let id = fresh.put(6i64).await.unwrap();
    assert_eq!(fresh.get::<i64>(id).await.unwrap(), 6);
    fresh.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn object_id_seed_makes_driver_ids_deterministic() {
    let _guard = test_lock().lock().await;

    let first_run = {
        let runtime = Runtime::init(InitOptions {
            num_cpus: Some(1),
            object_id_seed: Some(7),
            ..Default::default()
        })
        .await
        .unwrap();
        let id = runtime.put(1i64).await.unwrap();
        runtime.shutdown().await;
        id
    };
    let second_run = {
        let runtime = Runtime::init(InitOptions {
            num_cpus: Some(1),
            object_id_seed: Some(7),
            ..Default::default()
        })
        .await
        .unwrap();
        let id = runtime.put(1i64).await.unwrap();
        runtime.shutdown().await;
        id
    };
    assert_eq!(first_run, second_run);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn webui_url_is_recorded_at_bootstrap() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(InitOptions {
        num_cpus: Some(1),
        include_webui: true,
        ..Default::default()
    })
    .await
    .unwrap();
    assert!(runtime.get_webui_url().await.unwrap().starts_with("http://"));
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn attach_rejects_bootstrap_only_options() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(options(1)).await.unwrap();
    let handles = runtime.cluster_handles().unwrap();

    let error = Runtime::attach(InitOptions {
        cluster: Some(handles),
        num_gpus: Some(1),
        ..Default::default()
    })
    .await
    .unwrap_err();
    match error {
        WorkerError::InvalidArgument(message) => assert!(message.contains("num_gpus")),
        other => panic!("expected an invalid-argument error, got {other:?}"),
    }

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gpu_tasks_see_their_allotted_devices() {
    let _guard = test_lock().lock().await;
    // Workers of earlier clusters in this process rewrote the variable.
    std::env::remove_var("CUDA_VISIBLE_DEVICES");
    let runtime = Runtime::init(InitOptions {
        num_cpus: Some(1),
        num_gpus: Some(2),
        ..Default::default()
    })
    .await
    .unwrap();

    let read_gpus = RemoteFunction::new(
        "cluster_tests",
        "read_gpus",
        Arc::new(|_args: Vec<DynValue>| {
            let visible = std::env::var("CUDA_VISIBLE_DEVICES").unwrap_or_default();
            Ok(vec![Box::new(visible) as DynValue])
        }),
        RemoteOptions {
            num_gpus: Some(1.0),
            ..Default::default()
        },
    )
    .unwrap();

    let returns = runtime.submit(&read_gpus, vec![]).await.unwrap();
    let visible = runtime.get::<String>(returns[0]).await.unwrap();
    assert!(visible == "0" || visible == "1", "unexpected GPU set {visible:?}");

    // The driver itself holds no GPU assignment.
    assert!(runtime.get_gpu_ids().await.unwrap().is_empty());

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submit_requires_whole_resource_quantities() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(options(1)).await.unwrap();

    let noop = RemoteFunction::new(
        "cluster_tests",
        "noop_resources",
        Arc::new(|_args: Vec<DynValue>| Ok(vec![Box::new(0i64) as DynValue])),
        RemoteOptions::default(),
    )
    .unwrap();

    let error = runtime
        .worker()
        .submit_task(
            noop.descriptor(runtime.worker().own_driver_id()),
            vec![],
            SubmitOptions {
                num_returns: 1,
                resources: HashMap::from([("accelerator".to_owned(), 1.5)]),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(error, WorkerError::InvalidArgument(_)));

    runtime.shutdown().await;
}
