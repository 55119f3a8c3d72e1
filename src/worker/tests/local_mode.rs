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

//! LOCAL mode: in-process serial execution with no scheduler or store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use photon_worker::{
    ActorClass, Arg, DynValue, InitOptions, RemoteFunction, RemoteOptions, Runtime, SetupFunction,
    WorkerError,
};

fn test_lock() -> &'static tokio::sync::Mutex<()> {
    static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
}

fn local_options() -> InitOptions {
    InitOptions {
        local_mode: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn put_get_roundtrip_without_a_cluster() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(local_options()).await.unwrap();

    let id = runtime.put(42i64).await.unwrap();
    assert_eq!(runtime.get::<i64>(id).await.unwrap(), 42);

    runtime.shutdown().await;
}

#[tokio::test]
async fn submit_executes_synchronously() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(local_options()).await.unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let double = {
        let ran = ran.clone();
        RemoteFunction::new(
            "local_tests",
            "double",
            Arc::new(move |mut args: Vec<DynValue>| {
                ran.fetch_add(1, Ordering::SeqCst);
                let value = *args
                    .remove(0)
                    .downcast::<i64>()
                    .map_err(|_| anyhow::anyhow!("expected an i64 argument"))?;
                Ok(vec![Box::new(value * 2) as DynValue])
            }),
            RemoteOptions::default(),
        )
        .unwrap()
    };

    let returns = runtime.submit(&double, vec![Arg::value(21i64)]).await.unwrap();
    // The body already ran by the time submit returned.
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.get::<i64>(returns[0]).await.unwrap(), 42);

    runtime.shutdown().await;
}

#[tokio::test]
async fn failures_become_sentinels_like_on_a_cluster() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(local_options()).await.unwrap();

    let boom = RemoteFunction::new(
        "local_tests",
        "boom",
        Arc::new(|_args: Vec<DynValue>| Err(anyhow::anyhow!("local boom"))),
        RemoteOptions::default(),
    )
    .unwrap();

    let returns = runtime.submit(&boom, vec![]).await.unwrap();
    match runtime.get::<i64>(returns[0]).await.unwrap_err() {
        WorkerError::TaskFailed(failure) => assert!(failure.traceback.contains("local boom")),
        other => panic!("expected a task failure, got {other:?}"),
    }

    runtime.shutdown().await;
}

#[tokio::test]
async fn wait_reports_everything_ready() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(local_options()).await.unwrap();

    let ids = vec![
        runtime.put(1i64).await.unwrap(),
        runtime.put(2i64).await.unwrap(),
        runtime.put(3i64).await.unwrap(),
    ];
    let (ready, remaining) = runtime.wait(&ids, 2, None).await.unwrap();
    assert_eq!(ready, ids[..2].to_vec());
    assert_eq!(remaining, ids[2..].to_vec());

    runtime.shutdown().await;
}

#[tokio::test]
async fn actors_run_in_process() {
    let _guard = test_lock().lock().await;
    let runtime = Runtime::init(local_options()).await.unwrap();

    struct State {
        total: i64,
    }
    let class = ActorClass::builder("local_tests", "Adder")
        .factory(|_args| Ok(Box::new(State { total: 0 }) as Box<dyn std::any::Any + Send>))
        .method("add", |actor, mut args| {
            let state = actor
                .downcast_mut::<State>()
                .ok_or_else(|| anyhow::anyhow!("wrong actor state type"))?;
            let amount = *args
                .remove(0)
                .downcast::<i64>()
                .map_err(|_| anyhow::anyhow!("expected an i64 amount"))?;
            state.total += amount;
            Ok(vec![Box::new(state.total) as DynValue])
        })
        .build()
        .unwrap();

    let handle = runtime.create_actor(&class, vec![]).await.unwrap();
    let first = runtime
        .call_actor(&handle, "add", vec![Arg::value(40i64)])
        .await
        .unwrap();
    let second = runtime
        .call_actor(&handle, "add", vec![Arg::value(2i64)])
        .await
        .unwrap();

    assert_eq!(runtime.get::<i64>(first[0]).await.unwrap(), 40);
    assert_eq!(runtime.get::<i64>(second[0]).await.unwrap(), 42);

    runtime.shutdown().await;
}

#[tokio::test]
async fn setup_functions_registered_before_init_run_on_connect() {
    let _guard = test_lock().lock().await;

    static RUNS: AtomicUsize = AtomicUsize::new(0);
    RUNS.store(0, Ordering::SeqCst);
    photon_worker::register_setup_function(SetupFunction::new(
        "local_tests.pre_init_setup",
        |_info| {
            RUNS.fetch_add(1, Ordering::SeqCst);
        },
    ));
    assert_eq!(RUNS.load(Ordering::SeqCst), 0);

    let runtime = Runtime::init(local_options()).await.unwrap();
    assert_eq!(RUNS.load(Ordering::SeqCst), 1);

    runtime.shutdown().await;
}
