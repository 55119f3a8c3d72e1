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

//! Driver-side error propagation.
//!
//! Workers push error events through the control plane; on the driver a
//! listener filters them by driver id and queues task errors, and a
//! printer drains the queue with a grace-period delay so that an error a
//! `get` is about to raise synchronously is not also printed in the
//! background.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use photon_common::constants::{
    ERROR_CHANNEL, ERROR_KEYS_LIST, ERROR_KEY_PREFIX, TASK_PUSH_ERROR,
};
use photon_common::ids::{DriverId, WorkerId, ID_SIZE};
use photon_rpc_client::ControlPlaneRef;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Addressed driver; NIL addresses all drivers.
    pub driver_id: DriverId,
    pub error_type: String,
    pub message: String,
    pub timestamp_ms: u64,
    pub data: HashMap<String, String>,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Publish an error to the addressed driver: an `Error:` key for late
/// joiners, the `ErrorKeys` index, and a pubsub event for live listeners.
pub async fn push_error_to_driver(
    control_plane: &ControlPlaneRef,
    driver_id: DriverId,
    error_type: &str,
    message: String,
    data: HashMap<String, String>,
) {
    let event = ErrorEvent {
        driver_id,
        error_type: error_type.to_owned(),
        message,
        timestamp_ms: now_ms(),
        data,
    };
    let key = error_key(driver_id, WorkerId::random().into());
    let fields = vec![
        ("type".to_owned(), event.error_type.clone().into_bytes().into()),
        ("message".to_owned(), event.message.clone().into_bytes().into()),
        (
            "timestamp_ms".to_owned(),
            event.timestamp_ms.to_string().into_bytes().into(),
        ),
    ];
    let payload = match bincode::serialize(&event) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode error event");
            return;
        }
    };
    // Deliberately not transactional; a publisher crash in between leaves a
    // partially recorded error.
    let result: photon_rpc_client::Result<()> = async {
        control_plane.hash_set(&key, fields).await?;
        control_plane
            .list_push(ERROR_KEYS_LIST, key.clone().into_bytes().into())
            .await?;
        control_plane.publish(ERROR_CHANNEL, payload.into()).await?;
        Ok(())
    }
    .await;
    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to push error to driver");
    }
}

fn error_key(driver_id: DriverId, error_id: DriverId) -> String {
    format!("{}{}:{}", ERROR_KEY_PREFIX, driver_id.hex(), error_id.hex())
}

/// Whether an error key addresses the given driver. A NIL driver id in the
/// key addresses all drivers.
pub fn error_applies_to_driver(key: &str, driver_id: DriverId) -> bool {
    let expected_len = ERROR_KEY_PREFIX.len() + 2 * ID_SIZE + 1 + 2 * ID_SIZE;
    if key.len() != expected_len || !key.starts_with(ERROR_KEY_PREFIX) {
        return false;
    }
    let key_driver = &key[ERROR_KEY_PREFIX.len()..ERROR_KEY_PREFIX.len() + 2 * ID_SIZE];
    match DriverId::from_hex(key_driver) {
        Ok(key_driver) => key_driver == driver_id || key_driver.is_nil(),
        Err(_) => false,
    }
}

/// Whether the background printer must swallow an event because an equal
/// error was (or is about to be) raised synchronously by `get`.
pub fn should_suppress(event_ms: u64, last_raise_ms: u64, grace_period_ms: u64) -> bool {
    event_ms < last_raise_ms.saturating_add(grace_period_ms)
}

pub struct ErrorPipeline {
    listener: JoinHandle<()>,
    printer: JoinHandle<()>,
}

impl ErrorPipeline {
    /// Spawn the listener/printer pair for a driver.
    pub fn spawn(
        control_plane: ControlPlaneRef,
        driver_id: DriverId,
        last_task_error_raise_ms: Arc<AtomicU64>,
        grace_period_ms: u64,
        queue_size: usize,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_size);
        let listener = tokio::spawn(listen_error_messages(
            control_plane,
            driver_id,
            queue_tx,
        ));
        let printer = tokio::spawn(print_error_messages(
            queue_rx,
            last_task_error_raise_ms,
            grace_period_ms,
        ));
        Self { listener, printer }
    }

    pub fn shutdown(&self) {
        self.listener.abort();
        self.printer.abort();
    }
}

async fn listen_error_messages(
    control_plane: ControlPlaneRef,
    driver_id: DriverId,
    queue: mpsc::Sender<(String, u64)>,
) {
    let mut subscription = match control_plane.subscribe(ERROR_CHANNEL).await {
        Ok(subscription) => subscription,
        Err(_) => return,
    };

    // Errors published before this driver connected.
    if let Ok(keys) = control_plane.list_range(ERROR_KEYS_LIST, 0, -1).await {
        for key in keys {
            let key = String::from_utf8_lossy(&key).into_owned();
            if !error_applies_to_driver(&key, driver_id) {
                continue;
            }
            if let Ok(Some(message)) = control_plane.hash_get(&key, "message").await {
                tracing::error!("{}", String::from_utf8_lossy(&message));
            }
        }
    }

    loop {
        match subscription.recv().await {
            Ok(payload) => {
                let event: ErrorEvent = match bincode::deserialize(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable error event");
                        continue;
                    }
                };
                if event.driver_id != driver_id && !event.driver_id.is_nil() {
                    continue;
                }
                if event.error_type == TASK_PUSH_ERROR {
                    // Queued for the printer, which may still suppress it.
                    if queue.send((event.message, event.timestamp_ms)).await.is_err() {
                        return;
                    }
                } else {
                    tracing::error!("{}", event.message);
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "error listener lagged behind");
            }
            // The control plane went away; exit silently.
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn print_error_messages(
    mut queue: mpsc::Receiver<(String, u64)>,
    last_task_error_raise_ms: Arc<AtomicU64>,
    grace_period_ms: u64,
) {
    while let Some((message, event_ms)) = queue.recv().await {
        // Hold the message for the grace period before deciding.
        let printable_at = event_ms.saturating_add(grace_period_ms);
        let now = now_ms();
        if printable_at > now {
            tokio::time::sleep(Duration::from_millis(printable_at - now)).await;
        }
        let last_raise = last_task_error_raise_ms.load(Ordering::Relaxed);
        if should_suppress(event_ms, last_raise, grace_period_ms) {
            tracing::debug!("suppressing error from worker: {}", message);
        } else {
            tracing::error!("possible unhandled error from worker: {}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_key_dispatch() {
        let driver = DriverId::random();
        let other = DriverId::random();
        let key = error_key(driver, DriverId::random());
        assert!(error_applies_to_driver(&key, driver));
        assert!(!error_applies_to_driver(&key, other));

        // A NIL driver id addresses everyone.
        let broadcast_key = error_key(DriverId::nil(), DriverId::random());
        assert!(error_applies_to_driver(&broadcast_key, driver));
        assert!(error_applies_to_driver(&broadcast_key, other));

        assert!(!error_applies_to_driver("Error:short", driver));
        assert!(!error_applies_to_driver("Other:key", driver));
    }

    #[test]
    fn suppression_window() {
        // Raised synchronously just before the event: suppressed.
        assert!(should_suppress(10_000, 9_000, 5_000));
        // Raise long before the event: printed.
        assert!(!should_suppress(10_000, 1_000, 5_000));
        // No raise ever: printed.
        assert!(!should_suppress(10_000, 0, 5_000));
    }
}
