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

//! Span-style profiler. Events are buffered in the worker and flushed to
//! the control plane profile table periodically; it has no correctness
//! role.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use photon_common::constants::PROFILE_TABLE_KEY_PREFIX;
use photon_common::ids::WorkerId;
use photon_rpc_client::ControlPlaneRef;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProfileEvent {
    pub event_type: String,
    /// Seconds since the unix epoch.
    pub start_time: f64,
    pub end_time: f64,
    pub extra_data: String,
}

pub struct ProfilerCore {
    component_type: String,
    events: Mutex<Vec<ProfileEvent>>,
}

/// Disabled profiling is a first-class mode: a `Noop` profiler records
/// nothing and spawns no flush task.
#[derive(Clone)]
pub enum Profiler {
    Enabled(Arc<ProfilerCore>),
    Noop,
}

impl Profiler {
    pub fn new(component_type: &str) -> Self {
        Self::Enabled(Arc::new(ProfilerCore {
            component_type: component_type.to_owned(),
            events: Mutex::new(Vec::new()),
        }))
    }

    pub fn noop() -> Self {
        Self::Noop
    }

    /// Record a span covering the guard's lifetime.
    #[must_use = "the span is recorded when the guard drops"]
    pub fn profile(&self, event_type: &str) -> ProfileSpan {
        self.profile_with(event_type, String::new())
    }

    pub fn profile_with(&self, event_type: &str, extra_data: String) -> ProfileSpan {
        ProfileSpan {
            core: match self {
                Profiler::Enabled(core) => Some(core.clone()),
                Profiler::Noop => None,
            },
            event_type: event_type.to_owned(),
            extra_data,
            start_time: now_secs(),
        }
    }

    pub fn take_events(&self) -> Vec<ProfileEvent> {
        match self {
            Profiler::Enabled(core) => std::mem::take(&mut core.events.lock()),
            Profiler::Noop => Vec::new(),
        }
    }

    pub fn component_type(&self) -> &str {
        match self {
            Profiler::Enabled(core) => &core.component_type,
            Profiler::Noop => "noop",
        }
    }
}

pub struct ProfileSpan {
    core: Option<Arc<ProfilerCore>>,
    event_type: String,
    extra_data: String,
    start_time: f64,
}

impl Drop for ProfileSpan {
    fn drop(&mut self) {
        if let Some(core) = &self.core {
            core.events.lock().push(ProfileEvent {
                event_type: std::mem::take(&mut self.event_type),
                start_time: self.start_time,
                end_time: now_secs(),
                extra_data: std::mem::take(&mut self.extra_data),
            });
        }
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Periodically push buffered events to the control plane. Returns `None`
/// for a noop profiler. The task ends when the control plane disconnects.
pub fn spawn_flush_loop(
    profiler: Profiler,
    control_plane: ControlPlaneRef,
    worker_id: WorkerId,
    flush_interval_ms: u64,
) -> Option<JoinHandle<()>> {
    if matches!(profiler, Profiler::Noop) {
        return None;
    }
    let key = format!("{}{}", PROFILE_TABLE_KEY_PREFIX, worker_id.hex());
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(flush_interval_ms));
        loop {
            ticker.tick().await;
            let events = profiler.take_events();
            if events.is_empty() {
                continue;
            }
            let payload = match bincode::serialize(&events) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode profile events");
                    continue;
                }
            };
            if control_plane
                .list_push(&key, payload.into())
                .await
                .is_err()
            {
                return;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn spans_are_recorded_on_drop() {
        let profiler = Profiler::new("worker");
        {
            let _span = profiler.profile("task");
        }
        let events = profiler.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "task");
        assert!(events[0].end_time >= events[0].start_time);
        // The buffer is drained.
        assert!(profiler.take_events().is_empty());
    }

    #[test]
    fn noop_profiler_records_nothing() {
        let profiler = Profiler::noop();
        {
            let _span = profiler.profile("task");
        }
        assert!(profiler.take_events().is_empty());
    }
}
