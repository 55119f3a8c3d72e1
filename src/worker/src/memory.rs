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

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::{System, SystemExt};

use crate::error::{WorkerError, WorkerResult};

const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Refuses task execution when the node is close to running out of memory.
/// Checks are rate-limited; in between, the last verdict is reused.
pub struct MemoryMonitor {
    threshold: f64,
    inner: Mutex<MonitorInner>,
}

struct MonitorInner {
    system: System,
    last_check: Option<Instant>,
    last_usage: f64,
}

impl MemoryMonitor {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            inner: Mutex::new(MonitorInner {
                system: System::new(),
                last_check: None,
                last_usage: 0.0,
            }),
        }
    }

    pub fn raise_if_low_memory(&self) -> WorkerResult<()> {
        let usage = {
            let mut inner = self.inner.lock();
            let stale = inner
                .last_check
                .map_or(true, |at| at.elapsed() >= CHECK_INTERVAL);
            if stale {
                inner.system.refresh_memory();
                let total = inner.system.total_memory();
                inner.last_usage = if total == 0 {
                    0.0
                } else {
                    inner.system.used_memory() as f64 / total as f64
                };
                inner.last_check = Some(Instant::now());
            }
            inner.last_usage
        };
        if usage > self.threshold {
            return Err(WorkerError::Internal(anyhow::anyhow!(
                "memory usage {:.0}% exceeds the {:.0}% threshold; refusing to execute \
                 the task to avoid taking down the node",
                usage * 100.0,
                self.threshold * 100.0
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_full_threshold_never_trips() {
        let monitor = MemoryMonitor::new(1.0);
        monitor.raise_if_low_memory().unwrap();
    }

    #[test]
    fn a_zero_threshold_always_trips() {
        let monitor = MemoryMonitor::new(0.0);
        assert!(monitor.raise_if_low_memory().is_err());
    }
}
