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

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sentinel value stored in place of every output of a failed task.
///
/// Dependent tasks and `get` discover upstream failure by observing this
/// value in the object store; there is no out-of-band failure channel for
/// task results.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Qualified name of the failing function, or `<unknown>`.
    pub function_name: String,
    /// Rendered error chain of the failure.
    pub traceback: String,
    pub proctitle: String,
    pub pid: u32,
    pub host: String,
}

impl TaskFailure {
    pub fn new(function_name: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            traceback: traceback.into(),
            proctitle: String::new(),
            pid: std::process::id(),
            host: gethostname(),
        }
    }

    pub fn with_proctitle(mut self, proctitle: impl Into<String>) -> Self {
        self.proctitle = proctitle.into();
        self
    }

    /// The sentinel synthesised when the store returns bytes that cannot be
    /// decoded at all, which typically means the producing worker died.
    pub fn worker_died() -> Self {
        Self::new(
            "<unknown>",
            "Invalid return value: likely worker died or was killed while \
             executing the task; check previous logs or dmesg for errors.",
        )
    }
}

fn gethostname() -> String {
    ::gethostname::gethostname().to_string_lossy().into_owned()
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (pid={}, host={}): task '{}' failed:\n{}",
            self.proctitle, self.pid, self.host, self.function_name, self.traceback
        )
    }
}

impl std::error::Error for TaskFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_function_and_traceback() {
        let failure = TaskFailure::new("tests.boom", "ValueError: boom")
            .with_proctitle("photon_worker");
        let rendered = failure.to_string();
        assert!(rendered.contains("tests.boom"));
        assert!(rendered.contains("ValueError: boom"));
        assert!(rendered.contains("photon_worker"));
    }

    #[test]
    fn worker_died_mentions_the_cause() {
        assert!(TaskFailure::worker_died()
            .traceback
            .contains("worker died or was killed"));
    }
}
