// Copyright 2025 dentsusoken
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

//! Stale lock detection.
//!
//! A member record is only ever reaped when its owner is *provably* dead:
//! the recorded pid is gone, or it was recycled by a process with a
//! different creation time. Anything ambiguous fails open — destroying a
//! live peer's lock is far worse than waiting on a dead one.

use crate::platform::process;

/// Seconds of slack allowed between recorded and observed creation times.
/// Process-table readings round differently across kernels.
const CREATION_TIME_SLACK_SECS: u64 = 1;

/// Liveness oracle for execution descriptors. The default implementation
/// queries the live process table; tests inject fixed answers.
pub trait ExecutionVerifier: Send + Sync {
    /// Descriptor `"pid-creationTime"` for a currently-alive `pid`, `None`
    /// when no such process exists.
    fn descriptor(&self, pid: u32) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct DefaultExecutionVerifier;

impl ExecutionVerifier for DefaultExecutionVerifier {
    fn descriptor(&self, pid: u32) -> Option<String> {
        process::execution_descriptor(pid)
    }
}

/// Decides whether a recorded execution ID still names a live process.
///
/// - unparseable ID: `true` (fail open, never destroy an ambiguous lock)
/// - process not found: `false`
/// - creation-time mismatch when both sides have one: `false` (pid reuse)
/// - otherwise: `true`
pub fn is_valid_execution_id(verifier: &dyn ExecutionVerifier, id: &str) -> bool {
    let Some((pid, recorded_creation)) = process::split_execution_id(id) else {
        return true;
    };

    let Some(live) = verifier.descriptor(pid) else {
        return false;
    };

    let Some((_, live_creation)) = process::split_execution_id(&live) else {
        return true;
    };

    if recorded_creation == process::UNKNOWN_CREATION_TIME
        || live_creation == process::UNKNOWN_CREATION_TIME
    {
        // One side could not observe a creation time; liveness is all we have.
        return true;
    }

    live_creation.abs_diff(recorded_creation) <= CREATION_TIME_SLACK_SECS
}
