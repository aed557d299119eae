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

//! Execution descriptors: `"pid-creationTime"` strings identifying one run
//! of one process. A PID alone is not enough to decide whether a recorded
//! lock owner is still alive, because PIDs are recycled; the creation time
//! disambiguates reuse after a crash or reboot.

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Creation time reported when the platform cannot observe one. Comparisons
/// treat it as "unknown" and fall back to liveness alone.
pub const UNKNOWN_CREATION_TIME: u64 = 0;

/// Descriptor for `pid` if the process is currently alive, `None` otherwise.
pub fn execution_descriptor(pid: u32) -> Option<String> {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        ProcessRefreshKind::new(),
    );
    system
        .process(target)
        .map(|process| format!("{pid}-{}", process.start_time()))
}

/// Descriptor for the calling process. Never fails: if the process table
/// cannot be read the creation time degrades to unknown.
pub fn current_execution_id() -> String {
    let pid = std::process::id();
    execution_descriptor(pid).unwrap_or_else(|| format!("{pid}-{UNKNOWN_CREATION_TIME}"))
}

/// Splits a descriptor into its pid and creation-time halves. Returns `None`
/// for anything that does not parse; callers decide whether to fail open.
pub fn split_execution_id(id: &str) -> Option<(u32, u64)> {
    let (pid, creation_time) = id.split_once('-')?;
    Some((pid.parse().ok()?, creation_time.parse().ok()?))
}
