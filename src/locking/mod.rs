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

pub mod backoff;
pub mod bakery;
pub mod controller;
#[cfg(unix)]
pub mod device;
pub mod directory;
pub mod mandatory;
pub mod record;
pub mod scanner;
pub mod stale;
pub mod timeout;
pub mod token;
pub mod values;

pub use controller::LockManager;
#[cfg(unix)]
pub use device::{DeviceLockGuard, acquire_device_lock};
pub use scanner::{ScanVisit, ScanVisitor};
pub use stale::{DefaultExecutionVerifier, ExecutionVerifier};
pub use timeout::{INFINITE_WAIT, TRYLOCK_WAIT, WaitBudget, WaitLimit, parse_wait_override};
pub use token::{LockBackend, LockToken};
pub use values::{LockKind, LockValues};
