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

use crate::platform::process;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Indicates whether a lock allows concurrent readers or enforces
/// exclusivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Shared,
    Exclusive,
}

impl LockKind {
    /// Single-character token carried in the member record.
    pub fn record_token(self) -> &'static str {
        match self {
            LockKind::Shared => "S",
            LockKind::Exclusive => "X",
        }
    }

    pub fn from_record_token(token: &str) -> Option<Self> {
        match token {
            "S" => Some(LockKind::Shared),
            "X" => Some(LockKind::Exclusive),
            _ => None,
        }
    }

    pub fn is_exclusive(self) -> bool {
        matches!(self, LockKind::Exclusive)
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LockKind::Shared => "shared",
            LockKind::Exclusive => "exclusive",
        };
        f.write_str(label)
    }
}

/// Content of one member record: the identity of one lock holder.
///
/// Everything here is immutable once the member file is renamed into place;
/// peers re-derive priority from these values on every possession check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockValues {
    pub machine_id: String,
    pub execution_id: String,
    pub lamport: u64,
    pub kind: LockKind,
    pub creation_time: u64,
    /// Checksum of the lock directory path at encode time; a mismatch on
    /// decode means the whole directory was moved and the record is dead.
    pub location_checksum: Option<String>,
}

impl LockValues {
    /// Values describing the calling process taking a lock of `kind` inside
    /// `lock_dir`. The Lamport ticket starts at zero and is assigned later
    /// by the number scan.
    pub fn for_current_process(kind: LockKind, lock_dir: &Path) -> Self {
        let execution_id = process::current_execution_id();
        let creation_time = process::split_execution_id(&execution_id)
            .map(|(_, creation_time)| creation_time)
            .unwrap_or(process::UNKNOWN_CREATION_TIME);
        Self {
            machine_id: machine_id(),
            execution_id,
            lamport: 0,
            kind,
            creation_time,
            location_checksum: Some(location_checksum(lock_dir)),
        }
    }
}

/// Identity of this host as written into member records. Cross-host
/// staleness cannot be verified, so peers only ever reap records whose
/// machine ID matches their own.
pub fn machine_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Checksum of the normalized lock-directory path, carried as the `lc`
/// record property. Detects member files that were relocated wholesale
/// along with their directory.
pub fn location_checksum(lock_dir: &Path) -> String {
    let digest = Sha256::digest(lock_dir.to_string_lossy().as_bytes());
    hex::encode(&digest[..8])
}
