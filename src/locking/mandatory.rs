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

//! Native-lock fast path.
//!
//! Where the capability probe trusts the filesystem, a lock is a single
//! open-with-lock on the target file and release is a close. Busy retries
//! reuse the same randomized backoff as the portable protocol.

use crate::error::{PortlockError, Result};
use crate::locking::backoff::PollingBackoff;
use crate::locking::timeout::WaitBudget;
use crate::locking::token::LockToken;
use crate::locking::values::LockKind;
use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::Path;
use std::thread;

/// Outcome of a native acquisition attempt.
#[derive(Debug)]
pub(crate) enum MandatoryAcquire {
    Acquired(Box<LockToken>),
    /// The filesystem rejected native locking at runtime despite the probe;
    /// the caller falls back to the portable protocol.
    Unsupported,
}

pub(crate) fn acquire(
    target: &Path,
    kind: LockKind,
    budget: &WaitBudget,
) -> Result<MandatoryAcquire> {
    let file = open_lock_handle(target, kind)?;
    let backoff = PollingBackoff::with_start(budget.started_at());

    loop {
        match try_lock(&file, kind) {
            Ok(()) => {
                return Ok(MandatoryAcquire::Acquired(Box::new(LockToken::mandatory(
                    target.to_path_buf(),
                    kind,
                    file,
                ))));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if budget.is_expired() {
                    return Err(PortlockError::LockTimeout {
                        path: target.display().to_string(),
                        waited_secs: budget.elapsed().as_secs_f64(),
                        details: err.to_string(),
                    });
                }
                thread::sleep(budget.clamp_sleep(backoff.next_delay()));
            }
            Err(err) if err.kind() == io::ErrorKind::Unsupported => {
                return Ok(MandatoryAcquire::Unsupported);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(PortlockError::LockAcquire {
                    path: target.display().to_string(),
                    details: err.to_string(),
                });
            }
        }
    }
}

/// Non-destructive busy probe for `IsLocked`: a failed exclusive try-lock
/// means somebody holds the file. The probe opens read-only so it neither
/// creates the target nor needs write access to it.
pub(crate) fn probe_busy(target: &Path) -> Result<bool> {
    let file = match OpenOptions::new().read(true).open(target) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(PortlockError::from_io(target, err)),
    };
    match try_lock(&file, LockKind::Exclusive) {
        Ok(()) => {
            if let Err(err) = file.unlock() {
                log::debug!("Failed to unlock probe handle for {}: {err}", target.display());
            }
            Ok(false)
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::Unsupported => Ok(false),
        Err(err) => Err(PortlockError::from_io(target, err)),
    }
}

fn open_lock_handle(target: &Path, kind: LockKind) -> Result<File> {
    let attempt = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(target);

    match attempt {
        Ok(file) => Ok(file),
        // A reader on read-only media can still take a shared lock.
        Err(err)
            if err.kind() == io::ErrorKind::PermissionDenied && kind == LockKind::Shared =>
        {
            OpenOptions::new()
                .read(true)
                .open(target)
                .map_err(|err| PortlockError::from_io(target, err))
        }
        Err(err) => Err(PortlockError::from_io(target, err)),
    }
}

fn try_lock(file: &File, kind: LockKind) -> io::Result<()> {
    let result = match kind {
        LockKind::Shared => file.try_lock_shared(),
        LockKind::Exclusive => file.try_lock(),
    };

    match result {
        Ok(()) => Ok(()),
        Err(TryLockError::WouldBlock) => Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "lock would block",
        )),
        Err(TryLockError::Error(err)) => Err(err),
    }
}
