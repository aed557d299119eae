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

//! Legacy single-holder device locks (Unix).
//!
//! One `LCK..<device>` file containing `"<pid> <hostID>\n"` guards a device
//! node. The claim goes through an exclusive-create of a private temp file
//! followed by a hard link onto the lock name, which stays atomic on
//! filesystems where exclusive create itself is racy; where linking is not
//! possible the claim degrades to a direct exclusive create. Staleness is
//! plain pid liveness — there is no Lamport ordering and no shared access.

use crate::error::{PortlockError, Result};
use crate::locking::stale::ExecutionVerifier;
use crate::locking::values;
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Holder of a device lock; removing the lock file releases it.
#[derive(Debug)]
pub struct DeviceLockGuard {
    lock_path: PathBuf,
    released: bool,
}

impl DeviceLockGuard {
    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PortlockError::LockRelease {
                path: self.lock_path.display().to_string(),
                details: err.to_string(),
            }),
        }
    }
}

impl Drop for DeviceLockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!("Failed to release device lock: {err}");
        }
    }
}

/// Claims the single-holder lock for `device` inside `lock_area`.
/// `Ok(None)` means a live process already holds it.
pub fn acquire_device_lock(
    lock_area: &Path,
    device: &str,
    verifier: &dyn ExecutionVerifier,
) -> Result<Option<DeviceLockGuard>> {
    let device_name = device.rsplit('/').next().unwrap_or(device);
    if device_name.is_empty() {
        return Err(PortlockError::ValidationError(format!(
            "'{device}' does not name a device"
        )));
    }

    let lock_path = lock_area.join(format!("LCK..{device_name}"));
    let temp_path = lock_area.join(format!("LTMP..{}", std::process::id()));

    let claim = write_claim_file(&temp_path)?;
    let result = link_claim(&temp_path, &lock_path, &claim, verifier);

    if let Err(err) = fs::remove_file(&temp_path)
        && err.kind() != io::ErrorKind::NotFound
    {
        debug!("Failed to remove {}: {err}", temp_path.display());
    }

    result
}

fn write_claim_file(temp_path: &Path) -> Result<Vec<u8>> {
    let contents = format!("{} {}\n", std::process::id(), values::machine_id()).into_bytes();

    // A leftover temp file from a previous run of this pid is ours to replace.
    let _ = fs::remove_file(temp_path);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp_path)
        .map_err(|err| PortlockError::from_io(temp_path, err))?;
    file.write_all(&contents)
        .and_then(|()| file.sync_all())
        .map_err(|err| PortlockError::from_io(temp_path, err))?;
    Ok(contents)
}

fn link_claim(
    temp_path: &Path,
    lock_path: &Path,
    claim: &[u8],
    verifier: &dyn ExecutionVerifier,
) -> Result<Option<DeviceLockGuard>> {
    // One stale-holder cleanup, then one more try; anything still in the
    // way after that is a live competitor.
    for _ in 0..2 {
        match fs::hard_link(temp_path, lock_path) {
            Ok(()) => {
                return Ok(Some(DeviceLockGuard {
                    lock_path: lock_path.to_path_buf(),
                    released: false,
                }));
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if !reap_if_stale(lock_path, verifier)? {
                    return Ok(None);
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied
                ) =>
            {
                // No hard links here; fall back to a direct exclusive create.
                return create_claim_directly(lock_path, claim, verifier);
            }
            Err(err) => return Err(PortlockError::from_io(lock_path, err)),
        }
    }
    Ok(None)
}

fn create_claim_directly(
    lock_path: &Path,
    claim: &[u8],
    verifier: &dyn ExecutionVerifier,
) -> Result<Option<DeviceLockGuard>> {
    for _ in 0..2 {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(mut file) => {
                file.write_all(claim)
                    .and_then(|()| file.sync_all())
                    .map_err(|err| PortlockError::from_io(lock_path, err))?;
                return Ok(Some(DeviceLockGuard {
                    lock_path: lock_path.to_path_buf(),
                    released: false,
                }));
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if !reap_if_stale(lock_path, verifier)? {
                    return Ok(None);
                }
            }
            Err(err) => return Err(PortlockError::from_io(lock_path, err)),
        }
    }
    Ok(None)
}

/// Removes the lock file if its recorded holder is provably dead. Returns
/// whether the caller may retry the claim.
fn reap_if_stale(lock_path: &Path, verifier: &dyn ExecutionVerifier) -> Result<bool> {
    let contents = match fs::read_to_string(lock_path) {
        Ok(contents) => contents,
        // Gone between link failure and read: the holder released; retry.
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(PortlockError::from_io(lock_path, err)),
    };

    let Some(pid) = contents.split_whitespace().next().and_then(|t| t.parse::<u32>().ok())
    else {
        // Unreadable claim: fail open, treat the holder as alive.
        return Ok(false);
    };

    if verifier.descriptor(pid).is_some() {
        return Ok(false);
    }

    warn!(
        "Removing stale device lock {} held by dead pid {pid}",
        lock_path.display()
    );
    match fs::remove_file(lock_path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(err) => Err(PortlockError::from_io(lock_path, err)),
    }
}
