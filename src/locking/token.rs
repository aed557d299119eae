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

use crate::error::{PortlockError, Result};
use crate::locking::values::LockKind;
use crate::platform::file_ops;
use log::{debug, warn};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Which mechanism satisfied the lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackend {
    /// Native OS lock; the open handle holds it.
    Mandatory,
    /// Portable protocol; a member file in the lock directory holds it.
    Portable,
    /// Read access granted without artifacts because the filesystem cannot
    /// host the protocol but reading is safe.
    ImplicitRead,
}

#[derive(Debug)]
enum TokenInner {
    Mandatory { file: File },
    Portable { member_path: PathBuf },
    ImplicitRead,
}

/// Handle for an acquired lock. Consumed by [`LockToken::release`];
/// dropping an unreleased token releases best-effort.
#[derive(Debug)]
pub struct LockToken {
    path: PathBuf,
    kind: LockKind,
    acquired_at: Instant,
    inner: Option<TokenInner>,
}

impl LockToken {
    pub(crate) fn mandatory(path: PathBuf, kind: LockKind, file: File) -> Self {
        Self {
            path,
            kind,
            acquired_at: Instant::now(),
            inner: Some(TokenInner::Mandatory { file }),
        }
    }

    pub(crate) fn portable(path: PathBuf, kind: LockKind, member_path: PathBuf) -> Self {
        Self {
            path,
            kind,
            acquired_at: Instant::now(),
            inner: Some(TokenInner::Portable { member_path }),
        }
    }

    pub(crate) fn implicit_read(path: PathBuf) -> Self {
        Self {
            path,
            kind: LockKind::Shared,
            acquired_at: Instant::now(),
            inner: Some(TokenInner::ImplicitRead),
        }
    }

    /// Path of the locked file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn backend(&self) -> LockBackend {
        match &self.inner {
            Some(TokenInner::Mandatory { .. }) => LockBackend::Mandatory,
            Some(TokenInner::Portable { .. }) | None => LockBackend::Portable,
            Some(TokenInner::ImplicitRead) => LockBackend::ImplicitRead,
        }
    }

    pub fn is_implicit(&self) -> bool {
        matches!(self.inner, Some(TokenInner::ImplicitRead))
    }

    /// Member file backing a portable token.
    pub fn member_path(&self) -> Option<&Path> {
        match &self.inner {
            Some(TokenInner::Portable { member_path }) => Some(member_path),
            _ => None,
        }
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };

        let elapsed = self.acquired_at.elapsed();
        match inner {
            TokenInner::Mandatory { file } => {
                if let Err(err) = file.unlock() {
                    warn!(
                        "Failed to release native lock on {}: {err}",
                        self.path.display()
                    );
                    return Err(PortlockError::LockRelease {
                        path: self.path.display().to_string(),
                        details: err.to_string(),
                    });
                }
                debug!(
                    "Released native {} lock on {} after {:.3}s",
                    self.kind,
                    self.path.display(),
                    elapsed.as_secs_f64()
                );
            }
            TokenInner::Portable { member_path } => {
                release_member(&self.path, &member_path)?;
                debug!(
                    "Released portable {} lock on {} after {:.3}s",
                    self.kind,
                    self.path.display(),
                    elapsed.as_secs_f64()
                );
            }
            TokenInner::ImplicitRead => {
                debug!(
                    "Released implicit read lock on {} after {:.3}s",
                    self.path.display(),
                    elapsed.as_secs_f64()
                );
            }
        }
        Ok(())
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        if self.inner.is_none() {
            return;
        }
        if let Err(err) = self.release_inner() {
            warn!(
                "Failed to release lock on {} during drop: {err}",
                self.path.display()
            );
        }
    }
}

/// Deletes the member file and, if that left the lock directory empty,
/// removes the directory too. Both steps tolerate races with peers: the
/// member may already be gone (a stale-cleanup scan beat us to it) and the
/// directory may refill while we look at it.
fn release_member(path: &Path, member_path: &Path) -> Result<()> {
    match file_ops::remove_file_if_exists(member_path) {
        Ok(removed) => {
            if !removed {
                debug!(
                    "Lock member {} was already removed by a peer",
                    member_path.display()
                );
            }
        }
        Err(err) if err.kind() == io::ErrorKind::ResourceBusy => {
            warn!(
                "Lock member {} is busy during release; leaving it for cleanup",
                member_path.display()
            );
        }
        Err(err) => {
            return Err(PortlockError::LockRelease {
                path: path.display().to_string(),
                details: format!("cannot remove {}: {err}", member_path.display()),
            });
        }
    }

    if let Some(lock_dir) = member_path.parent()
        && let Err(err) = file_ops::remove_dir_if_empty(lock_dir)
    {
        debug!(
            "Leaving lock directory {} in place: {err}",
            lock_dir.display()
        );
    }

    Ok(())
}
