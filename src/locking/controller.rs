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

use crate::config::{LockingConfig, LockingMode};
use crate::error::Result;
use crate::locking::directory::LockDirectory;
use crate::locking::mandatory::{self, MandatoryAcquire};
use crate::locking::stale::{DefaultExecutionVerifier, ExecutionVerifier};
use crate::locking::timeout::{TRYLOCK_WAIT, WaitBudget, WaitLimit};
use crate::locking::token::LockToken;
use crate::locking::values::{LockKind, LockValues};
use crate::platform::{DefaultMandatoryLockProbe, MandatoryLockProbe, MandatorySupport};
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Mandatory,
    Portable,
}

/// Coordinates native and portable locking across filesystems.
pub struct LockManager {
    mode: LockingMode,
    probe: Arc<dyn MandatoryLockProbe>,
    verifier: Arc<dyn ExecutionVerifier>,
}

impl LockManager {
    pub fn new(config: &LockingConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(DefaultMandatoryLockProbe::new()),
            Arc::new(DefaultExecutionVerifier),
        )
    }

    pub fn with_parts(
        config: &LockingConfig,
        probe: Arc<dyn MandatoryLockProbe>,
        verifier: Arc<dyn ExecutionVerifier>,
    ) -> Self {
        Self {
            mode: config.mode,
            probe,
            verifier,
        }
    }

    /// Acquires a lock on `path`, waiting up to `max_wait_millis`
    /// (`0` = try once, `0xFFFFFFFF` = wait forever). Losing to a live
    /// competitor surfaces as the timeout variant, never as an I/O error.
    pub fn lock(&self, path: &Path, read_only: bool, max_wait_millis: u32) -> Result<LockToken> {
        let kind = if read_only {
            LockKind::Shared
        } else {
            LockKind::Exclusive
        };
        let budget = WaitBudget::new(WaitLimit::from_millis(max_wait_millis));
        self.acquire(path, kind, &budget)
    }

    /// Single non-blocking attempt; `Ok(None)` means a live competitor holds
    /// the lock.
    pub fn try_lock(&self, path: &Path, read_only: bool) -> Result<Option<LockToken>> {
        match self.lock(path, read_only, TRYLOCK_WAIT) {
            Ok(token) => Ok(Some(token)),
            Err(err) if err.is_timeout() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn unlock(&self, token: LockToken) -> Result<()> {
        token.release()
    }

    /// Whether anyone currently holds a lock on `path`.
    pub fn is_locked(&self, path: &Path) -> Result<bool> {
        match self.backend_for(path) {
            Backend::Mandatory => mandatory::probe_busy(path),
            Backend::Portable => {
                LockDirectory::new(path, self.verifier.as_ref())?.is_locked()
            }
        }
    }

    /// Decoded member records for the portable lock on `path`, for
    /// diagnostics. Mandatory locks leave no records to list.
    pub fn holders(&self, path: &Path) -> Result<Vec<(String, LockValues)>> {
        LockDirectory::new(path, self.verifier.as_ref())?.holders()
    }

    /// Path the token protects.
    pub fn token_path<'t>(&self, token: &'t LockToken) -> &'t Path {
        token.path()
    }

    fn acquire(&self, path: &Path, kind: LockKind, budget: &WaitBudget) -> Result<LockToken> {
        match self.backend_for(path) {
            Backend::Mandatory => match mandatory::acquire(path, kind, budget)? {
                MandatoryAcquire::Acquired(token) => Ok(*token),
                MandatoryAcquire::Unsupported => {
                    info!(
                        "Native locking rejected at runtime for {}; using the portable protocol",
                        path.display()
                    );
                    self.acquire_portable(path, kind, budget)
                }
            },
            Backend::Portable => self.acquire_portable(path, kind, budget),
        }
    }

    fn acquire_portable(
        &self,
        path: &Path,
        kind: LockKind,
        budget: &WaitBudget,
    ) -> Result<LockToken> {
        LockDirectory::new(path, self.verifier.as_ref())?.acquire(kind, budget)
    }

    fn backend_for(&self, path: &Path) -> Backend {
        match self.mode {
            LockingMode::Portable => {
                debug!("Locking mode forced to portable for {}", path.display());
                return Backend::Portable;
            }
            LockingMode::Mandatory => {
                debug!("Locking mode forced to mandatory for {}", path.display());
                return Backend::Mandatory;
            }
            LockingMode::Auto => {}
        }

        match self.probe.supports_mandatory_lock(path) {
            Ok(MandatorySupport::Supported) => Backend::Mandatory,
            Ok(MandatorySupport::Unsupported) => {
                info!(
                    "Filesystem for {} cannot carry native locks; using the portable protocol",
                    path.display()
                );
                Backend::Portable
            }
            Ok(MandatorySupport::Unknown) => Backend::Portable,
            Err(err) => {
                warn!(
                    "Capability probe failed for {} ({err}); using the portable protocol",
                    path.display()
                );
                Backend::Portable
            }
        }
    }
}
