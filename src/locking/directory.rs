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

//! Portable lock acquisition choreography.
//!
//! Acquisition walks a fixed sequence of steps, each leaving at most one
//! artifact to clean up on failure:
//!
//! ```text
//! ProbeDirectory -> CreateEntry -> AssignTicket -> WriteMember -> AwaitPossession
//! ```
//!
//! The `D` reservation directory is created first and removed only after
//! the entry file has been renamed to its member file. That ordering is
//! load-bearing: as long as a peer is anywhere between reservation and
//! rename, its `D` directory is visible, and possession scans keep
//! rescanning until it clears — so no finalizing member can slip past a
//! concurrent possession check unseen.

use crate::error::{PortlockError, Result};
use crate::locking::backoff::PollingBackoff;
use crate::locking::bakery::{PossessionWait, TicketScan};
use crate::locking::record;
use crate::locking::scanner::{DirectoryScanner, ENTRY_DEARTH_THRESHOLD};
use crate::locking::stale::ExecutionVerifier;
use crate::locking::timeout::WaitBudget;
use crate::locking::token::LockToken;
use crate::locking::values::{LockKind, LockValues};
use crate::paths::{self, ArtifactKind};
use crate::platform::file_ops;
use log::{debug, info, warn};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

/// Manager for the lock directory of one target file.
pub struct LockDirectory<'a> {
    target: PathBuf,
    lock_dir: PathBuf,
    verifier: &'a dyn ExecutionVerifier,
}

enum AcquireStep {
    ProbeDirectory,
    CreateEntry,
    AssignTicket(EntryReservation),
    WriteMember(EntryReservation, LockValues),
    AwaitPossession(String, LockValues),
}

enum Probe {
    Ready,
    ImplicitRead,
}

/// A reserved suffix: the `D` directory exists and the `E` file is ours.
struct EntryReservation {
    dir_path: PathBuf,
    entry_path: PathBuf,
    member_path: PathBuf,
    member_name: String,
}

impl EntryReservation {
    /// Removes the reservation artifacts after a failure.
    fn abandon(&self) {
        if let Err(err) = file_ops::remove_file_if_exists(&self.entry_path) {
            warn!(
                "Failed to remove entry file {}: {err}",
                self.entry_path.display()
            );
        }
        if let Err(err) = file_ops::remove_any(&self.dir_path) {
            warn!(
                "Failed to remove entry directory {}: {err}",
                self.dir_path.display()
            );
        }
    }
}

impl<'a> LockDirectory<'a> {
    pub fn new(target: &Path, verifier: &'a dyn ExecutionVerifier) -> Result<Self> {
        let lock_dir = paths::lock_directory_for(target)
            .map_err(|err| PortlockError::from_io(target, err))?;
        Ok(Self {
            target: target.to_path_buf(),
            lock_dir,
            verifier,
        })
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Runs the acquisition state machine to completion.
    pub fn acquire(&self, kind: LockKind, budget: &WaitBudget) -> Result<LockToken> {
        let mut step = AcquireStep::ProbeDirectory;
        loop {
            step = match step {
                AcquireStep::ProbeDirectory => match self.probe_directory(kind, budget)? {
                    Probe::Ready => AcquireStep::CreateEntry,
                    Probe::ImplicitRead => {
                        return Ok(LockToken::implicit_read(self.target.clone()));
                    }
                },
                AcquireStep::CreateEntry => match self.create_entry() {
                    Ok(reservation) => AcquireStep::AssignTicket(reservation),
                    Err(err) => {
                        self.sweep_directory();
                        return Err(err);
                    }
                },
                AcquireStep::AssignTicket(reservation) => match self.assign_ticket(kind) {
                    Ok(values) => AcquireStep::WriteMember(reservation, values),
                    Err(err) => {
                        reservation.abandon();
                        self.sweep_directory();
                        return Err(err);
                    }
                },
                AcquireStep::WriteMember(reservation, values) => {
                    match self.write_member(&reservation, &values) {
                        Ok(()) => {
                            AcquireStep::AwaitPossession(reservation.member_name, values)
                        }
                        Err(err) => {
                            reservation.abandon();
                            self.sweep_directory();
                            return Err(err);
                        }
                    }
                }
                AcquireStep::AwaitPossession(member_name, values) => {
                    match self.await_possession(&member_name, &values, budget) {
                        Ok(()) => {
                            debug!(
                                "Acquired {kind} lock on {} (ticket {}, member {member_name})",
                                self.target.display(),
                                values.lamport
                            );
                            return Ok(LockToken::portable(
                                self.target.clone(),
                                kind,
                                self.lock_dir.join(&member_name),
                            ));
                        }
                        Err(err) => {
                            if let Err(remove_err) = file_ops::remove_file_if_exists(
                                &self.lock_dir.join(&member_name),
                            ) {
                                warn!(
                                    "Failed to withdraw lock member {member_name}: {remove_err}"
                                );
                            }
                            self.sweep_directory();
                            return Err(self.retag_timeout(err));
                        }
                    }
                }
            };
        }
    }

    /// True iff at least one syntactically valid member file exists (or a
    /// legacy single-file lock occupies the directory's name).
    pub fn is_locked(&self) -> Result<bool> {
        let metadata = match fs::symlink_metadata(&self.lock_dir) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(PortlockError::from_io(&self.lock_dir, err)),
        };

        if metadata.file_type().is_file() {
            return Ok(true);
        }
        if !metadata.is_dir() {
            return Ok(false);
        }

        let read_dir = match fs::read_dir(&self.lock_dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(PortlockError::from_io(&self.lock_dir, err)),
        };

        for entry in read_dir.flatten() {
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str()
                && paths::artifact_kind(name) == Some(ArtifactKind::Member)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Current member records, decoded. Used for diagnostics.
    pub fn holders(&self) -> Result<Vec<(String, LockValues)>> {
        let read_dir = match fs::read_dir(&self.lock_dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(PortlockError::from_io(&self.lock_dir, err)),
        };

        let mut holders = Vec::new();
        for entry in read_dir.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if paths::artifact_kind(name) != Some(ArtifactKind::Member) {
                continue;
            }
            if let record::MemberRead::Values(member_values) =
                record::read_member_file(&entry.path())?
            {
                holders.push((name.to_string(), member_values));
            }
        }
        holders.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(holders)
    }

    fn probe_directory(&self, kind: LockKind, budget: &WaitBudget) -> Result<Probe> {
        let backoff = PollingBackoff::with_start(budget.started_at());
        loop {
            match fs::symlink_metadata(&self.lock_dir) {
                Ok(metadata) if metadata.is_dir() => return Ok(Probe::Ready),
                Ok(metadata) if metadata.file_type().is_file() => {
                    // A regular file under the directory's name is a legacy
                    // single-holder lock: busy until its owner removes it.
                    if budget.is_expired() {
                        return Err(PortlockError::LockTimeout {
                            path: self.target.display().to_string(),
                            waited_secs: budget.elapsed().as_secs_f64(),
                            details: "a legacy lock file occupies the lock directory path"
                                .to_string(),
                        });
                    }
                    thread::sleep(budget.clamp_sleep(backoff.next_delay()));
                }
                Ok(_) => {
                    warn!(
                        "Removing debris at lock directory path {}",
                        self.lock_dir.display()
                    );
                    file_ops::remove_any(&self.lock_dir)
                        .map_err(|err| PortlockError::from_io(&self.lock_dir, err))?;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    match fs::create_dir(&self.lock_dir) {
                        Ok(()) => return Ok(Probe::Ready),
                        // A concurrent locker created it first; fine.
                        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                        Err(err)
                            if matches!(
                                err.kind(),
                                io::ErrorKind::PermissionDenied
                                    | io::ErrorKind::ReadOnlyFilesystem
                            ) && kind == LockKind::Shared =>
                        {
                            info!(
                                "Granting implicit read lock on {}: {err}",
                                self.target.display()
                            );
                            return Ok(Probe::ImplicitRead);
                        }
                        Err(err) => {
                            return Err(PortlockError::from_io(&self.lock_dir, err));
                        }
                    }
                }
                Err(err) => return Err(PortlockError::from_io(&self.lock_dir, err)),
            }
        }
    }

    /// Reserves a random suffix by creating its `D` directory and `E` file.
    fn create_entry(&self) -> Result<EntryReservation> {
        let deadline = Instant::now() + ENTRY_DEARTH_THRESHOLD;
        loop {
            if Instant::now() >= deadline {
                return Err(PortlockError::LockAcquire {
                    path: self.target.display().to_string(),
                    details: "unable to reserve a lock entry suffix".to_string(),
                });
            }

            let suffix = paths::draw_suffix();
            let dir_path = self
                .lock_dir
                .join(paths::artifact_name(ArtifactKind::EntryDir, suffix));
            match fs::create_dir(&dir_path) {
                Ok(()) => {}
                // Another locker holds this suffix; draw again.
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    // The lock directory was reaped between probe and entry
                    // creation; recreate it and retry.
                    match fs::create_dir(&self.lock_dir) {
                        Ok(()) => continue,
                        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                        Err(err) => {
                            return Err(PortlockError::from_io(&self.lock_dir, err));
                        }
                    }
                }
                Err(err) => return Err(PortlockError::from_io(&dir_path, err)),
            }

            let member_name = paths::artifact_name(ArtifactKind::Member, suffix);
            let member_path = self.lock_dir.join(&member_name);
            if member_path.exists() {
                // A finished holder already owns this suffix.
                let _ = file_ops::remove_any(&dir_path);
                continue;
            }

            let entry_path = self
                .lock_dir
                .join(paths::artifact_name(ArtifactKind::Entry, suffix));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&entry_path)
            {
                Ok(_) => {
                    if let Err(err) = file_ops::restrict_permissions(&entry_path) {
                        debug!(
                            "Could not restrict permissions on {}: {err}",
                            entry_path.display()
                        );
                    }
                    return Ok(EntryReservation {
                        dir_path,
                        entry_path,
                        member_path,
                        member_name,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let _ = file_ops::remove_any(&dir_path);
                    continue;
                }
                Err(err) => {
                    let _ = file_ops::remove_any(&dir_path);
                    return Err(PortlockError::from_io(&entry_path, err));
                }
            }
        }
    }

    /// One number scan over the directory; ticket is one past the maximum.
    fn assign_ticket(&self, kind: LockKind) -> Result<LockValues> {
        let mut values = LockValues::for_current_process(kind, &self.lock_dir);
        let mut scanner = DirectoryScanner::new(self.verifier, false);
        let mut ticket_scan = TicketScan::new();
        scanner.scan(&self.lock_dir, None, &mut ticket_scan, None)?;
        values.lamport = ticket_scan.next_ticket();
        Ok(values)
    }

    /// Writes the record into the entry file and renames it to the member
    /// file. The rename is the atomic handoff that makes us a holder
    /// candidate; the reservation directory falls afterwards.
    fn write_member(&self, reservation: &EntryReservation, values: &LockValues) -> Result<()> {
        let bytes = record::encode(values)?;
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&reservation.entry_path)
            .map_err(|err| PortlockError::from_io(&reservation.entry_path, err))?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|err| PortlockError::from_io(&reservation.entry_path, err))?;
        drop(file);

        file_ops::atomic_rename(&reservation.entry_path, &reservation.member_path)
            .map_err(|err| PortlockError::from_io(&reservation.member_path, err))?;

        if let Err(err) = file_ops::remove_any(&reservation.dir_path) {
            warn!(
                "Failed to remove entry directory {}: {err}",
                reservation.dir_path.display()
            );
        }
        Ok(())
    }

    fn await_possession(
        &self,
        member_name: &str,
        values: &LockValues,
        budget: &WaitBudget,
    ) -> Result<()> {
        let mut scanner = DirectoryScanner::new(self.verifier, true);
        let mut wait = PossessionWait::new(member_name, values, budget, self.verifier);
        scanner.scan(
            &self.lock_dir,
            Some((member_name, values)),
            &mut wait,
            Some(budget),
        )
    }

    /// Best-effort removal of a now-possibly-empty lock directory. Losing
    /// the race to a new arrival is expected and harmless.
    fn sweep_directory(&self) {
        if let Err(err) = file_ops::remove_dir_if_empty(&self.lock_dir) {
            debug!(
                "Leaving lock directory {} in place: {err}",
                self.lock_dir.display()
            );
        }
    }

    /// Timeouts surfaced from scans carry the lock directory path; retag
    /// them with the path the caller actually asked about.
    fn retag_timeout(&self, err: PortlockError) -> PortlockError {
        match err {
            PortlockError::LockTimeout {
                waited_secs,
                details,
                ..
            } => PortlockError::LockTimeout {
                path: self.target.display().to_string(),
                waited_secs,
                details,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::record::encode;
    use crate::locking::stale::DefaultExecutionVerifier;
    use crate::locking::timeout::WaitLimit;
    use crate::locking::token::LockBackend;
    use crate::locking::values;
    use std::time::Duration;
    use tempfile::TempDir;

    fn try_once() -> WaitBudget {
        WaitBudget::new(WaitLimit::TryOnce)
    }

    #[test]
    fn acquire_and_release_leave_no_artifacts() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("foo.vmx");
        let verifier = DefaultExecutionVerifier;
        let directory = LockDirectory::new(&target, &verifier).unwrap();

        let token = directory.acquire(LockKind::Exclusive, &try_once()).unwrap();
        assert_eq!(token.backend(), LockBackend::Portable);
        assert!(directory.is_locked().unwrap());

        token.release().unwrap();
        assert!(!directory.is_locked().unwrap());
        assert!(!directory.lock_dir().exists());
    }

    #[test]
    fn two_shared_holders_coexist() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("foo.vmx");
        let verifier = DefaultExecutionVerifier;
        let directory = LockDirectory::new(&target, &verifier).unwrap();

        let first = directory.acquire(LockKind::Shared, &try_once()).unwrap();
        let second = directory.acquire(LockKind::Shared, &try_once()).unwrap();

        let holders = directory.holders().unwrap();
        assert_eq!(holders.len(), 2);
        assert!(holders[0].1.lamport != holders[1].1.lamport);

        first.release().unwrap();
        second.release().unwrap();
        assert!(!directory.is_locked().unwrap());
    }

    #[test]
    fn exclusive_try_once_fails_against_a_cross_host_holder() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("foo.vmx");
        let verifier = DefaultExecutionVerifier;
        let directory = LockDirectory::new(&target, &verifier).unwrap();

        fs::create_dir(directory.lock_dir()).unwrap();
        let theirs = LockValues {
            machine_id: "far-host".to_string(),
            execution_id: "4242-1700000000".to_string(),
            lamport: 1,
            kind: LockKind::Exclusive,
            creation_time: 1_700_000_000,
            location_checksum: Some(values::location_checksum(directory.lock_dir())),
        };
        fs::write(
            directory.lock_dir().join("M00001.lck"),
            encode(&theirs).unwrap(),
        )
        .unwrap();

        let err = directory
            .acquire(LockKind::Exclusive, &try_once())
            .unwrap_err();
        assert!(err.is_timeout());

        // The failed attempt must withdraw its own member.
        let holders = directory.holders().unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].0, "M00001.lck");
    }

    #[test]
    fn stale_local_member_is_reaped_during_acquisition() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("foo.vmx");
        let verifier = DefaultExecutionVerifier;
        let directory = LockDirectory::new(&target, &verifier).unwrap();

        fs::create_dir(directory.lock_dir()).unwrap();
        let dead = LockValues {
            machine_id: values::machine_id(),
            execution_id: "4294967294-1".to_string(),
            lamport: 1,
            kind: LockKind::Exclusive,
            creation_time: 1,
            location_checksum: Some(values::location_checksum(directory.lock_dir())),
        };
        fs::write(
            directory.lock_dir().join("M00001.lck"),
            encode(&dead).unwrap(),
        )
        .unwrap();

        let token = directory.acquire(LockKind::Exclusive, &try_once()).unwrap();
        assert!(!directory.lock_dir().join("M00001.lck").exists());
        token.release().unwrap();
    }

    #[test]
    fn second_exclusive_succeeds_after_release() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("foo.vmx");
        let verifier = DefaultExecutionVerifier;
        let directory = LockDirectory::new(&target, &verifier).unwrap();

        let first = directory.acquire(LockKind::Exclusive, &try_once()).unwrap();
        assert!(directory
            .acquire(LockKind::Exclusive, &try_once())
            .unwrap_err()
            .is_timeout());

        first.release().unwrap();
        let second = directory.acquire(LockKind::Exclusive, &try_once()).unwrap();
        second.release().unwrap();
    }

    #[test]
    fn legacy_lock_file_reports_busy() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("foo.vmx");
        let verifier = DefaultExecutionVerifier;
        let directory = LockDirectory::new(&target, &verifier).unwrap();

        fs::write(directory.lock_dir(), b"legacy holder").unwrap();
        assert!(directory.is_locked().unwrap());

        let budget = WaitBudget::new(WaitLimit::Finite(Duration::from_millis(150)));
        let err = directory.acquire(LockKind::Exclusive, &budget).unwrap_err();
        assert!(err.is_timeout());
    }

    #[cfg(unix)]
    #[test]
    fn shared_request_on_unwritable_directory_gets_an_implicit_grant() {
        use std::os::unix::fs::PermissionsExt;

        // Permission checks do not apply to root; skip there.
        if unsafe { libc::geteuid() } == 0 {
            return;
        }

        let temp = TempDir::new().unwrap();
        let readonly = temp.path().join("media");
        fs::create_dir(&readonly).unwrap();
        let target = readonly.join("foo.vmx");
        fs::write(&target, b"image").unwrap();
        fs::set_permissions(&readonly, fs::Permissions::from_mode(0o555)).unwrap();

        let verifier = DefaultExecutionVerifier;
        let directory = LockDirectory::new(&target, &verifier).unwrap();

        let token = directory.acquire(LockKind::Shared, &try_once()).unwrap();
        assert!(token.is_implicit());
        assert!(!directory.lock_dir().exists());
        token.release().unwrap();

        let err = directory
            .acquire(LockKind::Exclusive, &try_once())
            .unwrap_err();
        assert!(matches!(err, PortlockError::PermissionDenied(_)));

        fs::set_permissions(&readonly, fs::Permissions::from_mode(0o755)).unwrap();
    }
}
