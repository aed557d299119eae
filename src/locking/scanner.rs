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

//! Lock directory scanning.
//!
//! A scan makes two passes over the directory. Pass one enforces the
//! artifact naming grammar, deleting anything foreign, and (in cleanup
//! mode) registers `D` reservation directories in an age-tracked list —
//! they belong to peers mid-acquisition and must not be deleted outright.
//! Pass two visits the member files through an injected [`ScanVisitor`],
//! screening out relocated records and records left by dead same-machine
//! processes first.
//!
//! While tracked reservations remain, the scan sleeps and repeats; a
//! reservation whose age crosses the dearth threshold belongs to a crashed
//! locker and is force-deleted together with its sibling artifacts. This
//! bounds how long a crash mid-acquisition can stall everyone else.

use crate::error::{PortlockError, Result};
use crate::locking::record::{self, MemberRead};
use crate::locking::stale::{self, ExecutionVerifier};
use crate::locking::timeout::WaitBudget;
use crate::locking::values::{self, LockValues};
use crate::paths::{self, ArtifactKind};
use crate::platform::file_ops;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Interval by which tracked reservation ages advance between passes.
pub const ENTRY_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// Age beyond which a tracked reservation is declared abandoned.
pub const ENTRY_DEARTH_THRESHOLD: Duration = Duration::from_millis(8_000);

/// Decision returned by a visitor for one member entry.
#[derive(Debug)]
pub enum ScanVisit {
    Continue,
    Abort(PortlockError),
}

/// Per-member strategy injected into a scan: the number scan folds the
/// maximum ticket, the possession wait blocks on conflicting holders.
pub trait ScanVisitor {
    fn visit(
        &mut self,
        lock_dir: &Path,
        member_name: &str,
        values: &LockValues,
        is_self: bool,
    ) -> ScanVisit;
}

/// Ages of `D` reservation directories observed across scan passes.
#[derive(Debug, Default)]
struct EntryTracker {
    ages: HashMap<String, Duration>,
}

impl EntryTracker {
    fn observe(&mut self, name: &str) {
        self.ages.entry(name.to_string()).or_insert(Duration::ZERO);
    }

    /// Drops tracking for reservations that vanished: their owners finished.
    fn retain_seen(&mut self, seen: &HashSet<String>) {
        self.ages.retain(|name, _| seen.contains(name));
    }

    fn advance(&mut self, interval: Duration) {
        for age in self.ages.values_mut() {
            *age += interval;
        }
    }

    fn expired(&self) -> Vec<String> {
        self.ages
            .iter()
            .filter(|(_, age)| **age > ENTRY_DEARTH_THRESHOLD)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn remove(&mut self, name: &str) {
        self.ages.remove(name);
    }

    fn is_empty(&self) -> bool {
        self.ages.is_empty()
    }
}

pub struct DirectoryScanner<'a> {
    verifier: &'a dyn ExecutionVerifier,
    local_machine: String,
    clean_up: bool,
    tracker: EntryTracker,
}

impl<'a> DirectoryScanner<'a> {
    /// `clean_up` enables reservation tracking and the rescan loop; the
    /// number scan runs without it and settles for a single pass.
    pub fn new(verifier: &'a dyn ExecutionVerifier, clean_up: bool) -> Self {
        Self {
            verifier,
            local_machine: values::machine_id(),
            clean_up,
            tracker: EntryTracker::default(),
        }
    }

    /// Scans `lock_dir`, dispatching member entries to `visitor`. The
    /// caller's own member (when present) is passed through directly from
    /// `self_entry` without re-reading it from disk. `budget`, when given,
    /// bounds the rescan loop waiting on peer reservations.
    pub fn scan(
        &mut self,
        lock_dir: &Path,
        self_entry: Option<(&str, &LockValues)>,
        visitor: &mut dyn ScanVisitor,
        budget: Option<&WaitBudget>,
    ) -> Result<()> {
        loop {
            let reservations_pending = self.scan_once(lock_dir, self_entry, visitor)?;
            if !reservations_pending {
                return Ok(());
            }

            if let Some(budget) = budget
                && budget.is_expired()
            {
                return Err(PortlockError::LockTimeout {
                    path: lock_dir.display().to_string(),
                    waited_secs: budget.elapsed().as_secs_f64(),
                    details: "another locker is mid-acquisition".to_string(),
                });
            }

            thread::sleep(ENTRY_SAMPLE_INTERVAL);
            self.tracker.advance(ENTRY_SAMPLE_INTERVAL);
            for name in self.tracker.expired() {
                warn!(
                    "Removing abandoned lock entry {name} in {} after {}ms",
                    lock_dir.display(),
                    ENTRY_DEARTH_THRESHOLD.as_millis()
                );
                force_delete_triad(lock_dir, &name);
                self.tracker.remove(&name);
            }
        }
    }

    /// One full pass. Returns whether tracked reservations remain.
    fn scan_once(
        &mut self,
        lock_dir: &Path,
        self_entry: Option<(&str, &LockValues)>,
        visitor: &mut dyn ScanVisitor,
    ) -> Result<bool> {
        let read_dir = match fs::read_dir(lock_dir) {
            Ok(read_dir) => read_dir,
            // The whole directory vanished: every member is gone with it.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(PortlockError::from_io(lock_dir, err)),
        };

        let mut members: Vec<String> = Vec::new();
        let mut pending: HashSet<String> = HashSet::new();

        for entry in read_dir {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Failed to read entry in {}: {err}", lock_dir.display());
                    continue;
                }
            };

            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                remove_foreign(&entry.path());
                continue;
            };
            if !paths::is_valid_artifact_name(name) {
                remove_foreign(&entry.path());
                continue;
            }

            match paths::artifact_kind(name) {
                Some(ArtifactKind::Member) => members.push(name.to_string()),
                // Entry files live and die with their reservation directory.
                Some(ArtifactKind::Entry) => {}
                Some(ArtifactKind::EntryDir) => {
                    if self.clean_up {
                        pending.insert(name.to_string());
                        self.tracker.observe(name);
                    }
                }
                None => unreachable!("validated above"),
            }
        }

        if self.clean_up {
            self.tracker.retain_seen(&pending);
        }

        // Visit in name order so ticket ties resolve the same way on every
        // machine.
        members.sort_unstable();
        let expected_checksum = values::location_checksum(lock_dir);

        for name in &members {
            if let Some((self_name, self_values)) = self_entry
                && name == self_name
            {
                match visitor.visit(lock_dir, name, self_values, true) {
                    ScanVisit::Continue => continue,
                    ScanVisit::Abort(err) => return Err(err),
                }
            }

            let member_path = lock_dir.join(name);
            let member_values = match record::read_member_file(&member_path)? {
                MemberRead::Vanished => continue,
                MemberRead::Values(member_values) => member_values,
            };

            if let Some(checksum) = &member_values.location_checksum
                && *checksum != expected_checksum
            {
                warn!(
                    "Removing relocated lock member {} (recorded for a different directory)",
                    member_path.display()
                );
                remove_member(&member_path);
                continue;
            }

            if member_values.machine_id == self.local_machine
                && !stale::is_valid_execution_id(self.verifier, &member_values.execution_id)
            {
                warn!(
                    "Removing stale lock member {} left by dead process {}",
                    member_path.display(),
                    member_values.execution_id
                );
                remove_member(&member_path);
                continue;
            }

            match visitor.visit(lock_dir, name, &member_values, false) {
                ScanVisit::Continue => {}
                ScanVisit::Abort(err) => return Err(err),
            }
        }

        Ok(self.clean_up && !self.tracker.is_empty())
    }
}

fn remove_foreign(path: &Path) {
    warn!("Removing foreign entry {} from lock directory", path.display());
    if let Err(err) = file_ops::remove_any(path) {
        warn!("Failed to remove {}: {err}", path.display());
    }
}

fn remove_member(path: &Path) {
    if let Err(err) = file_ops::remove_file_if_exists(path) {
        warn!("Failed to remove lock member {}: {err}", path.display());
    }
}

/// Deletes an abandoned reservation directory and any sibling entry/member
/// artifacts sharing its suffix.
fn force_delete_triad(lock_dir: &Path, reservation_name: &str) {
    let Some(suffix) = paths::artifact_suffix(reservation_name) else {
        return;
    };

    for kind in [ArtifactKind::Member, ArtifactKind::Entry, ArtifactKind::EntryDir] {
        let path = lock_dir.join(paths::artifact_name(kind, suffix));
        if let Err(err) = file_ops::remove_any(&path) {
            warn!("Failed to remove abandoned artifact {}: {err}", path.display());
        } else {
            debug!("Removed abandoned artifact {}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::record::encode;
    use crate::locking::stale::DefaultExecutionVerifier;
    use crate::locking::values::LockKind;
    use std::fs;
    use tempfile::TempDir;

    struct Collect {
        seen: Vec<(String, u64, bool)>,
    }

    impl Collect {
        fn new() -> Self {
            Self { seen: Vec::new() }
        }
    }

    impl ScanVisitor for Collect {
        fn visit(
            &mut self,
            _lock_dir: &Path,
            member_name: &str,
            member_values: &LockValues,
            is_self: bool,
        ) -> ScanVisit {
            self.seen
                .push((member_name.to_string(), member_values.lamport, is_self));
            ScanVisit::Continue
        }
    }

    fn write_member(lock_dir: &Path, name: &str, values: &LockValues) {
        fs::write(lock_dir.join(name), encode(values).unwrap()).unwrap();
    }

    fn live_values(lock_dir: &Path, lamport: u64) -> LockValues {
        LockValues {
            lamport,
            ..LockValues::for_current_process(LockKind::Exclusive, lock_dir)
        }
    }

    #[test]
    fn foreign_names_are_deleted_and_members_visited() {
        let temp = TempDir::new().unwrap();
        let lock_dir = temp.path().join("foo.vmx.lck");
        fs::create_dir(&lock_dir).unwrap();

        write_member(&lock_dir, "M00002.lck", &live_values(&lock_dir, 3));
        fs::write(lock_dir.join("README.txt"), b"junk").unwrap();
        fs::create_dir(lock_dir.join("garbage")).unwrap();

        let verifier = DefaultExecutionVerifier;
        let mut scanner = DirectoryScanner::new(&verifier, false);
        let mut visitor = Collect::new();
        scanner.scan(&lock_dir, None, &mut visitor, None).unwrap();

        assert_eq!(visitor.seen.len(), 1);
        assert_eq!(visitor.seen[0].0, "M00002.lck");
        assert!(!lock_dir.join("README.txt").exists());
        assert!(!lock_dir.join("garbage").exists());
    }

    #[test]
    fn corrupt_members_are_healed_without_aborting_the_scan() {
        let temp = TempDir::new().unwrap();
        let lock_dir = temp.path().join("foo.vmx.lck");
        fs::create_dir(&lock_dir).unwrap();

        // Three-token garbage sorts before the valid member, so the scan
        // must survive it to reach the good record.
        fs::write(lock_dir.join("M00001.lck"), b"only three tokens").unwrap();
        write_member(&lock_dir, "M00002.lck", &live_values(&lock_dir, 5));

        let verifier = DefaultExecutionVerifier;
        let mut scanner = DirectoryScanner::new(&verifier, false);
        let mut visitor = Collect::new();
        scanner.scan(&lock_dir, None, &mut visitor, None).unwrap();

        assert_eq!(visitor.seen.len(), 1);
        assert_eq!(visitor.seen[0].1, 5);
        assert!(!lock_dir.join("M00001.lck").exists());
    }

    #[test]
    fn stale_same_machine_members_are_removed() {
        let temp = TempDir::new().unwrap();
        let lock_dir = temp.path().join("foo.vmx.lck");
        fs::create_dir(&lock_dir).unwrap();

        let stale = LockValues {
            // A pid from the far end of the space with an ancient creation
            // time: provably not alive here.
            execution_id: "4294967294-1".to_string(),
            ..live_values(&lock_dir, 1)
        };
        write_member(&lock_dir, "M00001.lck", &stale);

        let verifier = DefaultExecutionVerifier;
        let mut scanner = DirectoryScanner::new(&verifier, true);
        let mut visitor = Collect::new();
        scanner.scan(&lock_dir, None, &mut visitor, None).unwrap();

        assert!(visitor.seen.is_empty());
        assert!(!lock_dir.join("M00001.lck").exists());
    }

    #[test]
    fn relocated_members_are_discarded() {
        let temp = TempDir::new().unwrap();
        let lock_dir = temp.path().join("foo.vmx.lck");
        fs::create_dir(&lock_dir).unwrap();

        let moved = LockValues {
            location_checksum: Some(values::location_checksum(Path::new(
                "/somewhere/else.vmx.lck",
            ))),
            ..live_values(&lock_dir, 1)
        };
        write_member(&lock_dir, "M00001.lck", &moved);

        let verifier = DefaultExecutionVerifier;
        let mut scanner = DirectoryScanner::new(&verifier, false);
        let mut visitor = Collect::new();
        scanner.scan(&lock_dir, None, &mut visitor, None).unwrap();

        assert!(visitor.seen.is_empty());
        assert!(!lock_dir.join("M00001.lck").exists());
    }

    #[test]
    fn own_member_is_used_without_rereading() {
        let temp = TempDir::new().unwrap();
        let lock_dir = temp.path().join("foo.vmx.lck");
        fs::create_dir(&lock_dir).unwrap();

        // The on-disk copy is garbage on purpose: if the scanner re-read it,
        // it would be deleted as corrupt instead of visited as self.
        fs::write(lock_dir.join("M00009.lck"), b"not a record").unwrap();
        let own = live_values(&lock_dir, 4);

        let verifier = DefaultExecutionVerifier;
        let mut scanner = DirectoryScanner::new(&verifier, false);
        let mut visitor = Collect::new();
        scanner
            .scan(&lock_dir, Some(("M00009.lck", &own)), &mut visitor, None)
            .unwrap();

        assert_eq!(visitor.seen, vec![("M00009.lck".to_string(), 4, true)]);
        assert!(lock_dir.join("M00009.lck").exists());
    }

    #[test]
    fn missing_directory_is_an_empty_scan() {
        let temp = TempDir::new().unwrap();
        let verifier = DefaultExecutionVerifier;
        let mut scanner = DirectoryScanner::new(&verifier, true);
        let mut visitor = Collect::new();
        scanner
            .scan(&temp.path().join("gone.lck"), None, &mut visitor, None)
            .unwrap();
        assert!(visitor.seen.is_empty());
    }

    #[test]
    fn tracker_expires_entries_past_the_dearth_threshold() {
        let mut tracker = EntryTracker::default();
        tracker.observe("D00001.lck");
        tracker.advance(ENTRY_DEARTH_THRESHOLD);
        assert!(tracker.expired().is_empty());

        tracker.advance(ENTRY_SAMPLE_INTERVAL);
        assert_eq!(tracker.expired(), vec!["D00001.lck".to_string()]);

        tracker.remove("D00001.lck");
        assert!(tracker.is_empty());
    }

    #[test]
    fn tracker_forgets_entries_that_vanish() {
        let mut tracker = EntryTracker::default();
        tracker.observe("D00001.lck");
        tracker.observe("D00002.lck");
        tracker.advance(ENTRY_SAMPLE_INTERVAL);

        let mut seen = HashSet::new();
        seen.insert("D00002.lck".to_string());
        tracker.retain_seen(&seen);

        assert_eq!(tracker.ages.len(), 1);
        assert!(tracker.ages.contains_key("D00002.lck"));
    }

    #[test]
    fn force_delete_removes_the_whole_triad() {
        let temp = TempDir::new().unwrap();
        let lock_dir = temp.path().join("foo.vmx.lck");
        fs::create_dir(&lock_dir).unwrap();
        fs::create_dir(lock_dir.join("D00042.lck")).unwrap();
        fs::write(lock_dir.join("E00042.lck"), b"pending").unwrap();
        fs::write(lock_dir.join("M00042.lck"), b"pending").unwrap();

        force_delete_triad(&lock_dir, "D00042.lck");

        assert!(!lock_dir.join("D00042.lck").exists());
        assert!(!lock_dir.join("E00042.lck").exists());
        assert!(!lock_dir.join("M00042.lck").exists());
    }

    #[test]
    fn try_once_budget_times_out_on_pending_reservations() {
        let temp = TempDir::new().unwrap();
        let lock_dir = temp.path().join("foo.vmx.lck");
        fs::create_dir(&lock_dir).unwrap();
        fs::create_dir(lock_dir.join("D00007.lck")).unwrap();

        let verifier = DefaultExecutionVerifier;
        let mut scanner = DirectoryScanner::new(&verifier, true);
        let mut visitor = Collect::new();
        let budget = WaitBudget::new(crate::locking::timeout::WaitLimit::TryOnce);
        let err = scanner
            .scan(&lock_dir, None, &mut visitor, Some(&budget))
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
