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

//! Bakery possession decisions.
//!
//! Ticket issuance is not atomic: two lockers can race to the same number.
//! Correct mutual exclusion comes from re-deriving priority from the live
//! directory contents at every possession check, with ties broken
//! lexicographically by member file name — both sides agree on the
//! comparison, so exactly one of them yields.

use crate::error::PortlockError;
use crate::locking::backoff::PollingBackoff;
use crate::locking::scanner::{ScanVisit, ScanVisitor};
use crate::locking::stale::{self, ExecutionVerifier};
use crate::locking::timeout::WaitBudget;
use crate::locking::values::{self, LockValues};
use crate::platform::file_ops;
use log::warn;
use std::cmp;
use std::fs;
use std::io;
use std::path::Path;
use std::thread;

/// Whether the holder described by `(other_ticket, other_name)` goes before
/// us: a strictly smaller ticket wins, a tied ticket falls to the smaller
/// member file name.
pub fn has_priority(other_ticket: u64, other_name: &str, my_ticket: u64, my_name: &str) -> bool {
    other_ticket < my_ticket || (other_ticket == my_ticket && other_name < my_name)
}

/// Whether we must wait on `other`: it holds priority and at least one of
/// the two locks is exclusive. Shared holders never conflict.
pub fn requires_wait(
    other: &LockValues,
    other_name: &str,
    mine: &LockValues,
    my_name: &str,
) -> bool {
    has_priority(other.lamport, other_name, mine.lamport, my_name)
        && (other.kind.is_exclusive() || mine.kind.is_exclusive())
}

/// Number scan: folds the highest Lamport ticket present in the directory.
#[derive(Debug, Default)]
pub struct TicketScan {
    highest: u64,
}

impl TicketScan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticket for a new entrant: one past everything seen.
    pub fn next_ticket(&self) -> u64 {
        self.highest + 1
    }
}

impl ScanVisitor for TicketScan {
    fn visit(
        &mut self,
        _lock_dir: &Path,
        _member_name: &str,
        member_values: &LockValues,
        _is_self: bool,
    ) -> ScanVisit {
        self.highest = cmp::max(self.highest, member_values.lamport);
        ScanVisit::Continue
    }
}

/// Possession wait: blocks on every member that outranks us until it
/// releases, dies, or the wait budget runs out.
pub struct PossessionWait<'a> {
    my_name: &'a str,
    mine: &'a LockValues,
    budget: &'a WaitBudget,
    backoff: PollingBackoff,
    verifier: &'a dyn ExecutionVerifier,
    local_machine: String,
}

impl<'a> PossessionWait<'a> {
    pub fn new(
        my_name: &'a str,
        mine: &'a LockValues,
        budget: &'a WaitBudget,
        verifier: &'a dyn ExecutionVerifier,
    ) -> Self {
        Self {
            my_name,
            mine,
            budget,
            backoff: PollingBackoff::with_start(budget.started_at()),
            verifier,
            local_machine: values::machine_id(),
        }
    }

    fn timed_out(&self, lock_dir: &Path, other: &LockValues) -> ScanVisit {
        ScanVisit::Abort(PortlockError::LockTimeout {
            path: lock_dir.display().to_string(),
            waited_secs: self.budget.elapsed().as_secs_f64(),
            details: format!(
                "blocked by a {} lock held by {} on {}",
                other.kind, other.execution_id, other.machine_id
            ),
        })
    }
}

impl ScanVisitor for PossessionWait<'_> {
    fn visit(
        &mut self,
        lock_dir: &Path,
        member_name: &str,
        member_values: &LockValues,
        is_self: bool,
    ) -> ScanVisit {
        if is_self {
            return ScanVisit::Continue;
        }
        if !requires_wait(member_values, member_name, self.mine, self.my_name) {
            return ScanVisit::Continue;
        }

        let member_path = lock_dir.join(member_name);
        loop {
            // The holder may release at any instant; its record never
            // changes, so existence is the whole question.
            match fs::symlink_metadata(&member_path) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return ScanVisit::Continue;
                }
                Err(err) => {
                    return ScanVisit::Abort(PortlockError::from_io(&member_path, err));
                }
            }

            if member_values.machine_id == self.local_machine
                && !stale::is_valid_execution_id(self.verifier, &member_values.execution_id)
            {
                warn!(
                    "Removing stale lock member {} held by dead process {}",
                    member_path.display(),
                    member_values.execution_id
                );
                if let Err(err) = file_ops::remove_file_if_exists(&member_path) {
                    warn!(
                        "Failed to remove stale lock member {}: {err}",
                        member_path.display()
                    );
                }
                return ScanVisit::Continue;
            }

            if self.budget.is_expired() {
                return self.timed_out(lock_dir, member_values);
            }

            thread::sleep(self.budget.clamp_sleep(self.backoff.next_delay()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::record::encode;
    use crate::locking::stale::DefaultExecutionVerifier;
    use crate::locking::timeout::WaitLimit;
    use crate::locking::values::LockKind;
    use std::time::Duration;
    use tempfile::TempDir;

    fn member(kind: LockKind, lamport: u64, lock_dir: &Path) -> LockValues {
        LockValues {
            machine_id: "far-host".to_string(),
            execution_id: "4242-1700000000".to_string(),
            lamport,
            kind,
            creation_time: 1_700_000_000,
            location_checksum: Some(values::location_checksum(lock_dir)),
        }
    }

    #[test]
    fn smaller_ticket_has_priority() {
        assert!(has_priority(1, "M00009.lck", 2, "M00001.lck"));
        assert!(!has_priority(3, "M00001.lck", 2, "M00009.lck"));
    }

    #[test]
    fn tied_tickets_fall_to_the_name_tiebreak() {
        assert!(has_priority(2, "M00001.lck", 2, "M00002.lck"));
        assert!(!has_priority(2, "M00002.lck", 2, "M00001.lck"));
    }

    #[test]
    fn shared_holders_never_conflict() {
        let dir = Path::new("/shared/foo.vmx.lck");
        let theirs = member(LockKind::Shared, 1, dir);
        let mine = member(LockKind::Shared, 2, dir);
        assert!(!requires_wait(&theirs, "M00001.lck", &mine, "M00002.lck"));
    }

    #[test]
    fn exclusive_conflicts_in_either_direction() {
        let dir = Path::new("/shared/foo.vmx.lck");
        let exclusive = member(LockKind::Exclusive, 1, dir);
        let shared = member(LockKind::Shared, 2, dir);
        assert!(requires_wait(&exclusive, "M00001.lck", &shared, "M00002.lck"));

        let shared_first = member(LockKind::Shared, 1, dir);
        let exclusive_second = member(LockKind::Exclusive, 2, dir);
        assert!(requires_wait(
            &shared_first,
            "M00001.lck",
            &exclusive_second,
            "M00002.lck"
        ));
    }

    #[test]
    fn lower_priority_never_requires_waiting() {
        let dir = Path::new("/shared/foo.vmx.lck");
        let later = member(LockKind::Exclusive, 9, dir);
        let mine = member(LockKind::Exclusive, 2, dir);
        assert!(!requires_wait(&later, "M00009.lck", &mine, "M00002.lck"));
    }

    #[test]
    fn ticket_scan_folds_the_maximum() {
        let dir = Path::new("/shared/foo.vmx.lck");
        let mut scan = TicketScan::new();
        assert_eq!(scan.next_ticket(), 1);

        for (name, lamport) in [("M00001.lck", 4u64), ("M00002.lck", 11), ("M00003.lck", 2)] {
            let entry = member(LockKind::Shared, lamport, dir);
            assert!(matches!(
                scan.visit(dir, name, &entry, false),
                ScanVisit::Continue
            ));
        }
        assert_eq!(scan.next_ticket(), 12);
    }

    #[test]
    fn possession_wait_times_out_on_a_live_competitor() {
        let temp = TempDir::new().unwrap();
        let lock_dir = temp.path().join("foo.vmx.lck");
        std::fs::create_dir(&lock_dir).unwrap();

        // Cross-host holder: staleness cannot be verified, so the wait
        // must run the budget down.
        let theirs = member(LockKind::Exclusive, 1, &lock_dir);
        std::fs::write(lock_dir.join("M00001.lck"), encode(&theirs).unwrap()).unwrap();

        let mine = LockValues {
            machine_id: values::machine_id(),
            lamport: 2,
            ..theirs.clone()
        };
        let budget = WaitBudget::new(WaitLimit::Finite(Duration::from_millis(250)));
        let verifier = DefaultExecutionVerifier;
        let mut wait = PossessionWait::new("M00002.lck", &mine, &budget, &verifier);

        match wait.visit(&lock_dir, "M00001.lck", &theirs, false) {
            ScanVisit::Abort(err) => assert!(err.is_timeout()),
            ScanVisit::Continue => panic!("expected timeout"),
        }
    }

    #[test]
    fn possession_wait_fails_immediately_for_try_once() {
        let temp = TempDir::new().unwrap();
        let lock_dir = temp.path().join("foo.vmx.lck");
        std::fs::create_dir(&lock_dir).unwrap();

        let theirs = member(LockKind::Exclusive, 1, &lock_dir);
        std::fs::write(lock_dir.join("M00001.lck"), encode(&theirs).unwrap()).unwrap();

        let mine = member(LockKind::Exclusive, 2, &lock_dir);
        let budget = WaitBudget::new(WaitLimit::TryOnce);
        let verifier = DefaultExecutionVerifier;
        let mut wait = PossessionWait::new("M00002.lck", &mine, &budget, &verifier);

        let started = std::time::Instant::now();
        match wait.visit(&lock_dir, "M00001.lck", &theirs, false) {
            ScanVisit::Abort(err) => assert!(err.is_timeout()),
            ScanVisit::Continue => panic!("expected immediate timeout"),
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn possession_wait_passes_once_the_member_is_gone() {
        let temp = TempDir::new().unwrap();
        let lock_dir = temp.path().join("foo.vmx.lck");
        std::fs::create_dir(&lock_dir).unwrap();

        let theirs = member(LockKind::Exclusive, 1, &lock_dir);
        let mine = member(LockKind::Exclusive, 2, &lock_dir);
        let budget = WaitBudget::new(WaitLimit::Finite(Duration::from_secs(5)));
        let verifier = DefaultExecutionVerifier;
        let mut wait = PossessionWait::new("M00002.lck", &mine, &budget, &verifier);

        // Never written to disk: the conflicting member is already gone.
        match wait.visit(&lock_dir, "M00001.lck", &theirs, false) {
            ScanVisit::Continue => {}
            ScanVisit::Abort(err) => panic!("unexpected abort: {err}"),
        }
    }

    #[test]
    fn possession_wait_reaps_a_dead_local_holder() {
        let temp = TempDir::new().unwrap();
        let lock_dir = temp.path().join("foo.vmx.lck");
        std::fs::create_dir(&lock_dir).unwrap();

        let dead = LockValues {
            machine_id: values::machine_id(),
            execution_id: "4294967294-1".to_string(),
            ..member(LockKind::Exclusive, 1, &lock_dir)
        };
        std::fs::write(lock_dir.join("M00001.lck"), encode(&dead).unwrap()).unwrap();

        let mine = LockValues {
            machine_id: values::machine_id(),
            lamport: 2,
            ..dead.clone()
        };
        let budget = WaitBudget::new(WaitLimit::Finite(Duration::from_secs(5)));
        let verifier = DefaultExecutionVerifier;
        let mut wait = PossessionWait::new("M00002.lck", &mine, &budget, &verifier);

        match wait.visit(&lock_dir, "M00001.lck", &dead, false) {
            ScanVisit::Continue => {}
            ScanVisit::Abort(err) => panic!("unexpected abort: {err}"),
        }
        assert!(!lock_dir.join("M00001.lck").exists());
    }
}
