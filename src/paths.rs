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

//! On-disk layout of the portable lock protocol.
//!
//! A lock on `/shared/foo.vmx` lives in the sibling directory
//! `/shared/foo.vmx.lck/`, which holds three kinds of artifacts:
//! `M#####.lck` member files (one per active holder), `D#####.lck`
//! entry-reservation directories, and `E#####.lck` entry files. The five
//! digits are a random suffix drawn at reservation time, not the Lamport
//! ticket.

use rand::Rng;
use std::path::{Path, PathBuf};

/// Suffix appended to the locked path to form the lock directory name, and
/// carried by every artifact inside it.
pub const LOCK_SUFFIX: &str = ".lck";

/// Number of ASCII digits in an artifact name.
pub const SUFFIX_DIGITS: usize = 5;

const SUFFIX_SPACE: u32 = 100_000;

/// The three artifact kinds living inside a lock directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// `M` — record of an active (or finalizing) lock holder.
    Member,
    /// `E` — placeholder holding the serialized record before the ticket is
    /// finalized; renamed to the member file.
    Entry,
    /// `D` — ephemeral directory reserving a suffix number.
    EntryDir,
}

impl ArtifactKind {
    pub fn tag(self) -> char {
        match self {
            ArtifactKind::Member => 'M',
            ArtifactKind::Entry => 'E',
            ArtifactKind::EntryDir => 'D',
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'M' => Some(ArtifactKind::Member),
            b'E' => Some(ArtifactKind::Entry),
            b'D' => Some(ArtifactKind::EntryDir),
            _ => None,
        }
    }
}

/// Lock directory for `path`. The path is absolutized so that two processes
/// naming the same file through different working directories agree on the
/// directory (and on its location checksum).
pub fn lock_directory_for(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut name = absolute
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(LOCK_SUFFIX);
    Ok(absolute.with_file_name(name))
}

pub fn artifact_name(kind: ArtifactKind, suffix: u32) -> String {
    format!("{}{:05}{}", kind.tag(), suffix % SUFFIX_SPACE, LOCK_SUFFIX)
}

/// True iff `name` matches `[MDE][0-9]{5}\.lck` exactly.
pub fn is_valid_artifact_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 1 + SUFFIX_DIGITS + LOCK_SUFFIX.len()
        && ArtifactKind::from_tag(bytes[0]).is_some()
        && bytes[1..1 + SUFFIX_DIGITS].iter().all(u8::is_ascii_digit)
        && name.ends_with(LOCK_SUFFIX)
}

/// Kind of a syntactically valid artifact name.
pub fn artifact_kind(name: &str) -> Option<ArtifactKind> {
    if !is_valid_artifact_name(name) {
        return None;
    }
    ArtifactKind::from_tag(name.as_bytes()[0])
}

/// Suffix number of a syntactically valid artifact name.
pub fn artifact_suffix(name: &str) -> Option<u32> {
    if !is_valid_artifact_name(name) {
        return None;
    }
    name[1..1 + SUFFIX_DIGITS].parse().ok()
}

/// Draws a random suffix for a new entry reservation. Collisions are handled
/// by the caller retrying with a fresh draw.
pub fn draw_suffix() -> u32 {
    rand::thread_rng().gen_range(0..SUFFIX_SPACE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_directory_appends_suffix() {
        let dir = lock_directory_for(Path::new("/shared/foo.vmx")).unwrap();
        assert_eq!(dir, Path::new("/shared/foo.vmx.lck"));
    }

    #[test]
    fn artifact_names_follow_grammar() {
        assert_eq!(artifact_name(ArtifactKind::Member, 7), "M00007.lck");
        assert_eq!(artifact_name(ArtifactKind::Entry, 99_999), "E99999.lck");
        assert_eq!(artifact_name(ArtifactKind::EntryDir, 123), "D00123.lck");
    }

    #[test]
    fn name_validation_accepts_all_three_kinds() {
        for name in ["M00000.lck", "D54321.lck", "E99999.lck"] {
            assert!(is_valid_artifact_name(name), "{name}");
        }
    }

    #[test]
    fn name_validation_rejects_near_misses() {
        for name in [
            "M0000.lck",   // four digits
            "M000000.lck", // six digits
            "X12345.lck",  // unknown tag
            "M12345.lock", // wrong suffix
            "m12345.lck",  // lowercase tag
            "M1234a.lck",  // non-digit
            "M12345.lckx", // trailing junk
            "",
        ] {
            assert!(!is_valid_artifact_name(name), "{name}");
        }
    }

    #[test]
    fn suffix_and_kind_round_trip() {
        let name = artifact_name(ArtifactKind::EntryDir, 42);
        assert_eq!(artifact_kind(&name), Some(ArtifactKind::EntryDir));
        assert_eq!(artifact_suffix(&name), Some(42));
    }

    #[test]
    fn drawn_suffixes_stay_in_range() {
        for _ in 0..256 {
            assert!(draw_suffix() < 100_000);
        }
    }
}
