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

//! Member file codec.
//!
//! A member record is a fixed-size, space-padded text line:
//!
//! ```text
//! <machineID> <executionID> <lamportNumber> <S|X> <processCreationTime> lc=<checksum>
//! ```
//!
//! Records written by old releases carry six positional fields and an
//! execution ID without the `pid-creationTime` dash; decoding resynthesizes
//! a modern execution ID from the trailing creation-time field so that
//! staleness checks keep working against them.

use crate::error::Result;
use crate::locking::values::{LockKind, LockValues};
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::Path;

/// Size of every member file. A record that is not exactly this long was
/// torn mid-write and is treated as corrupt.
pub const MEMBER_RECORD_SIZE: usize = 512;

/// Upper bound on whitespace-separated tokens in a record.
const MAX_RECORD_TOKENS: usize = 16;

/// Positional fields preceding the optional property list.
const POSITIONAL_FIELDS: usize = 5;

/// Outcome of decoding raw record bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    Values(LockValues),
    /// The bytes do not form a record; the reason is for logging only.
    Corrupt(String),
}

/// Outcome of reading a member file from disk. Corrupt files are deleted on
/// the spot, so both arms of `Vanished` look identical to the caller: the
/// lock no longer exists.
#[derive(Debug)]
pub enum MemberRead {
    Values(LockValues),
    Vanished,
}

/// Formats `values` into a fixed-size record.
pub fn encode(values: &LockValues) -> Result<Vec<u8>> {
    let mut line = format!(
        "{} {} {} {} {}",
        values.machine_id,
        values.execution_id,
        values.lamport,
        values.kind.record_token(),
        values.creation_time
    );
    if let Some(checksum) = &values.location_checksum {
        line.push_str(&format!(" lc={checksum}"));
    }

    if line.len() > MEMBER_RECORD_SIZE {
        return Err(crate::error::PortlockError::ValidationError(format!(
            "Lock record for machine '{}' exceeds {MEMBER_RECORD_SIZE} bytes",
            values.machine_id
        )));
    }

    let mut record = line.into_bytes();
    record.resize(MEMBER_RECORD_SIZE, b' ');
    Ok(record)
}

/// Parses raw record bytes. Pure: deletion of corrupt files is the reading
/// caller's job.
pub fn decode(bytes: &[u8], required_size: usize) -> DecodeOutcome {
    if bytes.len() != required_size {
        return DecodeOutcome::Corrupt(format!(
            "record is {} bytes, expected {required_size}",
            bytes.len()
        ));
    }

    let Ok(text) = std::str::from_utf8(bytes) else {
        return DecodeOutcome::Corrupt("record is not valid UTF-8".to_string());
    };

    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() > MAX_RECORD_TOKENS {
        return DecodeOutcome::Corrupt(format!("record has {} tokens", tokens.len()));
    }
    if tokens.len() < POSITIONAL_FIELDS {
        return DecodeOutcome::Corrupt(format!(
            "record has {} fields, expected at least {POSITIONAL_FIELDS}",
            tokens.len()
        ));
    }

    let machine_id = tokens[0].to_string();

    let Ok(lamport) = tokens[2].parse::<u64>() else {
        return DecodeOutcome::Corrupt(format!("bad lamport number '{}'", tokens[2]));
    };

    let Some(kind) = LockKind::from_record_token(tokens[3]) else {
        return DecodeOutcome::Corrupt(format!("bad lock type '{}'", tokens[3]));
    };

    let legacy = !tokens[1].contains('-');
    let (execution_id, creation_time, property_tokens) = if legacy {
        // Six-field legacy record: the last field is the creation time and
        // the execution ID is a bare pid.
        let Ok(creation_time) = tokens[tokens.len() - 1].parse::<u64>() else {
            return DecodeOutcome::Corrupt(format!(
                "bad legacy creation time '{}'",
                tokens[tokens.len() - 1]
            ));
        };
        let execution_id = format!("{}-{creation_time}", tokens[1]);
        (execution_id, creation_time, &[] as &[&str])
    } else {
        let Ok(creation_time) = tokens[4].parse::<u64>() else {
            return DecodeOutcome::Corrupt(format!("bad creation time '{}'", tokens[4]));
        };
        (
            tokens[1].to_string(),
            creation_time,
            &tokens[POSITIONAL_FIELDS..],
        )
    };

    let mut location_checksum = None;
    for property in property_tokens {
        let Some((name, value)) = property.split_once('=') else {
            return DecodeOutcome::Corrupt(format!("malformed property '{property}'"));
        };
        match name {
            "lc" => location_checksum = Some(value.to_string()),
            other => debug!("Ignoring unknown record property '{other}'"),
        }
    }

    DecodeOutcome::Values(LockValues {
        machine_id,
        execution_id,
        lamport,
        kind,
        creation_time,
        location_checksum,
    })
}

/// Reads and decodes a member file. A missing file is a benign race (the
/// holder released between listing and reading); a corrupt file is deleted
/// and reported the same way, never surfaced as a caller error.
pub fn read_member_file(path: &Path) -> Result<MemberRead> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(MemberRead::Vanished),
        Err(err) => return Err(err.into()),
    };

    match decode(&bytes, MEMBER_RECORD_SIZE) {
        DecodeOutcome::Values(values) => Ok(MemberRead::Values(values)),
        DecodeOutcome::Corrupt(reason) => {
            warn!(
                "Removing corrupt lock member {}: {reason}",
                path.display()
            );
            if let Err(err) = fs::remove_file(path)
                && err.kind() != io::ErrorKind::NotFound
            {
                warn!(
                    "Failed to remove corrupt lock member {}: {err}",
                    path.display()
                );
            }
            Ok(MemberRead::Vanished)
        }
    }
}
