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

use crate::error::PortlockError;
use std::fmt;

pub struct ErrorContext<'a> {
    pub error: &'a PortlockError,
    pub suggestion: Option<String>,
    pub details: Option<String>,
}

impl<'a> ErrorContext<'a> {
    pub fn new(error: &'a PortlockError) -> Self {
        let (suggestion, details) = match error {
            PortlockError::LockTimeout { path, details, .. } => {
                let suggestion = Some(
                    "Another process currently holds the lock. Retry later, or raise the wait \
                     budget with --wait <millis> (or --wait infinite)."
                        .to_string(),
                );
                let details = Some(format!("Contention on '{path}': {details}"));
                (suggestion, details)
            }
            PortlockError::LockAcquire { path, details } => {
                let suggestion = Some(format!(
                    "Verify that '{path}' sits on a writable filesystem and that its parent \
                     directory exists."
                ));
                let details = Some(details.clone());
                (suggestion, details)
            }
            PortlockError::LockRelease { path, details } => {
                let details = Some(format!("Release of '{path}' failed: {details}"));
                (None, details)
            }
            PortlockError::PermissionDenied(msg) => {
                let suggestion = Some(
                    "Check file permissions. Read-only media can still serve shared locks, but \
                     exclusive locks need write access."
                        .to_string(),
                );
                (suggestion, Some(msg.clone()))
            }
            PortlockError::NameTooLong(msg) => {
                let suggestion = Some(
                    "The lock artifacts add a short suffix to the target path; shorten the file \
                     name or move it up the directory tree."
                        .to_string(),
                );
                (suggestion, Some(msg.clone()))
            }
            PortlockError::DiskSpaceError(msg) => {
                let suggestion =
                    Some("Free up disk space on the target filesystem.".to_string());
                (suggestion, Some(msg.clone()))
            }
            PortlockError::ConfigError(msg) | PortlockError::ValidationError(msg) => {
                (None, Some(msg.clone()))
            }
            PortlockError::NotFound(msg) | PortlockError::SystemError(msg) => {
                (None, Some(msg.clone()))
            }
            PortlockError::Io(err) => (None, Some(err.to_string())),
        };

        Self {
            error,
            suggestion,
            details,
        }
    }
}

impl<'a> fmt::Display for ErrorContext<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\n\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}
