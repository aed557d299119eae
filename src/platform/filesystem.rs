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

//! Capability probe deciding whether native OS locks can be trusted on the
//! filesystem backing a path.
//!
//! Native locks are the fast path, but their semantics degrade or disappear
//! on network filesystems (NFS, SMB) and FAT-family media. The probe
//! classifies the mount and the controller falls back to the portable
//! directory protocol whenever support is not positively established.

use crate::error::{PortlockError, Result};
use std::path::{Path, PathBuf};

/// Whether native locking should be used on the target filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MandatorySupport {
    /// Native locks are expected to function reliably.
    Supported,
    /// Native locks are known to be unreliable; the portable protocol must
    /// be used.
    Unsupported,
    /// Capability is unknown; the caller should prefer the portable path.
    Unknown,
}

/// Filesystems the probe can distinguish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilesystemKind {
    Ext4,
    Xfs,
    Btrfs,
    Apfs,
    Zfs,
    Vmfs,
    Tmpfs,
    Overlay,
    Fat,
    Exfat,
    Nfs,
    Cifs,
    Smb2,
    Other(String),
}

/// Classification outcome relevant to lock dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemInfo {
    pub kind: FilesystemKind,
    pub mandatory_support: MandatorySupport,
    pub is_network_share: bool,
}

impl FilesystemInfo {
    fn new(kind: FilesystemKind, mandatory_support: MandatorySupport, is_network_share: bool) -> Self {
        Self {
            kind,
            mandatory_support,
            is_network_share,
        }
    }

    fn unknown(identifier: impl Into<String>) -> Self {
        Self::new(
            FilesystemKind::Other(identifier.into()),
            MandatorySupport::Unknown,
            false,
        )
    }
}

/// Abstract interface for mandatory-lock capability probes.
pub trait MandatoryLockProbe: Send + Sync {
    /// Classifies the filesystem backing `path`.
    fn classify(&self, path: &Path) -> Result<FilesystemInfo>;

    fn supports_mandatory_lock(&self, path: &Path) -> Result<MandatorySupport> {
        Ok(self.classify(path)?.mandatory_support)
    }
}

/// Default probe performing live OS queries.
#[derive(Debug, Default)]
pub struct DefaultMandatoryLockProbe;

impl DefaultMandatoryLockProbe {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self
    }
}

impl MandatoryLockProbe for DefaultMandatoryLockProbe {
    fn classify(&self, path: &Path) -> Result<FilesystemInfo> {
        let probe_target = resolve_probe_target(path)?;

        #[cfg(unix)]
        {
            classify_unix(&probe_target)
        }

        #[cfg(not(unix))]
        {
            let identifier = probe_target.display().to_string();
            Ok(FilesystemInfo::unknown(identifier))
        }
    }
}

fn resolve_probe_target(original: &Path) -> Result<PathBuf> {
    if let Ok(existing) = original.canonicalize() {
        return Ok(existing);
    }

    if let Some(parent) = original.parent()
        && let Ok(existing) = parent.canonicalize()
    {
        return Ok(existing);
    }

    std::env::current_dir().map_err(|e| {
        PortlockError::SystemError(format!(
            "Failed to resolve filesystem for '{}': {e}",
            original.display()
        ))
    })
}

#[cfg(unix)]
fn classify_unix(path: &Path) -> Result<FilesystemInfo> {
    use nix::sys::statfs::statfs;

    let stats = statfs(path).map_err(|err| {
        PortlockError::SystemError(format!(
            "Failed to query filesystem for '{}': {err}",
            path.display()
        ))
    })?;

    Ok(describe_unix_filesystem(&stats))
}

#[cfg(unix)]
fn describe_unix_filesystem(stats: &nix::sys::statfs::Statfs) -> FilesystemInfo {
    use nix::sys::statfs::FsType;

    let fs_type: FsType = stats.filesystem_type();
    let raw = fs_type.0 as libc::c_long;
    if let Some(info) = classify_unix_magic(raw) {
        return info;
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    {
        if let Some(name) = stats.fstypename() {
            if let Ok(name_str) = name.to_str() {
                return classify_by_name(name_str, raw);
            }
        }
    }

    FilesystemInfo::unknown(format!("0x{raw:x}"))
}

#[cfg(unix)]
fn classify_unix_magic(raw: libc::c_long) -> Option<FilesystemInfo> {
    match raw {
        EXT4_SUPER_MAGIC => Some(FilesystemInfo::new(
            FilesystemKind::Ext4,
            MandatorySupport::Supported,
            false,
        )),
        XFS_SUPER_MAGIC => Some(FilesystemInfo::new(
            FilesystemKind::Xfs,
            MandatorySupport::Supported,
            false,
        )),
        BTRFS_SUPER_MAGIC => Some(FilesystemInfo::new(
            FilesystemKind::Btrfs,
            MandatorySupport::Supported,
            false,
        )),
        ZFS_SUPER_MAGIC => Some(FilesystemInfo::new(
            FilesystemKind::Zfs,
            MandatorySupport::Supported,
            false,
        )),
        VMFS_SUPER_MAGIC => Some(FilesystemInfo::new(
            FilesystemKind::Vmfs,
            MandatorySupport::Supported,
            true,
        )),
        TMPFS_MAGIC => Some(FilesystemInfo::new(
            FilesystemKind::Tmpfs,
            MandatorySupport::Supported,
            false,
        )),
        OVERLAYFS_SUPER_MAGIC => Some(FilesystemInfo::new(
            FilesystemKind::Overlay,
            MandatorySupport::Unknown,
            false,
        )),
        NFS_SUPER_MAGIC => Some(FilesystemInfo::new(
            FilesystemKind::Nfs,
            MandatorySupport::Unsupported,
            true,
        )),
        CIFS_MAGIC_NUMBER => Some(FilesystemInfo::new(
            FilesystemKind::Cifs,
            MandatorySupport::Unsupported,
            true,
        )),
        SMB2_MAGIC_NUMBER => Some(FilesystemInfo::new(
            FilesystemKind::Smb2,
            MandatorySupport::Unsupported,
            true,
        )),
        MSDOS_SUPER_MAGIC | VFAT_SUPER_MAGIC => Some(FilesystemInfo::new(
            FilesystemKind::Fat,
            MandatorySupport::Unsupported,
            false,
        )),
        EXFAT_SUPER_MAGIC => Some(FilesystemInfo::new(
            FilesystemKind::Exfat,
            MandatorySupport::Unsupported,
            false,
        )),
        _ => None,
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd",
    target_os = "netbsd"
))]
fn classify_by_name(name: &str, fallback_raw: libc::c_long) -> FilesystemInfo {
    let normalized = name.to_ascii_lowercase();
    match normalized.as_str() {
        "apfs" => FilesystemInfo::new(FilesystemKind::Apfs, MandatorySupport::Supported, false),
        "zfs" => FilesystemInfo::new(FilesystemKind::Zfs, MandatorySupport::Supported, false),
        "nfs" => FilesystemInfo::new(FilesystemKind::Nfs, MandatorySupport::Unsupported, true),
        "smbfs" | "cifs" => {
            FilesystemInfo::new(FilesystemKind::Cifs, MandatorySupport::Unsupported, true)
        }
        "msdos" | "exfat" => {
            FilesystemInfo::new(FilesystemKind::Fat, MandatorySupport::Unsupported, false)
        }
        other_name => FilesystemInfo::unknown(format!("{other_name} (0x{fallback_raw:x})")),
    }
}

#[cfg(unix)]
const EXT4_SUPER_MAGIC: libc::c_long = 0xEF53;
#[cfg(unix)]
const XFS_SUPER_MAGIC: libc::c_long = 0x5846_5342;
#[cfg(unix)]
const BTRFS_SUPER_MAGIC: libc::c_long = 0x9123_683E;
#[cfg(unix)]
const TMPFS_MAGIC: libc::c_long = 0x0102_1994;
#[cfg(unix)]
const OVERLAYFS_SUPER_MAGIC: libc::c_long = 0x794C_7630;
#[cfg(unix)]
const ZFS_SUPER_MAGIC: libc::c_long = 0x2FC1_2FC1;
#[cfg(unix)]
const VMFS_SUPER_MAGIC: libc::c_long = 0x2FAB_F15E;
#[cfg(unix)]
const CIFS_MAGIC_NUMBER: libc::c_long = 0xFF53_4D42;
#[cfg(unix)]
const SMB2_MAGIC_NUMBER: libc::c_long = 0xFE53_4D42;
#[cfg(unix)]
const NFS_SUPER_MAGIC: libc::c_long = 0x0000_6969;
#[cfg(unix)]
const MSDOS_SUPER_MAGIC: libc::c_long = 0x0000_4D44;
#[cfg(unix)]
const VFAT_SUPER_MAGIC: libc::c_long = 0x0000_5646;
#[cfg(unix)]
const EXFAT_SUPER_MAGIC: libc::c_long = 0x2011_BAB0;
