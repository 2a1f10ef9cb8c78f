// SPDX-License-Identifier: LGPL-3.0-only

//! Wrappers around the external partitioning and file-system tools.
//!
//! Every destructive content-level action in this crate funnels through
//! here, so the command lines stay auditable in one place.

use crate::device::FileSystem;
use cradle::prelude::*;
use std::path::Path;

fn dev(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Create a file system on the given block device.
pub fn mkfs(path: &Path, fs: &FileSystem) -> Result<(), cradle::Error> {
    info!("creating {} file system on {}", fs.as_str(), path.display());

    match fs {
        FileSystem::Ext2 => run_result!("mkfs.ext2", "-F", "-q", dev(path)),
        FileSystem::Ext3 => run_result!("mkfs.ext3", "-F", "-q", dev(path)),
        FileSystem::Ext4 => run_result!("mkfs.ext4", "-F", "-q", dev(path)),
        FileSystem::Btrfs => run_result!("mkfs.btrfs", "-f", dev(path)),
        FileSystem::Xfs => run_result!("mkfs.xfs", "-f", dev(path)),
        FileSystem::F2fs => run_result!("mkfs.f2fs", "-f", dev(path)),
        FileSystem::Ntfs => run_result!("mkfs.ntfs", "-Q", "-F", dev(path)),
        FileSystem::Fat32 => run_result!("mkfs.vfat", "-F", "32", dev(path)),
        FileSystem::Fat16 => run_result!("mkfs.vfat", "-F", "16", dev(path)),
        FileSystem::Exfat => run_result!("mkfs.exfat", dev(path)),
        FileSystem::Swap => mkswap(path),
        other => {
            warn!("no mkfs handler for {}", other.as_str());
            Ok(())
        }
    }
}

pub fn mkswap(path: &Path) -> Result<(), cradle::Error> {
    info!("creating swap space on {}", path.display());
    run_result!("mkswap", "-f", dev(path))
}

/// Release an active swap device back to the installer.
pub fn swapoff(path: &Path) -> Result<(), cradle::Error> {
    info!("deactivating swap on {}", path.display());
    run_result!("swapoff", dev(path))
}

/// Query a block-device attribute through blkid. `None` when the attribute
/// is absent or the tool is unavailable; never fatal.
fn blkid_value(path: &Path, tag: &str) -> Option<String> {
    let result: Result<StdoutTrimmed, cradle::Error> =
        run_result!("blkid", "-o", "value", "-s", tag, dev(path));

    match result {
        Ok(StdoutTrimmed(out)) if !out.is_empty() => Some(out),
        Ok(_) => None,
        Err(why) => {
            debug!("blkid -s {} {}: {}", tag, path.display(), why);
            None
        }
    }
}

/// File-system UUID of a block device.
pub fn blkid_uuid(path: &Path) -> Option<String> {
    blkid_value(path, "UUID")
}

/// File-system type as reported by blkid.
pub fn blkid_type(path: &Path) -> Option<FileSystem> {
    blkid_value(path, "TYPE").map(|t| FileSystem::from_blkid(&t))
}

/// Erase file-system signatures from a device before reformatting.
pub fn wipefs(path: &Path) -> Result<(), cradle::Error> {
    run_result!("wipefs", "-a", dev(path))
}

/// Integrity-check pass required before shrinking an NTFS file system.
/// A dry run of the resize itself, which refuses inconsistent volumes.
pub fn ntfs_check(path: &Path, new_size_bytes: u64) -> Result<(), cradle::Error> {
    info!("checking NTFS on {} before resize", path.display());
    run_result!(
        "ntfsresize",
        "--no-action",
        "--force",
        format!("--size={}", new_size_bytes),
        dev(path)
    )
}

pub fn ntfs_resize(path: &Path, new_size_bytes: u64) -> Result<(), cradle::Error> {
    info!(
        "resizing NTFS on {} to {} bytes",
        path.display(),
        new_size_bytes
    );
    run_result!(
        "ntfsresize",
        "--force",
        "--force",
        format!("--size={}", new_size_bytes),
        dev(path)
    )
}

/// File-system check required before resizing an ext file system.
pub fn ext_check(path: &Path) -> Result<(), cradle::Error> {
    info!("checking ext file system on {}", path.display());
    run_result!("e2fsck", "-f", "-y", dev(path))
}

pub fn ext_resize(path: &Path, new_size_bytes: u64) -> Result<(), cradle::Error> {
    info!(
        "resizing ext file system on {} to {} bytes",
        path.display(),
        new_size_bytes
    );
    run_result!("resize2fs", dev(path), format!("{}K", new_size_bytes / 1024))
}

/// Smallest size an NTFS volume will shrink to, per `ntfsresize --info`.
pub fn ntfs_min_bytes(path: &Path) -> Option<u64> {
    let result: Result<StdoutTrimmed, cradle::Error> =
        run_result!("ntfsresize", "--info", "--force", dev(path));

    match result {
        Ok(StdoutTrimmed(out)) => parse_ntfs_info(&out),
        Err(why) => {
            debug!("ntfsresize --info {}: {}", path.display(), why);
            None
        }
    }
}

/// Parse the "You might resize at N bytes" line of `ntfsresize --info`.
pub fn parse_ntfs_info(output: &str) -> Option<u64> {
    output
        .lines()
        .find(|line| line.contains("You might resize at"))
        .and_then(|line| {
            line.split_whitespace()
                .find_map(|field| field.parse::<u64>().ok())
        })
}

/// Smallest size an ext file system will shrink to, derived from the used
/// block count reported by dumpe2fs.
pub fn ext_min_bytes(path: &Path) -> Option<u64> {
    let result: Result<StdoutTrimmed, cradle::Error> =
        run_result!("dumpe2fs", "-h", dev(path));

    match result {
        Ok(StdoutTrimmed(out)) => parse_dumpe2fs(&out),
        Err(why) => {
            debug!("dumpe2fs -h {}: {}", path.display(), why);
            None
        }
    }
}

/// Parse `dumpe2fs -h` output into used bytes: (blocks - free) * block size.
pub fn parse_dumpe2fs(output: &str) -> Option<u64> {
    let mut blocks = None;
    let mut free = None;
    let mut block_size = None;

    for line in output.lines() {
        let value = || {
            line.split(':')
                .nth(1)
                .and_then(|v| v.trim().parse::<u64>().ok())
        };

        if line.starts_with("Block count:") {
            blocks = value();
        } else if line.starts_with("Free blocks:") {
            free = value();
        } else if line.starts_with("Block size:") {
            block_size = value();
        }
    }

    match (blocks, free, block_size) {
        (Some(blocks), Some(free), Some(size)) => {
            Some(blocks.saturating_sub(free) * size)
        }
        _ => None,
    }
}
