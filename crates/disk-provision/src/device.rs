// SPDX-License-Identifier: LGPL-3.0-only

use std::path::{Path, PathBuf};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// A whole physical or virtual block device, as discovered from the kernel's
/// partition listing. Rediscovered on every inventory pass; devices carry no
/// persistent identity across runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// Resolved path of the block device, such as `/dev/sda`.
    pub path: PathBuf,
    /// Total length of the device, in sectors.
    pub sectors: u64,
    /// Logical sector size, in bytes.
    pub sector_size: u64,
    /// Whether the rotational flag is set for the device.
    pub rotational: bool,
    /// Model string reported by the device, if any.
    pub model: String,
}

impl Device {
    pub fn size_bytes(&self) -> u64 {
        self.sectors * self.sector_size
    }

    /// The kernel name of the device (`sda` for `/dev/sda`).
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// The kind of partition table found on a device. Absence of a recognized
/// table is a valid state, not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    None,
    Mbr,
    Gpt,
}

impl TableKind {
    /// Upper bound on primary partitions for this table type.
    pub fn max_primaries(self) -> usize {
        match self {
            TableKind::None => 0,
            TableKind::Mbr => 4,
            TableKind::Gpt => 128,
        }
    }

    /// Upper bound on logical partitions inside an extended partition.
    pub fn max_logical(self) -> usize {
        match self {
            TableKind::Mbr => 15,
            _ => 0,
        }
    }

    pub fn supports_extended(self) -> bool {
        self == TableKind::Mbr
    }
}

/// File systems the provisioning engine knows how to create and reuse.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileSystem {
    Ext2,
    Ext3,
    Ext4,
    Btrfs,
    Xfs,
    F2fs,
    Ntfs,
    Fat16,
    Fat32,
    Exfat,
    Swap,
    Luks,
    Lvm,
    Iso9660,
    Other(String),
}

impl FileSystem {
    /// Map a blkid `TYPE` value to a known file system.
    pub fn from_blkid(value: &str) -> FileSystem {
        match value {
            "ext2" => FileSystem::Ext2,
            "ext3" => FileSystem::Ext3,
            "ext4" => FileSystem::Ext4,
            "btrfs" => FileSystem::Btrfs,
            "xfs" => FileSystem::Xfs,
            "f2fs" => FileSystem::F2fs,
            "ntfs" => FileSystem::Ntfs,
            "vfat" | "fat32" => FileSystem::Fat32,
            "msdos" | "fat16" => FileSystem::Fat16,
            "exfat" => FileSystem::Exfat,
            "swap" => FileSystem::Swap,
            "crypto_LUKS" => FileSystem::Luks,
            "LVM2_member" => FileSystem::Lvm,
            "iso9660" => FileSystem::Iso9660,
            other => FileSystem::Other(other.to_owned()),
        }
    }

    /// The name used in `/etc/fstab` and by `mount -t`.
    pub fn as_str(&self) -> &str {
        match self {
            FileSystem::Ext2 => "ext2",
            FileSystem::Ext3 => "ext3",
            FileSystem::Ext4 => "ext4",
            FileSystem::Btrfs => "btrfs",
            FileSystem::Xfs => "xfs",
            FileSystem::F2fs => "f2fs",
            FileSystem::Ntfs => "ntfs",
            FileSystem::Fat16 | FileSystem::Fat32 => "vfat",
            FileSystem::Exfat => "exfat",
            FileSystem::Swap => "swap",
            FileSystem::Luks => "crypto_LUKS",
            FileSystem::Lvm => "LVM2_member",
            FileSystem::Iso9660 => "iso9660",
            FileSystem::Other(name) => name,
        }
    }

    /// Whether the engine knows how to shrink this file system in place.
    pub fn is_resizable(&self) -> bool {
        matches!(
            self,
            FileSystem::Ext2 | FileSystem::Ext3 | FileSystem::Ext4 | FileSystem::Ntfs
        )
    }

    pub fn is_ext(&self) -> bool {
        matches!(self, FileSystem::Ext2 | FileSystem::Ext3 | FileSystem::Ext4)
    }

    pub fn is_swap(&self) -> bool {
        matches!(self, FileSystem::Swap)
    }
}

/// Derive the path of partition `number` on `device`, accounting for the
/// `p` separator used by devices whose names end in a digit (nvme, mmc, md).
pub fn partition_path(device: &Path, number: u32) -> PathBuf {
    let name = device
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let sep = if name.ends_with(|c: char| c.is_ascii_digit()) {
        "p"
    } else {
        ""
    };

    device.with_file_name(format!("{}{}{}", name, sep, number))
}

/// Round a byte length up to the next whole MiB so partition lengths stay
/// aligned instead of wasting slack.
pub fn round_up_mib(bytes: u64) -> u64 {
    (bytes + MIB - 1) / MIB * MIB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_paths_follow_kernel_naming() {
        assert_eq!(
            partition_path(Path::new("/dev/sda"), 3),
            PathBuf::from("/dev/sda3")
        );
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 2),
            PathBuf::from("/dev/nvme0n1p2")
        );
        assert_eq!(
            partition_path(Path::new("/dev/mmcblk0"), 1),
            PathBuf::from("/dev/mmcblk0p1")
        );
    }

    #[test]
    fn mib_rounding_goes_up_only() {
        assert_eq!(round_up_mib(MIB), MIB);
        assert_eq!(round_up_mib(MIB + 1), 2 * MIB);
        assert_eq!(round_up_mib(4 * GIB - 1), 4 * GIB);
    }

    #[test]
    fn blkid_round_trips_common_types() {
        assert_eq!(FileSystem::from_blkid("ext4"), FileSystem::Ext4);
        assert_eq!(FileSystem::from_blkid("vfat"), FileSystem::Fat32);
        assert_eq!(FileSystem::from_blkid("crypto_LUKS"), FileSystem::Luks);
        assert!(FileSystem::Ntfs.is_resizable());
        assert!(!FileSystem::Btrfs.is_resizable());
    }
}
