// SPDX-License-Identifier: LGPL-3.0-only

use crate::device::{FileSystem, MIB};
use crate::os_probe::OsInfo;
use std::path::PathBuf;

/// Placement of a partition within the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionType {
    Primary,
    Logical,
    Extended,
}

/// What a slot of the disk holds. Real file systems aside, the inspector
/// reports the parted-style pseudo states as explicit sentinels instead of
/// pretending they are file systems.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionContent {
    Filesystem(FileSystem),
    /// Usable free space between partitions.
    Free,
    /// Space the table cannot allocate (alignment remainders and the like).
    Unallocated,
    /// The extended-partition container itself.
    Extended,
    /// Table metadata regions.
    Metadata,
    /// The protective MBR entry of a GPT disk.
    Protective,
    Unknown,
}

impl PartitionContent {
    pub fn is_free(&self) -> bool {
        matches!(self, PartitionContent::Free | PartitionContent::Unallocated)
    }

    pub fn filesystem(&self) -> Option<&FileSystem> {
        match self {
            PartitionContent::Filesystem(fs) => Some(fs),
            _ => None,
        }
    }
}

/// A partition plus everything the strategy selector needs to know about
/// it. Rebuilt on every inspection pass and never cached across mutations.
#[derive(Clone, Debug)]
pub struct SystemPartition {
    /// Table slot number; 0 for free-space aggregates.
    pub number: u32,
    /// Block-device path; free-space aggregates have none.
    pub path: Option<PathBuf>,
    /// First sector, inclusive.
    pub start: u64,
    /// Last sector, inclusive.
    pub end: u64,
    pub size_bytes: u64,
    pub part_type: PartitionType,
    pub content: PartitionContent,
    /// Flagged as an EFI system partition in the table.
    pub esp: bool,
    /// Whether the content can be shrunk in place.
    pub resizable: bool,
    /// Smallest size the content can shrink to, when known.
    pub min_shrink_bytes: Option<u64>,
    /// Operating system detected on the partition, if any.
    pub os: Option<OsInfo>,
    pub mount_point: Option<PathBuf>,
}

impl SystemPartition {
    pub fn free_region(start: u64, end: u64, sector_size: u64) -> SystemPartition {
        SystemPartition {
            number: 0,
            path: None,
            start,
            end,
            size_bytes: (end - start + 1) * sector_size,
            part_type: PartitionType::Primary,
            content: PartitionContent::Free,
            esp: false,
            resizable: false,
            min_shrink_bytes: None,
            os: None,
            mount_point: None,
        }
    }

    pub fn is_free_space(&self) -> bool {
        self.content.is_free()
    }

    /// Headroom available by shrinking this partition, with a 1 MiB margin
    /// held back for re-alignment.
    pub fn shrink_headroom(&self) -> Option<u64> {
        let min = self.min_shrink_bytes?;
        Some(self.size_bytes.saturating_sub(min).saturating_sub(MIB))
    }
}

/// Merge runs of consecutive free-space entries into single aggregates with
/// summed size and extended end offset, the way a partitioning view must
/// present a gap as one span rather than raw fragments.
pub fn coalesce_free(parts: Vec<SystemPartition>) -> Vec<SystemPartition> {
    let mut out: Vec<SystemPartition> = Vec::with_capacity(parts.len());

    for part in parts {
        if part.is_free_space() {
            if let Some(last) = out.last_mut() {
                if last.is_free_space() {
                    last.end = part.end;
                    last.size_bytes += part.size_bytes;
                    continue;
                }
            }
        }
        out.push(part);
    }

    out
}
