// SPDX-License-Identifier: LGPL-3.0-only

//! Per-device partition inspection.
//!
//! Produces a point-in-time snapshot of one device: table kind, real
//! partitions with their content, and coalesced free-space aggregates.
//! Snapshots are rebuilt after any mutation; nothing here is cached.

use crate::device::{partition_path, Device, TableKind};
use crate::external;
use crate::inventory;
use crate::os_probe;
use crate::partitions::{coalesce_free, PartitionContent, PartitionType, SystemPartition};
use crate::table::{guid_bytes, read_mbr, TableError, GUID_ESP};
use gptman::GPT;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Everything the strategy selector needs to know about one device.
#[derive(Clone, Debug)]
pub struct DiskSnapshot {
    pub device: Device,
    pub table: TableKind,
    /// Real partitions and free-space aggregates, ordered by start sector.
    pub partitions: Vec<SystemPartition>,
}

impl DiskSnapshot {
    pub fn capacity_bytes(&self) -> u64 {
        self.device.size_bytes()
    }

    pub fn real_partitions(&self) -> impl Iterator<Item = &SystemPartition> {
        self.partitions.iter().filter(|p| !p.is_free_space())
    }

    pub fn is_empty(&self) -> bool {
        self.table == TableKind::None || self.real_partitions().count() == 0
    }

    pub fn primary_count(&self) -> usize {
        self.real_partitions()
            .filter(|p| p.part_type != PartitionType::Logical)
            .count()
    }

    pub fn logical_count(&self) -> usize {
        self.real_partitions()
            .filter(|p| p.part_type == PartitionType::Logical)
            .count()
    }

    pub fn has_esp(&self) -> bool {
        self.real_partitions().any(|p| p.esp)
    }

    pub fn swap_partition(&self) -> Option<&SystemPartition> {
        self.real_partitions()
            .find(|p| p.content.filesystem().map_or(false, |fs| fs.is_swap()))
    }

    pub fn largest_free_bytes(&self) -> u64 {
        self.partitions
            .iter()
            .filter(|p| p.is_free_space())
            .map(|p| p.size_bytes)
            .max()
            .unwrap_or(0)
    }

    /// Whether adding `additional` partitions stays inside the table's
    /// slot budget.
    pub fn fits_additional(&self, additional: usize, logical: bool) -> bool {
        if logical && self.table.supports_extended() {
            self.logical_count() + additional < self.table.max_logical()
        } else {
            self.primary_count() + additional < self.table.max_primaries()
        }
    }
}

/// Inspect a device, probing partition content through blkid and the
/// read-only mount prober.
pub fn inspect(device: &Device) -> Result<DiskSnapshot, TableError> {
    let mounts = inventory::mount_table();
    inspect_with(device, true, &mounts)
}

/// Inspect a device's table. With `probe` unset only geometry is read,
/// which keeps the inspector usable against plain files.
pub fn inspect_with(
    device: &Device,
    probe: bool,
    mounts: &BTreeMap<PathBuf, PathBuf>,
) -> Result<DiskSnapshot, TableError> {
    let mut file = OpenOptions::new()
        .read(true)
        .open(&device.path)
        .map_err(|why| TableError::Open {
            device: device.path.clone(),
            why,
        })?;

    let sector_size = device.sector_size;
    let esp_guid = guid_bytes(GUID_ESP);

    // (number, start, end, part_type, esp)
    let mut raw: Vec<(u32, u64, u64, PartitionType, bool)> = Vec::new();
    let table;
    let bounds;

    if let Ok(gpt) = GPT::find_from(&mut file) {
        table = TableKind::Gpt;
        bounds = (gpt.header.first_usable_lba, gpt.header.last_usable_lba);
        for (i, entry) in gpt.iter().filter(|(_, e)| e.is_used()) {
            raw.push((
                i,
                entry.starting_lba,
                entry.ending_lba,
                PartitionType::Primary,
                entry.partition_type_guid == esp_guid,
            ));
        }
    } else if let Some(mbr) = read_mbr(&mut file, sector_size as u32) {
        table = TableKind::Mbr;
        bounds = (
            u64::from(2048u32.min(mbr.disk_size)),
            device.sectors.saturating_sub(1),
        );
        for (i, entry) in mbr.iter().filter(|(_, e)| e.is_used()) {
            let part_type = if entry.is_extended() {
                PartitionType::Extended
            } else if i > 4 {
                PartitionType::Logical
            } else {
                PartitionType::Primary
            };
            raw.push((
                i as u32,
                u64::from(entry.starting_lba),
                u64::from(entry.starting_lba) + u64::from(entry.sectors) - 1,
                part_type,
                entry.sys == 0xEF,
            ));
        }
    } else {
        return Ok(DiskSnapshot {
            device: device.clone(),
            table: TableKind::None,
            partitions: Vec::new(),
        });
    }

    raw.sort_unstable_by_key(|&(_, start, ..)| start);

    let mut partitions = Vec::with_capacity(raw.len() * 2);
    let mut cursor = bounds.0;

    for (number, start, end, part_type, esp) in raw {
        // Gaps inside an extended partition belong to the logical chain;
        // only track gaps at the primary level.
        if part_type != PartitionType::Logical && start > cursor {
            partitions.push(SystemPartition::free_region(cursor, start - 1, sector_size));
        }

        partitions.push(build_partition(
            device, number, start, end, part_type, esp, probe, mounts,
        ));

        if part_type != PartitionType::Logical {
            cursor = cursor.max(end + 1);
        }
    }

    if cursor <= bounds.1 {
        partitions.push(SystemPartition::free_region(cursor, bounds.1, sector_size));
    }

    Ok(DiskSnapshot {
        device: device.clone(),
        table,
        partitions: coalesce_free(partitions),
    })
}

fn build_partition(
    device: &Device,
    number: u32,
    start: u64,
    end: u64,
    part_type: PartitionType,
    esp: bool,
    probe: bool,
    mounts: &BTreeMap<PathBuf, PathBuf>,
) -> SystemPartition {
    let path = partition_path(&device.path, number);
    let size_bytes = (end - start + 1) * device.sector_size;

    let mut part = SystemPartition {
        number,
        path: Some(path.clone()),
        start,
        end,
        size_bytes,
        part_type,
        content: if part_type == PartitionType::Extended {
            PartitionContent::Extended
        } else {
            PartitionContent::Unknown
        },
        esp,
        resizable: false,
        min_shrink_bytes: None,
        os: None,
        mount_point: mounts.get(&path).cloned(),
    };

    if !probe || part_type == PartitionType::Extended {
        return part;
    }

    let fs = external::blkid_type(&path);

    if let Some(fs) = fs {
        part.resizable = fs.is_resizable();
        if part.resizable {
            part.min_shrink_bytes = min_shrink_bytes(&path, &fs);
        }
        part.os = os_probe::detect_foreign_os(&path, Some(&fs), mounts);
        part.content = PartitionContent::Filesystem(fs);
    }

    part
}

fn min_shrink_bytes(path: &Path, fs: &crate::device::FileSystem) -> Option<u64> {
    use crate::device::FileSystem;

    match fs {
        FileSystem::Ntfs => external::ntfs_min_bytes(path),
        fs if fs.is_ext() => external::ext_min_bytes(path),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FileSystem, GIB, MIB};
    use crate::table::{PartitionRole, TableEditor};
    use tempfile::NamedTempFile;

    fn scratch(bytes: u64) -> (NamedTempFile, Device) {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(bytes).unwrap();
        let device = Device {
            path: file.path().to_owned(),
            sectors: bytes / 512,
            sector_size: 512,
            rotational: false,
            model: String::new(),
        };
        (file, device)
    }

    #[test]
    fn blank_device_reports_no_table() {
        let (_file, device) = scratch(GIB);
        let snap = inspect_with(&device, false, &BTreeMap::new()).unwrap();
        assert_eq!(snap.table, TableKind::None);
        assert!(snap.is_empty());
        assert_eq!(snap.primary_count(), 0);
    }

    #[test]
    fn malformed_mbr_degrades_to_no_table() {
        use std::os::unix::fs::FileExt;

        let (file, device) = scratch(GIB);
        let mut sector = [0u8; 512];
        sector[450] = 0x83;
        sector[510] = 0x55;
        sector[511] = 0xAA;
        file.as_file().write_at(&sector, 0).unwrap();

        // Discovery degrades to an empty snapshot instead of aborting.
        let snap = inspect_with(&device, false, &BTreeMap::new()).unwrap();
        assert_eq!(snap.table, TableKind::None);
        assert!(snap.is_empty());
    }

    #[test]
    fn committed_gpt_shows_partitions_and_trailing_gap() {
        let (file, device) = scratch(8 * GIB);
        let mut editor = TableEditor::open(file.path(), 512, device.sectors, false).unwrap();
        editor.create_table(TableKind::Gpt).unwrap();
        editor
            .create_partition(PartitionRole::Esp, Some(512 * MIB), None)
            .unwrap();
        editor
            .create_partition(PartitionRole::Root, Some(2 * GIB), None)
            .unwrap();
        editor.commit().unwrap();

        let snap = inspect_with(&device, false, &BTreeMap::new()).unwrap();
        assert_eq!(snap.table, TableKind::Gpt);
        assert_eq!(snap.primary_count(), 2);
        assert!(snap.has_esp());
        assert!(!snap.is_empty());

        // Leading alignment gap plus the tail after the root partition.
        assert!(snap.largest_free_bytes() > 5 * GIB);

        let numbers: Vec<u32> = snap.real_partitions().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn committed_mbr_reports_esp_flag_from_sys_byte() {
        let (file, device) = scratch(4 * GIB);
        let mut editor = TableEditor::open(file.path(), 512, device.sectors, false).unwrap();
        editor.create_table(TableKind::Mbr).unwrap();
        editor
            .create_partition(PartitionRole::Esp, Some(512 * MIB), None)
            .unwrap();
        editor.commit().unwrap();

        let snap = inspect_with(&device, false, &BTreeMap::new()).unwrap();
        assert_eq!(snap.table, TableKind::Mbr);
        assert!(snap.has_esp());
        assert_eq!(snap.logical_count(), 0);
    }

    #[test]
    fn slot_budget_accounts_for_existing_partitions() {
        let (file, device) = scratch(4 * GIB);
        let mut editor = TableEditor::open(file.path(), 512, device.sectors, false).unwrap();
        editor.create_table(TableKind::Mbr).unwrap();
        for _ in 0..3 {
            editor
                .create_partition(PartitionRole::Root, Some(256 * MIB), None)
                .unwrap();
        }
        editor.commit().unwrap();

        let snap = inspect_with(&device, false, &BTreeMap::new()).unwrap();
        assert_eq!(snap.primary_count(), 3);
        assert!(!snap.fits_additional(1, false));
        assert!(snap.fits_additional(0, false));
    }

    #[test]
    fn free_space_never_counts_as_swap() {
        let (_file, device) = scratch(GIB);
        let mut snap = inspect_with(&device, false, &BTreeMap::new()).unwrap();
        snap.partitions
            .push(SystemPartition::free_region(2048, 4095, 512));
        assert!(snap.swap_partition().is_none());

        let mut swap = SystemPartition::free_region(4096, 8191, 512);
        swap.number = 2;
        swap.content = PartitionContent::Filesystem(FileSystem::Swap);
        snap.partitions.push(swap);
        assert!(snap.swap_partition().is_some());
    }
}
