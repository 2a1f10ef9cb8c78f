// SPDX-License-Identifier: LGPL-3.0-only

//! In-memory partition-table editing.
//!
//! All geometry work happens against a gptman/mbrman model of the table.
//! Nothing touches the device until `commit`, which is the single write
//! point; a simulating editor never opens the device for writing at all.

use crate::device::{partition_path, round_up_mib, TableKind, MIB};
use gptman::{GPTPartitionEntry, GPT};
use mbrman::{MBRPartitionEntry, CHS, MBR};
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub const GUID_LINUX_FS: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
pub const GUID_SWAP: &str = "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F";
pub const GUID_ESP: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
pub const GUID_LVM: &str = "E6D6D379-F507-44C2-A23C-238F2A3DF928";

// linux/fs.h
const BLKRRPART: libc::c_ulong = 0x125F;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("unable to open {device}: {why}")]
    Open { device: PathBuf, why: io::Error },
    #[error("device has no partition table")]
    NoTable,
    #[error("partition table has no free slot")]
    NoFreeSlot,
    #[error("no free region can hold {wanted} bytes")]
    NoFreeRegion { wanted: u64 },
    #[error("partition {number} not found in table")]
    NotFound { number: u32 },
    #[error("requested geometry is below the minimum usable size")]
    TooSmall,
    #[error(transparent)]
    Gpt(#[from] gptman::Error),
    #[error(transparent)]
    Mbr(#[from] mbrman::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The role a newly created partition plays in the installed system.
/// Decides partition type GUIDs (GPT) and system identifiers (MBR).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionRole {
    Root,
    Swap,
    Esp,
    Boot,
    Home,
    LuksContainer,
    PhysicalVolume,
}

impl PartitionRole {
    fn type_guid(self) -> [u8; 16] {
        match self {
            PartitionRole::Swap => guid_bytes(GUID_SWAP),
            PartitionRole::Esp => guid_bytes(GUID_ESP),
            PartitionRole::PhysicalVolume => guid_bytes(GUID_LVM),
            _ => guid_bytes(GUID_LINUX_FS),
        }
    }

    fn mbr_sys(self) -> u8 {
        match self {
            PartitionRole::Swap => 0x82,
            PartitionRole::Esp => 0xEF,
            PartitionRole::PhysicalVolume => 0x8E,
            _ => 0x83,
        }
    }
}

/// A partition slot resolved by applying an operation: later operations and
/// the post-install pipeline address partitions through these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPartition {
    pub number: u32,
    pub path: PathBuf,
    /// First sector, inclusive.
    pub start: u64,
    /// Last sector, inclusive.
    pub end: u64,
}

impl ResolvedPartition {
    pub fn sectors(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// A free span of sectors between allocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub sectors: u64,
}

enum TableModel {
    None,
    Gpt(GPT),
    Mbr(MBR),
}

/// Editor over one device's partition table. Threads resolved-partition
/// state from each applied operation to the ones that follow it.
pub struct TableEditor {
    device: PathBuf,
    sector_size: u64,
    total_sectors: u64,
    simulate: bool,
    model: TableModel,
    resolved: Vec<(PartitionRole, ResolvedPartition)>,
    /// Mapper path of a LUKS container opened by the running plan.
    pub luks_mapper: Option<PathBuf>,
}

impl TableEditor {
    /// Open the device and read whatever table it carries. A device with
    /// no recognizable table yields an editor in the `None` state.
    pub fn open(
        device: &Path,
        sector_size: u64,
        total_sectors: u64,
        simulate: bool,
    ) -> Result<TableEditor, TableError> {
        let mut file = OpenOptions::new()
            .read(true)
            .open(device)
            .map_err(|why| TableError::Open {
                device: device.to_owned(),
                why,
            })?;

        let model = match GPT::find_from(&mut file) {
            Ok(gpt) => TableModel::Gpt(gpt),
            Err(_) => match read_mbr(&mut file, sector_size as u32) {
                Some(mbr) => TableModel::Mbr(mbr),
                None => TableModel::None,
            },
        };

        Ok(TableEditor {
            device: device.to_owned(),
            sector_size,
            total_sectors,
            simulate,
            model,
            resolved: Vec::new(),
            luks_mapper: None,
        })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn is_simulating(&self) -> bool {
        self.simulate
    }

    pub fn kind(&self) -> TableKind {
        match &self.model {
            TableModel::None => TableKind::None,
            TableModel::Gpt(_) => TableKind::Gpt,
            TableModel::Mbr(_) => TableKind::Mbr,
        }
    }

    /// Sectors per 1 MiB on this device; also the alignment and safety
    /// margin unit for all geometry decisions.
    fn align(&self) -> u64 {
        (MIB / self.sector_size).max(1)
    }

    /// Replace the current model with a fresh, empty table. Destroys the
    /// in-memory view of any previous table; the device itself is only
    /// rewritten at commit.
    pub fn create_table(&mut self, kind: TableKind) -> Result<(), TableError> {
        let mut file = OpenOptions::new()
            .read(true)
            .open(&self.device)
            .map_err(|why| TableError::Open {
                device: self.device.clone(),
                why,
            })?;

        self.model = match kind {
            TableKind::Gpt => {
                let mut gpt =
                    GPT::new_from(&mut file, self.sector_size, rand::thread_rng().gen())?;
                gpt.align = self.align();
                TableModel::Gpt(gpt)
            }
            TableKind::Mbr => {
                let mbr = MBR::new_from(
                    &mut file,
                    self.sector_size as u32,
                    rand::thread_rng().gen(),
                )?;
                TableModel::Mbr(mbr)
            }
            TableKind::None => TableModel::None,
        };

        self.resolved.clear();
        Ok(())
    }

    /// Sector spans already allocated, in ascending order.
    fn used_ranges(&self) -> Vec<(u64, u64)> {
        let mut ranges = match &self.model {
            TableModel::None => Vec::new(),
            TableModel::Gpt(gpt) => gpt
                .iter()
                .filter(|(_, entry)| entry.is_used())
                .map(|(_, entry)| (entry.starting_lba, entry.ending_lba))
                .collect(),
            TableModel::Mbr(mbr) => mbr
                .iter()
                .filter(|(_, entry)| entry.is_used())
                .map(|(_, entry)| {
                    (
                        u64::from(entry.starting_lba),
                        u64::from(entry.starting_lba) + u64::from(entry.sectors) - 1,
                    )
                })
                .collect(),
        };

        ranges.sort_unstable();
        ranges
    }

    /// First and last usable sector of the table.
    fn usable_bounds(&self) -> (u64, u64) {
        match &self.model {
            TableModel::None => (0, 0),
            TableModel::Gpt(gpt) => (gpt.header.first_usable_lba, gpt.header.last_usable_lba),
            TableModel::Mbr(_) => (self.align(), self.total_sectors.saturating_sub(1)),
        }
    }

    /// Free spans between allocations, in ascending order.
    pub fn free_regions(&self) -> Vec<Region> {
        let (first, last) = self.usable_bounds();
        if last <= first {
            return Vec::new();
        }

        let mut regions = Vec::new();
        let mut cursor = first;

        for (start, end) in self.used_ranges() {
            if start > cursor {
                regions.push(Region {
                    start: cursor,
                    sectors: start - cursor,
                });
            }
            cursor = cursor.max(end + 1);
        }

        if cursor <= last {
            regions.push(Region {
                start: cursor,
                sectors: last - cursor + 1,
            });
        }

        regions
    }

    fn next_free_slot(&self) -> Result<u32, TableError> {
        match &self.model {
            TableModel::None => Err(TableError::NoTable),
            TableModel::Gpt(gpt) => {
                for i in 1..=gpt.header.number_of_partition_entries {
                    if gpt[i].is_unused() {
                        return Ok(i);
                    }
                }
                Err(TableError::NoFreeSlot)
            }
            TableModel::Mbr(mbr) => {
                for i in 1..=4usize {
                    if mbr[i].is_unused() {
                        return Ok(i as u32);
                    }
                }
                Err(TableError::NoFreeSlot)
            }
        }
    }

    /// Allocate a partition of `size_bytes` (rounded up to a whole MiB) in
    /// the first region able to hold it, or clamp into the largest region
    /// while holding back a 1 MiB safety margin before the next partition.
    /// `None` fills the largest free region.
    pub fn create_partition(
        &mut self,
        role: PartitionRole,
        size_bytes: Option<u64>,
        label: Option<&str>,
    ) -> Result<ResolvedPartition, TableError> {
        if let TableModel::None = self.model {
            return Err(TableError::NoTable);
        }
        let number = self.next_free_slot()?;

        let align = self.align();
        let margin = align;
        let wanted = size_bytes.map(|bytes| round_up_mib(bytes) / self.sector_size);

        // Capacity of a region once its start is aligned and the safety
        // margin is held back.
        let capacity = |region: &Region| -> Option<(u64, u64)> {
            let start = align_up(region.start, align);
            let end = region.start + region.sectors;
            let cap = end.saturating_sub(start).saturating_sub(margin);
            if cap < align {
                None
            } else {
                Some((start, cap))
            }
        };

        let regions = self.free_regions();
        let mut placement = None;

        if let Some(wanted) = wanted {
            placement = regions
                .iter()
                .filter_map(|r| capacity(r))
                .find(|(_, cap)| *cap >= wanted)
                .map(|(start, _)| (start, wanted));
        }

        if placement.is_none() {
            // Fall back to the largest region, clamped.
            placement = regions
                .iter()
                .filter_map(|r| capacity(r))
                .max_by_key(|(_, cap)| *cap)
                .map(|(start, cap)| (start, wanted.map_or(cap, |w| w.min(cap))));
        }

        let (start, sectors) = placement.ok_or(TableError::NoFreeRegion {
            wanted: size_bytes.unwrap_or(0),
        })?;

        let end = start + sectors - 1;

        match &mut self.model {
            TableModel::None => unreachable!(),
            TableModel::Gpt(gpt) => {
                gpt[number] = GPTPartitionEntry {
                    partition_type_guid: role.type_guid(),
                    unique_partition_guid: rand::thread_rng().gen(),
                    starting_lba: start,
                    ending_lba: end,
                    attribute_bits: 0,
                    partition_name: label.unwrap_or("").into(),
                };
            }
            TableModel::Mbr(mbr) => {
                mbr[number as usize] = MBRPartitionEntry {
                    boot: if role == PartitionRole::Esp {
                        mbrman::BOOT_ACTIVE
                    } else {
                        mbrman::BOOT_INACTIVE
                    },
                    first_chs: CHS::empty(),
                    sys: role.mbr_sys(),
                    last_chs: CHS::empty(),
                    starting_lba: start as u32,
                    sectors: sectors as u32,
                };
            }
        }

        let resolved = ResolvedPartition {
            number,
            path: partition_path(&self.device, number),
            start,
            end,
        };

        info!(
            "planned partition {} on {}: sectors {}..={}",
            number,
            self.device.display(),
            start,
            end
        );

        self.resolved.push((role, resolved.clone()));
        Ok(resolved)
    }

    /// Shrink or grow an existing partition to `new_size_bytes`. The end
    /// geometry is re-aligned through the table's alignment rules: down
    /// when shrinking into new territory, up when growing.
    pub fn resize_partition(
        &mut self,
        number: u32,
        new_size_bytes: u64,
    ) -> Result<ResolvedPartition, TableError> {
        let align = self.align();
        let (start, old_end) = self.geometry_of(number)?;

        let wanted_sectors = round_up_mib(new_size_bytes) / self.sector_size;
        if wanted_sectors < align {
            return Err(TableError::TooSmall);
        }

        let raw_end = start + wanted_sectors - 1;
        let new_end = if raw_end < old_end {
            align_down(raw_end + 1, align).saturating_sub(1)
        } else {
            align_up(raw_end + 1, align) - 1
        };

        if new_end <= start {
            return Err(TableError::TooSmall);
        }

        match &mut self.model {
            TableModel::None => return Err(TableError::NoTable),
            TableModel::Gpt(gpt) => {
                if gpt[number].is_unused() {
                    return Err(TableError::NotFound { number });
                }
                gpt[number].ending_lba = new_end;
            }
            TableModel::Mbr(mbr) => {
                let entry = &mut mbr[number as usize];
                if entry.is_unused() {
                    return Err(TableError::NotFound { number });
                }
                entry.sectors = (new_end - start + 1) as u32;
            }
        }

        Ok(ResolvedPartition {
            number,
            path: partition_path(&self.device, number),
            start,
            end: new_end,
        })
    }

    fn geometry_of(&self, number: u32) -> Result<(u64, u64), TableError> {
        match &self.model {
            TableModel::None => Err(TableError::NoTable),
            TableModel::Gpt(gpt) => {
                let entry = &gpt[number];
                if entry.is_unused() {
                    Err(TableError::NotFound { number })
                } else {
                    Ok((entry.starting_lba, entry.ending_lba))
                }
            }
            TableModel::Mbr(mbr) => {
                let entry = &mbr[number as usize];
                if entry.is_unused() {
                    Err(TableError::NotFound { number })
                } else {
                    Ok((
                        u64::from(entry.starting_lba),
                        u64::from(entry.starting_lba) + u64::from(entry.sectors) - 1,
                    ))
                }
            }
        }
    }

    /// Record of partitions resolved so far, in creation order.
    pub fn resolved(&self) -> &[(PartitionRole, ResolvedPartition)] {
        &self.resolved
    }

    /// The most recent partition resolved for `role`.
    pub fn resolved_by_role(&self, role: PartitionRole) -> Option<&ResolvedPartition> {
        self.resolved
            .iter()
            .rev()
            .find(|(r, _)| *r == role)
            .map(|(_, p)| p)
    }

    /// Write the whole table to the device. Skipped while simulating. The
    /// kernel is asked to re-read the table afterwards; that request is
    /// best-effort since regular files (tests) reject the ioctl.
    pub fn commit(&mut self) -> Result<(), TableError> {
        if self.simulate {
            info!("simulating: not writing table to {}", self.device.display());
            return Ok(());
        }

        if let TableModel::None = self.model {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device)
            .map_err(|why| TableError::Open {
                device: self.device.clone(),
                why,
            })?;

        match &mut self.model {
            TableModel::None => unreachable!(),
            TableModel::Gpt(gpt) => {
                GPT::write_protective_mbr_into(&mut file, self.sector_size)?;
                gpt.write_into(&mut file)?;
            }
            TableModel::Mbr(mbr) => {
                // Both GPT headers must go first; either one would shadow
                // the new MBR on the next read.
                erase_gpt_headers(&mut file, self.sector_size, self.total_sectors)?;
                mbr.write_into(&mut file)?;
            }
        }

        file.sync_all()?;

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKRRPART) };
        if ret < 0 {
            debug!(
                "{}: kernel did not re-read the partition table: {}",
                self.device.display(),
                io::Error::last_os_error()
            );
        }

        info!("committed partition table to {}", self.device.display());
        Ok(())
    }
}

/// Read an MBR, treating a malformed-but-signed sector as no table at
/// all. mbrman aborts on used entries with a zero start, so the read is
/// isolated rather than letting a corrupt disk take discovery down.
pub(crate) fn read_mbr(file: &mut File, sector_size: u32) -> Option<MBR> {
    let read = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        MBR::read_from(file, sector_size)
    }));

    match read {
        Ok(Ok(mbr)) => Some(mbr),
        Ok(Err(_)) => None,
        Err(_) => {
            warn!("malformed MBR; treating the device as having no table");
            None
        }
    }
}

/// Zero the primary and backup GPT header sectors so a stale GPT cannot
/// shadow a freshly written MBR.
fn erase_gpt_headers(file: &mut File, sector_size: u64, total_sectors: u64) -> io::Result<()> {
    let zeros = vec![0u8; sector_size as usize];

    file.seek(SeekFrom::Start(sector_size))?;
    file.write_all(&zeros)?;

    if total_sectors > 1 {
        file.seek(SeekFrom::Start((total_sectors - 1) * sector_size))?;
        file.write_all(&zeros)?;
    }

    Ok(())
}

pub fn align_up(sector: u64, align: u64) -> u64 {
    (sector + align - 1) / align * align
}

pub fn align_down(sector: u64, align: u64) -> u64 {
    sector / align * align
}

/// Encode a textual GUID into the mixed-endian on-disk layout used by GPT
/// partition type fields (first three groups little-endian).
pub fn guid_bytes(guid: &str) -> [u8; 16] {
    let mut raw = [0u8; 16];
    let hex: Vec<u8> = guid
        .bytes()
        .filter(|b| *b != b'-')
        .filter_map(|b| (b as char).to_digit(16).map(|d| d as u8))
        .collect();

    if hex.len() != 32 {
        return raw;
    }

    let mut packed = [0u8; 16];
    for i in 0..16 {
        packed[i] = (hex[2 * i] << 4) | hex[2 * i + 1];
    }

    raw[0] = packed[3];
    raw[1] = packed[2];
    raw[2] = packed[1];
    raw[3] = packed[0];
    raw[4] = packed[5];
    raw[5] = packed[4];
    raw[6] = packed[7];
    raw[7] = packed[6];
    raw[8..].copy_from_slice(&packed[8..]);
    raw
}
